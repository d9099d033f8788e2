//! Underload consolidation — evacuate and suspend idle hosts, wake them
//! again when the fleet gets busy.
//!
//! ```text
//! indicate:
//!   active hosts < 2              → try resume
//!   host cpu% < suspend_cpu or
//!        mem% < suspend_memory    → suspending, evacuate
//!                                    ok:   stop (one evacuation per pass)
//!                                    fail: not_suspended, next host
//!   nothing evacuated             → try resume
//!
//! resume:  μ_cpu > resume_cpu or μ_mem > resume_memory
//!          → wake first suspended host with a wake address, mark active
//!
//! reconcile (per suspending host):
//!   migrations in flight          → wait
//!   no instances left             → record MAC, mark suspended, power down
//!   instances left                → evacuate again, not_suspended on failure
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use hostbal_state::*;

use crate::balancer::Balancer;
use crate::collaborators::PowerControl;
use crate::config::MeanUnderloadConfig;
use crate::error::{BalancerError, BalancerResult};
use crate::stats::{self, FleetSnapshot, FleetStats, HostLoad};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnderloadAction {
    /// The host is now `suspending` and its instances are moving away.
    Evacuating(HostId),
    /// The host was woken and is `active` again.
    Resumed(HostId),
    Idle,
}

/// Outcome of one reconciliation pass, by host.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub suspended: Vec<HostId>,
    /// Still waiting for migrations.
    pub deferred: Vec<HostId>,
    /// Evacuation issued again.
    pub retried: Vec<HostId>,
    pub rolled_back: Vec<HostId>,
}

/// Underload strategies selectable by name.
pub enum UnderloadStrategy {
    MeanUnderload(MeanUnderload),
}

impl UnderloadStrategy {
    pub fn from_name(
        name: &str,
        config: &MeanUnderloadConfig,
        store: StateStore,
        balancer: Arc<Balancer>,
        power: Arc<dyn PowerControl>,
    ) -> BalancerResult<Self> {
        match name {
            "mean_underload" => Ok(Self::MeanUnderload(MeanUnderload::new(
                config.clone(),
                store,
                balancer,
                power,
            ))),
            other => Err(BalancerError::UnknownStrategy {
                axis: "underload",
                name: other.to_string(),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::MeanUnderload(_) => "mean_underload",
        }
    }

    pub async fn indicate(
        &self,
        snapshot: &FleetSnapshot,
        stats: &FleetStats,
    ) -> BalancerResult<UnderloadAction> {
        match self {
            Self::MeanUnderload(m) => m.indicate(snapshot, stats).await,
        }
    }

    pub async fn check_is_all_vms_migrated(&self) -> BalancerResult<ReconcileReport> {
        match self {
            Self::MeanUnderload(m) => m.check_is_all_vms_migrated().await,
        }
    }

    pub async fn evacuate(
        &self,
        host: &HostLoad,
        snapshot: &FleetSnapshot,
    ) -> BalancerResult<bool> {
        match self {
            Self::MeanUnderload(m) => m.evacuate(host, snapshot).await,
        }
    }

    pub async fn resume(&self, node: &ComputeNode) -> BalancerResult<()> {
        match self {
            Self::MeanUnderload(m) => m.resume(node).await,
        }
    }
}

pub struct MeanUnderload {
    config: MeanUnderloadConfig,
    store: StateStore,
    balancer: Arc<Balancer>,
    power: Arc<dyn PowerControl>,
}

impl MeanUnderload {
    pub fn new(
        config: MeanUnderloadConfig,
        store: StateStore,
        balancer: Arc<Balancer>,
        power: Arc<dyn PowerControl>,
    ) -> Self {
        Self {
            config,
            store,
            balancer,
            power,
        }
    }

    pub async fn indicate(
        &self,
        snapshot: &FleetSnapshot,
        stats: &FleetStats,
    ) -> BalancerResult<UnderloadAction> {
        if stats.active_hosts < 2 {
            debug!(active = stats.active_hosts, "too few active hosts to consolidate");
            return self.unsuspend_host(stats).await;
        }

        for host in &snapshot.hosts {
            if !self.is_underloaded(host) {
                continue;
            }
            match self.evacuate(host, snapshot).await {
                Ok(true) => return Ok(UnderloadAction::Evacuating(host.host.clone())),
                Ok(false) => {}
                Err(e) => warn!(host = %host.host, error = %e, "evacuation not started"),
            }
        }

        self.unsuspend_host(stats).await
    }

    fn is_underloaded(&self, host: &HostLoad) -> bool {
        host.cpu_percent < self.config.suspend_cpu
            || host.memory_percent < self.config.suspend_memory
    }

    /// Mark `host` suspending and move its instances to the other snapshot
    /// hosts. Rolls back to `not_suspended` when the evacuation fails.
    pub async fn evacuate(
        &self,
        host: &HostLoad,
        snapshot: &FleetSnapshot,
    ) -> BalancerResult<bool> {
        self.store
            .transition_host(&host.host, SuspendState::Suspending)?;
        info!(
            host = %host.host,
            cpu = host.cpu_percent,
            memory = host.memory_percent,
            instances = host.instances.len(),
            "evacuating underloaded host"
        );

        let pool = snapshot.others(&host.host);
        self.migrate_all_or_roll_back(host, &pool).await
    }

    /// Wake one suspended host when the fleet means exceed the resume
    /// thresholds.
    pub async fn unsuspend_host(&self, stats: &FleetStats) -> BalancerResult<UnderloadAction> {
        if stats.cpu_mean <= self.config.resume_cpu
            && stats.memory_mean <= self.config.resume_memory
        {
            return Ok(UnderloadAction::Idle);
        }

        let Some(node) = self
            .store
            .list_nodes_in(SuspendFilter::Only)?
            .into_iter()
            .find(|n| n.mac_to_wake.is_some())
        else {
            debug!(
                cpu_mean = stats.cpu_mean,
                memory_mean = stats.memory_mean,
                "fleet is busy but no suspended host can be woken"
            );
            return Ok(UnderloadAction::Idle);
        };

        self.resume(&node).await?;
        Ok(UnderloadAction::Resumed(node.host))
    }

    /// Wake a suspended host and mark it active.
    pub async fn resume(&self, node: &ComputeNode) -> BalancerResult<()> {
        if node.suspend_state != SuspendState::Suspended {
            return Err(BalancerError::WrongState {
                host: node.host.clone(),
                state: node.suspend_state,
                expected: "suspended",
            });
        }
        let mac = node
            .mac_to_wake
            .as_deref()
            .ok_or_else(|| BalancerError::WrongState {
                host: node.host.clone(),
                state: node.suspend_state,
                expected: "a recorded wake address",
            })?;

        self.power.wake_host(mac).await?;
        self.store.transition_host(&node.host, SuspendState::Active)?;
        info!(host = %node.host, %mac, "host resumed");
        Ok(())
    }

    /// Finish or retry the evacuation of every `suspending` host.
    pub async fn check_is_all_vms_migrated(&self) -> BalancerResult<ReconcileReport> {
        let mut report = ReconcileReport::default();

        for node in self.store.list_nodes_in(SuspendFilter::Suspending)? {
            let in_flight = self.store.in_progress_migrations_for_host(&node.host)?;
            if !in_flight.is_empty() {
                debug!(
                    host = %node.host,
                    migrations = in_flight.len(),
                    "evacuation still in flight"
                );
                report.deferred.push(node.host);
                continue;
            }

            if self.store.list_instances_on_host(&node.host)?.is_empty() {
                match self.suspend(&node).await {
                    Ok(()) => report.suspended.push(node.host),
                    Err(e) => warn!(host = %node.host, error = %e, "host suspend failed"),
                }
                continue;
            }

            let (source, pool) = self.evacuation_view(&node.host)?;
            report.retried.push(node.host.clone());
            if !self.migrate_all_or_roll_back(&source, &pool).await? {
                report.rolled_back.push(node.host);
            }
        }

        Ok(report)
    }

    /// Record the wake address, mark the host suspended and power it down.
    ///
    /// The store refuses the transition while instances are still placed on
    /// the host. A failed power-down puts the host back to `active`.
    async fn suspend(&self, node: &ComputeNode) -> BalancerResult<()> {
        let mac = self.power.host_mac_address(&node.host).await?;
        self.store.set_wake_address(&node.host, &mac)?;
        self.store
            .transition_host(&node.host, SuspendState::Suspended)?;
        if let Err(e) = self.power.suspend_host(&node.host).await {
            self.store.transition_host(&node.host, SuspendState::Active)?;
            return Err(e.into());
        }
        info!(host = %node.host, %mac, "host suspended");
        Ok(())
    }

    /// Run the evacuation; on failure or error put `source` back to
    /// `not_suspended`.
    async fn migrate_all_or_roll_back(
        &self,
        source: &HostLoad,
        pool: &[HostLoad],
    ) -> BalancerResult<bool> {
        let migrated = match self.balancer.migrate_all_vms_from_host(source, pool).await {
            Ok(migrated) => migrated,
            Err(e) => {
                warn!(host = %source.host, error = %e, "evacuation failed");
                false
            }
        };
        if !migrated {
            self.store
                .transition_host(&source.host, SuspendState::NotSuspended)?;
            warn!(host = %source.host, "evacuation aborted, host rolled back");
        }
        Ok(migrated)
    }

    /// Load of a suspending host plus the active hosts it can drain into.
    fn evacuation_view(&self, host: &str) -> BalancerResult<(HostLoad, Vec<HostLoad>)> {
        let snapshot = stats::collect(&self.store, SuspendFilter::All)?;
        let active: HashSet<String> = self
            .store
            .list_nodes_in(SuspendFilter::Active)?
            .into_iter()
            .map(|n| n.host)
            .collect();
        let source = snapshot
            .host(host)
            .cloned()
            .ok_or_else(|| BalancerError::HostNotFound(host.to_string()))?;
        let pool = snapshot
            .hosts
            .into_iter()
            .filter(|h| active.contains(&h.host))
            .collect();
        Ok((source, pool))
    }
}
