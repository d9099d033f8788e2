//! LoadBalancer — the control loop tying detection, balancing and
//! consolidation together.
//!
//! Four entry points run on their own timers:
//!
//! | tick                       | does                                          |
//! |----------------------------|-----------------------------------------------|
//! | `tick_balance`             | snapshot → detect → balance or consolidate    |
//! | `tick_clear_stats`         | purge stats and settled migrations past ttl   |
//! | `tick_reconcile_suspension`| finish or retry evacuations                   |
//! | `tick_confirm_migrations`  | confirm finished migrations                   |
//!
//! Each runs in its own task, so an entry point never overlaps itself.
//! Tick errors are logged and the loop keeps going.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use hostbal_state::*;

use crate::balancer::{Balancer, BalancerStrategy};
use crate::collaborators::{MigrationExecutor, PlacementFilter, PowerControl};
use crate::config::{BalancerConfig, TickIntervals};
use crate::error::{BalancerError, BalancerResult};
use crate::migration::MigrationOrchestrator;
use crate::stats;
use crate::threshold::ThresholdStrategy;
use crate::underload::{ReconcileReport, UnderloadAction, UnderloadStrategy};

/// External subsystems the engine drives.
#[derive(Clone)]
pub struct Collaborators {
    pub placement: Arc<dyn PlacementFilter>,
    pub executor: Arc<dyn MigrationExecutor>,
    pub power: Arc<dyn PowerControl>,
}

/// What one balance tick did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BalanceOutcome {
    /// An overloaded host was found; `migrated` tells whether a move started.
    Overloaded { host: HostId, migrated: bool },
    Underload(UnderloadAction),
    Idle,
}

/// A compute node merged with its latest load figures.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeView {
    pub host: HostId,
    pub suspend_state: SuspendState,
    pub cpu_used_percent: f64,
    pub ram_used_percent: f64,
    pub memory_total_mb: u64,
    pub vcpus: u32,
    pub mac_to_wake: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickKind {
    Balance,
    ClearStats,
    Reconcile,
    Confirm,
}

impl TickKind {
    pub const ALL: [TickKind; 4] = [
        TickKind::Balance,
        TickKind::ClearStats,
        TickKind::Reconcile,
        TickKind::Confirm,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Balance => "balance",
            Self::ClearStats => "clear_stats",
            Self::Reconcile => "reconcile",
            Self::Confirm => "confirm",
        }
    }

    pub fn interval(self, intervals: &TickIntervals) -> Duration {
        match self {
            Self::Balance => intervals.balance,
            Self::ClearStats => intervals.clear_stats,
            Self::Reconcile => intervals.reconcile,
            Self::Confirm => intervals.confirm,
        }
    }
}

pub struct LoadBalancer {
    config: BalancerConfig,
    store: StateStore,
    threshold: ThresholdStrategy,
    balancer: Arc<Balancer>,
    underload: UnderloadStrategy,
    orchestrator: Arc<MigrationOrchestrator>,
}

impl LoadBalancer {
    /// Validate `config` and build the configured strategies.
    ///
    /// Unknown strategy names and invalid thresholds are rejected here.
    pub fn new(
        config: BalancerConfig,
        store: StateStore,
        collaborators: Collaborators,
    ) -> BalancerResult<Self> {
        config.validate()?;

        let threshold = ThresholdStrategy::from_config(&config)?;
        let strategy = BalancerStrategy::from_name(&config.loadbalancer.balancer_class)?;
        let orchestrator = Arc::new(MigrationOrchestrator::new(
            store.clone(),
            collaborators.executor,
        ));
        let balancer = Arc::new(Balancer::new(
            strategy,
            config.loadbalancer.migration_kind,
            store.clone(),
            orchestrator.clone(),
            collaborators.placement,
        ));
        let underload = UnderloadStrategy::from_name(
            &config.loadbalancer.underload_class,
            &config.mean_underload,
            store.clone(),
            balancer.clone(),
            collaborators.power,
        )?;

        info!(
            threshold = threshold.name(),
            balancer = strategy.name(),
            underload = underload.name(),
            enable_balancer = config.loadbalancer.enable_balancer,
            enable_underload = config.loadbalancer.enable_underload,
            "load balancer configured"
        );

        Ok(Self {
            config,
            store,
            threshold,
            balancer,
            underload,
            orchestrator,
        })
    }

    pub fn config(&self) -> &BalancerConfig {
        &self.config
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    // ── Ticks ──────────────────────────────────────────────────────

    /// Detect overload and relieve it, or consolidate when nothing is
    /// overloaded.
    pub async fn tick_balance(&self) -> BalancerResult<BalanceOutcome> {
        let snapshot = stats::collect(&self.store, SuspendFilter::Active)?;
        let nodes = self.store.list_nodes_in(SuspendFilter::Active)?;
        for stat in snapshot.host_stats(&nodes, epoch_secs()) {
            self.store.put_host_stat(&stat)?;
        }

        let detection = self.threshold.indicate(&snapshot);
        let lb = &self.config.loadbalancer;

        if let Some(candidate) = &detection.candidate {
            if !lb.enable_balancer {
                debug!(host = %candidate.host, "overloaded host found, balancing disabled");
                return Ok(BalanceOutcome::Idle);
            }
            let migrated = self.balancer.balance(candidate, &detection.pool).await?;
            return Ok(BalanceOutcome::Overloaded {
                host: candidate.host.clone(),
                migrated,
            });
        }

        if lb.enable_underload {
            let action = self.underload.indicate(&snapshot, &detection.stats).await?;
            return Ok(BalanceOutcome::Underload(action));
        }

        Ok(BalanceOutcome::Idle)
    }

    /// Purge expired stat rows and settled migration records. Returns the
    /// number of rows removed.
    pub async fn tick_clear_stats(&self) -> BalancerResult<u32> {
        self.clear_stats_at(epoch_secs())
    }

    pub fn clear_stats_at(&self, now: u64) -> BalancerResult<u32> {
        let cutoff = self.config.clear_stats.cutoff(now);
        let stats = self.store.clear_stats(cutoff)?;
        let migrations = self.store.clear_migrations(cutoff)?;
        if stats + migrations > 0 {
            debug!(cutoff, stats, migrations, "expired rows purged");
        }
        Ok(stats + migrations)
    }

    pub async fn tick_reconcile_suspension(&self) -> BalancerResult<ReconcileReport> {
        self.underload.check_is_all_vms_migrated().await
    }

    pub async fn tick_confirm_migrations(&self) -> BalancerResult<u32> {
        self.orchestrator.confirm_finished().await
    }

    // ── Manual host operations ─────────────────────────────────────

    /// Evacuate `host` on request. Returns whether the evacuation started.
    pub async fn suspend_host(&self, host: &str) -> BalancerResult<bool> {
        let node = self.existing_node(host)?;
        if !node.suspend_state.is_active() {
            return Err(BalancerError::WrongState {
                host: node.host,
                state: node.suspend_state,
                expected: "active",
            });
        }

        let snapshot = stats::collect(&self.store, SuspendFilter::Active)?;
        let load = snapshot
            .host(host)
            .cloned()
            .ok_or_else(|| BalancerError::HostNotFound(host.to_string()))?;
        self.underload.evacuate(&load, &snapshot).await
    }

    /// Wake a suspended host on request.
    pub async fn resume_host(&self, host: &str) -> BalancerResult<()> {
        let node = self.existing_node(host)?;
        self.underload.resume(&node).await
    }

    fn existing_node(&self, host: &str) -> BalancerResult<ComputeNode> {
        if host.trim().is_empty() {
            return Err(BalancerError::InvalidHost(host.to_string()));
        }
        self.store
            .get_node(host)?
            .ok_or_else(|| BalancerError::HostNotFound(host.to_string()))
    }

    // ── Views and registration ─────────────────────────────────────

    /// Every registered node with its latest stats; nodes without stats
    /// report zero usage.
    pub fn list_nodes(&self) -> BalancerResult<Vec<NodeView>> {
        let stats = self
            .store
            .compute_node_stats(SuspendFilter::All, StatAggregation::Latest)?;
        Ok(self
            .store
            .list_nodes()?
            .into_iter()
            .map(|node| {
                let stat = stats.iter().find(|s| s.host == node.host);
                NodeView {
                    cpu_used_percent: stat.map_or(0.0, |s| s.cpu_used_percent),
                    ram_used_percent: stat.map_or(0.0, |s| s.memory_used_percent()),
                    host: node.host,
                    suspend_state: node.suspend_state,
                    memory_total_mb: node.memory_total_mb,
                    vcpus: node.vcpus,
                    mac_to_wake: node.mac_to_wake,
                }
            })
            .collect())
    }

    /// Register a node or update its capacity. Lifecycle state of a known
    /// node is kept.
    pub fn register_node(
        &self,
        host: &str,
        memory_total_mb: u64,
        vcpus: u32,
    ) -> BalancerResult<ComputeNode> {
        if host.trim().is_empty() {
            return Err(BalancerError::InvalidHost(host.to_string()));
        }
        let node = match self.store.get_node(host)? {
            Some(existing) => ComputeNode {
                memory_total_mb,
                vcpus,
                updated_at: epoch_secs(),
                ..existing
            },
            None => ComputeNode {
                host: host.to_string(),
                memory_total_mb,
                vcpus,
                suspend_state: SuspendState::Active,
                mac_to_wake: None,
                updated_at: epoch_secs(),
            },
        };
        self.store.put_node(&node)?;
        Ok(node)
    }

    /// Record an instance placement.
    ///
    /// An instance reported on a new host finishes its in-progress
    /// migrations; one reported again on the host it was leaving fails them.
    pub fn put_instance(&self, instance: &InstanceRecord) -> BalancerResult<()> {
        if self.store.get_node(&instance.host)?.is_none() {
            return Err(BalancerError::HostNotFound(instance.host.clone()));
        }
        let previous = self.store.get_instance(&instance.id)?;
        self.store.put_instance(instance)?;
        let Some(prev) = previous else {
            return Ok(());
        };
        if prev.host != instance.host {
            let finished = self
                .store
                .finish_migrations_for_instance(&instance.id, &instance.host)?;
            debug!(
                instance = %instance.id,
                from = %prev.host,
                to = %instance.host,
                finished,
                "instance moved"
            );
        } else {
            let failed = self
                .store
                .fail_migrations_for_instance(&instance.id, &instance.host)?;
            if failed > 0 {
                warn!(
                    instance = %instance.id,
                    host = %instance.host,
                    failed,
                    "instance stayed on its source host, migration failed"
                );
            }
        }
        Ok(())
    }

    /// Forget an instance that no longer exists. Its in-progress migrations
    /// are failed.
    pub fn delete_instance(&self, id: &str) -> BalancerResult<()> {
        let instance = self
            .store
            .get_instance(id)?
            .ok_or_else(|| BalancerError::InstanceNotFound(id.to_string()))?;
        self.store.delete_instance(id)?;
        let failed = self.store.fail_migrations_for_instance(id, &instance.host)?;
        info!(instance = %id, host = %instance.host, failed, "instance deleted");
        Ok(())
    }

    pub fn report_instance_stat(&self, stat: &InstanceStat) -> BalancerResult<()> {
        if self.store.get_instance(&stat.instance_id)?.is_none() {
            return Err(BalancerError::InstanceNotFound(stat.instance_id.clone()));
        }
        self.store.put_instance_stat(stat)?;
        Ok(())
    }

    // ── Rules ──────────────────────────────────────────────────────

    pub fn create_rule(&self, rule: &NewRule) -> BalancerResult<LoadBalanceRule> {
        let stored = self.store.create_rule(rule)?;
        info!(id = stored.id, value = %stored.value, allow = stored.allow, "rule created");
        Ok(stored)
    }

    pub fn delete_rule(&self, id: u64) -> BalancerResult<()> {
        if !self.store.delete_rule(id)? {
            return Err(BalancerError::RuleNotFound(id));
        }
        info!(id, "rule deleted");
        Ok(())
    }

    pub fn list_rules(&self) -> BalancerResult<Vec<LoadBalanceRule>> {
        Ok(self.store.list_rules()?)
    }

    // ── Scheduling ─────────────────────────────────────────────────

    async fn run_tick(&self, kind: TickKind) -> BalancerResult<()> {
        match kind {
            TickKind::Balance => {
                let outcome = self.tick_balance().await?;
                if outcome != BalanceOutcome::Idle {
                    info!(?outcome, "balance tick");
                }
            }
            TickKind::ClearStats => {
                self.tick_clear_stats().await?;
            }
            TickKind::Reconcile => {
                let report = self.tick_reconcile_suspension().await?;
                if report != ReconcileReport::default() {
                    info!(?report, "suspension reconciled");
                }
            }
            TickKind::Confirm => {
                let confirmed = self.tick_confirm_migrations().await?;
                if confirmed > 0 {
                    debug!(confirmed, "migrations confirmed");
                }
            }
        }
        Ok(())
    }

    async fn tick_loop(
        self: Arc<Self>,
        kind: TickKind,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) {
        debug!(tick = kind.as_str(), interval_secs = interval.as_secs(), "tick loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.run_tick(kind).await {
                        error!(tick = kind.as_str(), error = %e, "tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!(tick = kind.as_str(), "tick loop shutting down");
                    break;
                }
            }
        }
    }

    /// Run every entry point on its own timer until `shutdown` changes.
    pub async fn run(self: Arc<Self>, intervals: TickIntervals, shutdown: watch::Receiver<bool>) {
        info!(
            balance_secs = intervals.balance.as_secs(),
            clear_stats_secs = intervals.clear_stats.as_secs(),
            reconcile_secs = intervals.reconcile.as_secs(),
            confirm_secs = intervals.confirm.as_secs(),
            "load balancer started"
        );

        let handles: Vec<_> = TickKind::ALL
            .into_iter()
            .map(|kind| {
                let lb = self.clone();
                tokio::spawn(lb.tick_loop(kind, kind.interval(&intervals), shutdown.clone()))
            })
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "tick task panicked");
            }
        }
        info!("load balancer stopped");
    }
}
