//! Balancer strategies — move load off an overloaded host.
//!
//! ```text
//! classic:     heaviest movable instance → first permitted host with room
//! minimize_sd: every (movable instance, permitted host with room) pair,
//!              scored by σ_cpu + σ_mem of the fleet after the move;
//!              lowest score wins
//! ```
//!
//! Destination candidates always go through the placement filter together
//! with the current rule list. CPU moved between hosts of different sizes
//! is rescaled by the vcpu ratio.

use std::cmp::Ordering;
use std::sync::Arc;

use tracing::{debug, info, warn};

use hostbal_state::*;

use crate::collaborators::PlacementFilter;
use crate::error::{BalancerError, BalancerResult};
use crate::migration::{MigrationOrchestrator, MigrationOutcome, MigrationRequest};
use crate::stats::{HostLoad, InstanceLoad, std_dev};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BalancerStrategy {
    Classic,
    MinimizeSd,
}

impl BalancerStrategy {
    pub fn from_name(name: &str) -> BalancerResult<Self> {
        match name {
            "classic" => Ok(Self::Classic),
            "minimize_sd" => Ok(Self::MinimizeSd),
            other => Err(BalancerError::UnknownStrategy {
                axis: "balancer",
                name: other.to_string(),
            }),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::MinimizeSd => "minimize_sd",
        }
    }
}

/// A chosen instance move.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedMove {
    pub instance: InstanceLoad,
    pub destination: HostId,
}

pub struct Balancer {
    strategy: BalancerStrategy,
    kind: MigrationKind,
    store: StateStore,
    orchestrator: Arc<MigrationOrchestrator>,
    placement: Arc<dyn PlacementFilter>,
}

impl Balancer {
    pub fn new(
        strategy: BalancerStrategy,
        kind: MigrationKind,
        store: StateStore,
        orchestrator: Arc<MigrationOrchestrator>,
        placement: Arc<dyn PlacementFilter>,
    ) -> Self {
        Self {
            strategy,
            kind,
            store,
            orchestrator,
            placement,
        }
    }

    pub fn strategy(&self) -> BalancerStrategy {
        self.strategy
    }

    /// Move one instance off `overloaded` onto a host from `pool`.
    ///
    /// Returns false when no destination qualifies or the executor reports
    /// no valid host.
    pub async fn balance(&self, overloaded: &HostLoad, pool: &[HostLoad]) -> BalancerResult<bool> {
        let rules = self.store.list_rules()?;
        let Some(planned) = self.plan(overloaded, pool, &rules) else {
            info!(
                host = %overloaded.host,
                strategy = self.strategy.name(),
                "no destination can take load from overloaded host"
            );
            return Ok(false);
        };
        self.execute(&overloaded.host, &planned).await
    }

    /// Pick the move `balance` would issue, without issuing it.
    pub fn plan(
        &self,
        source: &HostLoad,
        pool: &[HostLoad],
        rules: &[LoadBalanceRule],
    ) -> Option<PlannedMove> {
        match self.strategy {
            BalancerStrategy::Classic => {
                let instance = source.movable_instances().min_by(|a, b| heaviest_first(a, b))?;
                let destination = self.first_fit(instance, pool, rules)?;
                Some(PlannedMove {
                    instance: instance.clone(),
                    destination,
                })
            }
            BalancerStrategy::MinimizeSd => {
                let mut best: Option<(f64, PlannedMove)> = None;
                for instance in source.movable_instances() {
                    if let Some((score, destination)) =
                        self.lowest_deviation(instance, source, pool, rules)
                        && best.as_ref().is_none_or(|(s, b)| {
                            score < *s || (score == *s && instance.id < b.instance.id)
                        })
                    {
                        best = Some((
                            score,
                            PlannedMove {
                                instance: instance.clone(),
                                destination,
                            },
                        ));
                    }
                }
                best.map(|(_, planned)| planned)
            }
        }
    }

    /// Move every instance off `source`, one at a time in id order.
    ///
    /// Each destination is chosen against the pool as updated by the moves
    /// already issued. Stops at the first instance that cannot be moved.
    /// Instances already being migrated are left to finish.
    pub async fn migrate_all_vms_from_host(
        &self,
        source: &HostLoad,
        pool: &[HostLoad],
    ) -> BalancerResult<bool> {
        let rules = self.store.list_rules()?;
        let mut source = source.clone();
        let mut pool = pool.to_vec();

        for instance in source.instances.clone() {
            if !instance.movable {
                debug!(instance = %instance.id, host = %source.host, "instance already migrating");
                continue;
            }
            let destination = match self.strategy {
                BalancerStrategy::Classic => self.first_fit(&instance, &pool, &rules),
                BalancerStrategy::MinimizeSd => self
                    .lowest_deviation(&instance, &source, &pool, &rules)
                    .map(|(_, d)| d),
            };
            let Some(destination) = destination else {
                warn!(
                    instance = %instance.id,
                    host = %source.host,
                    "no destination for instance during evacuation"
                );
                return Ok(false);
            };

            let planned = PlannedMove {
                instance: instance.clone(),
                destination,
            };
            if !self.execute(&source.host, &planned).await? {
                return Ok(false);
            }

            if let Some(dest) = pool.iter_mut().find(|h| h.host == planned.destination) {
                dest.admit(&instance, &source);
            }
            source.release(&instance);
        }
        Ok(true)
    }

    async fn execute(&self, source: &str, planned: &PlannedMove) -> BalancerResult<bool> {
        let request = MigrationRequest {
            instance_id: planned.instance.id.clone(),
            source: source.to_string(),
            destination: Some(planned.destination.clone()),
            kind: self.kind,
        };
        match self.orchestrator.migrate(&request).await? {
            MigrationOutcome::Started(_) => Ok(true),
            MigrationOutcome::NoValidHost => Ok(false),
        }
    }

    /// Permitted pool hosts for `instance` that have room for it, in
    /// placement order.
    fn candidates<'a>(
        &self,
        instance: &InstanceLoad,
        pool: &'a [HostLoad],
        rules: &[LoadBalanceRule],
    ) -> Vec<&'a HostLoad> {
        let ids: Vec<String> = pool.iter().map(|h| h.host.clone()).collect();
        self.placement
            .filter_hosts(&instance.id, &ids, rules)
            .iter()
            .filter_map(|id| pool.iter().find(|h| &h.host == id))
            .filter(|h| h.fits(instance))
            .collect()
    }

    fn first_fit(
        &self,
        instance: &InstanceLoad,
        pool: &[HostLoad],
        rules: &[LoadBalanceRule],
    ) -> Option<HostId> {
        self.candidates(instance, pool, rules)
            .first()
            .map(|h| h.host.clone())
    }

    /// Best destination for `instance` by post-move deviation, ties broken
    /// by lowest host id.
    fn lowest_deviation(
        &self,
        instance: &InstanceLoad,
        source: &HostLoad,
        pool: &[HostLoad],
        rules: &[LoadBalanceRule],
    ) -> Option<(f64, HostId)> {
        let mut candidates = self.candidates(instance, pool, rules);
        candidates.sort_by(|a, b| a.host.cmp(&b.host));
        candidates
            .into_iter()
            .map(|dest| (deviation_after_move(source, dest, instance, pool), dest))
            .fold(None, |best: Option<(f64, &HostLoad)>, (score, dest)| match best {
                Some((s, _)) if s <= score => best,
                _ => Some((score, dest)),
            })
            .map(|(score, dest)| (score, dest.host.clone()))
    }
}

/// Order by CPU descending, then memory used descending, then id.
fn heaviest_first(a: &InstanceLoad, b: &InstanceLoad) -> Ordering {
    b.cpu_percent
        .total_cmp(&a.cpu_percent)
        .then(b.memory_used_mb.total_cmp(&a.memory_used_mb))
        .then_with(|| a.id.cmp(&b.id))
}

/// σ_cpu + σ_mem over `source` and `pool` if `instance` moved to `dest`.
fn deviation_after_move(
    source: &HostLoad,
    dest: &HostLoad,
    instance: &InstanceLoad,
    pool: &[HostLoad],
) -> f64 {
    let mut after_source = source.clone();
    after_source.release(instance);
    let mut after_dest = dest.clone();
    after_dest.admit(instance, source);

    let hosts = std::iter::once(&after_source).chain(pool.iter().map(|h| {
        if h.host == dest.host { &after_dest } else { h }
    }));
    let (cpu, memory): (Vec<f64>, Vec<f64>) =
        hosts.map(|h| (h.cpu_percent, h.memory_percent)).unzip();
    std_dev(&cpu) + std_dev(&memory)
}
