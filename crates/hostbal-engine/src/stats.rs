//! Stats aggregation — per-host load summaries and fleet-wide means.
//!
//! Loads are built from instance records and their raw stat samples:
//!
//! ```text
//! instance cpu%  = mean of its samples taken on its current host
//! host cpu%      = Σ instance cpu%
//! host memory%   = Σ instance memory used / host memory total × 100
//! fleet mean     = Σ host value / number of hosts
//! ```
//!
//! Only sums and divisions are involved, so the result does not depend on
//! the order of the input records. Hosts without instances are summarised
//! with zero load rather than skipped.

use std::collections::{BTreeMap, HashSet};

use hostbal_state::*;

use crate::error::BalancerResult;

/// Load of one instance, as seen by the balancer.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceLoad {
    pub id: InstanceId,
    /// Share of its current host's CPU, in percent.
    pub cpu_percent: f64,
    pub memory_used_mb: f64,
    /// Allocated memory, used for capacity checks.
    pub memory_mb: u64,
    /// False while a migration of this instance is in flight.
    pub movable: bool,
}

/// Aggregated load of one host.
#[derive(Debug, Clone, PartialEq)]
pub struct HostLoad {
    pub host: HostId,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: u64,
    /// Memory allocated to the instances on this host.
    pub memory_allocated_mb: u64,
    pub vcpus: u32,
    /// Instances on this host, ordered by id.
    pub instances: Vec<InstanceLoad>,
}

impl HostLoad {
    pub fn free_memory_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_allocated_mb)
    }

    /// Whether `instance` fits into the unallocated memory of this host.
    pub fn fits(&self, instance: &InstanceLoad) -> bool {
        self.free_memory_mb() >= instance.memory_mb
    }

    pub fn movable_instances(&self) -> impl Iterator<Item = &InstanceLoad> {
        self.instances.iter().filter(|i| i.movable)
    }

    /// CPU percent `instance` would account for on a host with `vcpus` cores.
    pub fn rescaled_cpu(&self, instance: &InstanceLoad, vcpus: u32) -> f64 {
        if vcpus == 0 || self.vcpus == 0 {
            instance.cpu_percent
        } else {
            instance.cpu_percent * f64::from(self.vcpus) / f64::from(vcpus)
        }
    }

    /// Remove an instance, updating the aggregates.
    pub fn release(&mut self, instance: &InstanceLoad) {
        self.instances.retain(|i| i.id != instance.id);
        self.cpu_percent -= instance.cpu_percent;
        self.memory_used_mb -= instance.memory_used_mb;
        self.memory_allocated_mb = self.memory_allocated_mb.saturating_sub(instance.memory_mb);
        self.memory_percent = percent(self.memory_used_mb, self.memory_total_mb);
    }

    /// Add an instance that currently runs on `from`, updating the aggregates.
    pub fn admit(&mut self, instance: &InstanceLoad, from: &HostLoad) {
        let cpu = from.rescaled_cpu(instance, self.vcpus);
        self.cpu_percent += cpu;
        self.memory_used_mb += instance.memory_used_mb;
        self.memory_allocated_mb += instance.memory_mb;
        self.memory_percent = percent(self.memory_used_mb, self.memory_total_mb);
        self.instances.push(InstanceLoad {
            cpu_percent: cpu,
            movable: false,
            ..instance.clone()
        });
    }
}

/// Current loads of the active hosts plus fleet means.
#[derive(Debug, Clone, PartialEq)]
pub struct FleetSnapshot {
    /// Ordered by host id.
    pub hosts: Vec<HostLoad>,
    pub cpu_mean: f64,
    pub memory_mean: f64,
}

impl FleetSnapshot {
    pub fn host(&self, host: &str) -> Option<&HostLoad> {
        self.hosts.iter().find(|h| h.host == host)
    }

    /// Every host except `host`.
    pub fn others(&self, host: &str) -> Vec<HostLoad> {
        self.hosts.iter().filter(|h| h.host != host).cloned().collect()
    }

    /// One host stat row per summarised host, stamped `now`.
    pub fn host_stats(&self, nodes: &[ComputeNode], now: u64) -> Vec<HostStat> {
        self.hosts
            .iter()
            .filter_map(|load| {
                let node = nodes.iter().find(|n| n.host == load.host)?;
                Some(HostStat {
                    host: load.host.clone(),
                    cpu_used_percent: load.cpu_percent,
                    memory_used_mb: load.memory_used_mb,
                    memory_total_mb: load.memory_total_mb,
                    vcpus: load.vcpus,
                    suspend_state: node.suspend_state,
                    mac_to_wake: node.mac_to_wake.clone(),
                    created_at: now,
                })
            })
            .collect()
    }
}

/// Fleet-wide figures carried from detection into consolidation.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FleetStats {
    pub cpu_mean: f64,
    pub memory_mean: f64,
    pub cpu_sd: f64,
    pub memory_sd: f64,
    pub active_hosts: usize,
}

impl FleetStats {
    pub fn of(hosts: &[HostLoad]) -> Self {
        let cpu: Vec<f64> = hosts.iter().map(|h| h.cpu_percent).collect();
        let memory: Vec<f64> = hosts.iter().map(|h| h.memory_percent).collect();
        Self {
            cpu_mean: mean(&cpu),
            memory_mean: mean(&memory),
            cpu_sd: std_dev(&cpu),
            memory_sd: std_dev(&memory),
            active_hosts: hosts.len(),
        }
    }
}

/// Arithmetic mean; 0 for an empty slice.
pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation; 0 for an empty slice.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let m = mean(values);
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

fn percent(used: f64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used / total as f64 * 100.0
    }
}

/// Mean CPU and memory of one instance's samples.
///
/// Samples are summed in a fixed order so the result does not depend on
/// the order the store returned them in.
fn sample_means(group: &mut [&InstanceStat]) -> (f64, f64) {
    if group.is_empty() {
        return (0.0, 0.0);
    }
    group.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then(a.cpu_used_percent.total_cmp(&b.cpu_used_percent))
            .then(a.memory_used_mb.total_cmp(&b.memory_used_mb))
    });
    let n = group.len() as f64;
    let cpu = group.iter().map(|s| s.cpu_used_percent).sum::<f64>();
    let mem = group.iter().map(|s| s.memory_used_mb).sum::<f64>();
    (cpu / n, mem / n)
}

/// Summarise `nodes` from raw instance records and samples.
///
/// Instances listed in `in_flight` are marked non-movable.
pub fn aggregate(
    nodes: &[ComputeNode],
    instances: &[InstanceRecord],
    samples: &[InstanceStat],
    in_flight: &HashSet<InstanceId>,
) -> FleetSnapshot {
    let mut grouped: BTreeMap<(&str, &str), Vec<&InstanceStat>> = BTreeMap::new();
    for s in samples {
        grouped
            .entry((s.instance_id.as_str(), s.host.as_str()))
            .or_default()
            .push(s);
    }

    let mut by_host: BTreeMap<&str, Vec<InstanceLoad>> = BTreeMap::new();
    for inst in instances {
        let (cpu, mem) = match grouped.get_mut(&(inst.id.as_str(), inst.host.as_str())) {
            Some(group) => sample_means(group),
            None => (0.0, 0.0),
        };
        by_host.entry(inst.host.as_str()).or_default().push(InstanceLoad {
            id: inst.id.clone(),
            cpu_percent: cpu,
            memory_used_mb: mem,
            memory_mb: inst.memory_mb,
            movable: !in_flight.contains(&inst.id),
        });
    }

    let mut hosts: Vec<HostLoad> = nodes
        .iter()
        .map(|node| {
            let mut loads = by_host.remove(node.host.as_str()).unwrap_or_default();
            loads.sort_by(|a, b| a.id.cmp(&b.id));
            let cpu = loads.iter().map(|i| i.cpu_percent).sum::<f64>();
            let mem = loads.iter().map(|i| i.memory_used_mb).sum::<f64>();
            HostLoad {
                host: node.host.clone(),
                cpu_percent: cpu,
                memory_percent: percent(mem, node.memory_total_mb),
                memory_used_mb: mem,
                memory_total_mb: node.memory_total_mb,
                memory_allocated_mb: loads.iter().map(|i| i.memory_mb).sum(),
                vcpus: node.vcpus,
                instances: loads,
            }
        })
        .collect();
    hosts.sort_by(|a, b| a.host.cmp(&b.host));

    let stats = FleetStats::of(&hosts);
    FleetSnapshot {
        hosts,
        cpu_mean: stats.cpu_mean,
        memory_mean: stats.memory_mean,
    }
}

/// Read the store and summarise the nodes matching `filter`.
pub fn collect(store: &StateStore, filter: SuspendFilter) -> BalancerResult<FleetSnapshot> {
    let nodes = store.list_nodes_in(filter)?;
    let instances = store.list_instances()?;
    let samples = store.list_instance_stats()?;
    let in_flight: HashSet<InstanceId> = store
        .list_migrations_with_status(MigrationStatus::InProgress)?
        .into_iter()
        .map(|m| m.instance_id)
        .collect();
    Ok(aggregate(&nodes, &instances, &samples, &in_flight))
}
