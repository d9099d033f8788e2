//! Domain types for the hostbal state store.
//!
//! These types represent the persisted state of compute nodes, host and
//! instance statistics, migrations, and load-balance rules. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Hypervisor hostname of a compute node.
pub type HostId = String;

/// Unique identifier for an instance (VM).
pub type InstanceId = String;

// ── Compute node ──────────────────────────────────────────────────

/// Power/migration lifecycle of a compute node.
///
/// ```text
/// active ──► suspending ──► suspended ──► active
///   ▲            │
///   │            ▼
///   └──── not_suspended   (rollback after a failed evacuation)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuspendState {
    Active,
    Suspending,
    Suspended,
    NotSuspended,
}

impl SuspendState {
    /// Whether the host takes part in balancing and consolidation.
    ///
    /// `NotSuspended` is the rollback state of an aborted evacuation; the
    /// host keeps running its workload and stays eligible.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Active | Self::NotSuspended)
    }

    /// Whether `self → next` is a legal lifecycle edge.
    pub fn can_transition_to(self, next: SuspendState) -> bool {
        use SuspendState::*;
        matches!(
            (self, next),
            (Active | NotSuspended, Suspending)
                | (Suspending, Suspended)
                | (Suspending, NotSuspended)
                | (Suspended, Active)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Suspending => "suspending",
            Self::Suspended => "suspended",
            Self::NotSuspended => "not_suspended",
        }
    }
}

impl std::fmt::Display for SuspendState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered compute host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ComputeNode {
    pub host: HostId,
    /// Total memory on the host (MB).
    pub memory_total_mb: u64,
    pub vcpus: u32,
    pub suspend_state: SuspendState,
    /// MAC address recorded when the host was suspended.
    pub mac_to_wake: Option<String>,
    /// Unix timestamp of the last update.
    pub updated_at: u64,
}

/// Which compute nodes a stats query should return.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspendFilter {
    /// `active` and `not_suspended` hosts.
    #[default]
    Active,
    /// Only `suspended` hosts.
    Only,
    /// Only `suspending` hosts.
    Suspending,
    /// Every host regardless of state.
    All,
}

impl SuspendFilter {
    pub fn matches(self, state: SuspendState) -> bool {
        match self {
            Self::Active => state.is_active(),
            Self::Only => state == SuspendState::Suspended,
            Self::Suspending => state == SuspendState::Suspending,
            Self::All => true,
        }
    }
}

/// How host stat rows are folded when read back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StatAggregation {
    /// The most recent row per host.
    #[default]
    Latest,
    /// The mean of all retained rows per host.
    Mean,
}

// ── Statistics ────────────────────────────────────────────────────

/// One observation of a compute host's load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostStat {
    pub host: HostId,
    pub cpu_used_percent: f64,
    pub memory_used_mb: f64,
    pub memory_total_mb: u64,
    pub vcpus: u32,
    pub suspend_state: SuspendState,
    pub mac_to_wake: Option<String>,
    /// Unix timestamp (seconds).
    pub created_at: u64,
}

impl HostStat {
    /// Build the composite key for the host stats table.
    pub fn table_key(&self) -> String {
        format!("{}:{:020}", self.host, self.created_at)
    }

    /// Memory used as a percentage of the host total.
    pub fn memory_used_percent(&self) -> f64 {
        if self.memory_total_mb == 0 {
            0.0
        } else {
            self.memory_used_mb / self.memory_total_mb as f64 * 100.0
        }
    }
}

/// An instance and its current placement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceRecord {
    pub id: InstanceId,
    pub host: HostId,
    /// Allocated (flavor) memory in MB.
    pub memory_mb: u64,
    pub vcpus: u32,
    pub updated_at: u64,
}

/// One raw observation of an instance's load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceStat {
    pub instance_id: InstanceId,
    /// Host the sample was taken on.
    pub host: HostId,
    /// Share of the observing host's CPU, in percent.
    pub cpu_used_percent: f64,
    pub memory_used_mb: f64,
    pub created_at: u64,
}

impl InstanceStat {
    /// Build the composite key for the instance stats table.
    ///
    /// `seq` keeps samples taken within the same second apart.
    pub fn table_key(&self, seq: u64) -> String {
        format!("{}:{:020}:{:020}", self.instance_id, self.created_at, seq)
    }
}

// ── Migrations ────────────────────────────────────────────────────

/// How an instance is moved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationKind {
    Live,
    /// Resize-based migration; needs an explicit confirmation.
    Cold,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    InProgress,
    Finished,
    Confirmed,
    Failed,
}

/// Bookkeeping for a migration initiated by the balancer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MigrationRecord {
    pub id: u64,
    pub instance_id: InstanceId,
    pub source: HostId,
    pub destination: Option<HostId>,
    pub kind: MigrationKind,
    pub status: MigrationStatus,
    pub created_at: u64,
    pub updated_at: u64,
}

impl MigrationRecord {
    pub fn table_key(&self) -> String {
        format!("{:020}", self.id)
    }

    /// Whether this migration moves an instance off or onto `host`.
    pub fn touches(&self, host: &str) -> bool {
        self.source == host || self.destination.as_deref() == Some(host)
    }
}

// ── Rules ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// `value` is a hostname pattern.
    HostPattern,
    /// `value` is a high-availability group name.
    HaGroup,
}

/// User-defined placement constraint, opaque to the balancing engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadBalanceRule {
    pub id: u64,
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
    /// Permit (`true`) or forbid (`false`).
    pub allow: bool,
}

/// A rule as submitted for creation; the store assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NewRule {
    #[serde(rename = "type")]
    pub rule_type: RuleType,
    pub value: String,
    pub allow: bool,
}

impl LoadBalanceRule {
    pub fn table_key(&self) -> String {
        format!("{:020}", self.id)
    }
}
