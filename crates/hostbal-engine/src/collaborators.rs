//! Interfaces to the subsystems the engine drives but does not implement.
//!
//! The engine never filters hosts, moves instances or toggles host power
//! itself. It calls these traits, and the daemon decides what sits behind
//! them (cloud APIs, shell commands, or the in-process simulator).

use async_trait::async_trait;

use hostbal_state::LoadBalanceRule;

/// Reply of the migration execution layer to a move request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorReply {
    /// The request was accepted; completion is observed later.
    Accepted,
    /// The scheduler found no host able to take the instance.
    NoValidHost,
}

/// Low-level live migration and resize.
#[async_trait]
pub trait MigrationExecutor: Send + Sync {
    /// Start a live migration. `None` lets the scheduler pick the destination.
    async fn live_migrate(
        &self,
        instance_id: &str,
        destination: Option<&str>,
    ) -> anyhow::Result<ExecutorReply>;

    /// Start a cold migration (resize to the same flavor).
    async fn resize(&self, instance_id: &str) -> anyhow::Result<ExecutorReply>;

    /// Confirm a finished resize.
    async fn confirm_resize(&self, instance_id: &str) -> anyhow::Result<()>;
}

/// Wake-on-LAN and host suspend transport.
#[async_trait]
pub trait PowerControl: Send + Sync {
    /// MAC address to wake `host` with later.
    async fn host_mac_address(&self, host: &str) -> anyhow::Result<String>;

    async fn suspend_host(&self, host: &str) -> anyhow::Result<()>;

    async fn wake_host(&self, mac: &str) -> anyhow::Result<()>;
}

/// Instance placement filtering.
///
/// Rules are passed through untouched; only the filter interprets them.
pub trait PlacementFilter: Send + Sync {
    /// Permitted hosts among `candidates`, best first.
    fn filter_hosts(
        &self,
        instance_id: &str,
        candidates: &[String],
        rules: &[LoadBalanceRule],
    ) -> Vec<String>;
}
