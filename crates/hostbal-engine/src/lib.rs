//! hostbal-engine — fleet load balancing and host consolidation.
//!
//! Periodically summarises per-host load from the state store, detects
//! overloaded hosts, moves instances off them, and consolidates idle hosts
//! by evacuating and suspending them. Suspended hosts are woken again when
//! fleet-wide demand rises.
//!
//! # Pipeline
//!
//! ```text
//! tick ─► stats::collect ─► ThresholdStrategy::indicate
//!                              │
//!              overloaded ─────┼───── none
//!                  │                   │
//!           Balancer::balance   UnderloadStrategy::indicate
//!                  │                   │
//!                  └──► MigrationOrchestrator ◄──┘
//! ```
//!
//! Strategies are chosen by name in [`BalancerConfig`]; unknown names fail
//! [`LoadBalancer::new`]. Filtering, migration execution and host power are
//! external and reached through the traits in [`collaborators`].

pub mod balancer;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod manager;
pub mod migration;
pub mod stats;
pub mod threshold;
pub mod underload;

#[cfg(test)]
mod testing;

pub use balancer::{Balancer, BalancerStrategy, PlannedMove};
pub use collaborators::{ExecutorReply, MigrationExecutor, PlacementFilter, PowerControl};
pub use config::{BalancerConfig, TickIntervals};
pub use error::{BalancerError, BalancerResult};
pub use manager::{BalanceOutcome, Collaborators, LoadBalancer, NodeView, TickKind};
pub use migration::{MigrationOrchestrator, MigrationOutcome, MigrationRequest};
pub use stats::{FleetSnapshot, FleetStats, HostLoad, InstanceLoad};
pub use threshold::{Detection, ThresholdStrategy};
pub use underload::{MeanUnderload, ReconcileReport, UnderloadAction, UnderloadStrategy};
