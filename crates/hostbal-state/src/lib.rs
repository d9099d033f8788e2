//! hostbal-state — embedded state store for hostbal.
//!
//! Backed by [redb](https://docs.rs/redb), provides persistent and in-memory
//! state for compute nodes, host and instance statistics, instance placement,
//! migrations, and load-balance rules.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{host}:{created_at}`, `{instance_id}:{created_at}`) keep
//! observations of the same subject adjacent; zero-padded numeric keys keep
//! migrations and rules in creation order.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::{StateStore, epoch_secs};
pub use types::*;
