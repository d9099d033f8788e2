//! redb table definitions for the hostbal state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types),
//! except `META` which holds plain `u64` counters.
//! Composite keys follow the pattern `{parent_id}:{timestamp}`, with a sequence
//! suffix where several rows may share a second; timestamps and
//! sequence ids are zero-padded so lexical order matches numeric order.

use redb::TableDefinition;

/// Compute nodes keyed by `{host}`.
pub const NODES: TableDefinition<&str, &[u8]> = TableDefinition::new("nodes");

/// Host stat observations keyed by `{host}:{created_at}`.
pub const HOST_STATS: TableDefinition<&str, &[u8]> = TableDefinition::new("host_stats");

/// Instance placement keyed by `{instance_id}`.
pub const INSTANCES: TableDefinition<&str, &[u8]> = TableDefinition::new("instances");

/// Instance stat observations keyed by `{instance_id}:{created_at}:{seq}`.
pub const INSTANCE_STATS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("instance_stats");

/// Migration records keyed by `{id}`.
pub const MIGRATIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("migrations");

/// Load-balance rules keyed by `{id}`.
pub const RULES: TableDefinition<&str, &[u8]> = TableDefinition::new("rules");

/// Id sequences keyed by table name.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");
