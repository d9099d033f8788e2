//! StateStore — redb-backed state persistence for hostbal.
//!
//! Provides typed operations over compute nodes, host/instance stats,
//! instances, migrations and load-balance rules. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).
//!
//! Host lifecycle changes go through [`StateStore::transition_host`], which
//! checks the edge and writes the new state inside one write transaction.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        for table in [NODES, HOST_STATS, INSTANCES, INSTANCE_STATS, MIGRATIONS, RULES] {
            txn.open_table(table).map_err(map_err!(Table))?;
        }
        txn.open_table(META).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic JSON helpers ───────────────────────────────────────

    fn put_json<T: Serialize>(&self, table: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get_json<T: DeserializeOwned>(&self, table: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        match t.get(key).map_err(map_err!(Read))? {
            Some(guard) => {
                let value = serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// List all values in key order.
    fn list_json<T: DeserializeOwned>(&self, table: JsonTable) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let t = txn.open_table(table).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in t.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            results.push(serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?);
        }
        Ok(results)
    }

    fn delete_key(&self, table: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            existed = t.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    /// Read-modify-write a single value inside one write transaction.
    ///
    /// Nothing is written when `f` returns an error.
    fn update_json<T, F>(&self, table: JsonTable, key: &str, f: F) -> StateResult<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(&mut T) -> StateResult<()>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let value = {
            let mut t = txn.open_table(table).map_err(map_err!(Table))?;
            let mut value: T = {
                let guard = t
                    .get(key)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(key.to_string()))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            f(&mut value)?;
            let bytes = serde_json::to_vec(&value).map_err(map_err!(Serialize))?;
            t.insert(key, bytes.as_slice()).map_err(map_err!(Write))?;
            value
        };
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(value)
    }

    /// Allocate the next id of a named sequence (starting at 1).
    fn next_id(txn: &WriteTransaction, sequence: &str) -> StateResult<u64> {
        let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
        let next = meta
            .get(sequence)
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
            .unwrap_or(1);
        meta.insert(sequence, next + 1).map_err(map_err!(Write))?;
        Ok(next)
    }

    // ── Compute nodes ──────────────────────────────────────────────

    /// Insert or update a compute node.
    pub fn put_node(&self, node: &ComputeNode) -> StateResult<()> {
        self.put_json(NODES, &node.host, node)?;
        debug!(host = %node.host, state = %node.suspend_state, "compute node stored");
        Ok(())
    }

    /// Get a compute node by hostname.
    pub fn get_node(&self, host: &str) -> StateResult<Option<ComputeNode>> {
        self.get_json(NODES, host)
    }

    /// List all compute nodes, ordered by hostname.
    pub fn list_nodes(&self) -> StateResult<Vec<ComputeNode>> {
        self.list_json(NODES)
    }

    /// List compute nodes whose lifecycle state matches `filter`.
    pub fn list_nodes_in(&self, filter: SuspendFilter) -> StateResult<Vec<ComputeNode>> {
        Ok(self
            .list_nodes()?
            .into_iter()
            .filter(|n| filter.matches(n.suspend_state))
            .collect())
    }

    /// Delete a compute node. Returns true if it existed.
    pub fn delete_node(&self, host: &str) -> StateResult<bool> {
        self.delete_key(NODES, host)
    }

    /// Move a host along one lifecycle edge.
    ///
    /// Fails with [`StateError::InvalidTransition`] (and writes nothing) when
    /// the edge is not legal from the host's current state, and with
    /// [`StateError::HostNotEmpty`] when entering `suspended` while instances
    /// are still placed on the host. Both checks run in the write
    /// transaction that stores the new state.
    pub fn transition_host(&self, host: &str, to: SuspendState) -> StateResult<ComputeNode> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let node = {
            let mut nodes = txn.open_table(NODES).map_err(map_err!(Table))?;
            let mut node: ComputeNode = {
                let guard = nodes
                    .get(host)
                    .map_err(map_err!(Read))?
                    .ok_or_else(|| StateError::NotFound(host.to_string()))?;
                serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
            };
            if !node.suspend_state.can_transition_to(to) {
                return Err(StateError::InvalidTransition {
                    host: host.to_string(),
                    from: node.suspend_state,
                    to,
                });
            }
            if to == SuspendState::Suspended {
                let instances = txn.open_table(INSTANCES).map_err(map_err!(Table))?;
                let placed = count_rows::<InstanceRecord>(&instances, |i| i.host == host)?;
                if placed > 0 {
                    return Err(StateError::HostNotEmpty {
                        host: host.to_string(),
                        instances: placed,
                    });
                }
            }
            node.suspend_state = to;
            node.updated_at = now;
            let bytes = serde_json::to_vec(&node).map_err(map_err!(Serialize))?;
            nodes.insert(host, bytes.as_slice()).map_err(map_err!(Write))?;
            node
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%host, state = %to, "host lifecycle transition");
        Ok(node)
    }

    /// Record the MAC address used to wake a host.
    pub fn set_wake_address(&self, host: &str, mac: &str) -> StateResult<ComputeNode> {
        let now = epoch_secs();
        self.update_json::<ComputeNode, _>(NODES, host, |node| {
            node.mac_to_wake = Some(mac.to_string());
            node.updated_at = now;
            Ok(())
        })
    }

    // ── Host stats ─────────────────────────────────────────────────

    /// Insert a host stat observation.
    pub fn put_host_stat(&self, stat: &HostStat) -> StateResult<()> {
        self.put_json(HOST_STATS, &stat.table_key(), stat)
    }

    /// Read per-host stats for nodes matching `filter`.
    ///
    /// Only hosts with at least one retained observation are returned.
    /// Lifecycle fields always reflect the node's current record.
    pub fn compute_node_stats(
        &self,
        filter: SuspendFilter,
        aggregation: StatAggregation,
    ) -> StateResult<Vec<HostStat>> {
        let nodes: BTreeMap<String, ComputeNode> = self
            .list_nodes_in(filter)?
            .into_iter()
            .map(|n| (n.host.clone(), n))
            .collect();

        let mut rows: BTreeMap<String, Vec<HostStat>> = BTreeMap::new();
        for stat in self.list_json::<HostStat>(HOST_STATS)? {
            if nodes.contains_key(&stat.host) {
                rows.entry(stat.host.clone()).or_default().push(stat);
            }
        }

        let mut results = Vec::with_capacity(rows.len());
        for (host, samples) in rows {
            let node = &nodes[&host];
            let latest = samples
                .iter()
                .max_by_key(|s| s.created_at)
                .cloned()
                .ok_or_else(|| StateError::NotFound(host.clone()))?;
            let mut stat = match aggregation {
                StatAggregation::Latest => latest,
                StatAggregation::Mean => {
                    let n = samples.len() as f64;
                    HostStat {
                        cpu_used_percent: samples.iter().map(|s| s.cpu_used_percent).sum::<f64>()
                            / n,
                        memory_used_mb: samples.iter().map(|s| s.memory_used_mb).sum::<f64>() / n,
                        ..latest
                    }
                }
            };
            stat.suspend_state = node.suspend_state;
            stat.mac_to_wake = node.mac_to_wake.clone();
            results.push(stat);
        }
        Ok(results)
    }

    /// Purge host and instance stat rows created before `cutoff`.
    ///
    /// Returns the number of rows removed.
    pub fn clear_stats(&self, cutoff: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut removed = 0u32;
        {
            let mut hosts = txn.open_table(HOST_STATS).map_err(map_err!(Table))?;
            let expired = expired_keys::<HostStat>(&hosts, cutoff, |s| s.created_at)?;
            for key in &expired {
                hosts.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed += expired.len() as u32;

            let mut instances = txn.open_table(INSTANCE_STATS).map_err(map_err!(Table))?;
            let expired = expired_keys::<InstanceStat>(&instances, cutoff, |s| s.created_at)?;
            for key in &expired {
                instances.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed += expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(cutoff, removed, "stats cleared");
        Ok(removed)
    }

    // ── Instances ──────────────────────────────────────────────────

    /// Insert or update an instance record.
    pub fn put_instance(&self, instance: &InstanceRecord) -> StateResult<()> {
        self.put_json(INSTANCES, &instance.id, instance)
    }

    pub fn get_instance(&self, id: &str) -> StateResult<Option<InstanceRecord>> {
        self.get_json(INSTANCES, id)
    }

    /// List all instances, ordered by id.
    pub fn list_instances(&self) -> StateResult<Vec<InstanceRecord>> {
        self.list_json(INSTANCES)
    }

    /// List the instances currently placed on `host`.
    pub fn list_instances_on_host(&self, host: &str) -> StateResult<Vec<InstanceRecord>> {
        Ok(self
            .list_instances()?
            .into_iter()
            .filter(|i| i.host == host)
            .collect())
    }

    /// Re-home an instance after a migration completed.
    pub fn move_instance(&self, id: &str, host: &str) -> StateResult<InstanceRecord> {
        let now = epoch_secs();
        self.update_json::<InstanceRecord, _>(INSTANCES, id, |inst| {
            inst.host = host.to_string();
            inst.updated_at = now;
            Ok(())
        })
    }

    /// Delete an instance record. Returns true if it existed.
    pub fn delete_instance(&self, id: &str) -> StateResult<bool> {
        self.delete_key(INSTANCES, id)
    }

    // ── Instance stats ─────────────────────────────────────────────

    /// Insert an instance stat observation. Samples sharing a timestamp are
    /// all kept.
    pub fn put_instance_stat(&self, stat: &InstanceStat) -> StateResult<()> {
        let bytes = serde_json::to_vec(stat).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let seq = Self::next_id(&txn, "instance_stats")?;
            let mut t = txn.open_table(INSTANCE_STATS).map_err(map_err!(Table))?;
            t.insert(stat.table_key(seq).as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// List all retained instance stat observations.
    pub fn list_instance_stats(&self) -> StateResult<Vec<InstanceStat>> {
        self.list_json(INSTANCE_STATS)
    }

    // ── Migrations ─────────────────────────────────────────────────

    /// Record a newly issued migration as in progress.
    pub fn create_migration(
        &self,
        instance_id: &str,
        source: &str,
        destination: Option<&str>,
        kind: MigrationKind,
    ) -> StateResult<MigrationRecord> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let record = {
            let id = Self::next_id(&txn, "migrations")?;
            let record = MigrationRecord {
                id,
                instance_id: instance_id.to_string(),
                source: source.to_string(),
                destination: destination.map(str::to_string),
                kind,
                status: MigrationStatus::InProgress,
                created_at: now,
                updated_at: now,
            };
            let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
            let mut t = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            t.insert(record.table_key().as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            record
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = record.id, instance = %instance_id, %source, "migration recorded");
        Ok(record)
    }

    pub fn get_migration(&self, id: u64) -> StateResult<Option<MigrationRecord>> {
        self.get_json(MIGRATIONS, &format!("{id:020}"))
    }

    /// Set the status of a migration record.
    pub fn set_migration_status(
        &self,
        id: u64,
        status: MigrationStatus,
    ) -> StateResult<MigrationRecord> {
        let now = epoch_secs();
        self.update_json::<MigrationRecord, _>(MIGRATIONS, &format!("{id:020}"), |m| {
            m.status = status;
            m.updated_at = now;
            Ok(())
        })
    }

    /// Mark the in-progress migrations of an instance as finished.
    ///
    /// Called by whoever observes the instance running on its new host.
    /// Returns the number of records updated.
    pub fn finish_migrations_for_instance(
        &self,
        instance_id: &str,
        destination: &str,
    ) -> StateResult<u32> {
        self.settle_migrations(instance_id, |_| true, |m| {
            m.status = MigrationStatus::Finished;
            m.destination = Some(destination.to_string());
        })
    }

    /// Mark the in-progress migrations of an instance leaving `source` as
    /// failed.
    ///
    /// Called when the instance is observed still running on its source
    /// host. Returns the number of records updated.
    pub fn fail_migrations_for_instance(
        &self,
        instance_id: &str,
        source: &str,
    ) -> StateResult<u32> {
        let updated = self.settle_migrations(
            instance_id,
            |m| m.source == source,
            |m| m.status = MigrationStatus::Failed,
        )?;
        if updated > 0 {
            debug!(instance = %instance_id, %source, updated, "migrations failed");
        }
        Ok(updated)
    }

    /// Apply `settle` to every in-progress migration of `instance_id`
    /// accepted by `select`, in one write transaction.
    fn settle_migrations(
        &self,
        instance_id: &str,
        select: impl Fn(&MigrationRecord) -> bool,
        settle: impl Fn(&mut MigrationRecord),
    ) -> StateResult<u32> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let mut updated = 0u32;
        {
            let mut t = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            let mut pending = Vec::new();
            for entry in t.iter().map_err(map_err!(Read))? {
                let (_, value) = entry.map_err(map_err!(Read))?;
                let record: MigrationRecord =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                if record.instance_id == instance_id
                    && record.status == MigrationStatus::InProgress
                    && select(&record)
                {
                    pending.push(record);
                }
            }
            for mut record in pending {
                settle(&mut record);
                record.updated_at = now;
                let bytes = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                t.insert(record.table_key().as_str(), bytes.as_slice())
                    .map_err(map_err!(Write))?;
                updated += 1;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Purge `confirmed` and `failed` migration records last updated before
    /// `cutoff`. Returns the number of records removed.
    pub fn clear_migrations(&self, cutoff: u64) -> StateResult<u32> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut t = txn.open_table(MIGRATIONS).map_err(map_err!(Table))?;
            let expired = expired_keys::<MigrationRecord>(&t, cutoff, |m| match m.status {
                MigrationStatus::Confirmed | MigrationStatus::Failed => m.updated_at,
                MigrationStatus::InProgress | MigrationStatus::Finished => u64::MAX,
            })?;
            for key in &expired {
                t.remove(key.as_str()).map_err(map_err!(Write))?;
            }
            removed = expired.len() as u32;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if removed > 0 {
            debug!(cutoff, removed, "settled migrations cleared");
        }
        Ok(removed)
    }

    /// List all migration records, oldest first.
    pub fn list_migrations(&self) -> StateResult<Vec<MigrationRecord>> {
        self.list_json(MIGRATIONS)
    }

    /// List migration records with the given status.
    pub fn list_migrations_with_status(
        &self,
        status: MigrationStatus,
    ) -> StateResult<Vec<MigrationRecord>> {
        Ok(self
            .list_migrations()?
            .into_iter()
            .filter(|m| m.status == status)
            .collect())
    }

    /// In-progress migrations moving instances off or onto `host`.
    pub fn in_progress_migrations_for_host(&self, host: &str) -> StateResult<Vec<MigrationRecord>> {
        Ok(self
            .list_migrations_with_status(MigrationStatus::InProgress)?
            .into_iter()
            .filter(|m| m.touches(host))
            .collect())
    }

    // ── Rules ──────────────────────────────────────────────────────

    /// Store a new rule and return it with its assigned id.
    pub fn create_rule(&self, rule: &NewRule) -> StateResult<LoadBalanceRule> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored = {
            let id = Self::next_id(&txn, "rules")?;
            let stored = LoadBalanceRule {
                id,
                rule_type: rule.rule_type,
                value: rule.value.clone(),
                allow: rule.allow,
            };
            let bytes = serde_json::to_vec(&stored).map_err(map_err!(Serialize))?;
            let mut t = txn.open_table(RULES).map_err(map_err!(Table))?;
            t.insert(stored.table_key().as_str(), bytes.as_slice())
                .map_err(map_err!(Write))?;
            stored
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(id = stored.id, "rule created");
        Ok(stored)
    }

    pub fn get_rule(&self, id: u64) -> StateResult<Option<LoadBalanceRule>> {
        self.get_json(RULES, &format!("{id:020}"))
    }

    /// List all rules, ordered by id.
    pub fn list_rules(&self) -> StateResult<Vec<LoadBalanceRule>> {
        self.list_json(RULES)
    }

    /// Delete a rule. Returns true if it existed.
    pub fn delete_rule(&self, id: u64) -> StateResult<bool> {
        self.delete_key(RULES, &format!("{id:020}"))
    }
}

/// Collect the keys of rows whose timestamp is older than `cutoff`.
fn expired_keys<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    cutoff: u64,
    created_at: impl Fn(&T) -> u64,
) -> StateResult<Vec<String>> {
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if created_at(&row) < cutoff {
            keys.push(key.value().to_string());
        }
    }
    Ok(keys)
}

/// Count the rows matching `pred`.
fn count_rows<T: DeserializeOwned>(
    table: &impl ReadableTable<&'static str, &'static [u8]>,
    pred: impl Fn(&T) -> bool,
) -> StateResult<usize> {
    let mut count = 0;
    for entry in table.iter().map_err(map_err!(Read))? {
        let (_, value) = entry.map_err(map_err!(Read))?;
        let row: T = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
        if pred(&row) {
            count += 1;
        }
    }
    Ok(count)
}

/// Current unix time in seconds.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_node(host: &str) -> ComputeNode {
        ComputeNode {
            host: host.to_string(),
            memory_total_mb: 4096,
            vcpus: 8,
            suspend_state: SuspendState::Active,
            mac_to_wake: None,
            updated_at: 1000,
        }
    }

    fn host_stat(host: &str, cpu: f64, mem: f64, created_at: u64) -> HostStat {
        HostStat {
            host: host.to_string(),
            cpu_used_percent: cpu,
            memory_used_mb: mem,
            memory_total_mb: 4096,
            vcpus: 8,
            suspend_state: SuspendState::Active,
            mac_to_wake: None,
            created_at,
        }
    }

    fn instance_stat(id: &str, host: &str, created_at: u64) -> InstanceStat {
        InstanceStat {
            instance_id: id.to_string(),
            host: host.to_string(),
            cpu_used_percent: 10.0,
            memory_used_mb: 256.0,
            created_at,
        }
    }

    // ── Nodes and lifecycle ────────────────────────────────────────

    #[test]
    fn node_put_and_get() {
        let store = StateStore::open_in_memory().unwrap();
        let node = test_node("compute1");

        store.put_node(&node).unwrap();

        assert_eq!(store.get_node("compute1").unwrap(), Some(node));
        assert!(store.get_node("compute2").unwrap().is_none());
    }

    #[test]
    fn list_nodes_in_filters_by_state() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();
        let mut b = test_node("b");
        b.suspend_state = SuspendState::Suspended;
        store.put_node(&b).unwrap();
        let mut c = test_node("c");
        c.suspend_state = SuspendState::NotSuspended;
        store.put_node(&c).unwrap();

        let active: Vec<_> = store
            .list_nodes_in(SuspendFilter::Active)
            .unwrap()
            .into_iter()
            .map(|n| n.host)
            .collect();
        assert_eq!(active, vec!["a", "c"]);
        assert_eq!(store.list_nodes_in(SuspendFilter::Only).unwrap().len(), 1);
        assert_eq!(store.list_nodes_in(SuspendFilter::All).unwrap().len(), 3);
    }

    #[test]
    fn transition_follows_legal_edges() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();

        let node = store.transition_host("a", SuspendState::Suspending).unwrap();
        assert_eq!(node.suspend_state, SuspendState::Suspending);
        store.transition_host("a", SuspendState::Suspended).unwrap();
        store.transition_host("a", SuspendState::Active).unwrap();

        assert_eq!(
            store.get_node("a").unwrap().unwrap().suspend_state,
            SuspendState::Active
        );
    }

    #[test]
    fn illegal_transition_is_rejected_without_write() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();

        let err = store.transition_host("a", SuspendState::Suspended).unwrap_err();
        assert!(matches!(
            err,
            StateError::InvalidTransition {
                from: SuspendState::Active,
                to: SuspendState::Suspended,
                ..
            }
        ));
        assert_eq!(
            store.get_node("a").unwrap().unwrap().suspend_state,
            SuspendState::Active
        );
    }

    #[test]
    fn suspend_refused_while_instances_remain() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();
        store.transition_host("a", SuspendState::Suspending).unwrap();
        // Placement reported after the host was seen empty.
        store
            .put_instance(&InstanceRecord {
                id: "i-1".to_string(),
                host: "a".to_string(),
                memory_mb: 512,
                vcpus: 1,
                updated_at: 1000,
            })
            .unwrap();

        let err = store.transition_host("a", SuspendState::Suspended).unwrap_err();
        assert!(matches!(err, StateError::HostNotEmpty { instances: 1, .. }));
        assert_eq!(
            store.get_node("a").unwrap().unwrap().suspend_state,
            SuspendState::Suspending
        );

        store.move_instance("i-1", "b").unwrap();
        store.transition_host("a", SuspendState::Suspended).unwrap();
    }

    #[test]
    fn transition_unknown_host_is_not_found() {
        let store = StateStore::open_in_memory().unwrap();
        let err = store.transition_host("ghost", SuspendState::Suspending).unwrap_err();
        assert!(matches!(err, StateError::NotFound(_)));
    }

    #[test]
    fn wake_address_is_recorded() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();

        store.set_wake_address("a", "aa:bb:cc:dd:ee:ff").unwrap();

        let node = store.get_node("a").unwrap().unwrap();
        assert_eq!(node.mac_to_wake.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
    }

    // ── Host stats ─────────────────────────────────────────────────

    #[test]
    fn node_stats_latest_and_mean() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_node(&test_node("a")).unwrap();
        store.put_host_stat(&host_stat("a", 10.0, 1000.0, 100)).unwrap();
        store.put_host_stat(&host_stat("a", 30.0, 3000.0, 200)).unwrap();

        let latest = store
            .compute_node_stats(SuspendFilter::Active, StatAggregation::Latest)
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].cpu_used_percent, 30.0);
        assert_eq!(latest[0].created_at, 200);

        let mean = store
            .compute_node_stats(SuspendFilter::Active, StatAggregation::Mean)
            .unwrap();
        assert_eq!(mean[0].cpu_used_percent, 20.0);
        assert_eq!(mean[0].memory_used_mb, 2000.0);
    }

    #[test]
    fn node_stats_respect_suspend_filter() {
        let store = StateStore::open_in_memory().unwrap();
        let mut node = test_node("a");
        node.suspend_state = SuspendState::Suspending;
        store.put_node(&node).unwrap();
        store.put_host_stat(&host_stat("a", 10.0, 1000.0, 100)).unwrap();

        assert!(store
            .compute_node_stats(SuspendFilter::Active, StatAggregation::Latest)
            .unwrap()
            .is_empty());
        let suspending = store
            .compute_node_stats(SuspendFilter::Suspending, StatAggregation::Latest)
            .unwrap();
        assert_eq!(suspending[0].suspend_state, SuspendState::Suspending);
    }

    #[test]
    fn clear_stats_is_idempotent() {
        let store = StateStore::open_in_memory().unwrap();
        store.put_host_stat(&host_stat("a", 10.0, 1000.0, 100)).unwrap();
        store.put_host_stat(&host_stat("a", 10.0, 1000.0, 500)).unwrap();
        store.put_instance_stat(&instance_stat("i-1", "a", 100)).unwrap();
        store.put_instance_stat(&instance_stat("i-1", "a", 600)).unwrap();

        assert_eq!(store.clear_stats(300).unwrap(), 2);
        assert_eq!(store.clear_stats(300).unwrap(), 0);

        assert_eq!(store.list_instance_stats().unwrap().len(), 1);
    }

    #[test]
    fn same_second_instance_samples_are_kept() {
        let store = StateStore::open_in_memory().unwrap();
        let mut first = instance_stat("i-1", "a", 100);
        first.cpu_used_percent = 20.0;
        let mut second = instance_stat("i-1", "a", 100);
        second.cpu_used_percent = 40.0;

        store.put_instance_stat(&first).unwrap();
        store.put_instance_stat(&second).unwrap();

        assert_eq!(store.list_instance_stats().unwrap(), vec![first, second]);
        assert_eq!(store.clear_stats(101).unwrap(), 2);
    }

    // ── Instances ──────────────────────────────────────────────────

    #[test]
    fn instances_by_host_and_move() {
        let store = StateStore::open_in_memory().unwrap();
        for (id, host) in [("i-1", "a"), ("i-2", "a"), ("i-3", "b")] {
            store
                .put_instance(&InstanceRecord {
                    id: id.to_string(),
                    host: host.to_string(),
                    memory_mb: 512,
                    vcpus: 1,
                    updated_at: 1000,
                })
                .unwrap();
        }

        assert_eq!(store.list_instances_on_host("a").unwrap().len(), 2);

        store.move_instance("i-1", "b").unwrap();
        assert_eq!(store.list_instances_on_host("a").unwrap().len(), 1);
        assert_eq!(store.list_instances_on_host("b").unwrap().len(), 2);

        assert!(store.delete_instance("i-3").unwrap());
        assert!(!store.delete_instance("i-3").unwrap());
    }

    // ── Migrations ─────────────────────────────────────────────────

    #[test]
    fn migration_lifecycle() {
        let store = StateStore::open_in_memory().unwrap();

        let first = store
            .create_migration("i-1", "a", Some("b"), MigrationKind::Live)
            .unwrap();
        let second = store
            .create_migration("i-2", "c", None, MigrationKind::Cold)
            .unwrap();
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);

        assert_eq!(store.in_progress_migrations_for_host("b").unwrap().len(), 1);
        assert!(store.in_progress_migrations_for_host("z").unwrap().is_empty());

        assert_eq!(store.finish_migrations_for_instance("i-2", "d").unwrap(), 1);
        let finished = store.get_migration(2).unwrap().unwrap();
        assert_eq!(finished.status, MigrationStatus::Finished);
        assert_eq!(finished.destination.as_deref(), Some("d"));

        store.set_migration_status(1, MigrationStatus::Failed).unwrap();
        assert!(store.in_progress_migrations_for_host("a").unwrap().is_empty());
    }

    #[test]
    fn failing_migrations_matches_source() {
        let store = StateStore::open_in_memory().unwrap();
        store
            .create_migration("i-1", "a", Some("b"), MigrationKind::Live)
            .unwrap();

        assert_eq!(store.fail_migrations_for_instance("i-1", "b").unwrap(), 0);
        assert_eq!(store.fail_migrations_for_instance("i-1", "a").unwrap(), 1);
        assert_eq!(
            store.get_migration(1).unwrap().unwrap().status,
            MigrationStatus::Failed
        );
        assert!(store.in_progress_migrations_for_host("a").unwrap().is_empty());
        // Settled records are left alone.
        assert_eq!(store.fail_migrations_for_instance("i-1", "a").unwrap(), 0);
        assert_eq!(store.finish_migrations_for_instance("i-1", "b").unwrap(), 0);
    }

    #[test]
    fn only_settled_migrations_are_cleared() {
        let store = StateStore::open_in_memory().unwrap();
        for instance in ["i-1", "i-2", "i-3", "i-4"] {
            store
                .create_migration(instance, "a", Some("b"), MigrationKind::Live)
                .unwrap();
        }
        store.set_migration_status(1, MigrationStatus::Confirmed).unwrap();
        store.set_migration_status(2, MigrationStatus::Failed).unwrap();
        store.set_migration_status(3, MigrationStatus::Finished).unwrap();

        assert_eq!(store.clear_migrations(0).unwrap(), 0);
        let later = epoch_secs() + 10;
        assert_eq!(store.clear_migrations(later).unwrap(), 2);
        assert_eq!(store.clear_migrations(later).unwrap(), 0);

        let left: Vec<u64> = store.list_migrations().unwrap().iter().map(|m| m.id).collect();
        assert_eq!(left, vec![3, 4]);
    }

    // ── Rules ──────────────────────────────────────────────────────

    #[test]
    fn rule_create_list_delete() {
        let store = StateStore::open_in_memory().unwrap();
        let rule = NewRule {
            rule_type: RuleType::HostPattern,
            value: "compute-*".to_string(),
            allow: true,
        };

        let a = store.create_rule(&rule).unwrap();
        let b = store.create_rule(&rule).unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(store.list_rules().unwrap().len(), 2);

        assert!(store.delete_rule(a.id).unwrap());
        assert!(!store.delete_rule(a.id).unwrap());
        assert_eq!(store.get_rule(b.id).unwrap(), Some(b));
    }

    // ── Persistence (on-disk) ──────────────────────────────────────

    #[test]
    fn persistence_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("test.redb");

        {
            let store = StateStore::open(&db_path).unwrap();
            store.put_node(&test_node("compute1")).unwrap();
            store
                .create_rule(&NewRule {
                    rule_type: RuleType::HaGroup,
                    value: "db".to_string(),
                    allow: false,
                })
                .unwrap();
        }

        let store = StateStore::open(&db_path).unwrap();
        assert!(store.get_node("compute1").unwrap().is_some());
        // The id sequence continues after reopen.
        let next = store
            .create_rule(&NewRule {
                rule_type: RuleType::HaGroup,
                value: "web".to_string(),
                allow: true,
            })
            .unwrap();
        assert_eq!(next.id, 2);
    }

    #[test]
    fn empty_store_operations() {
        let store = StateStore::open_in_memory().unwrap();

        assert!(store.list_nodes().unwrap().is_empty());
        assert!(store.list_instances().unwrap().is_empty());
        assert!(store.list_rules().unwrap().is_empty());
        assert!(store.list_migrations().unwrap().is_empty());
        assert_eq!(store.clear_stats(u64::MAX).unwrap(), 0);
        assert!(!store.delete_node("nope").unwrap());
        assert!(!store.delete_rule(42).unwrap());
    }
}
