//! Fake collaborators and record builders for unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use hostbal_state::*;

use crate::collaborators::{ExecutorReply, MigrationExecutor, PlacementFilter, PowerControl};

pub fn node(host: &str, memory_total_mb: u64, vcpus: u32) -> ComputeNode {
    ComputeNode {
        host: host.to_string(),
        memory_total_mb,
        vcpus,
        suspend_state: SuspendState::Active,
        mac_to_wake: None,
        updated_at: 0,
    }
}

pub fn instance(id: &str, host: &str, memory_mb: u64) -> InstanceRecord {
    InstanceRecord {
        id: id.to_string(),
        host: host.to_string(),
        memory_mb,
        vcpus: 1,
        updated_at: 0,
    }
}

pub fn sample(id: &str, host: &str, cpu: f64, memory_mb: f64, at: u64) -> InstanceStat {
    InstanceStat {
        instance_id: id.to_string(),
        host: host.to_string(),
        cpu_used_percent: cpu,
        memory_used_mb: memory_mb,
        created_at: at,
    }
}

/// Register a node and one instance per `(id, cpu%)` pair, with a fresh sample.
pub fn seed_host(store: &StateStore, host: &str, instances: &[(&str, f64)]) {
    store.put_node(&node(host, 1000, 4)).unwrap();
    let now = epoch_secs();
    for (id, cpu) in instances {
        store.put_instance(&instance(id, host, 100)).unwrap();
        store
            .put_instance_stat(&sample(id, host, *cpu, 50.0, now))
            .unwrap();
    }
}

/// One executor or power call, as recorded by the fakes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    LiveMigrate(String, Option<String>),
    Resize(String),
    ConfirmResize(String),
    Suspend(String),
    Wake(String),
}

/// Executor that records calls and replies per its settings.
#[derive(Default)]
pub struct FakeExecutor {
    pub calls: Mutex<Vec<Call>>,
    /// Instances for which the scheduler reports no valid host.
    pub no_valid_host: Mutex<HashSet<String>>,
    /// Instances whose migration call errors.
    pub failing: Mutex<HashSet<String>>,
}

impl FakeExecutor {
    pub fn reject(&self, instance_id: &str) {
        self.no_valid_host.lock().unwrap().insert(instance_id.to_string());
    }

    pub fn fail(&self, instance_id: &str) {
        self.failing.lock().unwrap().insert(instance_id.to_string());
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    fn reply(&self, instance_id: &str) -> anyhow::Result<ExecutorReply> {
        if self.failing.lock().unwrap().contains(instance_id) {
            anyhow::bail!("executor unavailable");
        }
        if self.no_valid_host.lock().unwrap().contains(instance_id) {
            return Ok(ExecutorReply::NoValidHost);
        }
        Ok(ExecutorReply::Accepted)
    }
}

#[async_trait]
impl MigrationExecutor for FakeExecutor {
    async fn live_migrate(
        &self,
        instance_id: &str,
        destination: Option<&str>,
    ) -> anyhow::Result<ExecutorReply> {
        self.calls.lock().unwrap().push(Call::LiveMigrate(
            instance_id.to_string(),
            destination.map(str::to_string),
        ));
        self.reply(instance_id)
    }

    async fn resize(&self, instance_id: &str) -> anyhow::Result<ExecutorReply> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Resize(instance_id.to_string()));
        self.reply(instance_id)
    }

    async fn confirm_resize(&self, instance_id: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::ConfirmResize(instance_id.to_string()));
        Ok(())
    }
}

/// Power controller that records calls; every host's MAC is `mac-{host}`.
#[derive(Default)]
pub struct FakePower {
    pub calls: Mutex<Vec<Call>>,
    /// Make `suspend_host` error.
    pub suspend_fails: Mutex<bool>,
}

impl FakePower {
    pub fn fail_suspend(&self) {
        *self.suspend_fails.lock().unwrap() = true;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PowerControl for FakePower {
    async fn host_mac_address(&self, host: &str) -> anyhow::Result<String> {
        Ok(format!("mac-{host}"))
    }

    async fn suspend_host(&self, host: &str) -> anyhow::Result<()> {
        self.calls
            .lock()
            .unwrap()
            .push(Call::Suspend(host.to_string()));
        if *self.suspend_fails.lock().unwrap() {
            anyhow::bail!("host did not power down");
        }
        Ok(())
    }

    async fn wake_host(&self, mac: &str) -> anyhow::Result<()> {
        self.calls.lock().unwrap().push(Call::Wake(mac.to_string()));
        Ok(())
    }
}

/// Placement filter that permits every candidate in the given order.
pub struct AllowAll;

impl PlacementFilter for AllowAll {
    fn filter_hosts(
        &self,
        _instance_id: &str,
        candidates: &[String],
        _rules: &[LoadBalanceRule],
    ) -> Vec<String> {
        candidates.to_vec()
    }
}
