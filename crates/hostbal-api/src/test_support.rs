//! No-op collaborators for handler tests.

use std::sync::Arc;

use async_trait::async_trait;

use hostbal_engine::*;
use hostbal_state::{LoadBalanceRule, StateStore};

use crate::ApiState;

struct Noop;

#[async_trait]
impl MigrationExecutor for Noop {
    async fn live_migrate(
        &self,
        _instance_id: &str,
        _destination: Option<&str>,
    ) -> anyhow::Result<ExecutorReply> {
        Ok(ExecutorReply::Accepted)
    }

    async fn resize(&self, _instance_id: &str) -> anyhow::Result<ExecutorReply> {
        Ok(ExecutorReply::Accepted)
    }

    async fn confirm_resize(&self, _instance_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl PowerControl for Noop {
    async fn host_mac_address(&self, host: &str) -> anyhow::Result<String> {
        Ok(format!("mac-{host}"))
    }

    async fn suspend_host(&self, _host: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn wake_host(&self, _mac: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

impl PlacementFilter for Noop {
    fn filter_hosts(
        &self,
        _instance_id: &str,
        candidates: &[String],
        _rules: &[LoadBalanceRule],
    ) -> Vec<String> {
        candidates.to_vec()
    }
}

pub fn test_state() -> ApiState {
    let store = StateStore::open_in_memory().unwrap();
    let noop = Arc::new(Noop);
    let lb = LoadBalancer::new(
        BalancerConfig::default(),
        store,
        Collaborators {
            placement: noop.clone(),
            executor: noop.clone(),
            power: noop,
        },
    )
    .unwrap();
    ApiState { lb: Arc::new(lb) }
}
