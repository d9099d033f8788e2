//! Standalone regression tests.
//!
//! Drives the REST API and the balance ticks together: nodes and instances
//! are reported over HTTP, ticks run against the same state store, and the
//! results are read back through the API.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use hostbal_api::build_router;
use hostbal_engine::*;
use hostbal_state::*;

/// Moves instances in the store as soon as a migration is requested.
struct StoreExecutor {
    store: StateStore,
}

#[async_trait]
impl MigrationExecutor for StoreExecutor {
    async fn live_migrate(
        &self,
        instance_id: &str,
        destination: Option<&str>,
    ) -> anyhow::Result<ExecutorReply> {
        let Some(destination) = destination else {
            return Ok(ExecutorReply::NoValidHost);
        };
        self.store.move_instance(instance_id, destination)?;
        self.store
            .finish_migrations_for_instance(instance_id, destination)?;
        Ok(ExecutorReply::Accepted)
    }

    async fn resize(&self, _instance_id: &str) -> anyhow::Result<ExecutorReply> {
        Ok(ExecutorReply::NoValidHost)
    }

    async fn confirm_resize(&self, _instance_id: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct MacPower;

#[async_trait]
impl PowerControl for MacPower {
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

struct AllowAll;

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

fn test_lb(config: BalancerConfig) -> Arc<LoadBalancer> {
    let store = StateStore::open_in_memory().unwrap();
    let lb = LoadBalancer::new(
        config,
        store.clone(),
        Collaborators {
            placement: Arc::new(AllowAll),
            executor: Arc::new(StoreExecutor { store }),
            power: Arc::new(MacPower),
        },
    )
    .unwrap();
    Arc::new(lb)
}

async fn send(
    router: &Router,
    method: &str,
    uri: &str,
    body: Option<Value>,
) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn register(router: &Router, host: &str) {
    let (status, _) = send(
        router,
        "PUT",
        "/api/v1/nodes",
        Some(json!({"host": host, "memory_total_mb": 1000, "vcpus": 4})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

async fn place(router: &Router, id: &str, host: &str, cpu: f64) {
    let (status, _) = send(
        router,
        "PUT",
        "/api/v1/instances",
        Some(json!({"id": id, "host": host, "memory_mb": 100})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = send(
        router,
        "POST",
        "/api/v1/instance-stats",
        Some(json!({
            "instance_id": id,
            "host": host,
            "cpu_used_percent": cpu,
            "memory_used_mb": 50.0,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn standalone_api_list_nodes_empty() {
    let router = build_router(test_lb(BalancerConfig::default()));

    let (status, body) = send(&router, "GET", "/api/v1/nodes", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn standalone_overloaded_host_is_relieved() {
    let mut config = BalancerConfig::default();
    config.standard_deviation.deviation_factor = 0.5;
    let lb = test_lb(config);
    let router = build_router(lb.clone());

    register(&router, "compute-a").await;
    register(&router, "compute-b").await;
    place(&router, "vm-1", "compute-a", 50.0).await;
    place(&router, "vm-2", "compute-a", 40.0).await;
    place(&router, "vm-3", "compute-b", 10.0).await;

    let outcome = lb.tick_balance().await.unwrap();
    assert_eq!(
        outcome,
        BalanceOutcome::Overloaded {
            host: "compute-a".to_string(),
            migrated: true
        }
    );
    assert_eq!(lb.tick_confirm_migrations().await.unwrap(), 1);

    let (status, body) = send(&router, "GET", "/api/v1/nodes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["host"], "compute-a");
    assert_eq!(body["data"][0]["cpu_used_percent"], "90.00");
    assert_eq!(body["data"][0]["ram_used_percent"], "10.00");
}

#[tokio::test]
async fn standalone_consolidation_round_trip() {
    let mut config = BalancerConfig::default();
    config.loadbalancer.enable_underload = true;
    let lb = test_lb(config);
    let router = build_router(lb.clone());

    register(&router, "compute-a").await;
    register(&router, "compute-b").await;
    place(&router, "vm-1", "compute-a", 1.0).await;
    place(&router, "vm-2", "compute-b", 2.0).await;

    // compute-a is idle: evacuate it, then suspend it once empty.
    let outcome = lb.tick_balance().await.unwrap();
    assert_eq!(
        outcome,
        BalanceOutcome::Underload(UnderloadAction::Evacuating("compute-a".to_string()))
    );
    let report = lb.tick_reconcile_suspension().await.unwrap();
    assert_eq!(report.suspended, vec!["compute-a".to_string()]);

    let (_, body) = send(&router, "GET", "/api/v1/nodes", None).await;
    assert_eq!(body["data"][0]["suspend_state"], "suspended");
    assert_eq!(body["data"][0]["mac_to_wake"], "mac-compute-a");

    // Manual wake.
    let (status, _) = send(&router, "POST", "/api/v1/nodes/compute-a/unsuspend", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let (status, _) = send(&router, "POST", "/api/v1/nodes/compute-a/unsuspend", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (_, body) = send(&router, "GET", "/api/v1/nodes", None).await;
    assert_eq!(body["data"][0]["suspend_state"], "active");
}

#[tokio::test]
async fn standalone_manual_suspend_of_unknown_host() {
    let router = build_router(test_lb(BalancerConfig::default()));

    let (status, body) = send(&router, "POST", "/api/v1/nodes/ghost/suspend", None).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn standalone_rule_crud() {
    let router = build_router(test_lb(BalancerConfig::default()));

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/rules",
        Some(json!({"type": "host_pattern", "value": "^compute-", "allow": true})),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = body["data"]["id"].as_u64().unwrap();

    let (status, body) = send(&router, "GET", "/api/v1/rules", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["type"], "host_pattern");

    let uri = format!("/api/v1/rules/{id}");
    let (status, _) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn standalone_deleted_instance_frees_host() {
    let lb = test_lb(BalancerConfig::default());
    let router = build_router(lb.clone());

    register(&router, "compute-a").await;
    place(&router, "vm-1", "compute-a", 10.0).await;

    let (status, _) = send(&router, "DELETE", "/api/v1/instances/vm-1", None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = send(&router, "DELETE", "/api/v1/instances/vm-1", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["success"], false);

    // Nothing left to move: the host can be suspended right away.
    let (status, _) = send(&router, "POST", "/api/v1/nodes/compute-a/suspend", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let report = lb.tick_reconcile_suspension().await.unwrap();
    assert_eq!(report.suspended, vec!["compute-a".to_string()]);
}

#[tokio::test]
async fn standalone_stats_are_purged_after_ttl() {
    let lb = test_lb(BalancerConfig::default());
    let router = build_router(lb.clone());

    register(&router, "compute-a").await;
    place(&router, "vm-1", "compute-a", 10.0).await;
    lb.tick_balance().await.unwrap();

    let far_future = epoch_secs() + 3600;
    assert_eq!(lb.clear_stats_at(far_future).unwrap(), 2);
    assert_eq!(lb.clear_stats_at(far_future).unwrap(), 0);

    let (_, body) = send(&router, "GET", "/api/v1/nodes", None).await;
    assert_eq!(body["data"][0]["cpu_used_percent"], "0.00");
}
