//! REST API handlers for nodes and instances.
//!
//! Each handler calls into the `LoadBalancer` and returns JSON responses
//! in the `{success, data, error}` envelope.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::{Deserialize, Serialize};

use hostbal_engine::{BalancerError, NodeView};
use hostbal_state::*;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
pub(crate) struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> Response {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
        .into_response()
}

/// Map an engine error onto an HTTP status.
///
/// Lifecycle edges refused by the store are conflicts, like `WrongState`.
pub(crate) fn engine_error(e: &BalancerError) -> Response {
    let status = match e {
        BalancerError::HostNotFound(_)
        | BalancerError::InstanceNotFound(_)
        | BalancerError::RuleNotFound(_)
        | BalancerError::State(StateError::NotFound(_)) => StatusCode::NOT_FOUND,
        BalancerError::WrongState { .. }
        | BalancerError::State(StateError::InvalidTransition { .. })
        | BalancerError::State(StateError::HostNotEmpty { .. }) => StatusCode::CONFLICT,
        BalancerError::InvalidHost(_)
        | BalancerError::InvalidConfig(_)
        | BalancerError::UnknownStrategy { .. } => StatusCode::BAD_REQUEST,
        BalancerError::State(_) | BalancerError::Collaborator(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %e, "request failed");
    }
    error_response(&e.to_string(), status)
}

// ── Nodes ──────────────────────────────────────────────────────

/// Node as listed by the API; usage is rendered with two decimals.
#[derive(Debug, Serialize)]
pub struct NodeResponse {
    pub host: String,
    pub suspend_state: SuspendState,
    pub cpu_used_percent: String,
    pub ram_used_percent: String,
    pub memory_total_mb: u64,
    pub vcpus: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_to_wake: Option<String>,
}

impl From<NodeView> for NodeResponse {
    fn from(view: NodeView) -> Self {
        Self {
            host: view.host,
            suspend_state: view.suspend_state,
            cpu_used_percent: format!("{:.2}", view.cpu_used_percent),
            ram_used_percent: format!("{:.2}", view.ram_used_percent),
            memory_total_mb: view.memory_total_mb,
            vcpus: view.vcpus,
            mac_to_wake: view.mac_to_wake,
        }
    }
}

/// GET /api/v1/nodes
pub async fn list_nodes(State(state): State<ApiState>) -> impl IntoResponse {
    match state.lb.list_nodes() {
        Ok(nodes) => {
            let nodes: Vec<NodeResponse> = nodes.into_iter().map(NodeResponse::from).collect();
            ApiResponse::ok(nodes).into_response()
        }
        Err(e) => engine_error(&e),
    }
}

/// Node registration body.
#[derive(Debug, Deserialize)]
pub struct RegisterNodeRequest {
    pub host: String,
    pub memory_total_mb: u64,
    pub vcpus: u32,
}

/// PUT /api/v1/nodes
pub async fn register_node(
    State(state): State<ApiState>,
    Json(req): Json<RegisterNodeRequest>,
) -> impl IntoResponse {
    match state
        .lb
        .register_node(&req.host, req.memory_total_mb, req.vcpus)
    {
        Ok(node) => ApiResponse::ok(node).into_response(),
        Err(e) => engine_error(&e),
    }
}

/// POST /api/v1/nodes/{host}/suspend
pub async fn suspend_node(
    State(state): State<ApiState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    match state.lb.suspend_host(&host).await {
        Ok(true) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "host": host,
                "status": SuspendState::Suspending,
            })),
        )
            .into_response(),
        Ok(false) => error_response(
            &format!("host {host} could not be evacuated"),
            StatusCode::CONFLICT,
        ),
        Err(e) => engine_error(&e),
    }
}

/// POST /api/v1/nodes/{host}/unsuspend
pub async fn unsuspend_node(
    State(state): State<ApiState>,
    Path(host): Path<String>,
) -> impl IntoResponse {
    match state.lb.resume_host(&host).await {
        Ok(()) => (
            StatusCode::ACCEPTED,
            ApiResponse::ok(serde_json::json!({
                "host": host,
                "status": SuspendState::Active,
            })),
        )
            .into_response(),
        Err(e) => engine_error(&e),
    }
}

// ── Instances ──────────────────────────────────────────────────

/// Instance placement body.
#[derive(Debug, Deserialize)]
pub struct PutInstanceRequest {
    pub id: String,
    pub host: String,
    pub memory_mb: u64,
    #[serde(default = "default_vcpus")]
    pub vcpus: u32,
}

fn default_vcpus() -> u32 {
    1
}

/// PUT /api/v1/instances
pub async fn put_instance(
    State(state): State<ApiState>,
    Json(req): Json<PutInstanceRequest>,
) -> impl IntoResponse {
    let record = InstanceRecord {
        id: req.id,
        host: req.host,
        memory_mb: req.memory_mb,
        vcpus: req.vcpus,
        updated_at: epoch_secs(),
    };
    match state.lb.put_instance(&record) {
        Ok(()) => ApiResponse::ok(record).into_response(),
        Err(e) => engine_error(&e),
    }
}

/// DELETE /api/v1/instances/{id}
pub async fn delete_instance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.lb.delete_instance(&id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}

/// Instance load sample body. `created_at` defaults to now.
#[derive(Debug, Deserialize)]
pub struct InstanceStatRequest {
    pub instance_id: String,
    pub host: String,
    pub cpu_used_percent: f64,
    pub memory_used_mb: f64,
    #[serde(default)]
    pub created_at: Option<u64>,
}

/// POST /api/v1/instance-stats
pub async fn report_instance_stat(
    State(state): State<ApiState>,
    Json(req): Json<InstanceStatRequest>,
) -> impl IntoResponse {
    if !req.cpu_used_percent.is_finite()
        || req.cpu_used_percent < 0.0
        || !req.memory_used_mb.is_finite()
        || req.memory_used_mb < 0.0
    {
        return error_response("usage figures must be non-negative", StatusCode::BAD_REQUEST);
    }
    let stat = InstanceStat {
        instance_id: req.instance_id,
        host: req.host,
        cpu_used_percent: req.cpu_used_percent,
        memory_used_mb: req.memory_used_mb,
        created_at: req.created_at.unwrap_or_else(epoch_secs),
    };
    match state.lb.report_instance_stat(&stat) {
        Ok(()) => (StatusCode::CREATED, ApiResponse::ok(stat)).into_response(),
        Err(e) => engine_error(&e),
    }
}
