//! REST API handlers for load-balance rules.
//!
//! Rules are stored for the placement filter; the API only checks that a
//! rule is well formed.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use regex::Regex;

use hostbal_state::{NewRule, RuleType};

use crate::ApiState;
use crate::handlers::{ApiResponse, engine_error, error_response};

/// Reject empty values and host patterns that do not compile.
fn validate_rule(rule: &NewRule) -> Result<(), String> {
    if rule.value.trim().is_empty() {
        return Err("rule value must not be empty".to_string());
    }
    if rule.rule_type == RuleType::HostPattern {
        Regex::new(&rule.value).map_err(|e| format!("invalid host pattern: {e}"))?;
    }
    Ok(())
}

/// GET /api/v1/rules
pub async fn list_rules(State(state): State<ApiState>) -> impl IntoResponse {
    match state.lb.list_rules() {
        Ok(rules) => ApiResponse::ok(rules).into_response(),
        Err(e) => engine_error(&e),
    }
}

/// POST /api/v1/rules
pub async fn create_rule(
    State(state): State<ApiState>,
    Json(rule): Json<NewRule>,
) -> impl IntoResponse {
    if let Err(msg) = validate_rule(&rule) {
        return error_response(&msg, StatusCode::BAD_REQUEST);
    }
    match state.lb.create_rule(&rule) {
        Ok(stored) => (StatusCode::ACCEPTED, ApiResponse::ok(stored)).into_response(),
        Err(e) => engine_error(&e),
    }
}

/// DELETE /api/v1/rules/{id}
pub async fn delete_rule(State(state): State<ApiState>, Path(id): Path<u64>) -> impl IntoResponse {
    match state.lb.delete_rule(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => engine_error(&e),
    }
}
