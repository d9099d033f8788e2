//! hostbal-api — REST API for hostbal.
//!
//! Thin axum layer over [`LoadBalancer`]: node listing and registration,
//! manual suspend/resume, instance and stat reporting, and rule CRUD.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/api/v1/nodes` | List nodes with latest usage |
//! | PUT | `/api/v1/nodes` | Register or update a node |
//! | POST | `/api/v1/nodes/{host}/suspend` | Evacuate and suspend a host |
//! | POST | `/api/v1/nodes/{host}/unsuspend` | Wake a suspended host |
//! | PUT | `/api/v1/instances` | Report an instance placement |
//! | DELETE | `/api/v1/instances/{id}` | Forget a deleted instance |
//! | POST | `/api/v1/instance-stats` | Report an instance load sample |
//! | GET | `/api/v1/rules` | List load-balance rules |
//! | POST | `/api/v1/rules` | Create a rule |
//! | DELETE | `/api/v1/rules/{id}` | Delete a rule |

pub mod handlers;
pub mod rule_handlers;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use axum::Router;
use axum::routing::{delete, get, post, put};
use hostbal_engine::LoadBalancer;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub lb: Arc<LoadBalancer>,
}

/// Build the complete API router.
pub fn build_router(lb: Arc<LoadBalancer>) -> Router {
    let state = ApiState { lb };

    let api_routes = Router::new()
        .route("/nodes", get(handlers::list_nodes).put(handlers::register_node))
        .route("/nodes/{host}/suspend", post(handlers::suspend_node))
        .route("/nodes/{host}/unsuspend", post(handlers::unsuspend_node))
        .route("/instances", put(handlers::put_instance))
        .route("/instances/{id}", delete(handlers::delete_instance))
        .route("/instance-stats", post(handlers::report_instance_stat))
        .route(
            "/rules",
            get(rule_handlers::list_rules).post(rule_handlers::create_rule),
        )
        .route("/rules/{id}", delete(rule_handlers::delete_rule))
        .with_state(state);

    Router::new().nest("/api/v1", api_routes)
}
