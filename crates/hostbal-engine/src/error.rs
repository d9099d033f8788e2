//! Engine error types.

use thiserror::Error;

use hostbal_state::{StateError, SuspendState};

/// Errors surfaced by the balancing engine.
///
/// "No valid destination" is not an error: strategies report it as a
/// `false`/`NoValidHost` result.
#[derive(Debug, Error)]
pub enum BalancerError {
    #[error("host not found: {0}")]
    HostNotFound(String),

    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    #[error("rule not found: {0}")]
    RuleNotFound(u64),

    #[error("host {host} is {state}, expected {expected}")]
    WrongState {
        host: String,
        state: SuspendState,
        expected: &'static str,
    },

    #[error("invalid host name: {0:?}")]
    InvalidHost(String),

    #[error("unknown {axis} strategy: {name}")]
    UnknownStrategy { axis: &'static str, name: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("state store error: {0}")]
    State(#[from] StateError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] anyhow::Error),
}

pub type BalancerResult<T> = Result<T, BalancerError>;
