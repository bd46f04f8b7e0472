//! Registry error taxonomy
//!
//! Callers match on error kind, not on concrete backend failure types.
//! Backends translate their native failures into these kinds; the registry
//! façade returns them verbatim so the transport can map kinds onto wire
//! status codes.

use thiserror::Error;

/// Errors surfaced by registry and backend operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// Referenced entity does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Request fails preconditions (empty ID, missing payload, bad config)
    #[error("invalid: {0}")]
    Invalid(String),

    /// Uniqueness violated in a backend that surfaces it
    #[error("conflict: {0}")]
    Conflict(String),

    /// Backend feature not implemented
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Cancellation handle fired before the operation completed
    #[error("operation canceled")]
    Canceled,

    /// Operation deadline elapsed
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Fallback for unclassified backend failures
    #[error("internal: {0}")]
    Internal(String),
}

impl RegistryError {
    pub fn relay_not_found(relay_id: &str) -> Self {
        Self::NotFound(format!("relay not registered: {relay_id}"))
    }

    pub fn agent_not_found(agent_id: &str) -> Self {
        Self::NotFound(format!("agent not registered: {agent_id}"))
    }

    /// True for the kinds raised by a fired cancellation handle.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Canceled | Self::DeadlineExceeded)
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;
