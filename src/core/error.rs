//! Error types for balancer operations.

use thiserror::Error;

use crate::core::schema::ValidationError;

/// Errors produced synchronously by balancer components.
#[derive(Debug, Error)]
pub enum BalancerError {
    /// Submitted name is not a registered task type.
    #[error("unknown task type {0}")]
    UnknownTaskType(String),
    /// Arguments did not satisfy the task type's parameter schema.
    #[error("schema verification failed")]
    SchemaViolation(Vec<ValidationError>),
    /// A task type with this name is already registered.
    #[error("duplicate task type {0}")]
    DuplicateTaskType(String),
    /// Task implementation rejected its arguments while computing resources.
    #[error("verification failed: {0}")]
    Verification(String),
    /// `verify` returned a malformed resource list.
    #[error("invalid resource list: {0}")]
    InvalidResources(String),
    /// Persistent store failure.
    #[error("datastore error: {0}")]
    Datastore(String),
    /// The balancer no longer accepts work.
    #[error("balancer is shut down")]
    Shutdown,
    /// A thread of control could not be created.
    #[error("failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// Configuration validation failed.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl BalancerError {
    /// True for submission-time rejections the caller can fix by changing its request.
    #[must_use]
    pub const fn is_invalid_argument(&self) -> bool {
        matches!(
            self,
            Self::UnknownTaskType(_)
                | Self::SchemaViolation(_)
                | Self::Verification(_)
                | Self::InvalidResources(_)
        )
    }

    /// Itemized schema violations, empty for every other variant.
    #[must_use]
    pub fn validation_errors(&self) -> &[ValidationError] {
        match self {
            Self::SchemaViolation(errors) => errors,
            _ => &[],
        }
    }
}

/// Application-facing result using anyhow for task implementations and collaborators.
pub type AppResult<T> = Result<T, anyhow::Error>;
