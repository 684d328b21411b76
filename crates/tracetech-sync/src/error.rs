//! Error types for the synchronization engine.

use tracetech_config::DecodeError;

/// Terminal failure of a live subscription.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection error: {0}")]
    ConnectionError(String),
}

/// Errors surfaced by engine operations.
///
/// Channel failures never escape the engine as errors; they are folded into
/// the connectivity status. Write failures are returned to the caller after
/// the optimistic change has been rolled back.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{collection}/{id} not found")]
    NotFound { collection: String, id: String },

    #[error("invalid credentials")]
    AuthMismatch,

    #[error("no authenticated actor")]
    NotAuthenticated,

    #[error("operation not allowed: {0}")]
    Forbidden(String),

    #[error("local storage error: {0}")]
    Storage(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SyncError {
    pub fn not_found(collection: impl Into<String>, id: impl Into<String>) -> Self {
        SyncError::NotFound {
            collection: collection.into(),
            id: id.into(),
        }
    }

    pub fn missing_fields(fields: &[&str]) -> Self {
        SyncError::Validation(format!("required field(s) missing: {}", fields.join(", ")))
    }
}

impl From<ChannelError> for SyncError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::PermissionDenied(reason) => SyncError::PermissionDenied(reason),
            ChannelError::ConnectionError(reason) => SyncError::ConnectionError(reason),
        }
    }
}

impl From<DecodeError> for SyncError {
    fn from(err: DecodeError) -> Self {
        SyncError::Validation(err.to_string())
    }
}

impl From<anyhow::Error> for SyncError {
    fn from(err: anyhow::Error) -> Self {
        SyncError::Storage(format!("{:#}", err))
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
