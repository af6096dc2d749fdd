//! Error types for the backup engine

use thiserror::Error;

/// Every failure the engine can report.
///
/// Each variant is classified as retryable or fatal through
/// [`BackupError::is_retryable`]; the retry controller consults nothing else.
#[derive(Error, Debug)]
pub enum BackupError {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("credential error: {0}")]
    Credential(String),

    #[error("no credentials found for provider: {0}")]
    CredentialNotFound(String),

    #[error("transform error: {0}")]
    Transform(String),

    #[error("unsupported provider {0}")]
    UnsupportedProvider(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("task {task_id} timed out after {after}")]
    Timeout { task_id: String, after: String },

    #[error("task panic: {0}")]
    Panic(String),

    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("invalid status transition for task {task_id}: {from} -> {to}")]
    InvalidTransition {
        task_id: String,
        from: String,
        to: String,
    },

    #[error("failed to update task status: {0}")]
    StatusUpdate(String),

    #[error("schedule error: {0}")]
    Schedule(String),

    #[error("sync error: {0}")]
    Sync(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled: {0}")]
    Cancelled(String),

    #[error("operation failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        attempts: u32,
        last: Box<BackupError>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BackupError {
    /// Transient failures (network, IO, status persistence) may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BackupError::Provider(_) | BackupError::Io(_) | BackupError::StatusUpdate(_)
        )
    }

    /// Short, stable name of the error category, used in structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            BackupError::Validation(_) => "validation",
            BackupError::Credential(_) | BackupError::CredentialNotFound(_) => "credential",
            BackupError::Transform(_) => "transform",
            BackupError::UnsupportedProvider(_) | BackupError::Provider(_) => "provider",
            BackupError::Timeout { .. } => "timeout",
            BackupError::Panic(_) => "panic",
            BackupError::TaskNotFound(_) | BackupError::InvalidTransition { .. } => "task",
            BackupError::StatusUpdate(_) => "status",
            BackupError::Schedule(_) => "schedule",
            BackupError::Sync(_) => "sync",
            BackupError::Config(_) => "config",
            BackupError::Cancelled(_) => "cancelled",
            BackupError::RetriesExhausted { .. } => "retries_exhausted",
            BackupError::Io(_) => "io",
            BackupError::Serialization(_) => "serialization",
        }
    }
}

/// Result type alias used throughout the crate
pub type Result<T> = std::result::Result<T, BackupError>;
