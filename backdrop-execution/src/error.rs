//! Error types for worker coordination

use thiserror::Error;

use crate::handle::WorkerId;

/// Result type for coordinator operations
pub type ExecutionResult<T> = Result<T, ExecutionError>;

/// Worker coordination errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Too many workers: the limit of {max_workers} live workers is reached")]
    ResourceExhausted { max_workers: usize },

    #[error("Failed to spawn worker: {0}")]
    SpawnFailed(String),

    #[error("Worker not found: {0}")]
    NotFound(WorkerId),

    #[error("Worker {0} is detached")]
    Detached(WorkerId),

    #[error("Worker {0} is not running")]
    NotRunning(WorkerId),

    #[error("Worker {id} aborted: {reason}")]
    WorkerAborted { id: WorkerId, reason: String },

    #[error("Worker {0} was cancelled")]
    Cancelled(WorkerId),

    #[error("Command failed [{code}]: {message}")]
    CommandFailed { code: String, message: String },

    #[error("Result of worker {0} was already consumed")]
    ResultAlreadyConsumed(WorkerId),

    #[error("No Tokio runtime to drive workers: {0}")]
    NoRuntime(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

// Convert from config errors
impl From<backdrop_config::ConfigError> for ExecutionError {
    fn from(err: backdrop_config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

// Convert from IPC errors
impl From<backdrop_ipc::IpcError> for ExecutionError {
    fn from(err: backdrop_ipc::IpcError) -> Self {
        Self::Ipc(err.to_string())
    }
}
