//! Runtime error types

use backdrop_ipc::IpcError;
use thiserror::Error;

/// Error returned by a [`crate::CommandExecutor`]
#[derive(Error, Debug)]
pub enum CommandError {
    /// The command ran and reported a failure
    #[error("[{code}] {message}")]
    Failed { code: String, message: String },

    /// The command stopped because cancellation was requested
    #[error("Command cancelled")]
    Cancelled,

    /// Replies could not be delivered to the coordinator
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CommandError {
    pub fn failed(code: impl Into<String>, message: impl Into<String>) -> Self {
        CommandError::Failed {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Error code reported in the `Done` reply
    pub fn code(&self) -> &str {
        match self {
            CommandError::Failed { code, .. } => code,
            CommandError::Cancelled => "CANCELLED",
            CommandError::Ipc(_) => "IPC",
            CommandError::Io(_) => "IO",
        }
    }

    /// Message reported in the `Done` reply
    pub fn message(&self) -> String {
        match self {
            CommandError::Failed { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Errors that end the worker loop itself
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    /// The coordinator sent something out of sequence
    #[error("Protocol error: {0}")]
    Protocol(String),
}
