//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// The peer closed its end, no more frames will arrive
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },

    /// A frame can never fit into the channel
    #[error("Frame of {size} bytes exceeds channel capacity of {capacity} bytes")]
    FrameTooLarge { size: usize, capacity: usize },

    /// The stream ended in the middle of a frame
    #[error("Stream ended inside a frame ({received} bytes of a partial frame buffered)")]
    TruncatedFrame { received: usize },

    /// Channel capacity outside of the accepted range
    #[error("Channel capacity must be between {min} and {max} bytes, got {requested}")]
    InvalidCapacity {
        requested: usize,
        min: usize,
        max: usize,
    },
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        IpcError::IoError(err.to_string())
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
