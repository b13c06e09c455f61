//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Default byte capacity of each channel direction
pub const DEFAULT_CHANNEL_CAPACITY: usize = 64 * 1024;

/// Smallest channel that still fits a framed envelope with a useful payload
pub const MIN_CHANNEL_CAPACITY: usize = 1024;

/// Upper bound on a channel's byte capacity (16 MiB)
pub const MAX_CHANNEL_CAPACITY: usize = 16 * 1024 * 1024;

/// Longest command text accepted for launch (4 MiB)
pub const MAX_COMMAND_LEN: usize = 4 * 1024 * 1024;

/// Bytes reserved in every frame for the envelope wrapped around a payload
pub const ENVELOPE_OVERHEAD: usize = 256;

/// Largest frame a worker accepts on stdin; JSON escaping can grow a
/// command up to six times its raw length
pub const MAX_EXECUTE_FRAME_LEN: usize = MAX_COMMAND_LEN * 6 + ENVELOPE_OVERHEAD;

/// Messages sent from the coordinator to a worker process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorCommand {
    /// First frame on the command direction: the work to run
    Execute {
        worker_id: String,
        command: String,
        channel_capacity: usize,
    },

    /// Cooperative cancellation request
    Cancel,

    /// Coordinator is going away
    Shutdown,
}

/// Messages sent from a worker process back to the coordinator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReply {
    /// Worker received its command and is about to execute it
    Ready { worker_id: String, pid: u32 },

    /// One chunk of result data
    Data {
        #[serde(with = "base64_bytes")]
        chunk: Vec<u8>,
        format: DataFormat,
    },

    /// Informational message
    Notice { message: String },

    /// Progress counters, consumed without a reply
    Progress { done: u64, total: u64, phase: String },

    /// Terminal message, sent exactly once
    Done {
        status: DoneStatus,
        #[serde(default)]
        tags: Vec<String>,
    },
}

impl WorkerReply {
    /// Create a data reply
    pub fn data(chunk: impl Into<Vec<u8>>, format: DataFormat) -> Self {
        WorkerReply::Data {
            chunk: chunk.into(),
            format,
        }
    }

    /// Short name of the reply kind, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerReply::Ready { .. } => "ready",
            WorkerReply::Data { .. } => "data",
            WorkerReply::Notice { .. } => "notice",
            WorkerReply::Progress { .. } => "progress",
            WorkerReply::Done { .. } => "done",
        }
    }
}

/// Describes how a data chunk should be interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataFormat {
    Text,
    Binary,
}

/// Final status reported by a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DoneStatus {
    Success,
    Error { code: String, message: String },
    Cancelled,
}

impl DoneStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, DoneStatus::Success)
    }
}

impl fmt::Display for DoneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoneStatus::Success => write!(f, "success"),
            DoneStatus::Error { code, message } => write!(f, "error [{}]: {}", code, message),
            DoneStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Progress reported by a worker
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressState {
    pub done: u64,
    pub total: u64,
    pub phase: String,
    pub updated_at: Option<DateTime<Utc>>,
}

impl ProgressState {
    /// Completion percentage, when a total is known
    pub fn percent(&self) -> Option<f64> {
        if self.total == 0 {
            return None;
        }
        Some((self.done as f64 / self.total as f64) * 100.0)
    }
}

/// Largest raw data chunk whose encoded frame fits a channel of `capacity` bytes
pub fn max_data_chunk(capacity: usize) -> usize {
    (capacity.saturating_sub(ENVELOPE_OVERHEAD) / 4) * 3
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_envelope() {
        let envelope = MessageEnvelope::new(CoordinatorCommand::Cancel);
        assert_eq!(envelope.protocol_version, IPC_PROTOCOL_VERSION);
        assert!(envelope.is_compatible());

        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"cancel\""));
    }

    #[test]
    fn test_data_chunk_is_base64_on_the_wire() {
        let reply = WorkerReply::data(vec![0u8, 159, 255], DataFormat::Binary);
        let json = serde_json::to_string(&reply).unwrap();
        assert!(json.contains("\"chunk\":\"AJ//\""));

        let parsed: WorkerReply = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, reply);
    }

    #[test]
    fn test_done_without_tags_defaults_to_empty() {
        let parsed: WorkerReply =
            serde_json::from_str(r#"{"type":"done","status":{"status":"success"}}"#).unwrap();
        assert_eq!(
            parsed,
            WorkerReply::Done {
                status: DoneStatus::Success,
                tags: vec![]
            }
        );
    }

    #[test]
    fn test_max_data_chunk_fits_capacity() {
        let capacity = MIN_CHANNEL_CAPACITY;
        let chunk = max_data_chunk(capacity);
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            vec![0u8; chunk],
        );
        assert!(encoded.len() + ENVELOPE_OVERHEAD <= capacity);
        assert_eq!(max_data_chunk(100), 0);
    }

    #[test]
    fn test_progress_percent() {
        let mut progress = ProgressState::default();
        assert_eq!(progress.percent(), None);

        progress.done = 25;
        progress.total = 100;
        assert_eq!(progress.percent(), Some(25.0));
    }

    #[test]
    fn test_done_status_display() {
        let status = DoneStatus::Error {
            code: "22012".to_string(),
            message: "division by zero".to_string(),
        };
        assert_eq!(status.to_string(), "error [22012]: division by zero");
        assert!(!status.is_success());
        assert!(DoneStatus::Success.is_success());
    }
}
