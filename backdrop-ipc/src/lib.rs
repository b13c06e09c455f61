//! Inter-process communication for Backdrop
//!
//! This crate provides the message protocol, the length-prefixed frame
//! transport and the bounded message channel used between the coordinator
//! and its worker processes.

pub mod channel;
pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use channel::{Direction, MessageChannel};
pub use error::IpcError;
pub use protocol::{
    max_data_chunk, CoordinatorCommand, DataFormat, DoneStatus, MessageEnvelope, ProgressState,
    WorkerReply, DEFAULT_CHANNEL_CAPACITY, ENVELOPE_OVERHEAD, IPC_PROTOCOL_VERSION,
    MAX_CHANNEL_CAPACITY, MAX_COMMAND_LEN, MAX_EXECUTE_FRAME_LEN, MIN_CHANNEL_CAPACITY,
};
pub use transport::{decode_envelope, encode_envelope, FrameCodec, FrameReader, FrameWriter};
