//! Length-prefixed frame transport over byte streams
//!
//! Every frame is a 4-byte big-endian length followed by a JSON encoded
//! [`MessageEnvelope`]. A stream that ends in the middle of a frame is
//! reported as [`IpcError::TruncatedFrame`] and never partially decoded.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Size of the length prefix in front of every frame
pub const FRAME_HEADER_LEN: usize = 4;

/// Serialize an envelope into a frame payload
pub fn encode_envelope<T: Serialize>(message: &MessageEnvelope<T>) -> Result<Bytes, IpcError> {
    let json =
        serde_json::to_vec(message).map_err(|e| IpcError::SerializationError(e.to_string()))?;
    Ok(Bytes::from(json))
}

/// Deserialize a frame payload and check protocol compatibility
pub fn decode_envelope<T: DeserializeOwned>(frame: &[u8]) -> Result<MessageEnvelope<T>, IpcError> {
    let envelope: MessageEnvelope<T> = serde_json::from_slice(frame)
        .map_err(|e| IpcError::DeserializationError(e.to_string()))?;

    if envelope.protocol_version != IPC_PROTOCOL_VERSION {
        return Err(IpcError::ProtocolVersionMismatch {
            expected: IPC_PROTOCOL_VERSION,
            actual: envelope.protocol_version,
        });
    }

    Ok(envelope)
}

/// Frame codec with an upper bound on the payload size
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_len: usize,
}

impl FrameCodec {
    pub fn new(max_frame_len: usize) -> Self {
        Self { max_frame_len }
    }

    pub fn max_frame_len(&self) -> usize {
        self.max_frame_len
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = IpcError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, IpcError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; FRAME_HEADER_LEN];
        header.copy_from_slice(&src[..FRAME_HEADER_LEN]);
        let size = u32::from_be_bytes(header) as usize;
        if size > self.max_frame_len {
            return Err(IpcError::FrameTooLarge {
                size,
                capacity: self.max_frame_len,
            });
        }

        // Nothing is consumed until the whole frame is buffered
        let frame_len = FRAME_HEADER_LEN + size;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        Ok(Some(src.split_to(size)))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<BytesMut>, IpcError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(IpcError::TruncatedFrame {
                received: src.len(),
            }),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = IpcError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), IpcError> {
        if item.len() > self.max_frame_len {
            return Err(IpcError::FrameTooLarge {
                size: item.len(),
                capacity: self.max_frame_len,
            });
        }
        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

/// Reads frames from a byte stream such as a child's stdout
pub struct FrameReader<R> {
    inner: FramedRead<R, FrameCodec>,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(reader: R, max_frame_len: usize) -> Self {
        Self {
            inner: FramedRead::new(reader, FrameCodec::new(max_frame_len)),
        }
    }

    /// Read the next raw frame, `None` on a clean end of stream
    pub async fn read_frame(&mut self) -> Result<Option<Bytes>, IpcError> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(Some(frame.freeze())),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Receive and decode the next envelope
    pub async fn receive<T: DeserializeOwned>(&mut self) -> Result<MessageEnvelope<T>, IpcError> {
        match self.read_frame().await? {
            Some(frame) => decode_envelope(&frame),
            None => Err(IpcError::ConnectionClosed),
        }
    }
}

/// Writes frames to a byte stream such as a child's stdin
pub struct FrameWriter<W> {
    inner: FramedWrite<W, FrameCodec>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W, max_frame_len: usize) -> Self {
        Self {
            inner: FramedWrite::new(writer, FrameCodec::new(max_frame_len)),
        }
    }

    /// Write one raw frame and flush it
    pub async fn write_frame(&mut self, frame: Bytes) -> Result<(), IpcError> {
        self.inner.send(frame).await
    }

    /// Encode and send an envelope
    pub async fn send<T: Serialize>(&mut self, message: &MessageEnvelope<T>) -> Result<(), IpcError> {
        let frame = encode_envelope(message)?;
        self.write_frame(frame).await
    }

    /// Flush and shut down the underlying writer
    pub async fn close(&mut self) -> Result<(), IpcError> {
        SinkExt::<Bytes>::close(&mut self.inner).await
    }
}
