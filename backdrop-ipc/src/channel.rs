//! Bounded, byte-counted message channel between a coordinator and one worker
//!
//! A [`MessageChannel`] has two independent directions. Each direction holds
//! whole frames up to a fixed number of bytes; a writer waits until the frame
//! fits and a reader waits until a frame is available. Frames are delivered
//! in write order and never split.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, MAX_CHANNEL_CAPACITY, MIN_CHANNEL_CAPACITY};
use crate::transport::{decode_envelope, encode_envelope};

/// One of the two directions of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Coordinator to worker
    Command,
    /// Worker to coordinator
    Result,
}

struct QueueState {
    frames: VecDeque<(Bytes, OwnedSemaphorePermit)>,
    used: usize,
    closed: bool,
}

struct BoundedQueue {
    capacity: usize,
    permits: Arc<Semaphore>,
    state: Mutex<QueueState>,
    readable: Notify,
    write_lock: tokio::sync::Mutex<()>,
}

impl BoundedQueue {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            permits: Arc::new(Semaphore::new(capacity)),
            state: Mutex::new(QueueState {
                frames: VecDeque::new(),
                used: 0,
                closed: false,
            }),
            readable: Notify::new(),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    async fn write(&self, frame: Bytes) -> Result<(), IpcError> {
        let size = frame.len();
        if size > self.capacity {
            return Err(IpcError::FrameTooLarge {
                size,
                capacity: self.capacity,
            });
        }

        // Writers queue up here so frames land in the order write was called
        let _ordered = self.write_lock.lock().await;
        if self.state.lock().closed {
            return Err(IpcError::ConnectionClosed);
        }

        // A zero-length frame still occupies a slot in the queue
        let permit = Arc::clone(&self.permits)
            .acquire_many_owned(size.max(1).min(self.capacity) as u32)
            .await
            .map_err(|_| IpcError::ConnectionClosed)?;

        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(IpcError::ConnectionClosed);
            }
            state.used += size;
            state.frames.push_back((frame, permit));
        }
        self.readable.notify_one();
        Ok(())
    }

    fn try_read(&self) -> Option<Bytes> {
        let mut state = self.state.lock();
        let (frame, permit) = state.frames.pop_front()?;
        state.used -= frame.len();
        drop(state);
        drop(permit);
        Some(frame)
    }

    async fn read(&self) -> Option<Bytes> {
        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let state = self.state.lock();
                if state.frames.is_empty() && state.closed {
                    return None;
                }
            }
            if let Some(frame) = self.try_read() {
                return Some(frame);
            }

            notified.await;
        }
    }

    fn close(&self) {
        let mut state = self.state.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);

        self.permits.close();
        self.readable.notify_waiters();
        self.readable.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn used(&self) -> usize {
        self.state.lock().used
    }

    fn len(&self) -> usize {
        self.state.lock().frames.len()
    }
}

/// Two bounded directions shared by a coordinator and a single worker
pub struct MessageChannel {
    capacity: usize,
    command: BoundedQueue,
    result: BoundedQueue,
}

impl std::fmt::Debug for MessageChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageChannel")
            .field("capacity", &self.capacity)
            .field("command_used", &self.command.used())
            .field("result_used", &self.result.used())
            .finish()
    }
}

impl MessageChannel {
    /// Create a channel whose directions each hold `capacity` bytes
    pub fn new(capacity: usize) -> Result<Self, IpcError> {
        if !(MIN_CHANNEL_CAPACITY..=MAX_CHANNEL_CAPACITY).contains(&capacity) {
            return Err(IpcError::InvalidCapacity {
                requested: capacity,
                min: MIN_CHANNEL_CAPACITY,
                max: MAX_CHANNEL_CAPACITY,
            });
        }

        Ok(Self {
            capacity,
            command: BoundedQueue::new(capacity),
            result: BoundedQueue::new(capacity),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn queue(&self, direction: Direction) -> &BoundedQueue {
        match direction {
            Direction::Command => &self.command,
            Direction::Result => &self.result,
        }
    }

    /// Append a frame, waiting for space when the direction is full.
    ///
    /// Fails with [`IpcError::FrameTooLarge`] when the frame can never fit and
    /// with [`IpcError::ConnectionClosed`] once the direction is closed.
    pub async fn write(&self, direction: Direction, frame: Bytes) -> Result<(), IpcError> {
        trace!(?direction, size = frame.len(), "Channel write");
        self.queue(direction).write(frame).await
    }

    /// Take the next frame, waiting while the direction is empty.
    ///
    /// Returns `None` once the direction is closed and drained.
    pub async fn read(&self, direction: Direction) -> Option<Bytes> {
        self.queue(direction).read().await
    }

    /// Take the next frame if one is queued
    pub fn try_read(&self, direction: Direction) -> Option<Bytes> {
        self.queue(direction).try_read()
    }

    /// Close a direction. Queued frames stay readable; blocked writers fail.
    pub fn close(&self, direction: Direction) {
        self.queue(direction).close();
    }

    /// Close both directions
    pub fn close_all(&self) {
        self.command.close();
        self.result.close();
    }

    pub fn is_closed(&self, direction: Direction) -> bool {
        self.queue(direction).is_closed()
    }

    /// Bytes currently queued in a direction
    pub fn used_bytes(&self, direction: Direction) -> usize {
        self.queue(direction).used()
    }

    /// Frames currently queued in a direction
    pub fn len(&self, direction: Direction) -> usize {
        self.queue(direction).len()
    }

    pub fn is_empty(&self, direction: Direction) -> bool {
        self.len(direction) == 0
    }

    /// Encode an envelope and write it as one frame
    pub async fn send<T: Serialize>(
        &self,
        direction: Direction,
        message: &MessageEnvelope<T>,
    ) -> Result<(), IpcError> {
        let frame = encode_envelope(message)?;
        self.write(direction, frame).await
    }

    /// Read and decode the next envelope
    pub async fn receive<T: DeserializeOwned>(
        &self,
        direction: Direction,
    ) -> Result<MessageEnvelope<T>, IpcError> {
        match self.read(direction).await {
            Some(frame) => decode_envelope(&frame),
            None => Err(IpcError::ConnectionClosed),
        }
    }
}
