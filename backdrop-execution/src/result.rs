//! Result streams handed to callers

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use backdrop_ipc::{decode_envelope, DataFormat, Direction, WorkerReply};
use bytes::Bytes;
use futures::stream::{self, BoxStream};
use futures::{Stream, StreamExt};
use tracing::debug;

use crate::error::{ExecutionError, ExecutionResult};
use crate::handle::{Failure, TerminalState, WorkerHandle, WorkerId};

/// One item of a worker's result
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResultChunk {
    Data { bytes: Bytes, format: DataFormat },
    Notice(String),
    /// Successful end of the result
    Done { tags: Vec<String> },
}

/// What `result()` returns
pub enum ResultOutcome {
    Stream(ResultStream),
    /// The worker has not finished and the caller asked not to block
    StillRunning,
}

impl fmt::Debug for ResultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResultOutcome::Stream(stream) => f.debug_tuple("Stream").field(&stream.id).finish(),
            ResultOutcome::StillRunning => f.write_str("StillRunning"),
        }
    }
}

/// Everything a result stream produced, gathered in memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedResult {
    pub data: Vec<u8>,
    pub chunks: usize,
    pub notices: Vec<String>,
    pub tags: Vec<String>,
}

impl CollectedResult {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Data and notices in emission order, ending with [`ResultChunk::Done`] or an error
pub struct ResultStream {
    id: WorkerId,
    handle: Arc<WorkerHandle>,
    inner: BoxStream<'static, ExecutionResult<ResultChunk>>,
}

impl ResultStream {
    pub(crate) fn new(handle: Arc<WorkerHandle>) -> Self {
        let id = handle.id();
        let inner = stream::unfold(Some(Arc::clone(&handle)), |state| async move {
            let handle = state?;
            let item = next_item(&handle).await;
            let next = match &item {
                Ok(ResultChunk::Data { .. }) | Ok(ResultChunk::Notice(_)) => Some(handle),
                _ => None,
            };
            Some((item, next))
        })
        .boxed();

        Self { id, handle, inner }
    }

    pub fn worker_id(&self) -> WorkerId {
        self.id
    }

    /// Drain the stream into memory
    pub async fn collect_all(mut self) -> ExecutionResult<CollectedResult> {
        let mut collected = CollectedResult::default();
        while let Some(item) = self.next().await {
            match item? {
                ResultChunk::Data { bytes, .. } => {
                    collected.chunks += 1;
                    collected.data.extend_from_slice(&bytes);
                }
                ResultChunk::Notice(message) => collected.notices.push(message),
                ResultChunk::Done { tags } => collected.tags = tags,
            }
        }
        Ok(collected)
    }
}

impl Stream for ResultStream {
    type Item = ExecutionResult<ResultChunk>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        // The pump discards whatever the worker still sends
        self.handle.channel().close(Direction::Result);
    }
}

async fn next_item(handle: &WorkerHandle) -> ExecutionResult<ResultChunk> {
    let id = handle.id();
    loop {
        let Some(frame) = handle.channel().read(Direction::Result).await else {
            return terminal_item(id, handle.wait_terminal().await);
        };

        let reply = decode_envelope::<WorkerReply>(&frame)?.message;
        match reply {
            WorkerReply::Data { chunk, format } => {
                return Ok(ResultChunk::Data {
                    bytes: Bytes::from(chunk),
                    format,
                })
            }
            WorkerReply::Notice { message } => return Ok(ResultChunk::Notice(message)),
            // The outcome is taken from the terminal state once the process is gone
            WorkerReply::Done { .. } => continue,
            other => debug!("Ignoring {} reply in result of worker {}", other.kind(), id),
        }
    }
}

fn terminal_item(id: WorkerId, terminal: TerminalState) -> ExecutionResult<ResultChunk> {
    match terminal {
        TerminalState::Completed { tags } => Ok(ResultChunk::Done { tags }),
        TerminalState::Failed(Failure::Command { code, message }) => {
            Err(ExecutionError::CommandFailed { code, message })
        }
        TerminalState::Failed(Failure::Aborted { reason }) => {
            Err(ExecutionError::WorkerAborted { id, reason })
        }
        TerminalState::Cancelled => Err(ExecutionError::Cancelled(id)),
    }
}
