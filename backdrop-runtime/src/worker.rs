//! Worker process implementation
//!
//! The worker speaks the frame protocol over its stdin (commands from the
//! coordinator) and stdout (replies). Logging must go to stderr.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, info, warn};

use backdrop_ipc::{
    encode_envelope, max_data_chunk, CoordinatorCommand, DataFormat, DoneStatus, FrameReader,
    FrameWriter, IpcError, MessageEnvelope, WorkerReply, ENVELOPE_OVERHEAD, MAX_EXECUTE_FRAME_LEN,
};

use crate::error::{CommandError, WorkerError};
use crate::executor::CommandExecutor;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Longest progress phase label forwarded to the coordinator
const MAX_PHASE_LEN: usize = 256;

/// Longest error code kept when a failure has to be shortened
const MAX_CODE_LEN: usize = 32;

/// Worker process main entry point
pub async fn worker_main(
    worker_id: String,
    executor: &dyn CommandExecutor,
) -> Result<DoneStatus, WorkerError> {
    info!("Starting worker process {} ({})", worker_id, executor.name());

    let status = Worker::stdio(worker_id.clone()).run(executor).await?;

    info!("Worker process {} finished: {}", worker_id, status);
    Ok(status)
}

/// One worker: a command stream in, a reply stream out
pub struct Worker {
    worker_id: String,
    reader: FrameReader<BoxedReader>,
    writer: BoxedWriter,
}

impl Worker {
    /// Create a worker over arbitrary byte streams
    pub fn new(
        worker_id: impl Into<String>,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            reader: FrameReader::new(Box::new(reader), MAX_EXECUTE_FRAME_LEN),
            writer: Box::new(writer),
        }
    }

    /// Create a worker bound to the process's stdin and stdout
    pub fn stdio(worker_id: impl Into<String>) -> Self {
        Self::new(worker_id, tokio::io::stdin(), tokio::io::stdout())
    }

    /// Receive the command, execute it and report the outcome
    pub async fn run<E>(self, executor: &E) -> Result<DoneStatus, WorkerError>
    where
        E: CommandExecutor + ?Sized,
    {
        let Worker {
            worker_id,
            mut reader,
            writer,
        } = self;

        let envelope: MessageEnvelope<CoordinatorCommand> = reader.receive().await?;
        let (command, capacity) = match envelope.message {
            CoordinatorCommand::Execute {
                worker_id: assigned,
                command,
                channel_capacity,
            } => {
                if assigned != worker_id {
                    warn!(
                        "Worker {} was sent a command addressed to {}",
                        worker_id, assigned
                    );
                }
                (command, channel_capacity)
            }
            other => {
                return Err(WorkerError::Protocol(format!(
                    "expected an execute command, got {:?}",
                    other
                )))
            }
        };

        let mut writer = FrameWriter::new(writer, capacity);
        writer
            .send(&MessageEnvelope::new(WorkerReply::Ready {
                worker_id: worker_id.clone(),
                pid: std::process::id(),
            }))
            .await?;

        let token = CancellationToken::new();
        let listener = tokio::spawn(listen_for_cancel(reader, token.clone(), worker_id.clone()));

        debug!("Worker {} executing {} bytes of command", worker_id, command.len());
        let mut ctx = WorkerContext::new(worker_id.clone(), writer, capacity, token);
        let outcome = executor.execute(&command, &mut ctx).await;
        let (mut writer, data_chunks, data_bytes) = ctx.into_parts();

        let (mut status, mut tags) = match outcome {
            Ok(tags) => (DoneStatus::Success, tags),
            Err(CommandError::Cancelled) => (DoneStatus::Cancelled, Vec::new()),
            Err(e) => (
                DoneStatus::Error {
                    code: e.code().to_string(),
                    message: e.message(),
                },
                Vec::new(),
            ),
        };
        debug!(
            "Worker {} sent {} data chunks ({} bytes), status {}",
            worker_id, data_chunks, data_bytes, status
        );

        // Drop trailing tags, then shorten the error, until the reply fits the channel
        let mut done = encode_done(&status, &tags)?;
        while done.len() > capacity && !tags.is_empty() {
            tags.pop();
            done = encode_done(&status, &tags)?;
        }
        if done.len() > capacity {
            status = shorten_status(status, capacity);
            done = encode_done(&status, &tags)?;
        }
        writer.write_frame(done).await?;
        writer.close().await?;
        listener.abort();

        Ok(status)
    }
}

fn encode_done(status: &DoneStatus, tags: &[String]) -> Result<Bytes, IpcError> {
    encode_envelope(&MessageEnvelope::new(WorkerReply::Done {
        status: status.clone(),
        tags: tags.to_vec(),
    }))
}

fn shorten_status(status: DoneStatus, capacity: usize) -> DoneStatus {
    match status {
        DoneStatus::Error { code, message } => {
            let budget = text_budget(capacity);
            let code = truncate_at_char_boundary(&code, MAX_CODE_LEN.min(budget / 2));
            let message = truncate_at_char_boundary(&message, budget.saturating_sub(code.len()));
            DoneStatus::Error { code, message }
        }
        other => other,
    }
}

/// Raw text bytes that fit a frame whatever JSON escaping does to them
fn text_budget(capacity: usize) -> usize {
    // Escaping expands a byte to at most six
    capacity.saturating_sub(ENVELOPE_OVERHEAD) / 6
}

async fn listen_for_cancel(
    mut reader: FrameReader<BoxedReader>,
    token: CancellationToken,
    worker_id: String,
) {
    loop {
        match reader.receive::<CoordinatorCommand>().await {
            Ok(envelope) => match envelope.message {
                CoordinatorCommand::Cancel => {
                    info!("Worker {} received cancel request", worker_id);
                    token.cancel();
                }
                CoordinatorCommand::Shutdown => {
                    info!("Worker {} received shutdown", worker_id);
                    token.cancel();
                    break;
                }
                CoordinatorCommand::Execute { .. } => {
                    warn!("Worker {} ignoring a second execute command", worker_id);
                }
            },
            Err(IpcError::ConnectionClosed) => {
                debug!("Worker {} command stream closed", worker_id);
                token.cancel();
                break;
            }
            Err(e) => {
                warn!("Worker {} command stream failed: {}", worker_id, e);
                token.cancel();
                break;
            }
        }
    }
}

/// Handle given to a [`CommandExecutor`] for streaming output
pub struct WorkerContext {
    worker_id: String,
    writer: FrameWriter<BoxedWriter>,
    capacity: usize,
    token: CancellationToken,
    last_progress: Option<(u64, u64, String)>,
    data_chunks: u64,
    data_bytes: u64,
}

impl WorkerContext {
    fn new(
        worker_id: String,
        writer: FrameWriter<BoxedWriter>,
        capacity: usize,
        token: CancellationToken,
    ) -> Self {
        Self {
            worker_id,
            writer,
            capacity,
            token,
            last_progress: None,
            data_chunks: 0,
            data_bytes: 0,
        }
    }

    fn into_parts(self) -> (FrameWriter<BoxedWriter>, u64, u64) {
        (self.writer, self.data_chunks, self.data_bytes)
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Byte capacity of the channel this worker writes into
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest data chunk that fits a single frame
    pub fn max_chunk(&self) -> usize {
        max_data_chunk(self.capacity).max(1)
    }

    /// Stream result data, split into chunks that fit the channel.
    ///
    /// Waits while the coordinator's result queue is full.
    pub async fn send_data(&mut self, data: &[u8], format: DataFormat) -> Result<(), CommandError> {
        for chunk in data.chunks(self.max_chunk()) {
            self.send(WorkerReply::data(chunk, format)).await?;
            self.data_chunks += 1;
            self.data_bytes += chunk.len() as u64;
        }
        Ok(())
    }

    pub async fn send_text(&mut self, text: &str) -> Result<(), CommandError> {
        self.send_data(text.as_bytes(), DataFormat::Text).await
    }

    /// Send an informational message, shortened when it cannot fit a frame
    pub async fn notice(&mut self, message: impl Into<String>) -> Result<(), CommandError> {
        let message = message.into();
        let frame = encode_envelope(&MessageEnvelope::new(WorkerReply::Notice {
            message: message.clone(),
        }))?;
        if frame.len() <= self.capacity {
            self.writer.write_frame(frame).await?;
            return Ok(());
        }

        let shortened = truncate_at_char_boundary(&message, text_budget(self.capacity));
        self.send(WorkerReply::Notice { message: shortened }).await?;
        Ok(())
    }

    /// Report progress; the coordinator records it without replying.
    ///
    /// Repeating the last reported values sends nothing.
    pub async fn progress(
        &mut self,
        done: u64,
        total: u64,
        phase: impl Into<String>,
    ) -> Result<(), CommandError> {
        let limit = MAX_PHASE_LEN.min(text_budget(self.capacity));
        let phase = truncate_at_char_boundary(&phase.into(), limit);
        let update = (done, total, phase);
        if self.last_progress.as_ref() == Some(&update) {
            return Ok(());
        }
        let (done, total, phase) = update.clone();
        self.send(WorkerReply::Progress { done, total, phase }).await?;
        self.last_progress = Some(update);
        Ok(())
    }

    /// Whether the coordinator asked this worker to stop
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested; does not borrow the context
    pub fn cancelled(&self) -> WaitForCancellationFutureOwned {
        self.token.clone().cancelled_owned()
    }

    /// Token for executors that hand cancellation to their own tasks
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    async fn send(&mut self, reply: WorkerReply) -> Result<(), IpcError> {
        self.writer.send(&MessageEnvelope::new(reply)).await
    }
}

fn truncate_at_char_boundary(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text[..end].to_string()
}
