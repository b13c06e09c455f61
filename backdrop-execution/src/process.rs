//! Worker process manager
//!
//! Spawns one OS process per worker and binds it to the handle's
//! [`MessageChannel`](backdrop_ipc::MessageChannel) with three tasks:
//!
//! - a command writer that sends the `Execute` frame and then drains the
//!   command direction into the child's stdin,
//! - a reply pump that decodes frames from the child's stdout and forwards
//!   them to the result direction,
//! - a supervisor that awaits the child's exit and settles the terminal state.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use backdrop_config::WorkerConfig;
use backdrop_ipc::{
    decode_envelope, encode_envelope, CoordinatorCommand, Direction, DoneStatus, FrameReader,
    FrameWriter, MessageEnvelope, WorkerReply, MAX_EXECUTE_FRAME_LEN,
};
use bytes::Bytes;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::handle::{Failure, TerminalState, WorkerHandle, WorkerId};
use crate::registry::Registry;

/// How the reply pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
enum PumpEnd {
    /// The child closed stdout on a frame boundary
    Eof,
    /// Truncated, oversized or undecodable frame
    Fault(String),
}

/// Starts worker processes
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Launcher for the configured worker program, defaulting to the current executable
    pub fn from_config(config: &WorkerConfig) -> ExecutionResult<Self> {
        let program = match &config.program {
            Some(program) => program.clone(),
            None => std::env::current_exe().map_err(|e| {
                ExecutionError::Configuration(format!("Failed to get current exe: {}", e))
            })?,
        };
        Ok(Self::new(program, config.args.clone()))
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Spawn the process for `handle` and start the tasks that drive it.
    ///
    /// On error nothing keeps running: the child, if it was created, is
    /// killed on drop.
    pub fn spawn(
        &self,
        handle: Arc<WorkerHandle>,
        command: &str,
        registry: Arc<Registry>,
    ) -> ExecutionResult<()> {
        let id = handle.id();
        let channel = Arc::clone(handle.channel());

        let execute = encode_envelope(&MessageEnvelope::new(CoordinatorCommand::Execute {
            worker_id: id.to_string(),
            command: command.to_string(),
            channel_capacity: channel.capacity(),
        }))?;

        debug!("Spawning worker process {}: {}", id, self.program.display());
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg("--worker-id")
            .arg(id.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| {
            ExecutionError::SpawnFailed(format!("{}: {}", self.program.display(), e))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ExecutionError::SpawnFailed("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecutionError::SpawnFailed("Failed to get stdout".to_string()))?;

        handle.set_pid(child.id());
        info!("Worker {} started with pid {:?}", id, child.id());

        tokio::spawn(command_writer(id, stdin, Arc::clone(&handle), execute));
        let pump = tokio::spawn(reply_pump(Arc::clone(&handle), stdout));
        tokio::spawn(supervise(handle, child, pump, registry));

        Ok(())
    }
}

/// Sends the execute frame, then forwards the command direction until it closes
async fn command_writer(id: WorkerId, stdin: ChildStdin, handle: Arc<WorkerHandle>, execute: Bytes) {
    let channel = Arc::clone(handle.channel());
    let mut writer = FrameWriter::new(stdin, MAX_EXECUTE_FRAME_LEN);

    if let Err(e) = writer.write_frame(execute).await {
        warn!("Failed to send command to worker {}: {}", id, e);
        return;
    }

    while let Some(frame) = channel.read(Direction::Command).await {
        if let Err(e) = writer.write_frame(frame).await {
            debug!("Worker {} stdin closed: {}", id, e);
            return;
        }
    }

    // Closing stdin tells the worker the coordinator is done with it
    let _ = writer.close().await;
    debug!("Command writer for worker {} finished", id);
}

/// Decodes replies from the child's stdout
async fn reply_pump(handle: Arc<WorkerHandle>, stdout: ChildStdout) -> PumpEnd {
    let id = handle.id();
    let channel = Arc::clone(handle.channel());
    let mut reader = FrameReader::new(stdout, channel.capacity());
    let mut forwarding = true;

    loop {
        let frame = match reader.read_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => return PumpEnd::Eof,
            Err(e) => return PumpEnd::Fault(e.to_string()),
        };

        let reply = match decode_envelope::<WorkerReply>(&frame) {
            Ok(envelope) => envelope.message,
            Err(e) => return PumpEnd::Fault(e.to_string()),
        };
        handle.record_reply(&reply);

        match &reply {
            WorkerReply::Ready { pid, .. } => {
                if handle.mark_running() {
                    debug!("Worker {} is running (pid {})", id, pid);
                }
                continue;
            }
            WorkerReply::Progress { .. } => continue,
            WorkerReply::Done { status, .. } => {
                debug!("Worker {} reported {}", id, status);
            }
            _ => {}
        }

        if forwarding {
            if let Err(e) = channel.write(Direction::Result, frame).await {
                debug!(
                    "Result reader for worker {} went away, discarding output: {}",
                    id, e
                );
                forwarding = false;
            }
        }
    }
}

/// Awaits the child's exit and moves the handle to its terminal state
async fn supervise(
    handle: Arc<WorkerHandle>,
    mut child: Child,
    mut pump: JoinHandle<PumpEnd>,
    registry: Arc<Registry>,
) {
    let id = handle.id();
    let channel = Arc::clone(handle.channel());
    let kill = handle.kill_token();
    let mut killed = false;
    let mut pump_end: Option<PumpEnd> = None;

    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            _ = kill.cancelled(), if !killed => {
                killed = true;
                warn!("Force-killing worker {}", id);
                if let Err(e) = child.start_kill() {
                    error!("Failed to kill worker {}: {}", id, e);
                }
            }
            end = &mut pump, if pump_end.is_none() => {
                let end = end.unwrap_or_else(|e| PumpEnd::Fault(format!("reply pump failed: {}", e)));
                if let PumpEnd::Fault(reason) = &end {
                    warn!("Protocol fault from worker {}, killing it: {}", id, reason);
                    killed = true;
                    if let Err(e) = child.start_kill() {
                        error!("Failed to kill worker {}: {}", id, e);
                    }
                }
                pump_end = Some(end);
            }
        }
    };

    let exit = match status {
        Ok(status) => describe_exit(status),
        Err(e) => format!("failed to wait for process: {}", e),
    };
    debug!("Worker {} process exited: {}", id, exit);

    let pump_end = match pump_end {
        Some(end) => end,
        None => {
            // A cancelled worker's remaining output is not delivered
            if handle.cancel_requested() {
                channel.close(Direction::Result);
            }
            pump.await
                .unwrap_or_else(|e| PumpEnd::Fault(format!("reply pump failed: {}", e)))
        }
    };

    let outcome = settle(&handle, pump_end, &exit);
    handle.finish_with(outcome, |outcome| {
        registry.record_outcome(outcome.state());
        info!("Worker {} finished: {}", id, outcome);
    });

    channel.close(Direction::Command);
    channel.close(Direction::Result);

    if handle.is_detached() {
        registry.remove(id);
    }
}

/// Decide the terminal state once the process is gone and its output drained
fn settle(handle: &WorkerHandle, pump_end: PumpEnd, exit: &str) -> TerminalState {
    if handle.cancel_requested() {
        return TerminalState::Cancelled;
    }

    match handle.done() {
        Some((DoneStatus::Success, tags)) => TerminalState::Completed { tags },
        Some((DoneStatus::Error { code, message }, _)) => {
            TerminalState::Failed(Failure::Command { code, message })
        }
        Some((DoneStatus::Cancelled, _)) => TerminalState::Cancelled,
        None => {
            let reason = match pump_end {
                PumpEnd::Eof => format!("worker exited without a result ({})", exit),
                PumpEnd::Fault(fault) => format!("{} ({})", fault, exit),
            };
            TerminalState::Failed(Failure::Aborted { reason })
        }
    }
}

fn describe_exit(status: ExitStatus) -> String {
    status.to_string()
}
