//! Worker handles and the worker state machine
//!
//! A handle is owned by the registry and shared with the tasks that drive its
//! process. State changes are published on a `watch` channel so waiters never
//! poll.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use backdrop_ipc::{DoneStatus, MessageChannel, ProgressState, WorkerReply};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique worker identifier, allocated before the process exists and never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for WorkerId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Identity of the session that launched a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(Uuid);

impl OwnerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for OwnerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle state of a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Launched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl WorkerState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::Cancelled
        )
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkerState::Launched => "launched",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Whether a session still owns the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ownership {
    Attached,
    Detached,
}

/// Why a worker failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Failure {
    /// The command reported an error
    Command { code: String, message: String },
    /// The process went away without a terminal reply
    Aborted { reason: String },
}

/// Final outcome of a worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TerminalState {
    Completed { tags: Vec<String> },
    Failed(Failure),
    Cancelled,
}

impl TerminalState {
    pub fn state(&self) -> WorkerState {
        match self {
            TerminalState::Completed { .. } => WorkerState::Completed,
            TerminalState::Failed(_) => WorkerState::Failed,
            TerminalState::Cancelled => WorkerState::Cancelled,
        }
    }
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminalState::Completed { tags } if tags.is_empty() => write!(f, "completed"),
            TerminalState::Completed { tags } => write!(f, "completed ({})", tags.join(", ")),
            TerminalState::Failed(Failure::Command { code, message }) => {
                write!(f, "failed [{}]: {}", code, message)
            }
            TerminalState::Failed(Failure::Aborted { reason }) => write!(f, "aborted: {}", reason),
            TerminalState::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Message counters for one worker
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCounters {
    pub data_chunks: u64,
    pub data_bytes: u64,
    pub notices: u64,
    pub messages: u64,
}

/// Point-in-time copy of a handle, safe to hand to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub id: WorkerId,
    pub state: WorkerState,
    pub owner: Option<OwnerId>,
    pub ownership: Ownership,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub progress: ProgressState,
    pub counters: WorkerCounters,
    pub outcome: Option<TerminalState>,
}

struct HandleInner {
    ownership: Ownership,
    pid: Option<u32>,
    last_message_at: Option<DateTime<Utc>>,
    progress: ProgressState,
    counters: WorkerCounters,
    done: Option<(DoneStatus, Vec<String>)>,
    terminal: Option<TerminalState>,
    finished_at: Option<Instant>,
    consumed: bool,
    cancel_requested: bool,
}

/// Shared state of one worker
pub struct WorkerHandle {
    id: WorkerId,
    owner: OwnerId,
    channel: Arc<MessageChannel>,
    started_at: DateTime<Utc>,
    state_tx: watch::Sender<WorkerState>,
    kill: CancellationToken,
    inner: Mutex<HandleInner>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("owner", &self.owner)
            .finish()
    }
}

impl WorkerHandle {
    pub(crate) fn new(id: WorkerId, owner: OwnerId, channel: Arc<MessageChannel>) -> Self {
        let (state_tx, _) = watch::channel(WorkerState::Launched);
        Self {
            id,
            owner,
            channel,
            started_at: Utc::now(),
            state_tx,
            kill: CancellationToken::new(),
            inner: Mutex::new(HandleInner {
                ownership: Ownership::Attached,
                pid: None,
                last_message_at: None,
                progress: ProgressState::default(),
                counters: WorkerCounters::default(),
                done: None,
                terminal: None,
                finished_at: None,
                consumed: false,
                cancel_requested: false,
            }),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state_tx.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    /// Owning session, `None` once detached
    pub fn owner(&self) -> Option<OwnerId> {
        match self.inner.lock().ownership {
            Ownership::Attached => Some(self.owner),
            Ownership::Detached => None,
        }
    }

    /// The session that launched the worker, kept after detach
    pub(crate) fn launched_by(&self) -> OwnerId {
        self.owner
    }

    pub fn ownership(&self) -> Ownership {
        self.inner.lock().ownership
    }

    pub fn is_detached(&self) -> bool {
        self.ownership() == Ownership::Detached
    }

    pub fn pid(&self) -> Option<u32> {
        self.inner.lock().pid
    }

    pub fn progress(&self) -> ProgressState {
        self.inner.lock().progress.clone()
    }

    pub fn counters(&self) -> WorkerCounters {
        self.inner.lock().counters
    }

    pub fn terminal(&self) -> Option<TerminalState> {
        self.inner.lock().terminal.clone()
    }

    pub fn summary(&self) -> WorkerSummary {
        let state = self.state();
        let inner = self.inner.lock();
        WorkerSummary {
            id: self.id,
            state,
            owner: match inner.ownership {
                Ownership::Attached => Some(self.owner),
                Ownership::Detached => None,
            },
            ownership: inner.ownership,
            pid: inner.pid,
            started_at: self.started_at,
            last_message_at: inner.last_message_at,
            progress: inner.progress.clone(),
            counters: inner.counters,
            outcome: inner.terminal.clone(),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_tx.subscribe()
    }

    /// Wait until the worker reaches a terminal state
    pub async fn wait_terminal(&self) -> TerminalState {
        let mut rx = self.subscribe();
        // The sender lives as long as `self`, so this only returns once terminal
        let _ = rx.wait_for(|state| state.is_terminal()).await;
        self.terminal().unwrap_or_else(|| {
            TerminalState::Failed(Failure::Aborted {
                reason: "worker state was lost".to_string(),
            })
        })
    }

    pub(crate) fn set_pid(&self, pid: Option<u32>) {
        self.inner.lock().pid = pid;
    }

    /// `Launched -> Running` on the worker's handshake
    pub(crate) fn mark_running(&self) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == WorkerState::Launched {
                *state = WorkerState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Account for a reply read from the worker
    pub(crate) fn record_reply(&self, reply: &WorkerReply) {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        inner.last_message_at = Some(now);
        inner.counters.messages += 1;

        match reply {
            WorkerReply::Data { chunk, .. } => {
                inner.counters.data_chunks += 1;
                inner.counters.data_bytes += chunk.len() as u64;
            }
            WorkerReply::Notice { .. } => inner.counters.notices += 1,
            WorkerReply::Progress { done, total, phase } => {
                inner.progress = ProgressState {
                    done: *done,
                    total: *total,
                    phase: phase.clone(),
                    updated_at: Some(now),
                };
            }
            WorkerReply::Done { status, tags } => {
                if inner.done.is_none() {
                    inner.done = Some((status.clone(), tags.clone()));
                }
            }
            WorkerReply::Ready { pid, .. } => {
                if inner.pid.is_none() {
                    inner.pid = Some(*pid);
                }
            }
        }
    }

    /// The `Done` reply, if one was seen
    pub(crate) fn done(&self) -> Option<(DoneStatus, Vec<String>)> {
        self.inner.lock().done.clone()
    }

    /// Move to a terminal state. Returns `false` when already terminal.
    pub(crate) fn finish(&self, outcome: TerminalState) -> bool {
        self.finish_with(outcome, |_| {})
    }

    /// Like [`finish`](Self::finish), running `settled` before waiters are woken
    pub(crate) fn finish_with(
        &self,
        outcome: TerminalState,
        settled: impl FnOnce(&TerminalState),
    ) -> bool {
        let state = outcome.state();
        {
            let mut inner = self.inner.lock();
            if inner.terminal.is_some() {
                return false;
            }
            settled(&outcome);
            inner.terminal = Some(outcome);
            inner.finished_at = Some(Instant::now());
        }
        self.state_tx.send_replace(state);
        true
    }

    /// Record a cancel request. Returns `false` when already terminal.
    pub(crate) fn request_cancel(&self) -> CancelRequest {
        let mut inner = self.inner.lock();
        if inner.terminal.is_some() {
            CancelRequest::Finished
        } else if inner.cancel_requested {
            CancelRequest::AlreadyRequested
        } else {
            inner.cancel_requested = true;
            CancelRequest::New
        }
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.inner.lock().cancel_requested
    }

    /// One-way transition to detached. Returns `true` the first time.
    pub(crate) fn detach(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.ownership == Ownership::Detached {
            return false;
        }
        inner.ownership = Ownership::Detached;
        true
    }

    /// Claim the result stream. Returns `false` when it was already claimed.
    pub(crate) fn claim_result(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.consumed {
            return false;
        }
        inner.consumed = true;
        true
    }

    /// Ask the supervisor to kill the process
    pub(crate) fn kill(&self) {
        self.kill.cancel();
    }

    pub(crate) fn kill_token(&self) -> CancellationToken {
        self.kill.clone()
    }

    /// Whether a terminal handle may leave the registry without an explicit release
    pub(crate) fn expired(&self, retention: Duration, now: Instant) -> bool {
        let inner = self.inner.lock();
        let Some(finished_at) = inner.finished_at else {
            return false;
        };
        match inner.ownership {
            Ownership::Detached => true,
            Ownership::Attached => {
                inner.consumed && now.saturating_duration_since(finished_at) >= retention
            }
        }
    }
}

/// Result of recording a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelRequest {
    New,
    AlreadyRequested,
    Finished,
}
