//! Coordinator and the caller-facing session API
//!
//! A [`Coordinator`] owns the registry and the process launcher. Callers work
//! through a [`Session`], which scopes every lookup to the workers it launched.

use std::sync::Arc;
use std::time::Duration;

use backdrop_config::{ConfigLoader, Validatable, WorkerConfig, MAX_CANCEL_GRACE_PERIOD};
use backdrop_ipc::{
    CoordinatorCommand, Direction, MessageEnvelope, ProgressState, MAX_CHANNEL_CAPACITY,
    MAX_COMMAND_LEN, MIN_CHANNEL_CAPACITY,
};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::handle::{
    CancelRequest, OwnerId, TerminalState, WorkerHandle, WorkerId, WorkerState, WorkerSummary,
};
use crate::process::ProcessLauncher;
use crate::registry::{Registry, StatsSnapshot};
use crate::result::{ResultOutcome, ResultStream};

static GLOBAL: OnceCell<Arc<Coordinator>> = OnceCell::new();

/// Answer to a cancel request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelAck {
    /// The worker was asked to stop and will end up `Cancelled`
    Requested,
    /// The worker had already reached a terminal state
    AlreadyFinished,
}

/// Outcome of waiting for a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished(TerminalState),
    /// The timeout passed; the worker is untouched
    TimedOut,
}

/// Owns the worker registry and starts worker processes
#[derive(Debug)]
pub struct Coordinator {
    config: WorkerConfig,
    registry: Arc<Registry>,
    launcher: ProcessLauncher,
}

impl Coordinator {
    /// Build an isolated coordinator
    pub fn new(config: WorkerConfig) -> ExecutionResult<Arc<Self>> {
        config.validate()?;
        let launcher = ProcessLauncher::from_config(&config)?;
        info!(
            "Coordinator ready: {} workers max, program {}",
            config.max_workers,
            launcher.program().display()
        );

        Ok(Arc::new(Self {
            registry: Arc::new(Registry::new(config.max_workers)),
            config,
            launcher,
        }))
    }

    /// The process-wide coordinator, configured from the environment on first use
    pub fn global() -> ExecutionResult<Arc<Self>> {
        GLOBAL
            .get_or_try_init(|| {
                let config = ConfigLoader::new().from_env()?;
                Self::new(config.workers)
            })
            .cloned()
    }

    /// Install `config` as the process-wide coordinator unless one exists already
    pub fn init_global(config: WorkerConfig) -> ExecutionResult<Arc<Self>> {
        GLOBAL.get_or_try_init(|| Self::new(config)).cloned()
    }

    /// Start a new session with its own owner identity
    pub fn session(self: &Arc<Self>) -> Session {
        let owner = OwnerId::new();
        debug!("Opened session {}", owner);
        Session {
            coordinator: Arc::clone(self),
            owner,
            closed: false,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.registry.stats()
    }

    /// Ask every live worker to shut down and wait until all are terminal
    pub async fn shutdown(&self) -> usize {
        let live: Vec<_> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|s| !s.state.is_terminal())
            .filter_map(|s| self.registry.get(s.id))
            .collect();

        info!("Shutting down {} live workers", live.len());
        let runtime = Handle::current();
        let grace = self.config.effective_grace_period();
        for handle in &live {
            if handle.request_cancel() == CancelRequest::New {
                interrupt(&runtime, handle, CoordinatorCommand::Shutdown, grace);
            }
        }

        futures::future::join_all(live.iter().map(|h| h.wait_terminal())).await;
        live.len()
    }
}

/// The runtime worker tasks are spawned on
fn current_runtime() -> ExecutionResult<Handle> {
    Handle::try_current().map_err(|e| ExecutionError::NoRuntime(e.to_string()))
}

/// Deliver a stop command and force-kill after the grace period
fn interrupt(
    runtime: &Handle,
    handle: &Arc<WorkerHandle>,
    command: CoordinatorCommand,
    grace: Duration,
) {
    let handle = Arc::clone(handle);
    runtime.spawn(async move {
        let id = handle.id();
        if let Err(e) = handle
            .channel()
            .send(Direction::Command, &MessageEnvelope::new(command))
            .await
        {
            debug!("Could not deliver stop request to worker {}: {}", id, e);
        }

        tokio::select! {
            _ = handle.wait_terminal() => {}
            _ = tokio::time::sleep(grace) => {
                warn!("Worker {} did not stop within {:?}", id, grace);
                handle.kill();
            }
        }
    });
}

/// A caller's view of the coordinator
///
/// Workers launched through a session are invisible to other sessions.
/// Closing the session detaches the workers that are still running and
/// releases the finished ones.
///
/// `launch` and `cancel` start background tasks and must be called from
/// within a Tokio runtime; outside one they fail with
/// [`ExecutionError::NoRuntime`].
pub struct Session {
    coordinator: Arc<Coordinator>,
    owner: OwnerId,
    closed: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("owner", &self.owner).finish()
    }
}

impl Session {
    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    fn registry(&self) -> &Arc<Registry> {
        &self.coordinator.registry
    }

    fn lookup(&self, id: WorkerId) -> ExecutionResult<Arc<WorkerHandle>> {
        self.registry().lookup(self.owner, id)
    }

    /// Start a worker running `command`.
    ///
    /// `queue_size` is the byte capacity of each channel direction and
    /// defaults to the configured `default_channel_capacity`.
    pub fn launch(&self, command: &str, queue_size: Option<usize>) -> ExecutionResult<WorkerId> {
        if command.is_empty() {
            return Err(ExecutionError::InvalidArgument(
                "command must not be empty".to_string(),
            ));
        }
        if command.len() > MAX_COMMAND_LEN {
            return Err(ExecutionError::InvalidArgument(format!(
                "command of {} bytes exceeds the limit of {} bytes",
                command.len(),
                MAX_COMMAND_LEN
            )));
        }

        let capacity = queue_size.unwrap_or(self.coordinator.config.default_channel_capacity);
        if !(MIN_CHANNEL_CAPACITY..=MAX_CHANNEL_CAPACITY).contains(&capacity) {
            return Err(ExecutionError::InvalidArgument(format!(
                "queue size must be between {} and {} bytes, got {}",
                MIN_CHANNEL_CAPACITY, MAX_CHANNEL_CAPACITY, capacity
            )));
        }

        current_runtime()?;
        let registry = self.registry();
        registry.sweep(self.coordinator.config.result_retention);

        let handle = registry.reserve(self.owner, capacity)?;
        let id = handle.id();
        if let Err(e) = self
            .coordinator
            .launcher
            .spawn(handle, command, Arc::clone(registry))
        {
            warn!("Failed to launch worker {}: {}", id, e);
            registry.remove(id);
            return Err(e);
        }

        registry.record_launch();
        info!("Launched worker {} ({} byte queues)", id, capacity);
        Ok(id)
    }

    /// Open the worker's result.
    ///
    /// With `block = false` a worker that has not finished yields
    /// [`ResultOutcome::StillRunning`] without consuming anything. The result
    /// can be opened once.
    pub fn result(&self, id: WorkerId, block: bool) -> ExecutionResult<ResultOutcome> {
        let handle = self.lookup(id)?;
        if !block && !handle.is_terminal() {
            return Ok(ResultOutcome::StillRunning);
        }
        if !handle.claim_result() {
            return Err(ExecutionError::ResultAlreadyConsumed(id));
        }
        Ok(ResultOutcome::Stream(ResultStream::new(handle)))
    }

    /// Give up ownership without affecting execution.
    ///
    /// Afterwards every operation on `id` from this session fails with
    /// [`ExecutionError::Detached`], whether or not the worker has finished.
    pub fn detach(&self, id: WorkerId) -> ExecutionResult<()> {
        let Some(handle) = self.registry().find(self.owner, id)? else {
            return Ok(());
        };

        if handle.detach() {
            info!("Detached worker {}", id);
            handle.channel().close(Direction::Result);
            if handle.is_terminal() {
                self.registry().remove(id);
            }
        }
        Ok(())
    }

    /// Ask the worker to stop, force-killing it after the configured
    /// `cancel_grace_period`. Returns without waiting.
    pub fn cancel(&self, id: WorkerId) -> ExecutionResult<CancelAck> {
        self.cancel_with_grace(id, self.coordinator.config.cancel_grace_period)
    }

    /// Like [`cancel`](Self::cancel) with a grace period for this call only,
    /// clamped to [`MAX_CANCEL_GRACE_PERIOD`]
    pub fn cancel_with_grace(&self, id: WorkerId, grace: Duration) -> ExecutionResult<CancelAck> {
        let handle = self.lookup(id)?;
        let runtime = current_runtime()?;
        match handle.request_cancel() {
            CancelRequest::Finished => Ok(CancelAck::AlreadyFinished),
            CancelRequest::AlreadyRequested => Ok(CancelAck::Requested),
            CancelRequest::New => {
                let grace = grace.min(MAX_CANCEL_GRACE_PERIOD);
                info!("Cancelling worker {} ({:?} grace)", id, grace);
                interrupt(&runtime, &handle, CoordinatorCommand::Cancel, grace);
                Ok(CancelAck::Requested)
            }
        }
    }

    /// Wait for the worker to finish.
    ///
    /// `None` falls back to the configured `default_wait_timeout`, and waits
    /// without bound only when that is unset; use
    /// [`wait_unbounded`](Self::wait_unbounded) to ignore the default.
    /// Timing out leaves the worker alone.
    pub async fn wait(
        &self,
        id: WorkerId,
        timeout: Option<Duration>,
    ) -> ExecutionResult<WaitOutcome> {
        self.wait_for(id, timeout.or(self.coordinator.config.default_wait_timeout))
            .await
    }

    /// Wait for the worker to finish however long it takes
    pub async fn wait_unbounded(&self, id: WorkerId) -> ExecutionResult<TerminalState> {
        let handle = self.lookup(id)?;
        Ok(handle.wait_terminal().await)
    }

    async fn wait_for(
        &self,
        id: WorkerId,
        limit: Option<Duration>,
    ) -> ExecutionResult<WaitOutcome> {
        let handle = self.lookup(id)?;
        match limit {
            Some(limit) => match tokio::time::timeout(limit, handle.wait_terminal()).await {
                Ok(outcome) => Ok(WaitOutcome::Finished(outcome)),
                Err(_) => {
                    debug!("Wait on worker {} timed out after {:?}", id, limit);
                    Ok(WaitOutcome::TimedOut)
                }
            },
            None => Ok(WaitOutcome::Finished(handle.wait_terminal().await)),
        }
    }

    /// Latest progress of a running worker
    pub fn progress(&self, id: WorkerId) -> ExecutionResult<ProgressState> {
        let handle = self.lookup(id)?;
        if handle.state() != WorkerState::Running {
            return Err(ExecutionError::NotRunning(id));
        }
        Ok(handle.progress())
    }

    /// Status of one of this session's workers
    pub fn status(&self, id: WorkerId) -> ExecutionResult<WorkerSummary> {
        Ok(self.lookup(id)?.summary())
    }

    /// Every worker in the registry
    pub fn list(&self) -> Vec<WorkerSummary> {
        self.registry().snapshot()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.registry().stats()
    }

    /// Drop a finished worker from the registry
    pub fn release(&self, id: WorkerId) -> ExecutionResult<()> {
        let handle = self.lookup(id)?;
        if !handle.is_terminal() {
            return Err(ExecutionError::InvalidArgument(format!(
                "worker {} has not finished",
                id
            )));
        }
        self.registry().remove(id);
        Ok(())
    }

    /// End the session
    pub fn close(mut self) {
        self.release_all();
    }

    fn release_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let registry = Arc::clone(self.registry());
        let mut detached = 0;
        for handle in registry.owned_by(self.owner) {
            if handle.is_terminal() {
                registry.remove(handle.id());
            } else if handle.detach() {
                handle.channel().close(Direction::Result);
                detached += 1;
            }
        }
        debug!("Closed session {} ({} workers left running)", self.owner, detached);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::Failure;
    use std::path::PathBuf;

    fn config(script: &str, max_workers: usize) -> WorkerConfig {
        WorkerConfig {
            max_workers,
            program: Some(PathBuf::from("sh")),
            args: vec!["-c".to_string(), script.to_string()],
            cancel_grace_period: Duration::from_millis(100),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_invalid_arguments() {
        let coordinator = Coordinator::new(config("exit 0", 1)).unwrap();
        let session = coordinator.session();

        assert!(matches!(
            session.launch("", None),
            Err(ExecutionError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.launch("emit x", Some(10)),
            Err(ExecutionError::InvalidArgument(_))
        ));
        assert!(matches!(
            session.launch("emit x", Some(MAX_CHANNEL_CAPACITY + 1)),
            Err(ExecutionError::InvalidArgument(_))
        ));
        let huge = "x".repeat(MAX_COMMAND_LEN + 1);
        assert!(matches!(
            session.launch(&huge, None),
            Err(ExecutionError::InvalidArgument(_))
        ));
        assert!(coordinator.registry().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_releases_reservation() {
        let mut config = config("exit 0", 1);
        config.program = Some(PathBuf::from("/nonexistent/backdrop-worker"));
        let coordinator = Coordinator::new(config).unwrap();
        let session = coordinator.session();

        for _ in 0..2 {
            assert!(matches!(
                session.launch("emit x", None),
                Err(ExecutionError::SpawnFailed(_))
            ));
        }
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.stats().totals.launched, 0);
    }

    #[tokio::test]
    async fn test_worker_that_exits_without_result_is_aborted() {
        let coordinator = Coordinator::new(config("exit 3", 1)).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();

        let outcome = session.wait(id, Some(Duration::from_secs(5))).await.unwrap();
        assert!(matches!(
            outcome,
            WaitOutcome::Finished(TerminalState::Failed(Failure::Aborted { ref reason }))
                if reason.contains("exit status: 3")
        ));

        let ResultOutcome::Stream(stream) = session.result(id, false).unwrap() else {
            panic!("expected a stream for a finished worker");
        };
        assert!(matches!(
            stream.collect_all().await,
            Err(ExecutionError::WorkerAborted { id: got, .. }) if got == id
        ));
        assert_eq!(
            session.result(id, true).unwrap_err(),
            ExecutionError::ResultAlreadyConsumed(id)
        );
        assert_eq!(coordinator.stats().totals.failed, 1);
    }

    #[tokio::test]
    async fn test_silent_worker_stays_launched_until_cancelled() {
        // Reads its commands but never answers
        let coordinator = Coordinator::new(config("cat > /dev/null", 1)).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();

        assert_eq!(
            session.wait(id, Some(Duration::from_millis(50))).await.unwrap(),
            WaitOutcome::TimedOut
        );
        assert_eq!(session.status(id).unwrap().state, WorkerState::Launched);
        assert_eq!(session.progress(id).unwrap_err(), ExecutionError::NotRunning(id));
        assert!(matches!(session.result(id, false).unwrap(), ResultOutcome::StillRunning));
        assert!(matches!(
            session.release(id),
            Err(ExecutionError::InvalidArgument(_))
        ));

        // The only slot is taken
        assert_eq!(
            session.launch("emit y", None).unwrap_err(),
            ExecutionError::ResourceExhausted { max_workers: 1 }
        );

        assert_eq!(session.cancel(id).unwrap(), CancelAck::Requested);
        assert_eq!(session.cancel(id).unwrap(), CancelAck::Requested);
        assert_eq!(
            session.wait(id, Some(Duration::from_secs(5))).await.unwrap(),
            WaitOutcome::Finished(TerminalState::Cancelled)
        );
        assert_eq!(session.cancel(id).unwrap(), CancelAck::AlreadyFinished);

        session.release(id).unwrap();
        assert_eq!(session.status(id).unwrap_err(), ExecutionError::NotFound(id));
        assert_eq!(coordinator.stats().totals.cancelled, 1);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let coordinator = Coordinator::new(config("cat > /dev/null", 2)).unwrap();
        let first = coordinator.session();
        let second = coordinator.session();
        let id = first.launch("emit x", None).unwrap();

        assert_eq!(second.status(id).unwrap_err(), ExecutionError::NotFound(id));
        assert_eq!(second.cancel(id).unwrap_err(), ExecutionError::NotFound(id));
        assert_eq!(second.detach(id).unwrap_err(), ExecutionError::NotFound(id));
        assert_eq!(second.list().len(), 1);

        first.cancel(id).unwrap();
        first.wait(id, None).await.unwrap();
    }

    #[tokio::test]
    async fn test_detach_and_session_close() {
        let coordinator = Coordinator::new(config("cat > /dev/null", 2)).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();

        session.detach(id).unwrap();
        session.detach(id).unwrap();
        assert_eq!(session.wait(id, None).await.unwrap_err(), ExecutionError::Detached(id));
        assert_eq!(session.cancel(id).unwrap_err(), ExecutionError::Detached(id));
        assert_eq!(session.progress(id).unwrap_err(), ExecutionError::Detached(id));
        assert!(matches!(
            session.result(id, true),
            Err(ExecutionError::Detached(_))
        ));

        let summary = session.list().into_iter().find(|s| s.id == id).unwrap();
        assert_eq!(summary.owner, None);
        assert!(!summary.state.is_terminal());

        let other = session.launch("emit y", None).unwrap();
        session.close();
        let handle = coordinator.registry().get(other).unwrap();
        assert!(handle.is_detached());

        assert_eq!(coordinator.shutdown().await, 2);
        assert_eq!(coordinator.stats().live(), 0);
    }

    #[tokio::test]
    async fn test_detaching_a_finished_worker() {
        let coordinator = Coordinator::new(config("exit 3", 1)).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();
        assert!(matches!(
            session.wait(id, Some(Duration::from_secs(5))).await.unwrap(),
            WaitOutcome::Finished(_)
        ));

        session.detach(id).unwrap();
        assert!(coordinator.registry().get(id).is_none());
        session.detach(id).unwrap();

        assert!(matches!(
            session.result(id, true),
            Err(ExecutionError::Detached(_))
        ));
        assert_eq!(session.wait(id, None).await.unwrap_err(), ExecutionError::Detached(id));
        assert_eq!(session.status(id).unwrap_err(), ExecutionError::Detached(id));
        assert_eq!(session.release(id).unwrap_err(), ExecutionError::Detached(id));
        assert_eq!(session.cancel(id).unwrap_err(), ExecutionError::Detached(id));

        let other = coordinator.session();
        assert_eq!(other.status(id).unwrap_err(), ExecutionError::NotFound(id));
        assert_eq!(other.detach(id).unwrap_err(), ExecutionError::NotFound(id));
    }

    #[tokio::test]
    async fn test_cancel_with_grace_overrides_configured_grace() {
        let mut config = config("cat > /dev/null", 1);
        config.cancel_grace_period = Duration::from_secs(30);
        let coordinator = Coordinator::new(config).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();

        assert_eq!(
            session
                .cancel_with_grace(id, Duration::from_millis(50))
                .unwrap(),
            CancelAck::Requested
        );
        assert_eq!(
            session.wait(id, Some(Duration::from_secs(5))).await.unwrap(),
            WaitOutcome::Finished(TerminalState::Cancelled)
        );
    }

    #[tokio::test]
    async fn test_wait_unbounded_ignores_default_timeout() {
        let mut config = config("cat > /dev/null", 1);
        config.default_wait_timeout = Some(Duration::from_millis(20));
        let coordinator = Coordinator::new(config).unwrap();
        let session = coordinator.session();
        let id = session.launch("emit x", None).unwrap();

        assert_eq!(session.wait(id, None).await.unwrap(), WaitOutcome::TimedOut);
        session.cancel(id).unwrap();
        assert_eq!(
            session.wait_unbounded(id).await.unwrap(),
            TerminalState::Cancelled
        );
    }

    #[test]
    fn test_launch_outside_runtime_is_an_error() {
        let coordinator = Coordinator::new(config("exit 0", 1)).unwrap();
        let session = coordinator.session();

        assert!(matches!(
            session.launch("emit x", None),
            Err(ExecutionError::NoRuntime(_))
        ));
        assert!(coordinator.registry().is_empty());
        assert_eq!(coordinator.stats().totals.launched, 0);
    }
}
