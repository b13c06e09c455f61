//! Process-wide table of workers
//!
//! All membership changes happen under one lock, which is what keeps the
//! number of live workers at or below `max_workers`.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use backdrop_ipc::MessageChannel;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ExecutionError, ExecutionResult};
use crate::handle::{OwnerId, WorkerHandle, WorkerId, WorkerState, WorkerSummary};

/// Counters that only ever grow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LifetimeTotals {
    pub launched: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
}

/// Registry statistics at one point in time
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub max_workers: usize,
    pub launched: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub detached: usize,
    pub totals: LifetimeTotals,
}

impl StatsSnapshot {
    /// Workers that still hold a slot
    pub fn live(&self) -> usize {
        self.launched + self.running
    }
}

/// Detached workers remembered after their handles are gone
pub const MAX_RETIRED_DETACHED: usize = 4096;

/// Ids of removed detached workers, oldest evicted first
#[derive(Default)]
struct Retired {
    order: VecDeque<WorkerId>,
    owners: HashMap<WorkerId, OwnerId>,
}

impl Retired {
    fn insert(&mut self, id: WorkerId, owner: OwnerId) {
        if self.owners.insert(id, owner).is_some() {
            return;
        }
        self.order.push_back(id);
        while self.order.len() > MAX_RETIRED_DETACHED {
            if let Some(oldest) = self.order.pop_front() {
                self.owners.remove(&oldest);
            }
        }
    }

    fn owned_by(&self, id: WorkerId, owner: OwnerId) -> bool {
        self.owners.get(&id) == Some(&owner)
    }
}

#[derive(Default)]
struct Totals {
    launched: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
}

/// Table of worker handles, keyed by id
pub struct Registry {
    max_workers: usize,
    workers: Mutex<HashMap<WorkerId, Arc<WorkerHandle>>>,
    // Locked after `workers` when both are held
    retired: Mutex<Retired>,
    totals: Totals,
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("max_workers", &self.max_workers)
            .field("workers", &self.workers.lock().len())
            .finish()
    }
}

impl Registry {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers,
            workers: Mutex::new(HashMap::new()),
            retired: Mutex::new(Retired::default()),
            totals: Totals::default(),
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Take a slot for a new worker and insert its handle in `Launched`.
    ///
    /// Fails with [`ExecutionError::ResourceExhausted`] when every slot is
    /// held by a non-terminal worker.
    pub fn reserve(&self, owner: OwnerId, capacity: usize) -> ExecutionResult<Arc<WorkerHandle>> {
        let channel = MessageChannel::new(capacity)
            .map_err(|e| ExecutionError::InvalidArgument(e.to_string()))?;

        let mut workers = self.workers.lock();
        let live = workers.values().filter(|h| !h.is_terminal()).count();
        if live >= self.max_workers {
            self.totals.rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Rejecting launch: {} of {} worker slots in use",
                live, self.max_workers
            );
            return Err(ExecutionError::ResourceExhausted {
                max_workers: self.max_workers,
            });
        }

        let id = WorkerId::new();
        let handle = Arc::new(WorkerHandle::new(id, owner, Arc::new(channel)));
        workers.insert(id, Arc::clone(&handle));
        debug!("Reserved slot for worker {} ({} live)", id, live + 1);
        Ok(handle)
    }

    /// Find a worker owned by `owner`.
    ///
    /// A detached worker stays [`ExecutionError::Detached`] for its owner
    /// after its handle has been removed.
    pub fn lookup(&self, owner: OwnerId, id: WorkerId) -> ExecutionResult<Arc<WorkerHandle>> {
        match self.find(owner, id)? {
            Some(handle) if !handle.is_detached() => Ok(handle),
            _ => Err(ExecutionError::Detached(id)),
        }
    }

    /// A handle launched by `owner`, or `None` when it was detached and removed
    pub(crate) fn find(
        &self,
        owner: OwnerId,
        id: WorkerId,
    ) -> ExecutionResult<Option<Arc<WorkerHandle>>> {
        let workers = self.workers.lock();
        match workers.get(&id) {
            Some(handle) if handle.launched_by() == owner => Ok(Some(Arc::clone(handle))),
            Some(_) => Err(ExecutionError::NotFound(id)),
            None if self.retired.lock().owned_by(id, owner) => Ok(None),
            None => Err(ExecutionError::NotFound(id)),
        }
    }

    pub fn get(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        self.workers.lock().get(&id).cloned()
    }

    /// Drop a handle and close its channel
    pub fn remove(&self, id: WorkerId) -> Option<Arc<WorkerHandle>> {
        let handle = {
            let mut workers = self.workers.lock();
            let handle = workers.remove(&id)?;
            if handle.is_detached() {
                self.retired.lock().insert(id, handle.launched_by());
            }
            handle
        };
        handle.channel().close_all();
        debug!("Removed worker {} from registry", id);
        Some(handle)
    }

    /// Handles launched by one session, attached or not
    pub(crate) fn owned_by(&self, owner: OwnerId) -> Vec<Arc<WorkerHandle>> {
        self.workers
            .lock()
            .values()
            .filter(|h| h.launched_by() == owner)
            .cloned()
            .collect()
    }

    /// Summaries of every worker, oldest first
    pub fn snapshot(&self) -> Vec<WorkerSummary> {
        let handles: Vec<_> = self.workers.lock().values().cloned().collect();
        let mut summaries: Vec<_> = handles.iter().map(|h| h.summary()).collect();
        summaries.sort_by_key(|s| s.started_at);
        summaries
    }

    /// Remove terminal handles nobody is going to ask about again
    pub fn sweep(&self, retention: Duration) -> usize {
        let now = Instant::now();
        let expired: Vec<_> = {
            let mut workers = self.workers.lock();
            let ids: Vec<_> = workers
                .iter()
                .filter(|(_, h)| h.expired(retention, now))
                .map(|(id, _)| *id)
                .collect();
            let removed: Vec<_> = ids.into_iter().filter_map(|id| workers.remove(&id)).collect();
            let mut retired = self.retired.lock();
            for handle in removed.iter().filter(|h| h.is_detached()) {
                retired.insert(handle.id(), handle.launched_by());
            }
            removed
        };

        for handle in &expired {
            handle.channel().close_all();
            debug!("Swept worker {}", handle.id());
        }
        expired.len()
    }

    pub(crate) fn record_launch(&self) {
        self.totals.launched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, state: WorkerState) {
        let counter = match state {
            WorkerState::Completed => &self.totals.completed,
            WorkerState::Failed => &self.totals.failed,
            WorkerState::Cancelled => &self.totals.cancelled,
            WorkerState::Launched | WorkerState::Running => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatsSnapshot {
        let handles: Vec<_> = self.workers.lock().values().cloned().collect();
        let mut stats = StatsSnapshot {
            max_workers: self.max_workers,
            totals: LifetimeTotals {
                launched: self.totals.launched.load(Ordering::Relaxed),
                completed: self.totals.completed.load(Ordering::Relaxed),
                failed: self.totals.failed.load(Ordering::Relaxed),
                cancelled: self.totals.cancelled.load(Ordering::Relaxed),
                rejected: self.totals.rejected.load(Ordering::Relaxed),
            },
            ..Default::default()
        };

        for handle in handles {
            match handle.state() {
                WorkerState::Launched => stats.launched += 1,
                WorkerState::Running => stats.running += 1,
                WorkerState::Completed => stats.completed += 1,
                WorkerState::Failed => stats.failed += 1,
                WorkerState::Cancelled => stats.cancelled += 1,
            }
            if handle.is_detached() {
                stats.detached += 1;
            }
        }
        stats
    }
}
