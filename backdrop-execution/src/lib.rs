//! Backdrop Execution Engine
//!
//! Coordinator side of Backdrop: hands commands to worker processes, tracks
//! them in a process-wide registry and exposes results, progress, waiting
//! and cancellation through a [`Session`].

pub mod coordinator;
pub mod error;
pub mod handle;
pub mod process;
pub mod registry;
pub mod result;

// Re-export main types
pub use coordinator::{CancelAck, Coordinator, Session, WaitOutcome};
pub use error::{ExecutionError, ExecutionResult};
pub use handle::{
    Failure, OwnerId, Ownership, TerminalState, WorkerCounters, WorkerHandle, WorkerId,
    WorkerState, WorkerSummary,
};
pub use process::ProcessLauncher;
pub use registry::{LifetimeTotals, Registry, StatsSnapshot};
pub use result::{CollectedResult, ResultChunk, ResultOutcome, ResultStream};

// Re-export protocol types callers see in results
pub use backdrop_ipc::{DataFormat, ProgressState};
