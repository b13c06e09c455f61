//! Worker-side runtime for Backdrop
//!
//! A worker process reads one `Execute` command from stdin, runs it through a
//! [`CommandExecutor`] and streams replies back over stdout. The two
//! reference executors live in [`executors`].

pub mod error;
pub mod executor;
pub mod executors;
pub mod worker;

// Re-export commonly used types
pub use error::{CommandError, WorkerError};
pub use executor::CommandExecutor;
pub use executors::{ScriptExecutor, ShellExecutor};
pub use worker::{worker_main, Worker, WorkerContext};
