//! Logging infrastructure for Backdrop
//!
//! Installs a `tracing` subscriber for either side of the worker boundary.
//! A coordinator logs to stdout; a worker process logs to stderr because its
//! stdout carries IPC frames.

pub mod init;

pub use init::{
    build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing,
    LoggingError,
};
