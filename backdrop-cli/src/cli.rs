//! CLI argument parsing definitions

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Set the log level (trace, debug, info, warn, error)
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Command interpreter used inside a worker process
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ExecutorKind {
    /// Line-oriented test directives (emit, sleep, progress, fail, ...)
    Script,
    /// `sh -c`, stdout becomes result data
    Shell,
}

impl ExecutorKind {
    pub fn as_arg(&self) -> &'static str {
        match self {
            ExecutorKind::Script => "script",
            ExecutorKind::Shell => "shell",
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run as worker process (internal use)
    #[command(hide = true)]
    Worker {
        /// Worker ID assigned by the coordinator
        #[arg(long, value_name = "ID")]
        worker_id: String,

        /// Command interpreter
        #[arg(long, value_enum, default_value = "shell")]
        executor: ExecutorKind,
    },

    /// Run a command in a background worker and stream its result to stdout
    Run {
        /// The command text handed to the worker
        command: String,

        /// Byte capacity of each direction of the worker's message channel
        #[arg(long, value_name = "BYTES")]
        queue_size: Option<usize>,

        /// Cancel the worker if it has not finished within this many milliseconds
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,

        /// Command interpreter used by the worker
        #[arg(long, value_enum, default_value = "shell")]
        executor: ExecutorKind,

        /// Print progress updates to stderr
        #[arg(long)]
        progress: bool,
    },

    /// Configuration management commands
    Config {
        #[command(subcommand)]
        config_cmd: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print a sample configuration file
    Sample,

    /// Validate a configuration file
    Validate {
        /// Path to the configuration file
        #[arg(long, value_name = "PATH")]
        config_file: PathBuf,
    },

    /// Show the configuration in use
    Show {
        /// Output format: yaml, json
        #[arg(long, value_name = "FORMAT", default_value = "yaml")]
        format: String,
    },
}
