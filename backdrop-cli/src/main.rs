mod cli;

use anyhow::{Context, Result};
use backdrop_config::{BackdropConfig, ConfigLoader, LogLevel};
use backdrop_execution::{Coordinator, ExecutionError, ResultChunk, ResultOutcome};
use backdrop_logging::{init_logging_from_config, init_simple_tracing, init_worker_tracing};
use backdrop_runtime::{worker_main, CommandExecutor, ScriptExecutor, ShellExecutor};
use clap::Parser;
use futures::StreamExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use cli::{Cli, Commands, ConfigCommands, ExecutorKind};

/// Exit code used when the worker was cancelled
const EXIT_CANCELLED: i32 = 130;

/// Load configuration from file or environment
fn load_config(config_path: Option<&PathBuf>) -> Result<BackdropConfig> {
    let loader = ConfigLoader::new();
    let config = loader
        .load(config_path)
        .context("Failed to load configuration")?;
    debug!("Configuration loaded");
    Ok(config)
}

/// Initialize logging from configuration with fallback to simple tracing
fn init_logging_with_config(config: &BackdropConfig, log_level: Option<&str>) -> Result<()> {
    let mut logging_config = config.logging.clone();
    // If CLI log level is provided, override config level
    if let Some(level_str) = log_level {
        if let Ok(level) = level_str.parse::<LogLevel>() {
            logging_config.level = level;
        }
    }

    if let Err(e) = init_logging_from_config(&logging_config) {
        eprintln!(
            "Failed to initialize structured logging: {}, falling back to simple tracing",
            e
        );
        init_simple_tracing(log_level.unwrap_or("info"))?;
    }
    Ok(())
}

/// Run as worker process, returning the process exit code
async fn run_worker_process(worker_id: String, kind: ExecutorKind) -> i32 {
    let executor: Box<dyn CommandExecutor> = match kind {
        ExecutorKind::Script => Box::new(ScriptExecutor::new()),
        ExecutorKind::Shell => Box::new(ShellExecutor::new()),
    };

    match worker_main(worker_id.clone(), executor.as_ref()).await {
        Ok(_) => 0,
        Err(e) => {
            error!("Worker {} failed: {}", worker_id, e);
            1
        }
    }
}

/// Launch one worker and stream its result to stdout
async fn handle_run(
    mut config: BackdropConfig,
    command: &str,
    queue_size: Option<usize>,
    timeout_ms: Option<u64>,
    executor: ExecutorKind,
    show_progress: bool,
) -> Result<i32> {
    // Our own binary is the default worker program
    if config.workers.program.is_none() {
        config.workers.args = vec![
            "worker".to_string(),
            "--executor".to_string(),
            executor.as_arg().to_string(),
        ];
    }

    let coordinator = Coordinator::new(config.workers).context("Failed to start coordinator")?;
    let session = coordinator.session();
    let id = session.launch(command, queue_size)?;
    info!("Launched worker {}", id);

    let ResultOutcome::Stream(mut stream) = session.result(id, true)? else {
        return Err(anyhow::anyhow!("Worker {} returned no result stream", id));
    };

    let mut stdout = tokio::io::stdout();
    let mut ticker = tokio::time::interval(Duration::from_millis(250));
    let timeout = tokio::time::sleep(Duration::from_millis(timeout_ms.unwrap_or(0)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(timeout);
    tokio::pin!(ctrl_c);
    let mut interrupted = false;

    let outcome = loop {
        tokio::select! {
            item = stream.next() => match item {
                Some(Ok(ResultChunk::Data { bytes, .. })) => {
                    stdout.write_all(&bytes).await.context("Failed to write result")?;
                }
                Some(Ok(ResultChunk::Notice(message))) => eprintln!("NOTICE: {}", message),
                Some(Ok(ResultChunk::Done { tags })) => break Ok(tags),
                Some(Err(e)) => break Err(e),
                None => break Ok(Vec::new()),
            },
            _ = &mut timeout, if timeout_ms.is_some() && !interrupted => {
                warn!("Worker {} exceeded {} ms, cancelling", id, timeout_ms.unwrap_or_default());
                session.cancel(id)?;
                interrupted = true;
            }
            _ = &mut ctrl_c, if !interrupted => {
                info!("Interrupted, cancelling worker {}", id);
                session.cancel(id)?;
                interrupted = true;
            }
            _ = ticker.tick(), if show_progress => {
                if let Ok(progress) = session.progress(id) {
                    match progress.percent() {
                        Some(percent) => eprintln!(
                            "progress: {}/{} ({:.0}%) {}",
                            progress.done, progress.total, percent, progress.phase
                        ),
                        None => eprintln!("progress: {} {}", progress.done, progress.phase),
                    }
                }
            }
        }
    };
    stdout.flush().await.context("Failed to flush result")?;
    drop(stream);

    let code = match outcome {
        Ok(tags) => {
            for tag in tags {
                eprintln!("{}", tag);
            }
            0
        }
        Err(ExecutionError::Cancelled(_)) => {
            eprintln!("❌ Worker {} was cancelled", id);
            EXIT_CANCELLED
        }
        Err(e) => {
            eprintln!("❌ {}", e);
            1
        }
    };

    let stats = session.stats();
    debug!(
        "Worker totals: {} launched, {} completed, {} failed, {} cancelled",
        stats.totals.launched, stats.totals.completed, stats.totals.failed, stats.totals.cancelled
    );
    session.close();
    Ok(code)
}

/// Handle configuration validation
fn handle_config_validate(config_file: &PathBuf) -> Result<()> {
    info!("Validating configuration file: {:?}", config_file);

    if !config_file.exists() {
        return Err(anyhow::anyhow!(
            "Configuration file not found: {:?}",
            config_file
        ));
    }

    match load_config(Some(config_file)) {
        Ok(_config) => {
            println!("✅ Configuration file is valid");
            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed: {:#}", e);
            error!("Configuration validation failed: {:#}", e);
            Err(e)
        }
    }
}

/// Handle configuration display
fn handle_config_show(config: &BackdropConfig, format: &str) -> Result<()> {
    match format.to_lowercase().as_str() {
        "yaml" | "yml" => {
            let yaml_output =
                serde_yaml::to_string(config).context("Failed to serialize to YAML")?;
            println!("{}", yaml_output);
        }
        "json" => {
            let json_output =
                serde_json::to_string_pretty(config).context("Failed to serialize to JSON")?;
            println!("{}", json_output);
        }
        _ => {
            return Err(anyhow::anyhow!(
                "Unknown output format: {}. Valid formats: yaml, json",
                format
            ));
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Worker {
            worker_id,
            executor,
        } => {
            // Stdout carries IPC frames, so logs go to stderr only
            init_worker_tracing(cli.log_level.as_deref().unwrap_or("warn"))?;
            let code = run_worker_process(worker_id, executor).await;
            // Leaving main would wait on the blocking stdin reader
            std::process::exit(code);
        }
        Commands::Run {
            command,
            queue_size,
            timeout_ms,
            executor,
            progress,
        } => {
            let config = load_config(cli.config.as_ref())?;
            init_logging_with_config(&config, cli.log_level.as_deref())?;
            let code =
                handle_run(config, &command, queue_size, timeout_ms, executor, progress).await?;
            if code != 0 {
                std::process::exit(code);
            }
            Ok(())
        }
        Commands::Config { config_cmd } => match config_cmd {
            ConfigCommands::Sample => {
                print!("{}", BackdropConfig::generate_sample());
                Ok(())
            }
            ConfigCommands::Validate { config_file } => handle_config_validate(&config_file),
            ConfigCommands::Show { format } => {
                let config = load_config(cli.config.as_ref())?;
                handle_config_show(&config, &format)
            }
        },
    }
}
