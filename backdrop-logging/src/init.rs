use backdrop_config::{LogFormat, LoggingConfig};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Errors raised while installing a subscriber
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("Invalid log filter '{directives}': {message}")]
    InvalidFilter { directives: String, message: String },
}

/// Build the filter for a level plus optional extra directives.
///
/// An unparsable level falls back to `RUST_LOG` and then to `info`.
pub fn build_env_filter(level: &str, extra: Option<&str>) -> Result<EnvFilter, LoggingError> {
    let directives = match extra {
        Some(extra) if !extra.trim().is_empty() => format!("{},{}", level, extra),
        _ => level.to_string(),
    };

    match EnvFilter::try_new(&directives) {
        Ok(filter) => Ok(filter),
        Err(e) if extra.is_some() => Err(LoggingError::InvalidFilter {
            directives,
            message: e.to_string(),
        }),
        Err(_) => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

/// Initialize logging from configuration. Output goes to stderr so stdout
/// stays free for command results.
pub fn init_logging_from_config(config: &LoggingConfig) -> Result<(), LoggingError> {
    let filter = build_env_filter(config.level.as_str(), config.filter.as_deref())?;

    let layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Compact => tracing_subscriber::fmt::layer()
            .compact()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Pretty => tracing_subscriber::fmt::layer()
            .pretty()
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .with_filter(filter)
            .boxed(),
    };

    // Use try_init to avoid panic if global subscriber already set
    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize simple tracing for basic console output
pub fn init_simple_tracing(log_level: &str) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(log_level, None)?;

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}

/// Initialize tracing inside a worker process.
///
/// Output goes to stderr without ANSI colours so it can be inherited by the
/// coordinator's terminal.
pub fn init_worker_tracing(log_level: &str) -> Result<(), LoggingError> {
    let env_filter = build_env_filter(log_level, None)?;

    if tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .try_init()
        .is_err()
    {
        tracing::debug!("Global tracing subscriber already initialized, skipping");
    }

    Ok(())
}
