//! Deterministic line-oriented script executor
//!
//! A script is a list of directives separated by newlines or `;`:
//!
//! | directive | effect |
//! |---|---|
//! | `emit <text>` | one text data chunk |
//! | `emit-bytes <n> [byte]` | `n` binary bytes, `x` unless given |
//! | `notice <text>` | one notice |
//! | `progress <done> <total> [phase]` | one progress update |
//! | `sleep <ms>` | pause; interrupted by cancellation |
//! | `count <n> <interval_ms>` | emit `1..=n` as lines with progress, pausing between |
//! | `tag <text>` | add a completion tag |
//! | `fail <code> [message]` | stop with an error |
//! | `crash` | abort the process without a reply |
//! | `exit <code>` | exit the process without a reply |
//! | `ignore-cancel` | stop honouring cancellation from here on |
//!
//! Blank lines and lines starting with `#` are skipped.

use std::time::Duration;

use backdrop_ipc::DataFormat;
use tokio_util::sync::WaitForCancellationFutureOwned;
use tracing::debug;

use crate::error::CommandError;
use crate::executor::CommandExecutor;
use crate::worker::WorkerContext;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Directive {
    Emit(String),
    EmitBytes { count: usize, byte: u8 },
    Notice(String),
    Progress { done: u64, total: u64, phase: String },
    Sleep(Duration),
    Count { n: u64, interval: Duration },
    Tag(String),
    Fail { code: String, message: String },
    Crash,
    Exit(i32),
    IgnoreCancel,
}

fn parse_number<T: std::str::FromStr>(value: Option<&str>, directive: &str) -> Result<T, CommandError> {
    value
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| CommandError::failed("SYNTAX", format!("{} expects a number", directive)))
}

fn parse_line(line: &str) -> Result<Directive, CommandError> {
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };
    let mut args = rest.split_whitespace();

    let directive = match name {
        "emit" => Directive::Emit(rest.to_string()),
        "emit-bytes" => {
            let count = parse_number(args.next(), name)?;
            let byte = args.next().map(|b| b.as_bytes()[0]).unwrap_or(b'x');
            Directive::EmitBytes { count, byte }
        }
        "notice" => Directive::Notice(rest.to_string()),
        "progress" => {
            let done = parse_number(args.next(), name)?;
            let total = parse_number(args.next(), name)?;
            Directive::Progress {
                done,
                total,
                phase: args.collect::<Vec<_>>().join(" "),
            }
        }
        "sleep" => Directive::Sleep(Duration::from_millis(parse_number(args.next(), name)?)),
        "count" => {
            let n = parse_number(args.next(), name)?;
            let interval = Duration::from_millis(parse_number(args.next(), name)?);
            Directive::Count { n, interval }
        }
        "tag" => Directive::Tag(rest.to_string()),
        "fail" => {
            let code = args.next().unwrap_or("SCRIPT").to_string();
            Directive::Fail {
                code,
                message: args.collect::<Vec<_>>().join(" "),
            }
        }
        "crash" => Directive::Crash,
        "exit" => Directive::Exit(parse_number(args.next(), name)?),
        "ignore-cancel" => Directive::IgnoreCancel,
        other => {
            return Err(CommandError::failed(
                "SYNTAX",
                format!("unknown directive '{}'", other),
            ))
        }
    };
    Ok(directive)
}

/// Parse a whole script before anything runs, so syntax errors produce no output
fn parse_script(script: &str) -> Result<Vec<Directive>, CommandError> {
    script
        .split(['\n', ';'])
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(parse_line)
        .collect()
}

/// Runs scripts of simple directives; used for demos and tests
#[derive(Debug, Clone, Default)]
pub struct ScriptExecutor;

impl ScriptExecutor {
    pub fn new() -> Self {
        Self
    }
}

async fn pause(
    cancelled: WaitForCancellationFutureOwned,
    duration: Duration,
    honour_cancel: bool,
) -> Result<(), CommandError> {
    if !honour_cancel {
        tokio::time::sleep(duration).await;
        return Ok(());
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => Ok(()),
        _ = cancelled => Err(CommandError::Cancelled),
    }
}

#[async_trait::async_trait]
impl CommandExecutor for ScriptExecutor {
    async fn execute(
        &self,
        command: &str,
        ctx: &mut WorkerContext,
    ) -> Result<Vec<String>, CommandError> {
        let directives = parse_script(command)?;
        let mut honour_cancel = true;
        let mut tags = Vec::new();

        for directive in directives {
            if honour_cancel && ctx.is_cancelled() {
                return Err(CommandError::Cancelled);
            }
            debug!("Worker {} running {:?}", ctx.worker_id(), directive);

            match directive {
                Directive::Emit(text) => ctx.send_text(&text).await?,
                Directive::EmitBytes { count, byte } => {
                    ctx.send_data(&vec![byte; count], DataFormat::Binary).await?
                }
                Directive::Notice(message) => ctx.notice(message).await?,
                Directive::Progress { done, total, phase } => {
                    ctx.progress(done, total, phase).await?
                }
                Directive::Sleep(duration) => {
                    pause(ctx.cancelled(), duration, honour_cancel).await?
                }
                Directive::Count { n, interval } => {
                    for i in 1..=n {
                        ctx.send_text(&format!("{}\n", i)).await?;
                        ctx.progress(i, n, "count").await?;
                        if i < n {
                            pause(ctx.cancelled(), interval, honour_cancel).await?;
                        }
                    }
                }
                Directive::Tag(tag) => tags.push(tag),
                Directive::Fail { code, message } => {
                    return Err(CommandError::Failed { code, message })
                }
                Directive::Crash => std::process::abort(),
                Directive::Exit(code) => std::process::exit(code),
                Directive::IgnoreCancel => honour_cancel = false,
            }
        }

        Ok(tags)
    }

    fn name(&self) -> &'static str {
        "script"
    }
}
