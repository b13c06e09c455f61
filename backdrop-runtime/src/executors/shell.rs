//! Runs the command with `sh -c`
//!
//! Stdout is streamed back as data, stderr lines become notices. A stderr
//! line of the form `##progress <done> <total> [phase]` is turned into a
//! progress update instead.

use std::process::Stdio;

use backdrop_ipc::DataFormat;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CommandError;
use crate::executor::CommandExecutor;
use crate::worker::WorkerContext;

const PROGRESS_PREFIX: &str = "##progress";

/// Executes commands through the system shell
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use another POSIX shell, e.g. `bash`
    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

fn parse_progress(line: &str) -> Option<(u64, u64, String)> {
    let rest = line.strip_prefix(PROGRESS_PREFIX)?;
    let mut parts = rest.split_whitespace();
    let done = parts.next()?.parse().ok()?;
    let total = parts.next()?.parse().ok()?;
    Some((done, total, parts.collect::<Vec<_>>().join(" ")))
}

#[async_trait::async_trait]
impl CommandExecutor for ShellExecutor {
    async fn execute(
        &self,
        command: &str,
        ctx: &mut WorkerContext,
    ) -> Result<Vec<String>, CommandError> {
        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CommandError::failed("SPAWN", format!("{}: {}", self.shell, e)))?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| CommandError::failed("SPAWN", "shell stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| CommandError::failed("SPAWN", "shell stderr not captured"))?;
        let mut stderr_lines = BufReader::new(stderr).lines();

        let token = ctx.cancellation_token();
        let mut buf = vec![0u8; ctx.max_chunk()];
        let mut stdout_open = true;
        let mut stderr_open = true;

        while stdout_open || stderr_open {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("Worker {} killing shell on cancel", ctx.worker_id());
                    if let Err(e) = child.start_kill() {
                        warn!("Failed to kill shell: {}", e);
                    }
                    let _ = child.wait().await;
                    return Err(CommandError::Cancelled);
                }
                read = stdout.read(&mut buf), if stdout_open => {
                    match read? {
                        0 => stdout_open = false,
                        n => {
                            let chunk = &buf[..n];
                            let format = if std::str::from_utf8(chunk).is_ok() {
                                DataFormat::Text
                            } else {
                                DataFormat::Binary
                            };
                            ctx.send_data(chunk, format).await?;
                        }
                    }
                }
                line = stderr_lines.next_line(), if stderr_open => {
                    match line? {
                        None => stderr_open = false,
                        Some(line) => match parse_progress(&line) {
                            Some((done, total, phase)) => ctx.progress(done, total, phase).await?,
                            None => ctx.notice(line).await?,
                        },
                    }
                }
            }
        }

        let status = child.wait().await?;
        match status.code() {
            Some(0) => Ok(vec!["EXIT 0".to_string()]),
            Some(code) => Err(CommandError::failed(
                code.to_string(),
                format!("command exited with status {}", code),
            )),
            None => Err(CommandError::failed(
                "SIGNAL",
                format!("command terminated: {}", status),
            )),
        }
    }

    fn name(&self) -> &'static str {
        "shell"
    }
}
