//! The command execution collaborator

use crate::error::CommandError;
use crate::worker::WorkerContext;

/// Executes the command handed to a worker process.
///
/// Implementations stream output through the context while running and
/// return the completion tags on success. The runtime sends `Ready` before
/// calling `execute` and exactly one `Done` after it returns.
#[async_trait::async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn execute(
        &self,
        command: &str,
        ctx: &mut WorkerContext,
    ) -> Result<Vec<String>, CommandError>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}
