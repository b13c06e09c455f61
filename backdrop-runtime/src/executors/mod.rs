//! Reference command executors

pub mod script;
pub mod shell;

pub use script::ScriptExecutor;
pub use shell::ShellExecutor;
