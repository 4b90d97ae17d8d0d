pub mod native;

use crate::error::AppError;
use async_trait::async_trait;
use std::path::PathBuf;

/// One live process as seen by the OS process table.
#[derive(Debug, Clone)]
pub struct ProcessRecord {
    pub pid: u32,
    pub name: String,
    pub command: String,
}

/// Capability surface for everything the kill engine needs from the OS.
/// Process listing, port-to-PID mapping and termination all differ per
/// platform family; matching logic talks only to this trait so backends can
/// be swapped (and doubled in tests) without touching it.
#[async_trait]
pub trait ProcessApi: Send + Sync {
    /// PID of the tool's own process; seeds the exclusion set.
    fn current_pid(&self) -> u32;

    /// Processes whose full command line contains `pattern` as a substring.
    async fn processes_matching(&self, pattern: &str) -> Result<Vec<ProcessRecord>, AppError>;

    /// PIDs currently listening on the given TCP port.
    async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, AppError>;

    async fn parent_of(&self, pid: u32) -> Option<u32>;

    async fn children_of(&self, pid: u32) -> Vec<u32>;

    async fn working_directory(&self, pid: u32) -> Option<PathBuf>;

    /// Signals every PID in one batch; returns how many signals were delivered.
    async fn terminate(&self, pids: &[u32]) -> usize;
}

/// Wraps a user-authored string for interpolation into a shell invocation.
/// Single-quote wrapping with embedded-quote escaping; start commands and
/// server names may contain shell metacharacters, and letting them through
/// unquoted would be command injection.
pub fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', "'\\''"))
}
