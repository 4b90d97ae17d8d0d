use crate::config::Config;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tracing::error;

/// Append-only diagnostic stream for kill decisions. The engine writes one
/// human-readable line per decision point (what was searched, what matched,
/// what was excluded, what was signaled) so a user can reconstruct why a
/// kill succeeded or silently returned false. Injected into the resolver
/// and the killer rather than held as process-wide state.
#[async_trait]
pub trait KillLog: Send + Sync {
    async fn log(&self, line: &str);
}

pub struct FileKillLog {
    log_file_path: PathBuf,
}

impl FileKillLog {
    pub fn new(config: Arc<Config>) -> Self {
        // Ensure log directory exists
        if let Some(parent_dir) = config.kill_log_file.parent() {
            if !parent_dir.exists() {
                if let Err(e) = std::fs::create_dir_all(parent_dir) {
                    error!(path = %parent_dir.display(), error = %e, "Failed to create kill log directory");
                }
            }
        }
        Self {
            log_file_path: config.kill_log_file.clone(),
        }
    }

    async fn try_log(&self, line: &str) -> Result<()> {
        let entry = format!("{} | {}\n", Utc::now().to_rfc3339(), line);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_file_path)
            .await?;
        file.write_all(entry.as_bytes()).await?;
        Ok(())
    }
}

#[async_trait]
impl KillLog for FileKillLog {
    async fn log(&self, line: &str) {
        if let Err(e) = self.try_log(line).await {
            error!(error = %e, "Failed to write kill log");
        }
    }
}

/// Capturing double for tests: stores every line so assertions can check
/// which decisions were taken.
#[cfg(test)]
pub struct MemoryKillLog {
    lines: std::sync::Mutex<Vec<String>>,
}

#[cfg(test)]
impl MemoryKillLog {
    pub fn new() -> Self {
        Self {
            lines: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

#[cfg(test)]
#[async_trait]
impl KillLog for MemoryKillLog {
    async fn log(&self, line: &str) {
        self.lines.lock().unwrap().push(line.to_string());
    }
}
