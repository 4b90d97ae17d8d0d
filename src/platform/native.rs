use crate::config::Config;
use crate::error::AppError;
use crate::platform::{ProcessApi, ProcessRecord};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex}; // Using std::sync::Mutex as sysinfo is sync
use sysinfo::{Pid, Signal, System};
use tokio::process::Command as TokioCommand;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Backend for the platforms this tool actually ships on. The process table
/// side (matching, parents, children, cwd, signaling) goes through sysinfo;
/// port-to-PID mapping has no portable API and shells out to the platform's
/// socket-inspection utility.
pub struct NativeProcessApi {
    config: Arc<Config>,
    system: StdMutex<System>,
}

impl NativeProcessApi {
    pub fn new(config: Arc<Config>) -> Self {
        let mut sys = System::new_all();
        sys.refresh_processes();
        Self {
            config,
            system: StdMutex::new(sys),
        }
    }

    async fn port_probe(&self, program: &str, args: &[&str]) -> Result<String, AppError> {
        let mut cmd = TokioCommand::new(program);
        cmd.args(args);
        cmd.stdin(std::process::Stdio::null());
        // lsof exits non-zero when nothing listens; stdout is authoritative
        // either way, so only spawn/timeout failures are errors.
        match timeout(self.config.port_probe_timeout, cmd.output()).await {
            Ok(Ok(output)) => Ok(String::from_utf8_lossy(&output.stdout).into_owned()),
            Ok(Err(e)) => Err(AppError::CommandExecutionError(format!(
                "Failed to run {}: {}",
                program, e
            ))),
            Err(_) => Err(AppError::TimeoutError(format!("{} timed out", program))),
        }
    }

    #[cfg(unix)]
    async fn listeners_on_port_impl(&self, port: u16) -> Result<Vec<u32>, AppError> {
        if which::which("lsof").is_ok() {
            let spec = format!("TCP:{}", port);
            let out = self
                .port_probe("lsof", &["-t", "-i", &spec, "-s", "TCP:LISTEN"])
                .await?;
            return Ok(parse_pid_lines(&out));
        }
        if which::which("ss").is_ok() {
            let filter = format!("sport = :{}", port);
            let out = self
                .port_probe("ss", &["-H", "-l", "-t", "-n", "-p", &filter])
                .await?;
            return Ok(parse_ss_pids(&out));
        }
        Err(AppError::PlatformToolMissing(
            "neither lsof nor ss is installed".to_string(),
        ))
    }

    #[cfg(windows)]
    async fn listeners_on_port_impl(&self, port: u16) -> Result<Vec<u32>, AppError> {
        let script = format!(
            "Get-NetTCPConnection -LocalPort {} -State Listen -ErrorAction SilentlyContinue | Select-Object -ExpandProperty OwningProcess",
            port
        );
        let out = self
            .port_probe("powershell", &["-NoProfile", "-Command", &script])
            .await?;
        Ok(parse_pid_lines(&out))
    }
}

fn parse_pid_lines(out: &str) -> Vec<u32> {
    let mut pids: Vec<u32> = out
        .lines()
        .filter_map(|line| line.trim().parse::<u32>().ok())
        .collect();
    pids.sort_unstable();
    pids.dedup();
    pids
}

/// Pulls PIDs out of `ss -p` output, e.g. `users:(("node",pid=1234,fd=23))`.
#[cfg_attr(not(unix), allow(dead_code))]
fn parse_ss_pids(out: &str) -> Vec<u32> {
    let mut pids = Vec::new();
    for chunk in out.split("pid=").skip(1) {
        let digits: String = chunk.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(pid) = digits.parse::<u32>() {
            if !pids.contains(&pid) {
                pids.push(pid);
            }
        }
    }
    pids
}

#[async_trait]
impl ProcessApi for NativeProcessApi {
    fn current_pid(&self) -> u32 {
        std::process::id()
    }

    async fn processes_matching(&self, pattern: &str) -> Result<Vec<ProcessRecord>, AppError> {
        let mut sys = self.system.lock().map_err(|e| {
            AppError::ProcessError(format!("process table lock poisoned: {}", e))
        })?;
        sys.refresh_processes();
        debug!(pattern = %pattern, total = sys.processes().len(), "Scanning process table");

        let mut records = Vec::new();
        for (pid, process) in sys.processes() {
            let command = if process.cmd().is_empty() {
                process.name().to_string()
            } else {
                process.cmd().join(" ")
            };
            if command.contains(pattern) {
                records.push(ProcessRecord {
                    pid: pid.as_u32(),
                    name: process.name().to_string(),
                    command,
                });
            }
        }
        records.sort_by_key(|r| r.pid);
        Ok(records)
    }

    async fn listeners_on_port(&self, port: u16) -> Result<Vec<u32>, AppError> {
        self.listeners_on_port_impl(port).await
    }

    async fn parent_of(&self, pid: u32) -> Option<u32> {
        let mut sys = self.system.lock().ok()?;
        sys.refresh_processes();
        sys.process(Pid::from_u32(pid))
            .and_then(|p| p.parent())
            .map(|p| p.as_u32())
    }

    async fn children_of(&self, pid: u32) -> Vec<u32> {
        let Ok(mut sys) = self.system.lock() else {
            return Vec::new();
        };
        sys.refresh_processes();
        let target = Pid::from_u32(pid);
        let mut children: Vec<u32> = sys
            .processes()
            .iter()
            .filter(|(_, process)| process.parent() == Some(target))
            .map(|(child_pid, _)| child_pid.as_u32())
            .collect();
        children.sort_unstable();
        children
    }

    async fn working_directory(&self, pid: u32) -> Option<PathBuf> {
        let sys = self.system.lock().ok()?;
        let process = sys.process(Pid::from_u32(pid))?;
        process.cwd().map(|p| p.to_path_buf())
    }

    async fn terminate(&self, pids: &[u32]) -> usize {
        let Ok(mut sys) = self.system.lock() else {
            return 0;
        };
        sys.refresh_processes();
        let mut signaled = 0;
        for &pid in pids {
            let Some(process) = sys.process(Pid::from_u32(pid)) else {
                debug!(pid = pid, "Process vanished before it could be signaled");
                continue;
            };
            // SIGTERM where the platform supports it, sysinfo's default kill
            // where it does not.
            let delivered = match process.kill_with(Signal::Term) {
                Some(ok) => ok,
                None => process.kill(),
            };
            if delivered {
                signaled += 1;
            } else {
                warn!(pid = pid, "Failed to deliver termination signal");
            }
        }
        signaled
    }
}
