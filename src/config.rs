use anyhow::{Context, Result};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub default_shell: Option<String>,
    pub shell_resolve_timeout: Duration,
    pub port_probe_timeout: Duration,
    pub strategy_order: StrategyOrder,
    pub kill_proxy_ports: bool,
    pub health_timeout: Duration,
    pub kill_log_file: PathBuf,
    pub log_level: String,
}

/// Which termination strategy runs first. Both are always attempted;
/// the order changes observable behavior when both would succeed on
/// different processes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StrategyOrder {
    PatternFirst,
    PortFirst,
}

impl FromStr for StrategyOrder {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pattern-first" | "pattern" => Ok(StrategyOrder::PatternFirst),
            "port-first" | "port" => Ok(StrategyOrder::PortFirst),
            _ => Err(anyhow::anyhow!("Invalid strategy order: {}", s)),
        }
    }
}

fn expand_tilde(path_str: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path_str).as_ref())
}

fn env_millis(var: &str, default_ms: u64) -> Result<Duration> {
    let ms = std::env::var(var)
        .unwrap_or_else(|_| default_ms.to_string())
        .parse::<u64>()
        .context(format!("Invalid {}", var))?;
    Ok(Duration::from_millis(ms))
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let default_shell = std::env::var("DEFAULT_SHELL").ok().filter(|s| !s.is_empty());

        let shell_resolve_timeout = env_millis("SHELL_RESOLVE_TIMEOUT_MS", 3000)?;
        let port_probe_timeout = env_millis("PORT_PROBE_TIMEOUT_MS", 3000)?;
        let health_timeout = env_millis("HEALTH_TIMEOUT_MS", 2000)?;

        let strategy_order_str =
            std::env::var("KILL_STRATEGY_ORDER").unwrap_or_else(|_| "pattern-first".to_string());
        let strategy_order = StrategyOrder::from_str(&strategy_order_str)?;

        // Ports 80/443 usually front a shared reverse proxy, so the port
        // strategy refuses them unless the user opts in explicitly.
        let kill_proxy_ports = std::env::var("KILL_PROXY_PORTS")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .context("Invalid KILL_PROXY_PORTS")?;

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let log_dir_base = std::env::var("REAPER_LOG_DIR")
            .ok()
            .map(|s| expand_tilde(&s))
            .unwrap_or_else(|| expand_tilde("~/.dev-reaper"));
        let kill_log_file = log_dir_base.join("kill-decisions.log");

        Ok(Config {
            default_shell,
            shell_resolve_timeout,
            port_probe_timeout,
            strategy_order,
            kill_proxy_ports,
            health_timeout,
            kill_log_file,
            log_level,
        })
    }
}
