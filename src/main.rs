// FILE: src/main.rs
mod config;
mod error;
mod platform;
mod server;
mod tools;
mod utils;

use crate::config::Config;
use crate::platform::native::NativeProcessApi;
use crate::platform::ProcessApi;
use crate::server::ServerEntry;
use crate::tools::health::HealthChecker;
use crate::tools::killer::ProcessKiller;
use crate::utils::kill_log::{FileKillLog, KillLog};
use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt::format::FmtSpan, FmtSubscriber};

#[derive(Parser, Debug)]
#[command(author, version, about = "Dev-server sidekick: find and kill the processes behind a start command", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Find and terminate the processes behind a dev server entry
    Kill {
        /// Display name for the entry, used in log lines
        #[arg(long, default_value = "server")]
        name: String,
        /// URL the server is reachable on
        #[arg(long)]
        url: String,
        /// Shell command the server was started with
        #[arg(long)]
        command: String,
    },
    /// Probe a server URL and report up/down
    Status {
        #[arg(long)]
        url: String,
    },
}

fn setup_logging(log_level_str: &str) {
    let level = match log_level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("dev_reaper={}", level)));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_ansi(false)
        .with_writer(std::io::stderr)
        .with_level(true)
        .with_span_events(FmtSpan::CLOSE)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .expect("Failed to set tracing subscriber");
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::load()?);
    setup_logging(&config.log_level);

    tracing::info!(version = %env!("CARGO_PKG_VERSION"), "Starting dev-reaper");

    if cfg!(unix) && which::which("lsof").is_err() && which::which("ss").is_err() {
        tracing::warn!(
            "neither lsof nor ss is in PATH; the port-based kill strategy will be unavailable"
        );
    }

    let cli = Cli::parse();
    match cli.command {
        Commands::Kill { name, url, command } => {
            let api: Arc<dyn ProcessApi> = Arc::new(NativeProcessApi::new(config.clone()));
            let log: Arc<dyn KillLog> = Arc::new(FileKillLog::new(config.clone()));
            let killer = ProcessKiller::new(config, api, log);

            let entry = ServerEntry::new(&name, &url, &command);
            let report = killer.kill_report(&entry).await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.killed {
                std::process::exit(1);
            }
        }
        Commands::Status { url } => {
            let checker = HealthChecker::new(config);
            let status = checker.check(&url).await;
            println!(
                "{}",
                serde_json::to_string(&serde_json::json!({ "url": url, "status": status }))?
            );
        }
    }

    Ok(())
}
