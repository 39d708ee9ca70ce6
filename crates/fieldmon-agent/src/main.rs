use anyhow::Result;
use fieldmon_agent::config::{Config, LoggingConfig};
use fieldmon_agent::{devices, Agent};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[allow(clippy::print_stderr)]
fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  fieldmon-agent [config.toml]    Start the agent (default: config/agent.toml)");
    eprintln!("  fieldmon-agent --version        Show version information");
}

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();

    let config_path = match args.get(1).map(|s| s.as_str()) {
        Some("--help" | "-h") => {
            print_usage();
            return Ok(());
        }
        Some("--version" | "-V") => {
            #[allow(clippy::print_stdout)]
            {
                println!("fieldmon-agent {VERSION}");
            }
            return Ok(());
        }
        Some(path) => path,
        None => "config/agent.toml",
    };

    let config = Config::load(config_path)?;
    init_tracing(&config.logging)?;

    tracing::info!(
        version = VERSION,
        agent_id = %config.agent.id,
        config = %config_path,
        "fieldmon-agent starting"
    );

    let devices = devices::load(&config)?;
    let agent = Arc::new(Agent::new(config, devices)?);
    agent.start().await?;

    tracing::info!("Agent running, send SIGINT or SIGTERM to stop");
    wait_for_shutdown().await;

    agent.stop().await;
    tracing::info!("fieldmon-agent stopped");
    Ok(())
}

fn init_tracing(cfg: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("fieldmon={}", cfg.level)));

    match cfg.format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .init(),
        _ => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => tracing::info!("Received SIGINT"),
                _ = term.recv() => tracing::info!("Received SIGTERM"),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown() {
    let _ = tokio::signal::ctrl_c().await;
}
