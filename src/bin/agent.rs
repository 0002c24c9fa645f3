//! Backhaul Agent
//!
//! Dials out to the orchestrator, registers, and serves tunnel requests
//! until the control channel drops or the process is interrupted:
//! - Connects outward, so it runs fine behind NAT or inside containers
//! - Opens target connections on CONNECT and relays bytes both ways
//! - Optionally reconnects after session loss (the session itself is
//!   one-shot)

use anyhow::{anyhow, Context, Result};
use backhaul::{Config, Session};
use clap::Parser;
use std::path::Path;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Delay between reconnect attempts
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Backhaul Agent - reverse tunnel egress from inside the network
#[derive(Parser, Debug)]
#[command(name = "backhaul-agent")]
#[command(about = "Backhaul Agent - reverse tunnel egress from inside the network")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Orchestrator address (overrides config)
    #[arg(short, long)]
    orchestrator: Option<String>,

    /// Identity string announced at registration (overrides config)
    #[arg(long)]
    identity: Option<String>,

    /// Reconnect after the control channel drops
    #[arg(long)]
    reconnect: bool,

    /// Log level (trace, debug, info, warn, error; overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration; a missing file is fine when the orchestrator is
    // given on the command line
    let mut config = if Path::new(&args.config).exists() {
        Config::load(&args.config).context("Failed to load configuration")?
    } else if args.orchestrator.is_some() {
        Config::default()
    } else {
        return Err(anyhow!(
            "Config file '{}' not found (pass --orchestrator to run without one)",
            args.config
        ));
    };

    if let Some(orchestrator) = args.orchestrator {
        config.agent.orchestrator = orchestrator;
    }
    if let Some(identity) = args.identity {
        config.agent.identity = identity;
    }
    if args.reconnect {
        config.agent.reconnect = true;
    }

    // Initialize logging
    let log_level = args.log_level.unwrap_or_else(|| config.logging.level.clone());
    let subscriber = tracing_subscriber::fmt().with_env_filter(log_level.as_str());
    match config.logging.format.as_str() {
        "compact" => subscriber.compact().init(),
        _ => subscriber.init(),
    }

    config.validate()?;

    info!("Backhaul Agent v{}", backhaul::VERSION);
    info!("Orchestrator: {}", config.agent.orchestrator);
    info!("Identity: {:?}", config.agent.identity);

    // Ctrl-c fans out to the session (and to the reconnect loop) as a
    // broadcast shutdown token
    let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down...");
            let _ = signal_tx.send(());
        }
    });

    loop {
        match Session::connect(&config.agent.orchestrator, &config.agent.identity).await {
            Ok(session) => match session.run(shutdown_tx.subscribe()).await {
                Ok(()) => info!("Session ended"),
                Err(e) => error!("Session error: {}", e),
            },
            Err(e) => {
                if !config.agent.reconnect {
                    return Err(e).context("Failed to connect to orchestrator");
                }
                warn!("Connect failed: {}", e);
            }
        }

        if shutdown_rx.try_recv().is_ok() || !config.agent.reconnect {
            break;
        }

        info!("Reconnecting in {}s...", RECONNECT_DELAY.as_secs());
        tokio::select! {
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            _ = shutdown_rx.recv() => break,
        }
    }

    Ok(())
}
