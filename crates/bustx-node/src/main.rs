//! bustx transaction server binary
//!
//! Runs a transaction manager behind a tick-driven event loop.

mod cli;
mod config;
mod demo;
mod server;

use anyhow::Result;
use bustx_core::{ManagerConfig, TransactionManager};
use cli::Cli;
use config::{LogFormat, NodeConfig};
use server::Server;
use tokio::sync::mpsc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse_args();

    // Initialize tracing
    init_tracing(&cli.log_level, cli.log_format);

    tracing::info!("bustxd starting...");

    // Load configuration, flags win over the file
    let mut config = match &cli.config {
        Some(path) => NodeConfig::load(path)?,
        None => NodeConfig::default(),
    };
    config.apply_cli(&cli);
    config.validate()?;

    let mut manager = TransactionManager::new(ManagerConfig {
        use_locker: config.use_locker,
    });
    demo::register_handlers(&mut manager)?;

    let (inbox_tx, inbox_rx) = mpsc::channel(config.inbox_capacity);
    let (outbound_tx, outbound_rx) = mpsc::channel(config.inbox_capacity);
    tokio::spawn(demo::loopback(outbound_rx, inbox_tx.clone()));

    if config.demo.enabled {
        tokio::spawn(demo::generate_load(
            config.demo.clone(),
            config.tick_interval(),
            inbox_tx.clone(),
        ));
    }

    let mut server = Server::new(config, manager, inbox_rx, outbound_tx);
    server
        .run(async {
            tokio::signal::ctrl_c().await.ok();
        })
        .await?;

    tracing::info!(
        "bustxd stopped with {} transactions in flight: {}",
        server.manager().active_count(),
        server.loop_stats()
    );

    Ok(())
}

fn init_tracing(log_level: &str, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(filter)
            .init(),
    }
}
