#![warn(missing_docs)]

//! dsrepl replication server binary.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use dsrepl_server::{ReplServerConfig, ReplicationServer};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "dsrepl", version, about = "Directory replication server")]
struct Cli {
    /// Configuration file (.toml or .json).
    #[arg(short, long, env = "DSREPL_CONFIG")]
    config: PathBuf,

    /// Override replication_server_id.
    #[arg(long)]
    server_id: Option<u16>,

    /// Override replication_port.
    #[arg(long)]
    port: Option<u16>,

    /// Log as JSON lines.
    #[arg(long)]
    json: bool,
}

fn init_tracing(json: bool) {
    let registry = tracing_subscriber::registry().with(EnvFilter::from_default_env());
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json);

    let mut config = ReplServerConfig::from_file(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(id) = cli.server_id {
        config.replication_server_id = id;
    }
    if let Some(port) = cli.port {
        config.replication_port = port;
    }

    tracing::info!(
        server_id = config.replication_server_id,
        port = config.replication_port,
        "dsrepl starting..."
    );
    let server = ReplicationServer::start(config).await?;

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    server.shutdown().await?;
    Ok(())
}
