use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;

use darts_backend::persistence::connect_store;
use darts_backend::sweeper::run_liveness_sweeper;
use darts_backend::{router, Hub, ServerConfig};

#[derive(Parser, Debug)]
#[command(name = "darts-backend", about = "Darts match coordination server")]
struct Args {
    /// Optional TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen port (overrides config and PORT)
    #[arg(short, long)]
    port: Option<u16>,
}

// ─── Main ─────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    // Logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "darts_backend=info,tower_http=warn".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = ServerConfig::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.set_port(port);
    }

    info!("🎯 Darts backend starting...");

    let store = connect_store(config.redis_url.as_deref());
    let addr = config.bind_addr.clone();
    let hub = Hub::new(config, store);

    tokio::spawn(run_liveness_sweeper(hub.clone()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!("🚀 Listening on {addr}");

    axum::serve(listener, router(hub)).await?;
    Ok(())
}
