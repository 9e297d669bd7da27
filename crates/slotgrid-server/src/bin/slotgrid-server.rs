//! SlotGrid coordination server binary
//!
//! Listens on `SLOTGRID_ADDR` (default `127.0.0.1:8765`) with a
//! `SLOTGRID_ROWS`×`SLOTGRID_COLS` grid and runs until Ctrl-C.

use slotgrid_server::{ServerConfig, SlotServer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "slotgrid_server=info,slotgrid=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Starting SlotGrid server");
    tracing::info!("  Addr: {}", config.addr);
    tracing::info!("  Grid: {}x{}", config.rows, config.cols);
    tracing::info!("  Malformed messages: {:?}", config.malformed);

    let server = SlotServer::new(config)?;
    server.serve().await?;

    Ok(())
}
