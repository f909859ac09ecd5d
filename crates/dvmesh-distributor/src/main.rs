//! # dvmesh Distributor
//!
//! Daemon that connects local applications to the dvmesh mesh.
//!
//! ## Architecture
//!
//! One task per link reads and writes telegrams; a single runtime task owns
//! all protocol state:
//! 1. **Links**: handshake, keep-alive, throughput probing, fragment assembly
//! 2. **Routing**: distance-vector best paths to every distributor
//! 3. **Resolution**: hop-by-hop search for each channel's central distributor
//! 4. **Delivery**: records forwarded along resolved paths to local receivers
//! 5. **Interest**: interest lists exchanged with neighbours

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod directory;
mod link;
mod runtime;

pub use config::DistributorConfig;
pub use runtime::Distributor;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting dvmesh distributor"
    );

    let config = DistributorConfig::from_env().context("Failed to load configuration")?;
    tracing::info!(transmitter = %config.transmitter_id, neighbors = config.neighbors.len(), "Distributor configured");

    let distributor = Distributor::new(config)?;
    distributor.run().await?;

    Ok(())
}
