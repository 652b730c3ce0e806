//! Assetgate server
//!
//! Loads configuration, sets up logging and serves requests until the
//! process is stopped.

use anyhow::Context;
use assetgate::{AssetServer, GateConfig};
use std::env;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, Level};

/// # Usage
/// ```bash
/// # Start with the default config (assetgate.yaml)
/// assetgate
///
/// # Start with a custom config
/// assetgate /path/to/config.yaml
/// ```
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config_path = env::args()
        .nth(1)
        .unwrap_or_else(|| "assetgate.yaml".to_string());

    let config = GateConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load configuration from {}", config_path))?;

    let level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .init();

    info!("Starting assetgate with configuration from {}", config_path);
    info!("  - Cache TTL: {} seconds", config.caching.ttl);
    info!(
        "  - Max dimensions: {}x{}",
        config.security.max_width, config.security.max_height
    );
    info!("  - Image origins enabled: {}", config.images.enabled_count());
    info!("  - Asset origins enabled: {}", config.assets.enabled_count());
    info!("  - Multi-domain: {}", config.multi_domain.enabled);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let server = Arc::new(
        AssetServer::from_config(config)
            .await
            .context("Failed to initialise the asset server")?,
    );

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    server.serve(listener).await?;
    Ok(())
}
