//! DormNet Firewall - Main Entry Point

use anyhow::Context;
use dormnet_firewall::{FirewallConfig, FirewallDaemon};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("DormNet firewall v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "/etc/dormnet/firewall.json".into());

    let config = FirewallConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config {} not usable ({}), using defaults", config_path, e);
        FirewallConfig::default()
    });

    let daemon = tokio::task::spawn_blocking(move || FirewallDaemon::start(config))
        .await
        .context("startup task failed")??;

    daemon.run().await?;
    daemon.halt();

    Ok(())
}
