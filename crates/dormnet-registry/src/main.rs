//! DormNet Registry - Main Entry Point

use anyhow::Context;
use dormnet_common::RateLimiter;
use dormnet_registry::api::{self, ApiState};
use dormnet_registry::daily::spawn_daily;
use dormnet_registry::{Directory, HttpTransport, RegistryConfig, RulesetSyncClient};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("DormNet registry v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("CONFIG_PATH").ok())
        .unwrap_or_else(|| "/etc/dormnet/registry.json".into());

    let config = RegistryConfig::load(&config_path).unwrap_or_else(|e| {
        tracing::warn!("Config {} not usable ({}), using defaults", config_path, e);
        RegistryConfig::default()
    });
    config.validate()?;

    let transport = HttpTransport::new(
        config.firewall_url.clone(),
        config.firewall_api_key.clone(),
        config.firewall_timeout_secs.map(Duration::from_secs),
    )?;
    let client = RulesetSyncClient::connect(Arc::new(transport)).await;
    let directory = Directory::from_config(&config, client.clone())?;

    let maintenance = directory.clone();
    let daily = spawn_daily(
        "address-maintenance",
        config.maintenance_time,
        Arc::new(move || maintenance.run_daily_maintenance()),
    );

    let state = ApiState {
        directory: directory.clone(),
        client: client.clone(),
        api_key: config.api_key.as_str().into(),
        limiter: Arc::new(RateLimiter::from_config(&config.hosts_push_limit)?),
    };
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("cannot bind {}", config.listen_addr))?;
    api::serve(listener, state, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("Shutting down");
    })
    .await?;

    daily.abort();
    directory.halt();
    client.shutdown().await;

    Ok(())
}
