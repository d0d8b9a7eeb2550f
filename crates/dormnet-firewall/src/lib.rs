//! DormNet Firewall - Ruleset enforcement point and host discovery
//!
//! Runs on the gateway. Receives VLAN rulesets from the tenant registry, keeps
//! them on disk, applies them through an external command and reports the hosts
//! seen in the DHCP lease table back to the registry.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                         DORMNET FIREWALL                            │
//! │                                                                     │
//! │   POST /api/firewall/rules          GET /api/firewall/hosts         │
//! │            │                                  ▲                     │
//! │  ┌─────────▼──────────┐            ┌──────────┴──────────┐          │
//! │  │ RulesetController  │            │ HostDiscoveryWatcher │          │
//! │  │  store ─► enforce  │            │  inotify ─► notifier │──► push  │
//! │  └─────────┬──────────┘            └──────────▲──────────┘          │
//! │            │                                  │                     │
//! │   rules.json + vlan command          dnsmasq lease table            │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod config;
pub mod controller;
pub mod enforcer;
pub mod leases;
pub mod notifier;
pub mod push;
pub mod store;
pub mod watcher;

use dormnet_common::{CommonError, RateLimiter};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub use config::FirewallConfig;
pub use controller::RulesetController;
pub use enforcer::{ExecEnforcer, RulesetEnforcer};
pub use store::RulesetStore;
pub use watcher::{HostDiscoveryWatcher, HostListener, HostSnapshot, WatcherConfig};

/// Firewall error types
#[derive(Debug, Error)]
pub enum FirewallError {
    /// Filesystem or process I/O failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Lease table line that could not be parsed
    #[error("unrecognized lease line: {0}")]
    Lease(String),
    /// Shared type or codec failure
    #[error(transparent)]
    Common(#[from] CommonError),
    /// Ruleset files unusable
    #[error("persistence error: {0}")]
    Persistence(String),
    /// Enforcement command failed
    #[error("failed to enforce ruleset for vlan {vlan}: {reason}")]
    Enforcement {
        /// VLAN whose ruleset failed
        vlan: i32,
        /// Command output
        reason: String,
    },
    /// File watch setup failed
    #[error("watch error: {0}")]
    Watch(String),
    /// Host list push failed
    #[error("host push failed: {0}")]
    Push(String),
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
    /// API server failure
    #[error("network error: {0}")]
    Network(String),
}

/// Result type for firewall operations
pub type FirewallResult<T> = Result<T, FirewallError>;

/// Running firewall daemon
pub struct FirewallDaemon {
    /// Configuration
    pub config: FirewallConfig,
    /// Ruleset holder
    pub controller: Arc<RulesetController>,
    /// Lease table watcher
    pub watcher: Arc<HostDiscoveryWatcher>,
}

impl FirewallDaemon {
    /// Bring up the daemon: init command, ruleset recovery, host discovery.
    ///
    /// Blocks on external commands; call from a blocking context inside the
    /// runtime that drives host pushes.
    pub fn start(config: FirewallConfig) -> FirewallResult<Self> {
        config.validate()?;
        info!("Starting DormNet firewall...");

        if let Some(init) = &config.init_command {
            if let Err(e) = enforcer::run_init_command(init) {
                warn!("init command failed: {}", e);
            }
        }

        std::fs::create_dir_all(&config.ruleset_dir)?;
        let store = RulesetStore::new(&config.ruleset_dir)?;
        let enforcer = Arc::new(ExecEnforcer::new(&config.vlan_command));
        let controller = Arc::new(RulesetController::open(store, enforcer)?);

        let watcher = Arc::new(HostDiscoveryWatcher::start(WatcherConfig {
            lease_file: config.lease_file.clone(),
            read_interval: config.lease_read_interval(),
        })?);

        if let Some(url) = &config.hosts_push_url {
            let runtime = tokio::runtime::Handle::try_current()
                .map_err(|e| FirewallError::Config(format!("host push needs a tokio runtime: {e}")))?;
            let push = push::HttpHostPush::new(url.as_str(), config.api_key.as_str(), runtime)?;
            watcher.set_listener(Some(Arc::new(push)));
            info!("pushing host lists to {}", url);
        }

        Ok(Self {
            config,
            controller,
            watcher,
        })
    }

    /// Handler state for the API server
    pub fn api_state(&self) -> FirewallResult<api::ApiState> {
        Ok(api::ApiState {
            controller: self.controller.clone(),
            hosts: self.watcher.clone(),
            api_key: self.config.api_key.as_str().into(),
            limiter: Arc::new(RateLimiter::from_config(&self.config.api_rate_limit)?),
        })
    }

    /// Serve the API until Ctrl-C
    pub async fn run(&self) -> FirewallResult<()> {
        let listener = tokio::net::TcpListener::bind(&self.config.listen_addr).await?;
        api::serve(listener, self.api_state()?, async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown requested");
        })
        .await
    }

    /// Stop host discovery
    pub fn halt(&self) {
        self.watcher.set_listener(None);
        self.watcher.halt();
    }
}
