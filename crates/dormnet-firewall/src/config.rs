//! Firewall daemon configuration

use crate::FirewallError;
use dormnet_common::RateLimitConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Firewall daemon configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// Address the ruleset API listens on
    pub listen_addr: String,
    /// Shared secret expected in the `Key` header, also sent with host pushes
    pub api_key: String,
    /// Registry endpoint receiving host list updates (push disabled if unset)
    pub hosts_push_url: Option<String>,
    /// DHCP lease table to watch
    pub lease_file: PathBuf,
    /// Delay between attempts to read a lease file that is being rewritten
    pub lease_read_interval_ms: u64,
    /// Directory holding the persisted rulesets
    pub ruleset_dir: PathBuf,
    /// Command run once at startup, before any ruleset is enforced
    pub init_command: Option<PathBuf>,
    /// Command enforcing one VLAN ruleset
    pub vlan_command: PathBuf,
    /// Per peer address limit on API requests
    pub api_rate_limit: RateLimitConfig,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8081".into(),
            api_key: String::new(),
            hosts_push_url: None,
            lease_file: "/var/lib/misc/dnsmasq.leases".into(),
            lease_read_interval_ms: 250,
            ruleset_dir: "/var/lib/dormnet/rules".into(),
            init_command: None,
            vlan_command: "/usr/local/lib/dormnet/vlan-ruleset".into(),
            api_rate_limit: RateLimitConfig::new(600, 60),
        }
    }
}

impl FirewallConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Reject configurations the daemon cannot run with
    pub fn validate(&self) -> Result<(), FirewallError> {
        if self.api_key.is_empty() {
            return Err(FirewallError::Config("api_key must be set".into()));
        }
        if self.lease_read_interval_ms == 0 {
            return Err(FirewallError::Config("lease_read_interval_ms must be positive".into()));
        }
        if self.api_rate_limit.limit == 0 {
            return Err(FirewallError::Config("api_rate_limit.limit must be positive".into()));
        }
        Ok(())
    }

    /// Lease read retry interval
    pub fn lease_read_interval(&self) -> Duration {
        Duration::from_millis(self.lease_read_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: FirewallConfig =
            serde_json::from_str(r#"{ "api_key": "secret", "lease_file": "/tmp/leases" }"#).unwrap();
        assert_eq!(config.api_key, "secret");
        assert_eq!(config.lease_file, PathBuf::from("/tmp/leases"));
        assert_eq!(config.lease_read_interval(), Duration::from_millis(250));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_api_key_rejected() {
        assert!(FirewallConfig::default().validate().is_err());
    }
}
