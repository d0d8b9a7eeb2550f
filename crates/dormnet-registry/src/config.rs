//! Registry configuration

use crate::pool::AddressPool;
use crate::RegistryError;
use chrono::NaiveTime;
use dormnet_common::{RateLimitConfig, VlanId};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::PathBuf;

/// Room created at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSeed {
    /// Room number
    pub number: String,
    /// VLAN of the room's port
    #[serde(default)]
    pub vlan: Option<VlanId>,
}

/// Registry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Address the registry API listens on
    pub listen_addr: String,
    /// Shared secret expected from the firewall's host list pushes
    pub api_key: String,
    /// Base URL of the firewall daemon
    pub firewall_url: String,
    /// Shared secret sent to the firewall daemon
    pub firewall_api_key: String,
    /// Per-request timeout for firewall calls in seconds, none if unset
    pub firewall_timeout_secs: Option<u64>,
    /// Directory holding the directory snapshot
    pub state_dir: PathBuf,
    /// NAT pool as CIDR blocks or single addresses
    pub nat_pool: Vec<String>,
    /// Resolver used for tenants with ad blocking enabled
    pub adblock_dns: Option<Ipv4Addr>,
    /// Local time of the daily address reshuffle and history purge
    pub maintenance_time: NaiveTime,
    /// Closed address assignments are kept this many days, forever if unset
    pub address_retention_days: Option<u32>,
    /// Device self-registrations per tenant
    pub device_registration_limit: RateLimitConfig,
    /// Host list pushes per peer address
    pub hosts_push_limit: RateLimitConfig,
    /// Rooms of the building
    pub rooms: Vec<RoomSeed>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".into(),
            api_key: String::new(),
            firewall_url: "http://127.0.0.1:8081".into(),
            firewall_api_key: String::new(),
            firewall_timeout_secs: None,
            state_dir: PathBuf::from("/var/lib/dormnet/registry"),
            nat_pool: Vec::new(),
            adblock_dns: None,
            maintenance_time: NaiveTime::from_hms_opt(5, 0, 0).unwrap_or_default(),
            address_retention_days: None,
            device_registration_limit: RateLimitConfig::new(20, 20 * 60),
            hosts_push_limit: RateLimitConfig::new(60, 60),
            rooms: Vec::new(),
        }
    }
}

impl RegistryConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Reject configurations the registry cannot run with
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.api_key.is_empty() || self.firewall_api_key.is_empty() {
            return Err(RegistryError::Config("api_key and firewall_api_key must be set".into()));
        }
        if self.firewall_timeout_secs == Some(0) {
            return Err(RegistryError::Config("firewall_timeout_secs must be positive".into()));
        }
        if self.device_registration_limit.limit == 0 || self.hosts_push_limit.limit == 0 {
            return Err(RegistryError::Config("rate limits must be positive".into()));
        }
        AddressPool::from_networks(&self.nat_pool)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("registry.json");
        std::fs::write(
            &path,
            r#"{
                "api_key": "a",
                "firewall_api_key": "b",
                "nat_pool": ["137.226.10.0/29"],
                "maintenance_time": "04:30:00",
                "state_dir": "/srv/dormnet",
                "firewall_timeout_secs": 15,
                "rooms": [{ "number": "1105", "vlan": 105 }, { "number": "Lobby" }]
            }"#,
        )
        .unwrap();

        let config = RegistryConfig::load(path.to_str().unwrap()).unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.maintenance_time, NaiveTime::from_hms_opt(4, 30, 0).unwrap());
        assert_eq!(config.rooms[1].vlan, None);
        assert_eq!(config.device_registration_limit.limit, 20);
        assert_eq!(config.state_dir, PathBuf::from("/srv/dormnet"));
        assert_eq!(config.firewall_timeout_secs, Some(15));
        assert_eq!(RegistryConfig::default().firewall_timeout_secs, None);
    }

    #[test]
    fn test_validation() {
        assert!(RegistryConfig::default().validate().is_err());

        let config = RegistryConfig {
            api_key: "a".into(),
            firewall_api_key: "b".into(),
            nat_pool: vec!["not-a-network".into()],
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RegistryConfig {
            api_key: "a".into(),
            firewall_api_key: "b".into(),
            firewall_timeout_secs: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
