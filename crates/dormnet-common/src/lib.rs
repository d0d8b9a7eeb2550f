//! DormNet Common - Shared types for the tenant registry and the firewall daemon
//!
//! Both sides of the synchronization link speak in terms of these types:
//! - [`MacAddress`]: validated, canonical hardware addresses
//! - [`VlanRuleset`]: the enforced policy of one VLAN
//! - [`HostList`]: hosts observed on the wire, grouped by VLAN
//! - [`RateLimiter`]: sliding-window admission control for the HTTP endpoints
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────┐   POST /api/firewall/rules   ┌──────────────────────┐
//! │   TENANT REGISTRY    │ ───────────────────────────► │   FIREWALL DAEMON    │
//! │                      │                              │                      │
//! │  Directory           │   GET  /api/firewall/hosts   │  RulesetController   │
//! │  AddressPool         │ ◄─────────────────────────── │  HostDiscoveryWatch  │
//! │  RulesetSyncClient   │   POST /api/hosts (push)     │  ExecEnforcer        │
//! └──────────────────────┘ ◄─────────────────────────── └──────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod hosts;
pub mod mac;
pub mod ratelimit;
pub mod ruleset;
pub mod vlan;
pub mod wire;

pub use error::{CommonError, CommonResult};
pub use hosts::{HostList, NetworkHost};
pub use mac::MacAddress;
pub use ratelimit::{RateLimitConfig, RateLimiter};
pub use ruleset::VlanRuleset;
pub use vlan::{vlan_for_address, VlanId, DEFAULT_VLAN, UNKNOWN_VLAN};

/// Header carrying the shared secret on every API request
pub const API_KEY_HEADER: &str = "Key";

/// Path prefix of the firewall daemon's HTTP API
pub const FIREWALL_API_PREFIX: &str = "/api/firewall";
