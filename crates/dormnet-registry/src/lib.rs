//! DormNet Registry - Tenant directory and firewall synchronization
//!
//! Authoritative source of rooms, tenants, devices and NAT addresses. Every
//! change that affects network access is translated into a VLAN ruleset and
//! pushed to the firewall daemon; the firewall pushes back the hosts it sees.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                           DORMNET REGISTRY                            │
//! │                                                                       │
//! │  ┌──────────────────────────────────────────────────────────────┐     │
//! │  │                         DIRECTORY                            │     │
//! │  │   Rooms | Tenants | Groups | Devices | AddressPool           │     │
//! │  └───────┬───────────────────────┬────────────────────┬─────────┘     │
//! │          │ translate             │ expirations        │ daily         │
//! │  ┌───────▼─────────┐   ┌─────────▼─────────┐   ┌──────▼──────────┐    │
//! │  │ RulesetSync     │   │ Expiration        │   │ Reshuffle and   │    │
//! │  │ Client          │   │ Scheduler         │   │ retention purge │    │
//! │  └───────┬─────────┘   └───────────────────┘   └─────────────────┘    │
//! │          │ POST /api/firewall/rules        ▲ POST /api/hosts          │
//! └──────────┼─────────────────────────────────┼──────────────────────────┘
//!            ▼                                 │
//!                       FIREWALL DAEMON
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod api;
pub mod client;
pub mod config;
pub mod daily;
pub mod directory;
pub mod model;
pub mod pool;
pub mod scheduler;
pub mod store;
pub mod translator;

use dormnet_common::{CommonError, MacAddress};
use model::{AssignmentId, GroupId, TenantId};
use std::net::Ipv4Addr;
use thiserror::Error;

pub use client::{FirewallLink, HttpTransport, RulesetSyncClient, RulesetTransport};
pub use config::RegistryConfig;
pub use directory::Directory;
pub use pool::AddressPool;
pub use scheduler::ExpirationScheduler;
pub use store::{DirectoryStore, JsonDirectoryStore};

/// Registry error types
#[derive(Debug, Error)]
pub enum RegistryError {
    /// No tenant with this id
    #[error("unknown tenant {0}")]
    TenantNotFound(TenantId),
    /// No room with this number
    #[error("unknown room {0}")]
    RoomNotFound(String),
    /// No group with this id
    #[error("unknown group {0}")]
    GroupNotFound(GroupId),
    /// No room assignment with this id
    #[error("unknown room assignment {0}")]
    AssignmentNotFound(AssignmentId),
    /// Device not registered to the tenant
    #[error("device {0} is not registered to this tenant")]
    DeviceNotFound(MacAddress),
    /// Address not part of the pool
    #[error("address {0} is not in the pool")]
    UnknownAddress(Ipv4Addr),

    /// Room number already exists
    #[error("room {0} already exists")]
    DuplicateRoom(String),
    /// E-mail address already in use
    #[error("e-mail address {0} is already in use")]
    DuplicateEmail(String),
    /// Tenant already holds a room
    #[error("tenant {0} already has a room assignment")]
    TenantAlreadyAssigned(TenantId),
    /// Room is occupied
    #[error("room {0} is already assigned")]
    RoomAlreadyAssigned(String),
    /// Subtenant assignment for a room without a main tenant
    #[error("room {0} has no main tenant")]
    RoomWithoutMainTenant(String),
    /// Subtenant would outlast the main tenant
    #[error("subtenant assignment must expire before the main tenant's")]
    SubTenantExpiresAfterMainTenant,
    /// Main tenant cannot leave while a subtenant lives in the room
    #[error("room {0} still has a subtenant")]
    RoomHasSubTenant(String),
    /// Assignment is already over
    #[error("room assignment {0} has already ended")]
    AssignmentAlreadyEnded(AssignmentId),
    /// Expiration is not in the future
    #[error("lease expiration must be in the future")]
    EarlyLeaseExpiration,
    /// Tenant has no active room assignment
    #[error("tenant {0} has no active room assignment")]
    NoActiveAssignment(TenantId),
    /// MAC address registered to another tenant
    #[error("device {mac} is already registered to tenant {tenant}")]
    MacAlreadyAssigned {
        /// Address in question
        mac: MacAddress,
        /// Current owner
        tenant: TenantId,
    },
    /// Device name blank
    #[error("device name must not be empty")]
    InvalidDeviceName,

    /// No free address left
    #[error("no free address in the pool")]
    PoolExhausted,
    /// Address held by another tenant
    #[error("address {0} is already assigned")]
    AddressAlreadyAssigned(Ipv4Addr),
    /// Tenant already holds an address
    #[error("tenant {0} already holds an address")]
    TenantHasAddress(TenantId),

    /// Tenant may not register devices themselves
    #[error("self-service device registration is disabled for this tenant")]
    SelfRegistrationNotAllowed,
    /// Too many requests
    #[error("rate limit exceeded")]
    RateLimited,

    /// Ruleset delivery or host list fetch failed
    #[error("firewall sync error: {0}")]
    Sync(String),
    /// Directory snapshot could not be read or written
    #[error("persistence error: {0}")]
    Persistence(String),
    /// Invalid configuration
    #[error("config error: {0}")]
    Config(String),
    /// API server failure
    #[error("network error: {0}")]
    Network(String),
    /// Background worker could not be started
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Shared type or codec failure
    #[error(transparent)]
    Common(#[from] CommonError),
}

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;
