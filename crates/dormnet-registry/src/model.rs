//! Tenant directory records

use chrono::{DateTime, Utc};
use dormnet_common::{MacAddress, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Tenant identifier
pub type TenantId = u64;
/// Group identifier
pub type GroupId = u64;
/// Room assignment identifier, also the expiration timer key
pub type AssignmentId = u64;

/// Permission bits. The discriminant is the bit index and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum Permission {
    /// Full administrative access
    Admin = 0,
    /// May send mail to residents
    Mail = 1,
    /// May log in without an active room assignment
    LoginWithoutLease = 2,
    /// Treasury access
    Treasury = 3,
    /// Devices may reach the administration network
    AccessAdminNet = 4,
    /// Every host in the room's VLAN is allowed
    DeviceRegistrationNotNecessary = 5,
    /// Key management
    KeyManagement = 6,
    /// Address history is never purged
    UnlimitedDataRetention = 7,
    /// Devices can only be registered by an administrator
    NoSelfServiceDeviceRegistration = 11,
}

impl Permission {
    /// Bit mask of this permission
    pub const fn mask(self) -> u64 {
        1 << self as u8
    }
}

/// Set of permissions as a bit mask
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permissions(u64);

impl Permissions {
    /// No permissions
    pub const fn empty() -> Self {
        Self(0)
    }

    /// From a raw mask
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// Raw mask
    pub const fn bits(self) -> u64 {
        self.0
    }

    /// True if `permission` is set
    pub const fn contains(self, permission: Permission) -> bool {
        self.0 & permission.mask() != 0
    }

    /// Set or clear one permission
    pub fn set(&mut self, permission: Permission, enabled: bool) {
        if enabled {
            self.0 |= permission.mask();
        } else {
            self.0 &= !permission.mask();
        }
    }

    /// Union of both sets
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl FromIterator<Permission> for Permissions {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        let mut permissions = Self::empty();
        for permission in iter {
            permissions.set(permission, true);
        }
        permissions
    }
}

/// Group of tenants sharing permissions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    /// Identifier
    pub id: GroupId,
    /// Display name
    pub name: String,
    /// Granted to every member
    pub permissions: Permissions,
}

/// A room and its current occupants
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    /// Unique room number
    pub number: String,
    /// VLAN of the room's network port, rooms without one get no ruleset
    pub vlan: Option<VlanId>,
    /// Active main tenant assignment
    pub main: Option<AssignmentId>,
    /// Active subtenant assignment
    pub sub: Option<AssignmentId>,
}

/// Occupation of a room by a tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomAssignment {
    /// Identifier
    pub id: AssignmentId,
    /// Occupant
    pub tenant: TenantId,
    /// Room number
    pub room: String,
    /// Move-in time
    pub start: DateTime<Utc>,
    /// Set once the assignment has ended
    pub end: Option<DateTime<Utc>>,
    /// Scheduled end, `None` never expires
    pub expiration: Option<DateTime<Utc>>,
    /// Sublet of a room that keeps its main tenant
    pub sub_tenant: bool,
}

impl RoomAssignment {
    /// Still in effect
    pub fn is_active(&self) -> bool {
        self.end.is_none()
    }
}

/// Registered network device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Hardware address
    pub mac: MacAddress,
    /// Name given by the owner
    pub name: String,
    /// Registration time
    pub start: DateTime<Utc>,
    /// Set once unregistered
    pub end: Option<DateTime<Utc>>,
}

/// A resident
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    /// Identifier
    pub id: TenantId,
    /// Full name
    pub name: String,
    /// Unique e-mail address
    pub email: String,
    /// Blocked from logging in and from network access
    pub deactivated: bool,
    /// DNS requests go to the ad-blocking resolver
    pub adblock: bool,
    /// Takes part in the daily address reshuffle
    pub nat_dynamic: bool,
    /// Own permissions, group permissions come on top
    pub permissions: Permissions,
    /// Group memberships
    pub groups: BTreeSet<GroupId>,
    /// Active room assignment
    pub room_assignment: Option<AssignmentId>,
    /// Current and past devices
    pub devices: Vec<Device>,
}

impl Tenant {
    /// Devices that are still registered
    pub fn current_devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.iter().filter(|d| d.end.is_none())
    }

    /// True if `mac` is currently registered to this tenant
    pub fn has_device(&self, mac: &MacAddress) -> bool {
        self.current_devices().any(|d| d.mac == *mac)
    }
}

/// Holding of a pool address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressAssignment {
    /// Holder
    pub tenant: TenantId,
    /// Address held
    pub address: Ipv4Addr,
    /// Assignment time
    pub start: DateTime<Utc>,
    /// Release time
    pub end: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permission_bits_are_stable() {
        assert_eq!(Permission::Admin.mask(), 1);
        assert_eq!(Permission::AccessAdminNet.mask(), 1 << 4);
        assert_eq!(Permission::UnlimitedDataRetention.mask(), 1 << 7);
        assert_eq!(Permission::NoSelfServiceDeviceRegistration.mask(), 1 << 11);
    }

    #[test]
    fn test_permission_set() {
        let mut permissions: Permissions = [Permission::Mail, Permission::Treasury].into_iter().collect();
        assert!(permissions.contains(Permission::Mail));
        assert!(!permissions.contains(Permission::Admin));
        permissions.set(Permission::Mail, false);
        assert_eq!(permissions.bits(), Permission::Treasury.mask());

        let inherited = Permissions::from_bits(Permission::Admin.mask());
        assert!(permissions.union(inherited).contains(Permission::Admin));
    }

    #[test]
    fn test_current_devices() {
        let mac: MacAddress = "02:00:00:00:00:01".parse().unwrap();
        let mut tenant = Tenant {
            id: 1,
            name: "A".into(),
            email: "a@example.org".into(),
            deactivated: false,
            adblock: false,
            nat_dynamic: false,
            permissions: Permissions::empty(),
            groups: BTreeSet::new(),
            room_assignment: None,
            devices: vec![Device {
                mac,
                name: "laptop".into(),
                start: Utc::now(),
                end: None,
            }],
        };
        assert!(tenant.has_device(&mac));
        tenant.devices[0].end = Some(Utc::now());
        assert!(!tenant.has_device(&mac));
        assert_eq!(tenant.current_devices().count(), 0);
    }
}
