//! Room and tenant state to firewall ruleset

use crate::model::{Permission, Permissions, Room};
use dormnet_common::{MacAddress, VlanRuleset};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// What the translator needs to know about a room's current occupant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OccupantView {
    /// Login eligibility
    pub can_login: bool,
    /// Own and inherited permissions
    pub permissions: Permissions,
    /// Held NAT address
    pub nat_address: Option<Ipv4Addr>,
    /// Wants the ad-blocking resolver
    pub adblock: bool,
    /// Currently registered devices
    pub devices: BTreeSet<MacAddress>,
}

/// Ruleset for a room. Rooms without a VLAN produce none; an empty room or an
/// occupant who may not log in produces a blocked ruleset.
pub fn translate(room: &Room, occupant: Option<&OccupantView>, adblock_dns: Option<Ipv4Addr>) -> Option<VlanRuleset> {
    let vlan = room.vlan?;
    let occupant = match occupant {
        Some(o) if o.can_login => o,
        _ => return Some(VlanRuleset::blocked(vlan)),
    };
    Some(VlanRuleset {
        vlan,
        access_admin_net: occupant.permissions.contains(Permission::AccessAdminNet),
        nat_address: occupant.nat_address,
        dns_override: if occupant.adblock { adblock_dns } else { None },
        allow_all_hosts: occupant.permissions.contains(Permission::DeviceRegistrationNotNecessary),
        allowed_hosts: occupant.devices.clone(),
    })
}
