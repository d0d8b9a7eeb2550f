//! Firewall rulesets

use crate::{MacAddress, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Enforced policy of one VLAN
///
/// Configures which hosts (by MAC address) may reach the internet from within the
/// VLAN. The firewall performs NAT, `nat_address` is the external address these
/// hosts appear under. Only one ruleset is active per VLAN: activating a ruleset
/// replaces the previous one for the same VLAN.
///
/// Equality is plain structural equality over all fields.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VlanRuleset {
    /// VLAN this ruleset applies to
    pub vlan: VlanId,
    /// May hosts reach the administration network?
    pub access_admin_net: bool,
    /// External NAT address, `None` blocks outbound NAT
    pub nat_address: Option<Ipv4Addr>,
    /// DNS requests of allowed hosts are redirected here; `None` uses the gateway resolver
    pub dns_override: Option<Ipv4Addr>,
    /// Every host in the VLAN is allowed, `allowed_hosts` is ignored
    pub allow_all_hosts: bool,
    /// Hosts allowed internet access
    pub allowed_hosts: BTreeSet<MacAddress>,
}

impl VlanRuleset {
    /// Ruleset that cuts a VLAN off entirely
    pub fn blocked(vlan: VlanId) -> Self {
        Self {
            vlan,
            access_admin_net: false,
            nat_address: None,
            dns_override: None,
            allow_all_hosts: false,
            allowed_hosts: BTreeSet::new(),
        }
    }

    /// True if no host of this VLAN gets internet access
    pub fn is_blocked(&self) -> bool {
        !self.allow_all_hosts && self.allowed_hosts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked() {
        let ruleset = VlanRuleset::blocked(120);
        assert!(ruleset.is_blocked());
        assert_eq!(ruleset.vlan, 120);
        assert!(ruleset.nat_address.is_none());
    }

    #[test]
    fn test_structural_equality() {
        let mut a = VlanRuleset::blocked(120);
        a.allowed_hosts.insert("aa:bb:cc:dd:ee:ff".parse().unwrap());
        let mut b = VlanRuleset::blocked(120);
        b.allowed_hosts.insert("AA-BB-CC-DD-EE-FF".parse().unwrap());
        assert_eq!(a, b);

        b.nat_address = Some(Ipv4Addr::new(203, 0, 113, 7));
        assert_ne!(a, b);
    }
}
