//! VLAN classification of leased addresses

use crate::CommonError;
use std::net::Ipv4Addr;

/// VLAN identifier
pub type VlanId = i32;

/// VLAN reported for addresses whose third octet is 0
pub const DEFAULT_VLAN: VlanId = 10;

/// Marker for addresses outside every known subnet
pub const UNKNOWN_VLAN: VlanId = -1;

/// Map an IPv4 address in textual form to the VLAN it was leased in.
///
/// The third octet selects the VLAN: 100..=255 map to themselves, 0 maps to
/// [`DEFAULT_VLAN`], everything else is [`UNKNOWN_VLAN`].
pub fn vlan_for_address(address: &str) -> Result<VlanId, CommonError> {
    let parsed: Ipv4Addr = address
        .parse()
        .map_err(|_| CommonError::InvalidAddress(address.to_string()))?;
    Ok(match parsed.octets()[2] {
        subnet @ 100..=255 => VlanId::from(subnet),
        0 => DEFAULT_VLAN,
        _ => UNKNOWN_VLAN,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vlan_ranges() {
        assert_eq!(vlan_for_address("192.168.105.7").unwrap(), 105);
        assert_eq!(vlan_for_address("10.0.100.1").unwrap(), 100);
        assert_eq!(vlan_for_address("10.0.255.1").unwrap(), 255);
        assert_eq!(vlan_for_address("192.168.0.20").unwrap(), DEFAULT_VLAN);
        assert_eq!(vlan_for_address("192.168.99.20").unwrap(), UNKNOWN_VLAN);
        assert_eq!(vlan_for_address("192.168.1.20").unwrap(), UNKNOWN_VLAN);
    }

    #[test]
    fn test_invalid_address() {
        assert!(vlan_for_address("192.168.105").is_err());
        assert!(vlan_for_address("fe80::1").is_err());
        assert!(vlan_for_address("laptop").is_err());
    }
}
