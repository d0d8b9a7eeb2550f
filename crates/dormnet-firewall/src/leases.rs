//! dnsmasq lease table parsing

use crate::FirewallError;
use dormnet_common::{vlan_for_address, HostList, MacAddress, NetworkHost};
use std::path::Path;

/// Parse the whole lease table.
///
/// Each line is `<expiry> <mac> <ipv4> <hostname> ...`. Parsing stops at the first
/// blank line. Any unrecognized line fails the whole read, since a reader may be
/// looking at a half-written file.
pub fn parse_lease_table(content: &str) -> Result<HostList, FirewallError> {
    let mut hosts = HostList::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            break;
        }
        let (vlan, host) = parse_line(line).ok_or_else(|| FirewallError::Lease(line.to_string()))?;
        hosts.insert(vlan, host);
    }
    Ok(hosts)
}

fn parse_line(line: &str) -> Option<(i32, NetworkHost)> {
    let fields: Vec<&str> = line.split(' ').collect();
    let mac: MacAddress = fields.get(1)?.parse().ok()?;
    let vlan = vlan_for_address(fields.get(2)?).ok()?;
    let name = fields.get(3)?;
    Some((vlan, NetworkHost::new(*name, mac)))
}

/// Read and parse the lease file
pub fn read_lease_file(path: &Path) -> Result<HostList, FirewallError> {
    let content = std::fs::read_to_string(path)?;
    parse_lease_table(&content)
}
