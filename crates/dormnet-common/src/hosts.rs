//! Hosts observed on the network

use crate::{MacAddress, VlanId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A device seen in the DHCP lease table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkHost {
    /// Hostname announced by the device
    pub name: String,
    /// Hardware address
    pub mac: MacAddress,
}

impl NetworkHost {
    /// Create new host record
    pub fn new(name: impl Into<String>, mac: MacAddress) -> Self {
        Self { name: name.into(), mac }
    }
}

/// Snapshot of all hosts, grouped by VLAN
///
/// Compared by value: two snapshots holding the same hosts are equal no matter
/// in which order they were built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostList {
    hosts: BTreeMap<VlanId, BTreeSet<NetworkHost>>,
}

impl HostList {
    /// Create empty host list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a host in a VLAN
    pub fn insert(&mut self, vlan: VlanId, host: NetworkHost) {
        self.hosts.entry(vlan).or_default().insert(host);
    }

    /// Builder-style variant of [`HostList::insert`]
    pub fn with_host(mut self, vlan: VlanId, host: NetworkHost) -> Self {
        self.insert(vlan, host);
        self
    }

    /// Hosts of one VLAN (empty if none were seen)
    pub fn vlan_hosts(&self, vlan: VlanId) -> impl Iterator<Item = &NetworkHost> {
        self.hosts.get(&vlan).into_iter().flatten()
    }

    /// VLANs with at least one host
    pub fn vlans(&self) -> impl Iterator<Item = VlanId> + '_ {
        self.hosts.keys().copied()
    }

    /// Iterate over `(vlan, host)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (VlanId, &NetworkHost)> {
        self.hosts
            .iter()
            .flat_map(|(vlan, hosts)| hosts.iter().map(move |host| (*vlan, host)))
    }

    /// Total number of hosts
    pub fn len(&self) -> usize {
        self.hosts.values().map(BTreeSet::len).sum()
    }

    /// True if no host was seen
    pub fn is_empty(&self) -> bool {
        self.hosts.values().all(BTreeSet::is_empty)
    }
}
