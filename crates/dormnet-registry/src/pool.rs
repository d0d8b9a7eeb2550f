//! NAT address pool
//!
//! Every tenant with a room holds one external address. Addresses are handed
//! out at random, and the daily reshuffle moves every dynamic tenant to a
//! different address so an address does not identify a tenant for long.

use crate::model::{AddressAssignment, TenantId};
use crate::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use tracing::{debug, info};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Slot {
    deleted: bool,
    holder: Option<TenantId>,
}

/// Finite set of routable addresses and their assignment history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AddressPool {
    slots: BTreeMap<Ipv4Addr, Slot>,
    held: HashMap<TenantId, Ipv4Addr>,
    history: Vec<AddressAssignment>,
}

impl AddressPool {
    /// Empty pool
    pub fn new() -> Self {
        Self::default()
    }

    /// Pool of every address in the given CIDR blocks or single addresses
    pub fn from_networks<S: AsRef<str>>(networks: &[S]) -> RegistryResult<Self> {
        let mut pool = Self::new();
        for network in networks {
            let network: Ipv4Network = network
                .as_ref()
                .parse()
                .map_err(|e| RegistryError::Config(format!("invalid pool network {}: {e}", network.as_ref())))?;
            for address in network.iter() {
                pool.add(address);
            }
        }
        Ok(pool)
    }

    /// Add an address, or revive a deleted one. Returns false if it was already usable.
    pub fn add(&mut self, address: Ipv4Addr) -> bool {
        let slot = self.slots.entry(address).or_insert_with(|| Slot {
            deleted: true,
            holder: None,
        });
        std::mem::replace(&mut slot.deleted, false)
    }

    /// Add every usable address of `configured` that this pool has never seen.
    /// Addresses deleted here stay deleted. Returns how many were added.
    pub fn extend_from(&mut self, configured: &AddressPool) -> usize {
        let mut added = 0;
        for (address, slot) in &configured.slots {
            if !slot.deleted && !self.slots.contains_key(address) {
                self.slots.insert(*address, Slot::default());
                added += 1;
            }
        }
        added
    }

    /// Withdraw an address from future allocation
    pub fn delete(&mut self, address: Ipv4Addr) -> RegistryResult<()> {
        let slot = self
            .slots
            .get_mut(&address)
            .ok_or(RegistryError::UnknownAddress(address))?;
        if slot.holder.is_some() {
            return Err(RegistryError::AddressAlreadyAssigned(address));
        }
        slot.deleted = true;
        Ok(())
    }

    /// Unassigned, non-deleted addresses in ascending order
    pub fn free_addresses(&self) -> Vec<Ipv4Addr> {
        self.slots
            .iter()
            .filter(|(_, slot)| !slot.deleted && slot.holder.is_none())
            .map(|(address, _)| *address)
            .collect()
    }

    /// True if at least one address can be allocated
    pub fn has_free(&self) -> bool {
        self.slots.values().any(|slot| !slot.deleted && slot.holder.is_none())
    }

    /// Address held by `tenant`
    pub fn address_of(&self, tenant: TenantId) -> Option<Ipv4Addr> {
        self.held.get(&tenant).copied()
    }

    /// Tenant holding `address`
    pub fn holder_of(&self, address: Ipv4Addr) -> Option<TenantId> {
        self.slots.get(&address).and_then(|slot| slot.holder)
    }

    /// Give `tenant` a uniformly chosen free address
    pub fn allocate<R: Rng + ?Sized>(&mut self, tenant: TenantId, now: DateTime<Utc>, rng: &mut R) -> RegistryResult<Ipv4Addr> {
        if self.held.contains_key(&tenant) {
            return Err(RegistryError::TenantHasAddress(tenant));
        }
        let address = *self.free_addresses().choose(rng).ok_or(RegistryError::PoolExhausted)?;
        self.bind(tenant, address, now);
        Ok(address)
    }

    /// Give `tenant` a specific free address
    pub fn assign_specific(&mut self, tenant: TenantId, address: Ipv4Addr, now: DateTime<Utc>) -> RegistryResult<()> {
        if self.held.contains_key(&tenant) {
            return Err(RegistryError::TenantHasAddress(tenant));
        }
        let slot = self.slots.get(&address).ok_or(RegistryError::UnknownAddress(address))?;
        if slot.deleted {
            return Err(RegistryError::UnknownAddress(address));
        }
        if slot.holder.is_some() {
            return Err(RegistryError::AddressAlreadyAssigned(address));
        }
        self.bind(tenant, address, now);
        Ok(())
    }

    /// Free the tenant's address. No-op if the tenant holds none.
    pub fn release(&mut self, tenant: TenantId, now: DateTime<Utc>) -> Option<Ipv4Addr> {
        let address = self.held.remove(&tenant)?;
        if let Some(slot) = self.slots.get_mut(&address) {
            slot.holder = None;
        }
        if let Some(record) = self
            .history
            .iter_mut()
            .rev()
            .find(|r| r.tenant == tenant && r.address == address && r.end.is_none())
        {
            record.end = Some(now);
        }
        Some(address)
    }

    fn bind(&mut self, tenant: TenantId, address: Ipv4Addr, now: DateTime<Utc>) {
        if let Some(slot) = self.slots.get_mut(&address) {
            slot.holder = Some(tenant);
        }
        self.held.insert(tenant, address);
        self.history.push(AddressAssignment {
            tenant,
            address,
            start: now,
            end: None,
        });
    }

    /// Move every participant to a different address.
    ///
    /// Candidates are the participants' own addresses plus every free address.
    /// The candidate list is shuffled until no participant would keep their
    /// address, then assigned positionally. Participants without an address are
    /// ignored. Returns the new address per participant, or `None` if fewer than
    /// two candidates exist and no permutation can move anyone.
    pub fn reshuffle<R: Rng + ?Sized>(
        &mut self,
        participants: &[TenantId],
        now: DateTime<Utc>,
        rng: &mut R,
    ) -> Option<Vec<(TenantId, Ipv4Addr)>> {
        let holders: Vec<(TenantId, Ipv4Addr)> = participants
            .iter()
            .filter_map(|t| self.address_of(*t).map(|a| (*t, a)))
            .collect();
        if holders.is_empty() {
            debug!("no dynamic address holders, nothing to reshuffle");
            return Some(Vec::new());
        }

        let mut candidates: Vec<Ipv4Addr> = holders.iter().map(|(_, a)| *a).collect();
        candidates.extend(self.free_addresses());
        if candidates.len() < 2 {
            info!("only {} candidate address, skipping reshuffle", candidates.len());
            return None;
        }

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            candidates.shuffle(rng);
            if holders.iter().zip(&candidates).all(|((_, old), new)| old != new) {
                break;
            }
        }
        debug!(attempts, "found derangement for {} tenants", holders.len());

        for (tenant, _) in &holders {
            self.release(*tenant, now);
        }
        let moved: Vec<(TenantId, Ipv4Addr)> = holders
            .iter()
            .zip(&candidates)
            .map(|((tenant, _), new)| (*tenant, *new))
            .collect();
        for (tenant, address) in &moved {
            self.bind(*tenant, *address, now);
        }
        Some(moved)
    }

    /// Drop closed assignments that ended before `cutoff`, except for tenants
    /// for which `keep` returns true. Returns the number of dropped records.
    pub fn purge_history(&mut self, cutoff: DateTime<Utc>, keep: impl Fn(TenantId) -> bool) -> usize {
        let before = self.history.len();
        self.history
            .retain(|r| !matches!(r.end, Some(end) if end < cutoff) || keep(r.tenant));
        before - self.history.len()
    }

    /// Current and past assignments, oldest first
    pub fn history(&self) -> &[AddressAssignment] {
        &self.history
    }
}
