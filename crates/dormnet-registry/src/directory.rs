//! Tenant directory
//!
//! All rooms, tenants, groups, devices and addresses live behind one lock.
//! Every mutation that changes a room's network access recomputes the room's
//! ruleset and hands it to the firewall link while the lock is still held, so
//! rulesets reach the link in the order the changes were made.
//!
//! Every mutation is saved to the [`DirectoryStore`] before its rulesets are
//! pushed. A directory opened from a store sends nothing until the snapshot is
//! loaded, then refreshes every room in one batch.
//!
//! Lock order: directory, then scheduler, then the sync client's queue.

use crate::client::{BatchGuard, FirewallLink};
use crate::config::{RegistryConfig, RoomSeed};
use crate::model::{
    AssignmentId, Device, Group, GroupId, Permission, Permissions, Room, RoomAssignment, Tenant, TenantId,
};
use crate::pool::AddressPool;
use crate::scheduler::ExpirationScheduler;
use crate::store::{DirectoryStore, JsonDirectoryStore};
use crate::translator::{translate, OccupantView};
use crate::{RegistryError, RegistryResult};
use chrono::{DateTime, Utc};
use dormnet_common::{MacAddress, NetworkHost, RateLimitConfig, RateLimiter, VlanId, VlanRuleset};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::Ipv4Addr;
use std::sync::{Arc, OnceLock, Weak};
use tracing::{debug, error, info, warn};

/// Directory behaviour knobs
#[derive(Debug, Clone)]
pub struct DirectorySettings {
    /// Resolver for tenants with ad blocking enabled
    pub adblock_dns: Option<Ipv4Addr>,
    /// Closed address assignments older than this are purged; kept forever if unset
    pub address_retention: Option<chrono::Duration>,
    /// Device self-registrations per tenant
    pub device_registration_limit: RateLimitConfig,
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            adblock_dns: None,
            address_retention: None,
            device_registration_limit: RateLimitConfig::new(20, 20 * 60),
        }
    }
}

/// Every record of a directory, as saved by a [`DirectoryStore`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectoryState {
    rooms: BTreeMap<String, Room>,
    tenants: BTreeMap<TenantId, Tenant>,
    groups: BTreeMap<GroupId, Group>,
    assignments: BTreeMap<AssignmentId, RoomAssignment>,
    pool: AddressPool,
    last_id: u64,
}

/// `a` expires strictly before `b`; `None` never expires
fn expires_before(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a < b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

impl DirectoryState {
    fn next_id(&mut self) -> u64 {
        self.last_id += 1;
        self.last_id
    }

    fn tenant(&self, id: TenantId) -> RegistryResult<&Tenant> {
        self.tenants.get(&id).ok_or(RegistryError::TenantNotFound(id))
    }

    fn tenant_mut(&mut self, id: TenantId) -> RegistryResult<&mut Tenant> {
        self.tenants.get_mut(&id).ok_or(RegistryError::TenantNotFound(id))
    }

    fn permissions(&self, tenant: &Tenant) -> Permissions {
        tenant
            .groups
            .iter()
            .filter_map(|g| self.groups.get(g))
            .fold(tenant.permissions, |acc, g| acc.union(g.permissions))
    }

    fn can_login(&self, tenant: &Tenant) -> bool {
        !tenant.deactivated
            && (tenant.room_assignment.is_some() || self.permissions(tenant).contains(Permission::LoginWithoutLease))
    }

    /// Subtenant if present, else the main tenant
    fn occupant(&self, room: &Room) -> Option<TenantId> {
        room.sub
            .or(room.main)
            .and_then(|id| self.assignments.get(&id))
            .map(|a| a.tenant)
    }

    fn room_of(&self, tenant: &Tenant) -> Option<&Room> {
        let assignment = self.assignments.get(&tenant.room_assignment?)?;
        self.rooms.get(&assignment.room)
    }

    fn occupant_view(&self, tenant: &Tenant) -> OccupantView {
        OccupantView {
            can_login: self.can_login(tenant),
            permissions: self.permissions(tenant),
            nat_address: self.pool.address_of(tenant.id),
            adblock: tenant.adblock,
            devices: tenant.current_devices().map(|d| d.mac).collect(),
        }
    }

    fn ruleset(&self, room: &Room, adblock_dns: Option<Ipv4Addr>) -> Option<VlanRuleset> {
        let view = self
            .occupant(room)
            .and_then(|id| self.tenants.get(&id))
            .map(|t| self.occupant_view(t));
        translate(room, view.as_ref(), adblock_dns)
    }

    /// Close an assignment and release the tenant's address. Returns the room number.
    fn close_assignment(&mut self, id: AssignmentId, now: DateTime<Utc>) -> RegistryResult<String> {
        let assignment = self
            .assignments
            .get(&id)
            .ok_or(RegistryError::AssignmentNotFound(id))?;
        if !assignment.is_active() {
            return Err(RegistryError::AssignmentAlreadyEnded(id));
        }
        let (tenant_id, room_number, sub_tenant) = (assignment.tenant, assignment.room.clone(), assignment.sub_tenant);

        let room = self
            .rooms
            .get_mut(&room_number)
            .ok_or_else(|| RegistryError::RoomNotFound(room_number.clone()))?;
        if !sub_tenant && room.sub.is_some() {
            return Err(RegistryError::RoomHasSubTenant(room_number));
        }
        if sub_tenant {
            room.sub = None;
        } else {
            room.main = None;
        }

        if let Some(assignment) = self.assignments.get_mut(&id) {
            assignment.end = Some(now);
        }
        if let Some(tenant) = self.tenants.get_mut(&tenant_id) {
            tenant.room_assignment = None;
        }
        if let Some(address) = self.pool.release(tenant_id, now) {
            debug!(tenant = tenant_id, %address, "address released");
        }
        Ok(room_number)
    }
}

/// Authoritative tenant database
pub struct Directory {
    state: Mutex<DirectoryState>,
    scheduler: ExpirationScheduler,
    firewall: Arc<dyn FirewallLink>,
    device_limiter: RateLimiter<TenantId>,
    settings: DirectorySettings,
    store: Option<Arc<dyn DirectoryStore>>,
}

impl Directory {
    /// Empty directory over `pool`, reporting ruleset changes to `firewall`.
    /// Nothing is saved.
    pub fn new(pool: AddressPool, firewall: Arc<dyn FirewallLink>, settings: DirectorySettings) -> RegistryResult<Arc<Self>> {
        let state = DirectoryState {
            pool,
            ..Default::default()
        };
        Self::build(state, firewall, settings, None)
    }

    /// Directory restored from `store`.
    ///
    /// Configured addresses and rooms the snapshot does not know are added,
    /// configured VLANs win over stored ones. Expirations of open assignments
    /// are re-armed and every room's ruleset is sent once as a batch.
    pub fn open(
        configured: &AddressPool,
        rooms: &[RoomSeed],
        firewall: Arc<dyn FirewallLink>,
        settings: DirectorySettings,
        store: Arc<dyn DirectoryStore>,
    ) -> RegistryResult<Arc<Self>> {
        let mut state = store.load()?.unwrap_or_default();
        let added = state.pool.extend_from(configured);
        for seed in rooms {
            state
                .rooms
                .entry(seed.number.clone())
                .or_insert_with(|| Room {
                    number: seed.number.clone(),
                    vlan: None,
                    main: None,
                    sub: None,
                })
                .vlan = seed.vlan;
        }
        info!(
            rooms = state.rooms.len(),
            tenants = state.tenants.len(),
            "directory loaded, {} new pool addresses",
            added
        );

        let directory = Self::build(state, firewall, settings, Some(store))?;
        let armed = directory.schedule_pending_expirations();
        info!("{} lease expirations scheduled", armed);
        {
            let state = directory.state.lock();
            directory.persist(&state);
            directory.push_all(&state);
        }
        Ok(directory)
    }

    fn build(
        state: DirectoryState,
        firewall: Arc<dyn FirewallLink>,
        settings: DirectorySettings,
        store: Option<Arc<dyn DirectoryStore>>,
    ) -> RegistryResult<Arc<Self>> {
        let this: Arc<OnceLock<Weak<Directory>>> = Arc::new(OnceLock::new());
        let scheduler = ExpirationScheduler::spawn({
            let this = this.clone();
            move |id| {
                if let Some(directory) = this.get().and_then(Weak::upgrade) {
                    directory.handle_expiry(id);
                }
            }
        })?;

        let directory = Arc::new(Self {
            state: Mutex::new(state),
            scheduler,
            firewall,
            device_limiter: RateLimiter::from_config(&settings.device_registration_limit)?,
            settings,
            store,
        });
        let _ = this.set(Arc::downgrade(&directory));
        Ok(directory)
    }

    /// Directory saved under `config.state_dir`, with the pool, rooms and
    /// limits from `config`
    pub fn from_config(config: &RegistryConfig, firewall: Arc<dyn FirewallLink>) -> RegistryResult<Arc<Self>> {
        let pool = AddressPool::from_networks(&config.nat_pool)?;
        info!("address pool holds {} addresses", pool.free_addresses().len());
        let settings = DirectorySettings {
            adblock_dns: config.adblock_dns,
            address_retention: config
                .address_retention_days
                .map(|days| chrono::Duration::days(i64::from(days))),
            device_registration_limit: config.device_registration_limit,
        };
        std::fs::create_dir_all(&config.state_dir)?;
        let store = Arc::new(JsonDirectoryStore::new(&config.state_dir)?);
        Self::open(&pool, &config.rooms, firewall, settings, store)
    }

    /// Stop the expiration timer thread
    pub fn halt(&self) {
        self.scheduler.halt();
    }

    /// Copy of every record
    pub fn snapshot(&self) -> DirectoryState {
        self.state.lock().clone()
    }

    /// Number of armed expiration timers
    pub fn scheduled_expirations(&self) -> usize {
        self.scheduler.pending()
    }

    fn persist(&self, state: &DirectoryState) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(state) {
                error!("failed to save directory: {}", e);
            }
        }
    }

    fn push_room(&self, state: &DirectoryState, number: &str) {
        if let Some(ruleset) = state
            .rooms
            .get(number)
            .and_then(|room| state.ruleset(room, self.settings.adblock_dns))
        {
            self.firewall.activate(vec![ruleset]);
        }
    }

    fn push_tenant_room(&self, state: &DirectoryState, tenant: TenantId) {
        if let Some(number) = state
            .tenants
            .get(&tenant)
            .and_then(|t| state.room_of(t))
            .map(|r| r.number.clone())
        {
            self.push_room(state, &number);
        }
    }

    fn push_all(&self, state: &DirectoryState) {
        let _batch = BatchGuard::new(self.firewall.as_ref());
        let rulesets: Vec<VlanRuleset> = state
            .rooms
            .values()
            .filter_map(|room| state.ruleset(room, self.settings.adblock_dns))
            .collect();
        debug!("refreshing {} rulesets", rulesets.len());
        self.firewall.activate(rulesets);
    }

    /* ---------------- rooms ---------------- */

    /// Add a room
    pub fn create_room(&self, number: &str, vlan: Option<VlanId>) -> RegistryResult<()> {
        let mut state = self.state.lock();
        if state.rooms.contains_key(number) {
            return Err(RegistryError::DuplicateRoom(number.to_string()));
        }
        state.rooms.insert(
            number.to_string(),
            Room {
                number: number.to_string(),
                vlan,
                main: None,
                sub: None,
            },
        );
        self.persist(&state);
        self.push_room(&state, number);
        Ok(())
    }

    /// Room by number
    pub fn room(&self, number: &str) -> Option<Room> {
        self.state.lock().rooms.get(number).cloned()
    }

    /// Current occupant of a room
    pub fn occupant(&self, number: &str) -> Option<TenantId> {
        let state = self.state.lock();
        state.rooms.get(number).and_then(|room| state.occupant(room))
    }

    /// Recompute and send one room's ruleset
    pub fn refresh_room_rules(&self, number: &str) -> RegistryResult<()> {
        let state = self.state.lock();
        if !state.rooms.contains_key(number) {
            return Err(RegistryError::RoomNotFound(number.to_string()));
        }
        self.push_room(&state, number);
        Ok(())
    }

    /// Recompute and send every room's ruleset as one batch
    pub fn refresh_all_rules(&self) {
        let state = self.state.lock();
        self.push_all(&state);
    }

    /* ---------------- groups and permissions ---------------- */

    /// Add a group
    pub fn create_group(&self, name: &str, permissions: Permissions) -> GroupId {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.groups.insert(
            id,
            Group {
                id,
                name: name.to_string(),
                permissions,
            },
        );
        self.persist(&state);
        id
    }

    /// Change a group's permissions. Every room is refreshed.
    pub fn set_group_permissions(&self, group: GroupId, permissions: Permissions) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state
            .groups
            .get_mut(&group)
            .ok_or(RegistryError::GroupNotFound(group))?
            .permissions = permissions;
        self.persist(&state);
        self.push_all(&state);
        Ok(())
    }

    /// Add or remove a group membership
    pub fn set_group_membership(&self, tenant: TenantId, group: GroupId, member: bool) -> RegistryResult<()> {
        let mut state = self.state.lock();
        if !state.groups.contains_key(&group) {
            return Err(RegistryError::GroupNotFound(group));
        }
        let groups = &mut state.tenant_mut(tenant)?.groups;
        if member {
            groups.insert(group);
        } else {
            groups.remove(&group);
        }
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Set or clear one of the tenant's own permissions
    pub fn set_permission(&self, tenant: TenantId, permission: Permission, enabled: bool) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.tenant_mut(tenant)?.permissions.set(permission, enabled);
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Own and inherited permissions
    pub fn permissions(&self, tenant: TenantId) -> RegistryResult<Permissions> {
        let state = self.state.lock();
        let t = state.tenant(tenant)?;
        Ok(state.permissions(t))
    }

    /// Login eligibility
    pub fn can_login(&self, tenant: TenantId) -> RegistryResult<bool> {
        let state = self.state.lock();
        let t = state.tenant(tenant)?;
        Ok(state.can_login(t))
    }

    /* ---------------- tenants ---------------- */

    /// Add a tenant
    pub fn create_tenant(&self, name: &str, email: &str) -> RegistryResult<TenantId> {
        let mut state = self.state.lock();
        if state.tenants.values().any(|t| t.email.eq_ignore_ascii_case(email)) {
            return Err(RegistryError::DuplicateEmail(email.to_string()));
        }
        let id = state.next_id();
        state.tenants.insert(
            id,
            Tenant {
                id,
                name: name.to_string(),
                email: email.to_string(),
                deactivated: false,
                adblock: false,
                nat_dynamic: false,
                permissions: Permissions::empty(),
                groups: BTreeSet::new(),
                room_assignment: None,
                devices: Vec::new(),
            },
        );
        self.persist(&state);
        info!(tenant = id, "tenant created");
        Ok(id)
    }

    /// Tenant by id
    pub fn tenant(&self, id: TenantId) -> Option<Tenant> {
        self.state.lock().tenants.get(&id).cloned()
    }

    fn update_tenant(&self, tenant: TenantId, update: impl FnOnce(&mut Tenant)) -> RegistryResult<()> {
        let mut state = self.state.lock();
        update(state.tenant_mut(tenant)?);
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Route the tenant's DNS through the ad-blocking resolver
    pub fn set_adblock(&self, tenant: TenantId, enabled: bool) -> RegistryResult<()> {
        self.update_tenant(tenant, |t| t.adblock = enabled)
    }

    /// Include the tenant in the daily address reshuffle
    pub fn set_nat_dynamic(&self, tenant: TenantId, enabled: bool) -> RegistryResult<()> {
        self.update_tenant(tenant, |t| t.nat_dynamic = enabled)
    }

    /// Block or unblock a tenant
    pub fn set_deactivated(&self, tenant: TenantId, deactivated: bool) -> RegistryResult<()> {
        self.update_tenant(tenant, |t| t.deactivated = deactivated)
    }

    /* ---------------- room assignments ---------------- */

    /// Move a tenant into a room, as main tenant or as subtenant.
    ///
    /// The tenant receives a pool address unless they already hold one. All
    /// checks run before anything changes.
    pub fn assign_room(
        &self,
        tenant: TenantId,
        room: &str,
        expiration: Option<DateTime<Utc>>,
        sub_tenant: bool,
    ) -> RegistryResult<AssignmentId> {
        let now = Utc::now();
        let mut state = self.state.lock();

        if state.tenant(tenant)?.room_assignment.is_some() {
            return Err(RegistryError::TenantAlreadyAssigned(tenant));
        }
        let target = state
            .rooms
            .get(room)
            .ok_or_else(|| RegistryError::RoomNotFound(room.to_string()))?;
        if matches!(expiration, Some(at) if at <= now) {
            return Err(RegistryError::EarlyLeaseExpiration);
        }
        if state.pool.address_of(tenant).is_none() && !state.pool.has_free() {
            return Err(RegistryError::PoolExhausted);
        }
        if target.sub.is_some() || (target.main.is_some() && !sub_tenant) {
            return Err(RegistryError::RoomAlreadyAssigned(room.to_string()));
        }
        if sub_tenant {
            let main = target
                .main
                .and_then(|id| state.assignments.get(&id))
                .ok_or_else(|| RegistryError::RoomWithoutMainTenant(room.to_string()))?;
            if !expires_before(expiration, main.expiration) {
                return Err(RegistryError::SubTenantExpiresAfterMainTenant);
            }
        }

        let id = state.next_id();
        state.assignments.insert(
            id,
            RoomAssignment {
                id,
                tenant,
                room: room.to_string(),
                start: now,
                end: None,
                expiration,
                sub_tenant,
            },
        );
        if let Some(target) = state.rooms.get_mut(room) {
            if sub_tenant {
                target.sub = Some(id);
            } else {
                target.main = Some(id);
            }
        }
        state.tenant_mut(tenant)?.room_assignment = Some(id);
        if state.pool.address_of(tenant).is_none() {
            let address = state.pool.allocate(tenant, now, &mut rand::thread_rng())?;
            debug!(tenant, %address, "address allocated");
        }
        if let Some(at) = expiration {
            self.scheduler.schedule(id, at);
        }

        info!(tenant, room, sub_tenant, "room assigned");
        self.persist(&state);
        self.push_room(&state, room);
        Ok(id)
    }

    /// Room assignment by id
    pub fn assignment(&self, id: AssignmentId) -> Option<RoomAssignment> {
        self.state.lock().assignments.get(&id).cloned()
    }

    /// End an assignment now. A main tenant cannot leave while a subtenant
    /// still lives in the room.
    pub fn end_room_assignment(&self, id: AssignmentId) -> RegistryResult<()> {
        let mut state = self.state.lock();
        let room = state.close_assignment(id, Utc::now())?;
        self.scheduler.cancel(id);
        info!(assignment = id, room = %room, "room assignment ended");
        self.persist(&state);
        self.push_room(&state, &room);
        Ok(())
    }

    /// Change when an assignment expires. `None` removes the expiration.
    pub fn set_lease_expiration(&self, id: AssignmentId, expiration: Option<DateTime<Utc>>) -> RegistryResult<()> {
        let mut state = self.state.lock();
        let assignment = state
            .assignments
            .get(&id)
            .ok_or(RegistryError::AssignmentNotFound(id))?;
        if !assignment.is_active() {
            return Err(RegistryError::AssignmentAlreadyEnded(id));
        }
        if matches!(expiration, Some(at) if at <= Utc::now()) {
            return Err(RegistryError::EarlyLeaseExpiration);
        }

        let room = state
            .rooms
            .get(&assignment.room)
            .ok_or_else(|| RegistryError::RoomNotFound(assignment.room.clone()))?;
        let other = if assignment.sub_tenant { room.main } else { room.sub };
        if let Some(other) = other.and_then(|o| state.assignments.get(&o)) {
            let ordered = if assignment.sub_tenant {
                expires_before(expiration, other.expiration)
            } else {
                expires_before(other.expiration, expiration)
            };
            if !ordered {
                return Err(RegistryError::SubTenantExpiresAfterMainTenant);
            }
        }

        if let Some(assignment) = state.assignments.get_mut(&id) {
            assignment.expiration = expiration;
        }
        self.persist(&state);
        match expiration {
            Some(at) => self.scheduler.schedule(id, at),
            None => {
                self.scheduler.cancel(id);
            }
        }
        Ok(())
    }

    /// Timer callback: end the assignment if it is due, otherwise re-arm
    fn handle_expiry(&self, id: AssignmentId) {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(assignment) = state.assignments.get(&id).filter(|a| a.is_active()) else {
            return;
        };
        let Some(at) = assignment.expiration else {
            return;
        };
        if at > now {
            debug!(assignment = id, "not yet due, rescheduling");
            self.scheduler.schedule(id, at);
            return;
        }

        // A lingering subtenant goes first.
        if !assignment.sub_tenant {
            let sub = state.rooms.get(&assignment.room).and_then(|r| r.sub);
            if let Some(sub) = sub {
                warn!(assignment = sub, "subtenant outlived main tenant, ending it");
                if state.close_assignment(sub, now).is_ok() {
                    self.scheduler.cancel(sub);
                }
            }
        }
        match state.close_assignment(id, now) {
            Ok(room) => {
                info!(assignment = id, room = %room, "room assignment expired");
                self.persist(&state);
                self.push_room(&state, &room);
            }
            Err(e) => {
                warn!(assignment = id, "could not end expired assignment: {}", e);
                self.persist(&state);
            }
        }
    }

    /// Open assignments with an expiration
    pub fn pending_expirations(&self) -> Vec<(AssignmentId, DateTime<Utc>)> {
        self.state
            .lock()
            .assignments
            .values()
            .filter(|a| a.is_active())
            .filter_map(|a| a.expiration.map(|at| (a.id, at)))
            .collect()
    }

    /// Arm a timer for every open assignment with an expiration
    pub fn schedule_pending_expirations(&self) -> usize {
        let pending = self.pending_expirations();
        for (id, at) in &pending {
            self.scheduler.schedule(*id, *at);
        }
        pending.len()
    }

    /* ---------------- devices ---------------- */

    /// Register a device for a tenant. A MAC can belong to one tenant at a time.
    pub fn register_device(&self, tenant: TenantId, name: &str, mac: MacAddress) -> RegistryResult<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(RegistryError::InvalidDeviceName);
        }
        let mut state = self.state.lock();
        state.tenant(tenant)?;
        if let Some(owner) = state.tenants.values().find(|t| t.has_device(&mac)) {
            return Err(RegistryError::MacAlreadyAssigned { mac, tenant: owner.id });
        }
        state.tenant_mut(tenant)?.devices.push(Device {
            mac,
            name: name.to_string(),
            start: Utc::now(),
            end: None,
        });
        info!(tenant, %mac, "device registered");
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Device registration by the tenant themselves, rate limited per tenant
    pub fn self_register_device(&self, tenant: TenantId, name: &str, mac: MacAddress) -> RegistryResult<()> {
        {
            let state = self.state.lock();
            let t = state.tenant(tenant)?;
            if state.permissions(t).contains(Permission::NoSelfServiceDeviceRegistration) {
                return Err(RegistryError::SelfRegistrationNotAllowed);
            }
            if t.room_assignment.is_none() {
                return Err(RegistryError::NoActiveAssignment(tenant));
            }
        }
        if !self.device_limiter.try_acquire(tenant) {
            warn!(tenant, "device registration rate limited");
            return Err(RegistryError::RateLimited);
        }
        self.register_device(tenant, name, mac)
    }

    /// Unregister a device
    pub fn unregister_device(&self, tenant: TenantId, mac: MacAddress) -> RegistryResult<()> {
        let mut state = self.state.lock();
        let device = state
            .tenant_mut(tenant)?
            .devices
            .iter_mut()
            .find(|d| d.mac == mac && d.end.is_none())
            .ok_or(RegistryError::DeviceNotFound(mac))?;
        device.end = Some(Utc::now());
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Tenant that currently owns `mac`
    pub fn tenant_by_mac(&self, mac: MacAddress) -> Option<TenantId> {
        self.state
            .lock()
            .tenants
            .values()
            .find(|t| t.has_device(&mac))
            .map(|t| t.id)
    }

    /// Hosts on the tenant's VLAN that are not registered to them.
    ///
    /// Empty unless the tenant is the room's current occupant; a main tenant
    /// who sublets would otherwise see the subtenant's devices.
    pub fn unregistered_hosts(&self, tenant: TenantId) -> RegistryResult<Vec<NetworkHost>> {
        let state = self.state.lock();
        let t = state.tenant(tenant)?;
        let Some(room) = state.room_of(t) else {
            return Ok(Vec::new());
        };
        let (Some(vlan), Some(occupant)) = (room.vlan, state.occupant(room)) else {
            return Ok(Vec::new());
        };
        if occupant != tenant {
            return Ok(Vec::new());
        }
        let hosts = self.firewall.hosts();
        Ok(hosts
            .vlan_hosts(vlan)
            .filter(|h| !t.has_device(&h.mac))
            .cloned()
            .collect())
    }

    /* ---------------- addresses ---------------- */

    /// Address held by a tenant
    pub fn address_of(&self, tenant: TenantId) -> Option<Ipv4Addr> {
        self.state.lock().pool.address_of(tenant)
    }

    /// Give a tenant a specific address, releasing the one they hold
    pub fn assign_address(&self, tenant: TenantId, address: Ipv4Addr) -> RegistryResult<()> {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.tenant(tenant)?;
        match state.pool.holder_of(address) {
            Some(holder) if holder == tenant => return Ok(()),
            Some(_) => return Err(RegistryError::AddressAlreadyAssigned(address)),
            None => {}
        }
        if !state.pool.free_addresses().contains(&address) {
            return Err(RegistryError::UnknownAddress(address));
        }
        state.pool.release(tenant, now);
        state.pool.assign_specific(tenant, address, now)?;
        self.persist(&state);
        self.push_tenant_room(&state, tenant);
        Ok(())
    }

    /// Add an address to the pool
    pub fn add_address(&self, address: Ipv4Addr) -> bool {
        let mut state = self.state.lock();
        let added = state.pool.add(address);
        if added {
            self.persist(&state);
        }
        added
    }

    /// Withdraw a free address from the pool
    pub fn delete_address(&self, address: Ipv4Addr) -> RegistryResult<()> {
        let mut state = self.state.lock();
        state.pool.delete(address)?;
        self.persist(&state);
        Ok(())
    }

    /// Move every dynamic occupant to a different address. Returns how many moved.
    pub fn reshuffle_dynamic_addresses(&self) -> usize {
        let mut state = self.state.lock();
        let participants: Vec<TenantId> = state
            .rooms
            .values()
            .filter_map(|room| state.occupant(room))
            .filter(|id| state.tenants.get(id).is_some_and(|t| t.nat_dynamic))
            .filter(|id| state.pool.address_of(*id).is_some())
            .collect();
        if participants.is_empty() {
            debug!("no dynamic address holders");
            return 0;
        }

        let moved = match state.pool.reshuffle(&participants, Utc::now(), &mut rand::thread_rng()) {
            Some(moved) => moved,
            None => {
                warn!("not enough addresses to reshuffle {} tenants", participants.len());
                return 0;
            }
        };
        info!("reassigned {} dynamic addresses", moved.len());
        self.persist(&state);
        self.push_all(&state);
        moved.len()
    }

    /// Purge closed address assignments past the retention period
    pub fn purge_address_history(&self) -> usize {
        let Some(retention) = self.settings.address_retention else {
            return 0;
        };
        let mut state = self.state.lock();
        let keep: HashSet<TenantId> = state
            .tenants
            .values()
            .filter(|t| state.permissions(t).contains(Permission::UnlimitedDataRetention))
            .map(|t| t.id)
            .collect();
        let purged = state
            .pool
            .purge_history(Utc::now() - retention, |tenant| keep.contains(&tenant));
        if purged > 0 {
            info!("purged {} expired address assignments", purged);
            self.persist(&state);
        }
        purged
    }

    /// Daily maintenance: address reshuffle, then history purge
    pub fn run_daily_maintenance(&self) {
        self.reshuffle_dynamic_addresses();
        self.purge_address_history();
    }
}
