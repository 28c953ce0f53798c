//! In-process controller and routing table.
//!
//! These behave like the real collaborators where the engine depends on
//! it: duplicate creates are rejected, parents that still have children
//! cannot be deleted, and rule positions shift after every insert/delete.
//! Reads, creates and individual deletes can be made to fail.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;

use super::types::{
    identity_of, FirewallOptions, FirewallRule, GuestConfig, Identified, IpSet, IpSetEntry,
    ResourceKind, Route, Subnet, Vnet, Zone,
};
use super::{ControllerClient, GuestInventory, ProviderError, RouteClient};

/// Objects held by a [`MemoryController`]
#[derive(Debug, Clone, Default)]
pub struct ControllerState {
    pub zones: Vec<Zone>,
    pub vnets: Vec<Vnet>,
    pub subnets: Vec<Subnet>,
    pub ipsets: Vec<IpSet>,
    pub ipset_entries: Vec<IpSetEntry>,
    pub rules: Vec<FirewallRule>,
    pub firewall_options: FirewallOptions,
    pub host_firewall_options: FirewallOptions,
    pub guests: Vec<GuestConfig>,
    /// Number of successful `apply_pending_changes` calls
    pub applied: usize,
}

#[derive(Debug, Default)]
pub struct MemoryController {
    state: RefCell<ControllerState>,
    failing_reads: RefCell<HashSet<ResourceKind>>,
    failing_creates: RefCell<HashSet<ResourceKind>>,
    failing_deletes: RefCell<HashSet<(ResourceKind, String)>>,
    /// Routing table that loses a vnet's routes when the vnet is deleted
    linked_routes: RefCell<Option<Rc<RefCell<Vec<Route>>>>>,
}

fn unavailable(kind: ResourceKind) -> ProviderError {
    ProviderError::Command {
        command: format!("list {}", kind.collection()),
        message: "controller unavailable".to_string(),
    }
}

fn not_found(kind: ResourceKind, identity: &str) -> ProviderError {
    ProviderError::NotFound { kind: kind.to_string(), identity: identity.to_string() }
}

fn rejected(operation: String, message: &str) -> ProviderError {
    ProviderError::Rejected { operation, message: message.to_string() }
}

fn renumber(rules: &mut [FirewallRule]) {
    for (pos, rule) in rules.iter_mut().enumerate() {
        rule.pos = pos as u32;
    }
}

impl MemoryController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_state(state: ControllerState) -> Self {
        let controller = Self::default();
        *controller.state.borrow_mut() = state;
        controller
    }

    pub fn state(&self) -> Ref<'_, ControllerState> {
        self.state.borrow()
    }

    pub fn state_mut(&self) -> RefMut<'_, ControllerState> {
        self.state.borrow_mut()
    }

    /// Make every read of `kind` fail
    pub fn fail_reads(&self, kind: ResourceKind) {
        self.failing_reads.borrow_mut().insert(kind);
    }

    pub fn restore_reads(&self) {
        self.failing_reads.borrow_mut().clear();
    }

    /// Make every create of `kind` fail
    pub fn fail_creates(&self, kind: ResourceKind) {
        self.failing_creates.borrow_mut().insert(kind);
    }

    /// Make deleting the object with this identity fail
    pub fn fail_delete(&self, kind: ResourceKind, identity: impl Into<String>) {
        self.failing_deletes.borrow_mut().insert((kind, identity.into()));
    }

    /// Deleting a vnet removes its device, and with it every route of
    /// `routes` that uses the vnet as its device
    pub fn link_routes(&self, routes: &MemoryRoutes) {
        *self.linked_routes.borrow_mut() = Some(Rc::clone(&routes.routes));
    }

    fn check_read(&self, kind: ResourceKind) -> Result<(), ProviderError> {
        if self.failing_reads.borrow().contains(&kind) {
            return Err(unavailable(kind));
        }
        Ok(())
    }

    fn check_create(&self, kind: ResourceKind, identity: &str) -> Result<(), ProviderError> {
        if self.failing_creates.borrow().contains(&kind) {
            return Err(rejected(format!("create {} '{}'", kind, identity), "injected failure"));
        }
        Ok(())
    }

    fn check_delete(&self, kind: ResourceKind, identity: &str) -> Result<(), ProviderError> {
        if self.failing_deletes.borrow().contains(&(kind, identity.to_string())) {
            return Err(rejected(format!("delete {} '{}'", kind, identity), "injected failure"));
        }
        Ok(())
    }
}

impl ControllerClient for MemoryController {
    fn list_zones(&self) -> Result<Vec<Zone>, ProviderError> {
        self.check_read(ResourceKind::Zone)?;
        Ok(self.state.borrow().zones.clone())
    }

    fn list_vnets(&self) -> Result<Vec<Vnet>, ProviderError> {
        self.check_read(ResourceKind::Vnet)?;
        Ok(self.state.borrow().vnets.clone())
    }

    fn list_subnets(&self, vnet: &str) -> Result<Vec<Subnet>, ProviderError> {
        self.check_read(ResourceKind::Subnet)?;
        let state = self.state.borrow();
        if !state.vnets.iter().any(|v| v.vnet == vnet) {
            return Err(not_found(ResourceKind::Vnet, vnet));
        }
        Ok(state.subnets.iter().filter(|s| s.vnet == vnet).cloned().collect())
    }

    fn list_ipsets(&self) -> Result<Vec<IpSet>, ProviderError> {
        self.check_read(ResourceKind::IpSet)?;
        Ok(self.state.borrow().ipsets.clone())
    }

    fn list_ipset_entries(&self, ipset: &str) -> Result<Vec<IpSetEntry>, ProviderError> {
        self.check_read(ResourceKind::IpSetEntry)?;
        let state = self.state.borrow();
        if !state.ipsets.iter().any(|s| s.name == ipset) {
            return Err(not_found(ResourceKind::IpSet, ipset));
        }
        Ok(state.ipset_entries.iter().filter(|e| e.ipset == ipset).cloned().collect())
    }

    fn list_firewall_rules(&self) -> Result<Vec<FirewallRule>, ProviderError> {
        self.check_read(ResourceKind::FirewallRule)?;
        Ok(self.state.borrow().rules.clone())
    }

    fn get_firewall_options(&self) -> Result<FirewallOptions, ProviderError> {
        self.check_read(ResourceKind::FirewallOptions)?;
        Ok(self.state.borrow().firewall_options.clone())
    }

    fn get_host_firewall_options(&self) -> Result<FirewallOptions, ProviderError> {
        self.check_read(ResourceKind::HostFirewallOptions)?;
        Ok(self.state.borrow().host_firewall_options.clone())
    }

    fn create_zone(&self, zone: &Zone) -> Result<(), ProviderError> {
        self.check_create(ResourceKind::Zone, &zone.zone)?;
        let mut state = self.state.borrow_mut();
        if state.zones.iter().any(|z| z.zone == zone.zone) {
            return Err(rejected(format!("create zone '{}'", zone.zone), "already exists"));
        }
        state.zones.push(zone.clone());
        Ok(())
    }

    fn create_vnet(&self, vnet: &Vnet) -> Result<(), ProviderError> {
        self.check_create(ResourceKind::Vnet, &vnet.vnet)?;
        let mut state = self.state.borrow_mut();
        if !state.zones.iter().any(|z| z.zone == vnet.zone) {
            return Err(not_found(ResourceKind::Zone, &vnet.zone));
        }
        if state.vnets.iter().any(|v| v.vnet == vnet.vnet) {
            return Err(rejected(format!("create vnet '{}'", vnet.vnet), "already exists"));
        }
        state.vnets.push(vnet.clone());
        Ok(())
    }

    fn create_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError> {
        let identity = subnet.identity();
        self.check_create(ResourceKind::Subnet, &identity)?;
        let mut state = self.state.borrow_mut();
        let zone = match state.vnets.iter().find(|v| v.vnet == subnet.vnet) {
            Some(vnet) => vnet.zone.clone(),
            None => return Err(not_found(ResourceKind::Vnet, &subnet.vnet)),
        };
        if state.subnets.iter().any(|s| s.identity() == identity) {
            return Err(rejected(format!("create subnet '{}'", identity), "already exists"));
        }
        let mut stored = subnet.clone();
        stored.zone = Some(zone);
        stored.id = stored.controller_id();
        state.subnets.push(stored);
        Ok(())
    }

    fn create_ipset(&self, ipset: &IpSet) -> Result<(), ProviderError> {
        self.check_create(ResourceKind::IpSet, &ipset.name)?;
        let mut state = self.state.borrow_mut();
        if state.ipsets.iter().any(|s| s.name == ipset.name) {
            return Err(rejected(format!("create ipset '{}'", ipset.name), "already exists"));
        }
        state.ipsets.push(ipset.clone());
        Ok(())
    }

    fn create_ipset_entry(&self, entry: &IpSetEntry) -> Result<(), ProviderError> {
        let identity = entry.identity();
        self.check_create(ResourceKind::IpSetEntry, &identity)?;
        let mut state = self.state.borrow_mut();
        if !state.ipsets.iter().any(|s| s.name == entry.ipset) {
            return Err(not_found(ResourceKind::IpSet, &entry.ipset));
        }
        if state.ipset_entries.iter().any(|e| e.identity() == identity) {
            return Err(rejected(format!("create ipset entry '{}'", identity), "already exists"));
        }
        state.ipset_entries.push(entry.clone());
        Ok(())
    }

    fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        self.check_create(ResourceKind::FirewallRule, &rule.identity())?;
        let mut state = self.state.borrow_mut();
        // New rules go to the top, like the controller's default.
        state.rules.insert(0, rule.clone());
        renumber(&mut state.rules);
        Ok(())
    }

    fn delete_zone(&self, zone: &str) -> Result<(), ProviderError> {
        self.check_delete(ResourceKind::Zone, zone)?;
        let mut state = self.state.borrow_mut();
        if state.vnets.iter().any(|v| v.zone == zone) {
            return Err(rejected(format!("delete zone '{}'", zone), "zone is in use by a vnet"));
        }
        let before = state.zones.len();
        state.zones.retain(|z| z.zone != zone);
        if state.zones.len() == before {
            return Err(not_found(ResourceKind::Zone, zone));
        }
        Ok(())
    }

    fn delete_vnet(&self, vnet: &str) -> Result<(), ProviderError> {
        self.check_delete(ResourceKind::Vnet, vnet)?;
        let mut state = self.state.borrow_mut();
        if state.subnets.iter().any(|s| s.vnet == vnet) {
            return Err(rejected(format!("delete vnet '{}'", vnet), "vnet still has subnets"));
        }
        let before = state.vnets.len();
        state.vnets.retain(|v| v.vnet != vnet);
        if state.vnets.len() == before {
            return Err(not_found(ResourceKind::Vnet, vnet));
        }
        if let Some(routes) = self.linked_routes.borrow().as_ref() {
            routes.borrow_mut().retain(|r| r.device.as_deref() != Some(vnet));
        }
        Ok(())
    }

    fn delete_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError> {
        let identity = subnet.identity();
        self.check_delete(ResourceKind::Subnet, &identity)?;
        let mut state = self.state.borrow_mut();
        let before = state.subnets.len();
        state.subnets.retain(|s| s.identity() != identity);
        if state.subnets.len() == before {
            return Err(not_found(ResourceKind::Subnet, &identity));
        }
        Ok(())
    }

    fn delete_ipset(&self, name: &str) -> Result<(), ProviderError> {
        self.check_delete(ResourceKind::IpSet, name)?;
        let mut state = self.state.borrow_mut();
        if state.ipset_entries.iter().any(|e| e.ipset == name) {
            return Err(rejected(format!("delete ipset '{}'", name), "ipset is not empty"));
        }
        let before = state.ipsets.len();
        state.ipsets.retain(|s| s.name != name);
        if state.ipsets.len() == before {
            return Err(not_found(ResourceKind::IpSet, name));
        }
        Ok(())
    }

    fn delete_ipset_entry(&self, ipset: &str, cidr: &str) -> Result<(), ProviderError> {
        let probe = IpSetEntry {
            ipset: ipset.to_string(),
            cidr: cidr.to_string(),
            comment: None,
            extra: Default::default(),
        };
        let identity = probe.identity();
        self.check_delete(ResourceKind::IpSetEntry, &identity)?;
        let mut state = self.state.borrow_mut();
        let before = state.ipset_entries.len();
        state.ipset_entries.retain(|e| e.identity() != identity);
        if state.ipset_entries.len() == before {
            return Err(not_found(ResourceKind::IpSetEntry, &identity));
        }
        Ok(())
    }

    fn delete_firewall_rule_at(&self, pos: u32) -> Result<(), ProviderError> {
        let mut state = self.state.borrow_mut();
        let index = state
            .rules
            .iter()
            .position(|r| r.pos == pos)
            .ok_or_else(|| not_found(ResourceKind::FirewallRule, &pos.to_string()))?;
        let identity = identity_of(&state.rules[index]).to_string();
        self.check_delete(ResourceKind::FirewallRule, &identity)?;
        state.rules.remove(index);
        renumber(&mut state.rules);
        Ok(())
    }

    fn set_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError> {
        self.state.borrow_mut().firewall_options.enable = options.enable;
        Ok(())
    }

    fn set_host_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError> {
        self.state.borrow_mut().host_firewall_options.enable = options.enable;
        Ok(())
    }

    fn apply_pending_changes(&self) -> Result<(), ProviderError> {
        self.state.borrow_mut().applied += 1;
        Ok(())
    }
}

impl GuestInventory for MemoryController {
    fn list_guest_configs(&self) -> Result<Vec<GuestConfig>, ProviderError> {
        Ok(self.state.borrow().guests.clone())
    }
}

/// In-process kernel routing table
#[derive(Debug, Default)]
pub struct MemoryRoutes {
    routes: Rc<RefCell<Vec<Route>>>,
    failing_reads: RefCell<bool>,
    failing_deletes: RefCell<HashSet<String>>,
}

impl MemoryRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_routes(routes: Vec<Route>) -> Self {
        let table = Self::default();
        *table.routes.borrow_mut() = routes;
        table
    }

    pub fn routes(&self) -> Vec<Route> {
        self.routes.borrow().clone()
    }

    pub fn fail_reads(&self, failing: bool) {
        *self.failing_reads.borrow_mut() = failing;
    }

    pub fn fail_delete(&self, destination: &str) {
        self.failing_deletes.borrow_mut().insert(destination.to_string());
    }
}

impl RouteClient for MemoryRoutes {
    fn list_routes(&self) -> Result<Vec<Route>, ProviderError> {
        if *self.failing_reads.borrow() {
            return Err(unavailable(ResourceKind::Route));
        }
        Ok(self.routes.borrow().clone())
    }

    fn add_route(&self, destination: &str, via: Option<&str>, device: Option<&str>) -> Result<(), ProviderError> {
        let route = Route::new(destination, via.map(str::to_string), device.map(str::to_string));
        let mut routes = self.routes.borrow_mut();
        if routes.iter().any(|r| r.identity() == route.identity()) {
            return Err(rejected(format!("add route {}", destination), "File exists"));
        }
        routes.push(route);
        Ok(())
    }

    fn delete_route(&self, destination: &str) -> Result<(), ProviderError> {
        if self.failing_deletes.borrow().contains(destination) {
            return Err(rejected(format!("delete route {}", destination), "injected failure"));
        }
        let probe = Route::new(destination, None, None).identity();
        let mut routes = self.routes.borrow_mut();
        let before = routes.len();
        routes.retain(|r| r.identity() != probe);
        if routes.len() == before {
            return Err(not_found(ResourceKind::Route, destination));
        }
        Ok(())
    }
}
