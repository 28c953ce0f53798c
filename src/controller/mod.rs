//! Collaborators that read and mutate live state.
//!
//! The engine only talks to the controller and the kernel routing table
//! through the traits in this module:
//!
//! - [`ControllerClient`]: SDN zones, vnets and subnets, firewall IP sets,
//!   host firewall rules and the datacenter/host firewall options
//! - [`RouteClient`]: the kernel routing table
//! - [`GuestInventory`]: guest network metadata exposed by the hypervisor
//!
//! `pvesh` and `iproute` hold the subprocess-backed implementations,
//! `memory` an in-process one with failure injection.

pub mod iproute;
pub mod memory;
pub mod pvesh;
pub mod types;

pub use iproute::IpRouteClient;
pub use memory::{MemoryController, MemoryRoutes};
pub use pvesh::PveshController;
pub use types::{
    identity_of, FirewallOptions, FirewallRule, GuestConfig, GuestKind, Identified, IpSet,
    IpSetEntry, ResourceKind, Route, RuleIdentity, Subnet, Vnet, Zone,
};

/// Failures reading from or writing to a collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    #[error("Command `{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("Failed to decode {what}: {message}")]
    Decode { what: String, message: String },

    #[error("Failed to read {path}: {message}")]
    Io { path: String, message: String },

    #[error("{kind} '{identity}' not found")]
    NotFound { kind: String, identity: String },

    #[error("Controller rejected {operation}: {message}")]
    Rejected { operation: String, message: String },
}

/// Read/write access to the SDN and firewall controller.
///
/// Creates are keyed by identity; callers check existence before creating.
pub trait ControllerClient {
    fn list_zones(&self) -> Result<Vec<Zone>, ProviderError>;
    fn list_vnets(&self) -> Result<Vec<Vnet>, ProviderError>;
    fn list_subnets(&self, vnet: &str) -> Result<Vec<Subnet>, ProviderError>;
    fn list_ipsets(&self) -> Result<Vec<IpSet>, ProviderError>;
    fn list_ipset_entries(&self, ipset: &str) -> Result<Vec<IpSetEntry>, ProviderError>;
    fn list_firewall_rules(&self) -> Result<Vec<FirewallRule>, ProviderError>;
    fn get_firewall_options(&self) -> Result<FirewallOptions, ProviderError>;
    fn get_host_firewall_options(&self) -> Result<FirewallOptions, ProviderError>;

    fn create_zone(&self, zone: &Zone) -> Result<(), ProviderError>;
    fn create_vnet(&self, vnet: &Vnet) -> Result<(), ProviderError>;
    fn create_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError>;
    fn create_ipset(&self, ipset: &IpSet) -> Result<(), ProviderError>;
    fn create_ipset_entry(&self, entry: &IpSetEntry) -> Result<(), ProviderError>;
    fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), ProviderError>;

    fn delete_zone(&self, zone: &str) -> Result<(), ProviderError>;
    fn delete_vnet(&self, vnet: &str) -> Result<(), ProviderError>;
    fn delete_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError>;
    fn delete_ipset(&self, name: &str) -> Result<(), ProviderError>;
    fn delete_ipset_entry(&self, ipset: &str, cidr: &str) -> Result<(), ProviderError>;
    fn delete_firewall_rule_at(&self, pos: u32) -> Result<(), ProviderError>;

    /// Overwrite the datacenter-level enable flag
    fn set_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError>;
    /// Overwrite the host-level enable flag
    fn set_host_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError>;

    /// Commit batched SDN creates/deletes
    fn apply_pending_changes(&self) -> Result<(), ProviderError>;
}

/// Kernel routing table access
pub trait RouteClient {
    fn list_routes(&self) -> Result<Vec<Route>, ProviderError>;
    fn add_route(&self, destination: &str, via: Option<&str>, device: Option<&str>) -> Result<(), ProviderError>;
    fn delete_route(&self, destination: &str) -> Result<(), ProviderError>;
}

/// Guest network metadata exposed by the hypervisor management API
pub trait GuestInventory {
    fn list_guest_configs(&self) -> Result<Vec<GuestConfig>, ProviderError>;
}
