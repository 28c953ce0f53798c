//! # Netfabric - Multi-tenant network fabric planning and reconciliation
//!
//! This library plans the address space of an L2-isolated, multi-tenant
//! network fabric and drives an SDN/firewall controller to provision it or
//! to restore the controller to the state it had before provisioning.
//!
//! ## Overview
//!
//! A fabric is described by a flat configuration record: the site LAN and
//! its gateway, the number of tenants, a VPN transit segment, a VPN client
//! pool and the block tenant segments are carved from. From it the library
//! derives a plan, the controller objects that plan implies, and the
//! deletions needed to go back to the captured baseline.
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - `ip`: address arithmetic, discovery of networks in use, pool splitting
//!   and free-block search
//! - `config`: the validated configuration record
//! - `config_loader`: YAML and dotenv configuration files
//! - `plan`: the address plan derived from a record
//! - `controller`: collaborator traits and their `pvesh`, `iproute2` and
//!   in-memory implementations
//! - `reconcile`: baseline capture and restore, desired state and the
//!   idempotent apply pass
//! - `utils`: subprocess execution and validation helpers
//! - `orchestrator`: the flows behind each command
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use netfabric::config_loader;
//! use netfabric::controller::{IpRouteClient, PveshController};
//! use netfabric::reconcile::{FileBaselineStore, ReconciliationEngine};
//! use netfabric::utils::command::SystemRunner;
//! use std::path::Path;
//!
//! let record = config_loader::load_record(Path::new("fabric.env"))?;
//!
//! let runner = SystemRunner;
//! let controller = PveshController::new(&runner, record.node.clone());
//! let routes = IpRouteClient::new(&runner);
//! let store = FileBaselineStore::new("/var/lib/netfabric");
//!
//! let engine = ReconciliationEngine::new(&controller, &routes, &store);
//! let report = engine.restore_to_baseline(&record)?;
//! println!("{}", report);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Configuration Format
//!
//! ```text
//! LAN_CIDR=192.168.1.0/24
//! LAN_GATEWAY=192.168.1.1
//! TENANT_COUNT=8
//! VPN_TRANSIT_CIDR=10.99.0.0/30
//! VPN_POOL_CIDR=192.168.81.0/24
//! TENANT_NETWORK_CIDR=172.16.16.0/21
//! ```

pub mod config;
pub mod config_loader;
pub mod controller;
pub mod ip;
pub mod orchestrator;
pub mod plan;
pub mod reconcile;
pub mod utils;

// Re-export commonly used types
pub use config::{ConfigError, ConfigurationRecord};
pub use ip::cidr::CidrBlock;
pub use plan::{NetworkPlan, PlanError};
pub use reconcile::{ReconciliationEngine, ReconciliationReport};
