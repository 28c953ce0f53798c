//! Discovery of address space already in use.
//!
//! Each source reports CIDR-or-host strings; [`ExistingNetworkSet`]
//! normalizes, deduplicates and collapses them. Sources only read.
//!
//! Known limitation: addresses configured inside a powered-off guest and
//! neighbor entries for hosts that are currently unreachable cannot be
//! seen, so the discovered set is a lower bound, not ground truth.

use log::debug;
use regex::Regex;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use super::cidr::{self, CidrBlock};
use crate::controller::{ControllerClient, GuestInventory, ProviderError, RouteClient};
use crate::utils::command::CommandRunner;

/// Default location of the static interface configuration
pub const INTERFACES_PATH: &str = "/etc/network/interfaces";

/// A read-only probe that reports networks in use
pub trait DiscoverySource {
    fn name(&self) -> &str;

    fn collect(&self) -> Result<Vec<String>, ProviderError>;
}

/// Normalized, collapsed set of discovered networks.
///
/// No entry is a strict subset of another and entries are ordered by
/// numeric network address.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExistingNetworkSet {
    blocks: Vec<CidrBlock>,
}

impl ExistingNetworkSet {
    pub fn from_candidates<I, S>(candidates: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed: Vec<CidrBlock> = Vec::new();
        for candidate in candidates {
            let text = candidate.as_ref();
            match CidrBlock::normalized(text) {
                Ok(block) => parsed.push(block),
                Err(e) => debug!("Ignoring discovered entry '{}': {}", text, e),
            }
        }
        Self::from_blocks(parsed)
    }

    pub fn from_blocks(mut blocks: Vec<CidrBlock>) -> Self {
        // Widest first so supersets are kept before their subsets are seen.
        blocks.sort_by_key(|b| (b.prefix(), b.network_u32()));
        blocks.dedup();

        let mut kept: Vec<CidrBlock> = Vec::with_capacity(blocks.len());
        for block in blocks {
            if !kept.iter().any(|wider| wider.covers(&block)) {
                kept.push(block);
            }
        }
        kept.sort_by_key(|b| (b.network_u32(), b.prefix()));
        ExistingNetworkSet { blocks: kept }
    }

    pub fn blocks(&self) -> &[CidrBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// First discovered network overlapping `block`, if any
    pub fn first_overlap(&self, block: &CidrBlock) -> Option<CidrBlock> {
        self.blocks.iter().copied().find(|used| cidr::overlaps(block, used))
    }
}

/// Parse `/etc/network/interfaces` style `address` declarations.
///
/// Accepts both `address a.b.c.d/len` and `address a.b.c.d` followed by a
/// `netmask` line in the same stanza.
pub fn parse_interfaces_config(content: &str) -> Vec<String> {
    fn flush(pending: &mut Option<String>, found: &mut Vec<String>) {
        if let Some(addr) = pending.take() {
            found.push(addr);
        }
    }

    let mut found = Vec::new();
    let mut pending: Option<String> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("iface"), _) | (Some("auto"), _) => flush(&mut pending, &mut found),
            (Some("address"), Some(value)) => {
                flush(&mut pending, &mut found);
                if value.contains('/') {
                    found.push(value.to_string());
                } else {
                    pending = Some(value.to_string());
                }
            }
            (Some("netmask"), Some(mask)) => {
                if let Some(addr) = pending.take() {
                    match cidr::netmask_to_prefix(mask) {
                        Ok(prefix) => found.push(format!("{}/{}", addr, prefix)),
                        Err(_) => found.push(addr),
                    }
                }
            }
            _ => {}
        }
    }
    flush(&mut pending, &mut found);
    found
}

#[derive(Debug, Deserialize)]
struct LinkAddresses {
    #[serde(default)]
    addr_info: Vec<AddrInfo>,
}

#[derive(Debug, Deserialize)]
struct AddrInfo {
    #[serde(default)]
    family: Option<String>,
    local: String,
    prefixlen: u8,
}

/// Parse `ip -j -4 addr show` output into `address/prefix` strings
pub fn parse_ip_addr_json(json: &str) -> Result<Vec<String>, ProviderError> {
    let links: Vec<LinkAddresses> = serde_json::from_str(json).map_err(|e| ProviderError::Decode {
        what: "interface addresses".to_string(),
        message: e.to_string(),
    })?;
    Ok(links
        .into_iter()
        .flat_map(|link| link.addr_info)
        .filter(|info| info.family.as_deref().map_or(true, |f| f == "inet"))
        .map(|info| format!("{}/{}", info.local, info.prefixlen))
        .collect())
}

#[derive(Debug, Deserialize)]
struct Neighbor {
    dst: String,
    #[serde(default)]
    state: Vec<String>,
}

/// Neighbor states that do not prove a live host
const DISCARDED_NEIGHBOR_STATES: [&str; 3] = ["FAILED", "INCOMPLETE", "STALE"];

/// Parse `ip -j -4 neigh show` output into /32 host routes.
///
/// Only syntactically valid private addresses in a usable state are kept.
pub fn parse_neighbors_json(json: &str) -> Result<Vec<String>, ProviderError> {
    let neighbors: Vec<Neighbor> = serde_json::from_str(json).map_err(|e| ProviderError::Decode {
        what: "neighbor cache".to_string(),
        message: e.to_string(),
    })?;
    Ok(neighbors
        .into_iter()
        .filter(|n| !n.state.iter().any(|s| DISCARDED_NEIGHBOR_STATES.contains(&s.as_str())))
        .filter_map(|n| cidr::parse_ipv4(&n.dst).ok())
        .filter(|addr: &Ipv4Addr| cidr::is_private(*addr))
        .map(|addr| format!("{}/32", addr))
        .collect())
}

static GUEST_OPTION_KEY: OnceLock<Regex> = OnceLock::new();
static IP_ASSIGNMENT: OnceLock<Regex> = OnceLock::new();

/// Extract `ip=` assignments from guest network options.
///
/// `ipconfigN` (cloud-init) and `netN` (container) values are scanned;
/// `dhcp`/`manual` assignments and bare hosts are left for the normalizer.
pub fn parse_guest_ip_assignments<'a, I>(options: I) -> Vec<String>
where
    I: IntoIterator<Item = (&'a String, &'a String)>,
{
    let key_pattern = GUEST_OPTION_KEY
        .get_or_init(|| Regex::new(r"^(ipconfig|net)\d+$").expect("Invalid guest option key regex"));
    let ip_pattern = IP_ASSIGNMENT
        .get_or_init(|| Regex::new(r"(?:^|,)ip=([^,\s]+)").expect("Invalid ip assignment regex"));

    let mut found = Vec::new();
    for (key, value) in options {
        if !key_pattern.is_match(key) {
            continue;
        }
        for capture in ip_pattern.captures_iter(value) {
            let assignment = &capture[1];
            if assignment == "dhcp" || assignment == "manual" {
                continue;
            }
            found.push(assignment.to_string());
        }
    }
    found
}

/// Static interface configuration file
pub struct StaticInterfacesSource {
    path: PathBuf,
}

impl StaticInterfacesSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        StaticInterfacesSource { path: path.as_ref().to_path_buf() }
    }
}

impl DiscoverySource for StaticInterfacesSource {
    fn name(&self) -> &str {
        "static interface config"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| ProviderError::Io {
            path: self.path.display().to_string(),
            message: e.to_string(),
        })?;
        Ok(parse_interfaces_config(&content))
    }
}

/// Subnets defined on the controller
pub struct ControllerSubnetSource<'a> {
    controller: &'a dyn ControllerClient,
}

impl<'a> ControllerSubnetSource<'a> {
    pub fn new(controller: &'a dyn ControllerClient) -> Self {
        ControllerSubnetSource { controller }
    }
}

impl DiscoverySource for ControllerSubnetSource<'_> {
    fn name(&self) -> &str {
        "controller subnets"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        let mut found = Vec::new();
        for vnet in self.controller.list_vnets()? {
            for subnet in self.controller.list_subnets(&vnet.vnet)? {
                found.push(subnet.cidr);
            }
        }
        Ok(found)
    }
}

/// Kernel routing table, default route excluded
pub struct KernelRouteSource<'a> {
    routes: &'a dyn RouteClient,
}

impl<'a> KernelRouteSource<'a> {
    pub fn new(routes: &'a dyn RouteClient) -> Self {
        KernelRouteSource { routes }
    }
}

impl DiscoverySource for KernelRouteSource<'_> {
    fn name(&self) -> &str {
        "kernel routes"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        Ok(self
            .routes
            .list_routes()?
            .into_iter()
            .filter(|route| !route.is_default())
            .map(|route| route.destination)
            .collect())
    }
}

/// Addresses configured on local interfaces
pub struct InterfaceAddressSource<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> InterfaceAddressSource<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        InterfaceAddressSource { runner }
    }
}

impl DiscoverySource for InterfaceAddressSource<'_> {
    fn name(&self) -> &str {
        "interface addresses"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        let output = self.runner.run("ip", &["-j", "-4", "addr", "show"])?;
        parse_ip_addr_json(&output)
    }
}

/// Neighbor/ARP cache
pub struct NeighborCacheSource<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> NeighborCacheSource<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        NeighborCacheSource { runner }
    }
}

impl DiscoverySource for NeighborCacheSource<'_> {
    fn name(&self) -> &str {
        "neighbor cache"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        let output = self.runner.run("ip", &["-j", "-4", "neigh", "show"])?;
        parse_neighbors_json(&output)
    }
}

/// Guest network assignments exposed by the hypervisor
pub struct GuestMetadataSource<'a> {
    inventory: &'a dyn GuestInventory,
}

impl<'a> GuestMetadataSource<'a> {
    pub fn new(inventory: &'a dyn GuestInventory) -> Self {
        GuestMetadataSource { inventory }
    }
}

impl DiscoverySource for GuestMetadataSource<'_> {
    fn name(&self) -> &str {
        "guest metadata"
    }

    fn collect(&self) -> Result<Vec<String>, ProviderError> {
        let mut found = Vec::new();
        for guest in self.inventory.list_guest_configs()? {
            let assignments = parse_guest_ip_assignments(&guest.options);
            debug!("Guest {} reports {} address assignment(s)", guest.vmid, assignments.len());
            found.extend(assignments);
        }
        Ok(found)
    }
}
