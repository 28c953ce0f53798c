//! Network block allocation.
//!
//! This file contains the subdivision algorithms used to carve tenant
//! segments and VPN client pools out of parent blocks, plus the search for
//! unused private blocks given the set of networks already in use.

use log::{debug, info, warn};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use super::cidr::{self, CidrBlock};
use super::discovery::{DiscoverySource, ExistingNetworkSet};

/// Upper bound on candidates examined by a free-block search
pub const MAX_CANDIDATES: usize = 256;

/// Errors that can occur while subdividing or searching address space
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AllocationError {
    #[error("Count {count} is not a power of two")]
    NotPowerOfTwo { count: u32 },

    #[error("Splitting {parent} into {count} blocks needs prefix /{prefix}, which exceeds /32")]
    PrefixOverflow { parent: CidrBlock, count: u32, prefix: u32 },

    #[error("No free /{prefix} block found in the {class} range after {scanned} candidates")]
    Exhausted { prefix: u8, class: AddressClass, scanned: usize },

    #[error("Prefix /{prefix} is not valid inside the {class} range")]
    InvalidPrefix { prefix: u8, class: AddressClass },

    #[error("Unknown private address class '{0}' (expected 10, 172 or 192)")]
    UnknownClass(String),
}

/// RFC 1918 range a search starts from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum AddressClass {
    Ten,
    OneSevenTwo,
    OneNineTwo,
}

impl AddressClass {
    /// The whole private range for the class
    pub fn range(&self) -> CidrBlock {
        let text = match self {
            AddressClass::Ten => "10.0.0.0/8",
            AddressClass::OneSevenTwo => "172.16.0.0/12",
            AddressClass::OneNineTwo => "192.168.0.0/16",
        };
        cidr::parse_cidr(text).expect("Invalid private range literal")
    }
}

impl fmt::Display for AddressClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.range())
    }
}

impl FromStr for AddressClass {
    type Err = AllocationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "10" => Ok(AddressClass::Ten),
            "172" => Ok(AddressClass::OneSevenTwo),
            "192" => Ok(AddressClass::OneNineTwo),
            other => Err(AllocationError::UnknownClass(other.to_string())),
        }
    }
}

/// One block of an allocation plan, with its 1-based position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TaggedBlock {
    pub index: usize,
    pub block: CidrBlock,
}

/// Ordered, contiguous children of a parent block
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AllocationPlan {
    pub role: String,
    pub parent: CidrBlock,
    pub blocks: Vec<TaggedBlock>,
}

impl AllocationPlan {
    /// Re-tag the plan with a role name
    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = role.into();
        self
    }

    /// Look up a child by its 1-based index
    pub fn get(&self, index: usize) -> Option<CidrBlock> {
        self.blocks.iter().find(|tagged| tagged.index == index).map(|tagged| tagged.block)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TaggedBlock> {
        self.blocks.iter()
    }
}

/// Result of splitting a VPN client pool by protocol and then by tenant
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnPoolSplit {
    pub pool: CidrBlock,
    pub protocol_a: CidrBlock,
    pub protocol_b: CidrBlock,
    pub per_tenant_a: AllocationPlan,
    pub per_tenant_b: AllocationPlan,
}

/// Number of extra prefix bits needed for `count` children.
///
/// The count is halved until it reaches 1; only powers of two are accepted
/// so the children cover the parent exactly.
fn subdivision_bits(count: u32) -> Result<u32, AllocationError> {
    if count == 0 || !count.is_power_of_two() {
        return Err(AllocationError::NotPowerOfTwo { count });
    }
    let mut remaining = count;
    let mut bits = 0;
    while remaining > 1 {
        remaining /= 2;
        bits += 1;
    }
    Ok(bits)
}

/// Split `parent` into `count` equal, contiguous children in ascending order
///
/// # Examples
/// ```
/// use netfabric::ip::allocator::subdivide;
///
/// let parent = "172.16.16.0/21".parse().unwrap();
/// let plan = subdivide(parent, 8).unwrap();
/// assert_eq!(plan.get(1).unwrap().to_string(), "172.16.16.0/24");
/// assert_eq!(plan.get(8).unwrap().to_string(), "172.16.23.0/24");
/// ```
pub fn subdivide(parent: CidrBlock, count: u32) -> Result<AllocationPlan, AllocationError> {
    let bits = subdivision_bits(count)?;
    let prefix = u32::from(parent.prefix()) + bits;
    if prefix > 32 {
        return Err(AllocationError::PrefixOverflow { parent, count, prefix });
    }

    let step = 1u64 << (32 - prefix);
    let base = u64::from(parent.network_u32());
    let mut blocks = Vec::with_capacity(count as usize);
    for i in 0..u64::from(count) {
        let network = (base + i * step) as u32;
        let block = CidrBlock::new(network, prefix as u8).map_err(|_| AllocationError::PrefixOverflow {
            parent,
            count,
            prefix,
        })?;
        blocks.push(TaggedBlock { index: i as usize + 1, block });
    }

    debug!("Subdivided {} into {} x /{}", parent, count, prefix);
    Ok(AllocationPlan { role: String::new(), parent, blocks })
}

/// Split a client pool into protocol halves, then each half by tenant count
///
/// The lower half goes to protocol A, the upper half to protocol B.
pub fn split_vpn_pool(pool: CidrBlock, tenant_count: u32) -> Result<VpnPoolSplit, AllocationError> {
    let halves = subdivide(pool, 2)?;
    let (protocol_a, protocol_b) = match (halves.get(1), halves.get(2)) {
        (Some(a), Some(b)) => (a, b),
        _ => unreachable!("subdivide(_, 2) yields two blocks"),
    };
    let per_tenant_a = subdivide(protocol_a, tenant_count)?.with_role("protocol-a");
    let per_tenant_b = subdivide(protocol_b, tenant_count)?.with_role("protocol-b");

    Ok(VpnPoolSplit { pool, protocol_a, protocol_b, per_tenant_a, per_tenant_b })
}

/// Walk same-sized blocks of `class` in ascending order and return the first
/// one that overlaps nothing in `taken`.
pub fn find_free_block(
    prefix: u8,
    class: AddressClass,
    taken: &[CidrBlock],
) -> Result<CidrBlock, AllocationError> {
    let range = class.range();
    if prefix < range.prefix() || prefix > 32 {
        return Err(AllocationError::InvalidPrefix { prefix, class });
    }

    let step = 1u64 << (32 - u32::from(prefix));
    let start = u64::from(range.network_u32());
    let end = start + range.size();
    let mut scanned = 0;

    while scanned < MAX_CANDIDATES {
        let network = start + scanned as u64 * step;
        if network + step > end {
            break;
        }
        scanned += 1;
        let candidate = CidrBlock::new(network as u32, prefix)
            .map_err(|_| AllocationError::InvalidPrefix { prefix, class })?;
        match taken.iter().find(|used| cidr::overlaps(&candidate, used)) {
            Some(used) => debug!("Candidate {} overlaps {}", candidate, used),
            None => return Ok(candidate),
        }
    }

    Err(AllocationError::Exhausted { prefix, class, scanned })
}

/// Search for an unused block against a discovered network set
pub fn find_available_block(
    prefix: u8,
    class: AddressClass,
    existing: &ExistingNetworkSet,
) -> Result<CidrBlock, AllocationError> {
    find_free_block(prefix, class, existing.blocks())
}

/// Propose one free block per (role, prefix) request.
///
/// Each accepted proposal is treated as taken for the requests after it,
/// so the returned blocks never overlap each other.
pub fn propose_blocks(
    requests: &[(String, u8)],
    class: AddressClass,
    existing: &ExistingNetworkSet,
) -> Result<Vec<(String, CidrBlock)>, AllocationError> {
    let mut taken: Vec<CidrBlock> = existing.blocks().to_vec();
    let mut proposals = Vec::with_capacity(requests.len());
    for (role, prefix) in requests {
        let block = find_free_block(*prefix, class, &taken)?;
        info!("Proposed {} for {}", block, role);
        taken.push(block);
        proposals.push((role.clone(), block));
    }
    Ok(proposals)
}

/// Discovery-backed allocator.
///
/// Sources are queried in the order they were added; a failing source
/// contributes nothing.
pub struct NetworkAllocator<'a> {
    sources: Vec<Box<dyn DiscoverySource + 'a>>,
}

impl<'a> NetworkAllocator<'a> {
    pub fn new() -> Self {
        NetworkAllocator { sources: Vec::new() }
    }

    pub fn with_source(mut self, source: impl DiscoverySource + 'a) -> Self {
        self.sources.push(Box::new(source));
        self
    }

    /// Gather networks currently in use. The result is a lower bound.
    pub fn discover_existing_networks(&self) -> ExistingNetworkSet {
        let mut candidates = Vec::new();
        for source in &self.sources {
            match source.collect() {
                Ok(entries) => {
                    debug!("Discovery source '{}' returned {} entries", source.name(), entries.len());
                    candidates.extend(entries);
                }
                Err(e) => {
                    warn!("Discovery source '{}' failed, ignoring it: {}", source.name(), e);
                }
            }
        }
        ExistingNetworkSet::from_candidates(candidates)
    }

    pub fn find_available_block(&self, prefix: u8, class: AddressClass) -> Result<CidrBlock, AllocationError> {
        let existing = self.discover_existing_networks();
        find_available_block(prefix, class, &existing)
    }

    pub fn propose_blocks(
        &self,
        requests: &[(String, u8)],
        class: AddressClass,
    ) -> Result<Vec<(String, CidrBlock)>, AllocationError> {
        let existing = self.discover_existing_networks();
        propose_blocks(requests, class, &existing)
    }
}

impl Default for NetworkAllocator<'_> {
    fn default() -> Self {
        Self::new()
    }
}
