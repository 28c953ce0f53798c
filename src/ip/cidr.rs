//! IPv4 address arithmetic.
//!
//! This file holds the pure functions the allocator and the planner are
//! built on: strict CIDR parsing with an alignment check, integer
//! conversion, network/broadcast computation, and range tests.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Errors raised while parsing or validating addresses
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid CIDR '{input}': {reason}")]
    InvalidCidr { input: String, reason: String },

    #[error("Invalid IPv4 address '{input}'")]
    InvalidAddress { input: String },

    #[error("Invalid prefix length '{input}' (must be 0-32)")]
    InvalidPrefix { input: String },

    #[error("CIDR '{input}' is not aligned to its prefix (network address is {expected})")]
    Misaligned { input: String, expected: String },
}

/// An aligned IPv4 network block.
///
/// The network address always has its host bits cleared; every constructor
/// either checks this or clears them explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CidrBlock {
    network: u32,
    prefix: u8,
}

/// Closed interval of addresses covered by a block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressRange {
    pub first: u32,
    pub last: u32,
}

impl AddressRange {
    pub fn intersects(&self, other: &AddressRange) -> bool {
        self.first <= other.last && other.first <= self.last
    }

    pub fn contains(&self, value: u32) -> bool {
        self.first <= value && value <= self.last
    }
}

impl CidrBlock {
    /// Build a block from an integer network address, rejecting set host bits
    pub fn new(network: u32, prefix: u8) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::InvalidPrefix { input: prefix.to_string() });
        }
        let aligned = network & netmask(prefix);
        if aligned != network {
            return Err(AddressError::Misaligned {
                input: format!("{}/{}", from_int(network), prefix),
                expected: from_int(aligned).to_string(),
            });
        }
        Ok(CidrBlock { network, prefix })
    }

    /// Build a block from any address inside it, clearing the host bits
    pub fn containing(address: Ipv4Addr, prefix: u8) -> Result<Self, AddressError> {
        if prefix > 32 {
            return Err(AddressError::InvalidPrefix { input: prefix.to_string() });
        }
        Ok(CidrBlock { network: to_int(address) & netmask(prefix), prefix })
    }

    /// Lenient parse used for discovered data: accepts a bare host (taken as
    /// /32) and non-aligned input, which is normalized to its network address.
    pub fn normalized(text: &str) -> Result<Self, AddressError> {
        let text = text.trim();
        match text.split_once('/') {
            Some((addr, prefix)) => {
                let address = parse_ipv4(addr)?;
                let prefix = parse_prefix(prefix)?;
                CidrBlock::containing(address, prefix)
            }
            None => CidrBlock::containing(parse_ipv4(text)?, 32),
        }
    }

    pub fn network(&self) -> Ipv4Addr {
        from_int(self.network)
    }

    pub fn network_u32(&self) -> u32 {
        self.network
    }

    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Number of addresses covered, including network and broadcast
    pub fn size(&self) -> u64 {
        1u64 << (32 - u32::from(self.prefix))
    }

    pub fn range(&self) -> AddressRange {
        AddressRange {
            first: to_int(network_address(self)),
            last: to_int(broadcast_address(self)),
        }
    }

    /// True when `other` lies entirely inside this block
    pub fn covers(&self, other: &CidrBlock) -> bool {
        self.prefix <= other.prefix && (other.network & netmask(self.prefix)) == self.network
    }
}

impl fmt::Display for CidrBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network(), self.prefix)
    }
}

impl FromStr for CidrBlock {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_cidr(s)
    }
}

impl Serialize for CidrBlock {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CidrBlock {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        parse_cidr(&text).map_err(serde::de::Error::custom)
    }
}

/// Netmask for a prefix length; prefix 0 yields an all-zero mask
pub fn netmask(prefix: u8) -> u32 {
    u32::MAX.checked_shl(32 - u32::from(prefix.min(32))).unwrap_or(0)
}

/// Parse a dotted quad: exactly four decimal octets in 0-255
pub fn parse_ipv4(text: &str) -> Result<Ipv4Addr, AddressError> {
    let invalid = || AddressError::InvalidAddress { input: text.to_string() };
    let parts: Vec<&str> = text.trim().split('.').collect();
    if parts.len() != 4 {
        return Err(invalid());
    }
    let mut octets = [0u8; 4];
    for (slot, part) in octets.iter_mut().zip(&parts) {
        if part.is_empty() || part.len() > 3 || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        *slot = part.parse::<u8>().map_err(|_| invalid())?;
    }
    Ok(Ipv4Addr::from(octets))
}

fn parse_prefix(text: &str) -> Result<u8, AddressError> {
    let text = text.trim();
    let invalid = || AddressError::InvalidPrefix { input: text.to_string() };
    if text.is_empty() || text.len() > 2 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let prefix = text.parse::<u8>().map_err(|_| invalid())?;
    if prefix > 32 {
        return Err(invalid());
    }
    Ok(prefix)
}

/// Strict `address/prefix` parse. Host bits must be clear.
///
/// # Examples
/// ```
/// use netfabric::ip::cidr::parse_cidr;
///
/// assert!(parse_cidr("192.168.1.0/24").is_ok());
/// assert!(parse_cidr("192.168.1.5/24").is_err());
/// assert!(parse_cidr("192.168.1.0").is_err());
/// ```
pub fn parse_cidr(text: &str) -> Result<CidrBlock, AddressError> {
    let trimmed = text.trim();
    let (addr, prefix) = trimmed.split_once('/').ok_or_else(|| AddressError::InvalidCidr {
        input: trimmed.to_string(),
        reason: "expected address/prefix".to_string(),
    })?;
    let address = parse_ipv4(addr).map_err(|_| AddressError::InvalidCidr {
        input: trimmed.to_string(),
        reason: format!("'{}' is not a dotted-quad address", addr),
    })?;
    let prefix = parse_prefix(prefix).map_err(|_| AddressError::InvalidCidr {
        input: trimmed.to_string(),
        reason: format!("prefix '{}' is not in 0-32", prefix),
    })?;
    let value = to_int(address);
    let aligned = value & netmask(prefix);
    if aligned != value {
        return Err(AddressError::Misaligned {
            input: trimmed.to_string(),
            expected: from_int(aligned).to_string(),
        });
    }
    Ok(CidrBlock { network: value, prefix })
}

pub fn to_int(address: Ipv4Addr) -> u32 {
    u32::from(address)
}

pub fn from_int(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Network address; a /32 is its own network (host route)
pub fn network_address(block: &CidrBlock) -> Ipv4Addr {
    if block.prefix == 32 {
        return from_int(block.network);
    }
    from_int(block.network & netmask(block.prefix))
}

/// Broadcast address; a /32 is its own broadcast (host route)
pub fn broadcast_address(block: &CidrBlock) -> Ipv4Addr {
    if block.prefix == 32 {
        return from_int(block.network);
    }
    from_int(block.network | !netmask(block.prefix))
}

pub fn overlaps(a: &CidrBlock, b: &CidrBlock) -> bool {
    a.range().intersects(&b.range())
}

pub fn contains(block: &CidrBlock, address: Ipv4Addr) -> bool {
    block.range().contains(to_int(address))
}

/// RFC 1918 check
pub fn is_private(address: Ipv4Addr) -> bool {
    const PRIVATE: [(u32, u8); 3] = [
        (0x0A00_0000, 8),  // 10.0.0.0/8
        (0xAC10_0000, 12), // 172.16.0.0/12
        (0xC0A8_0000, 16), // 192.168.0.0/16
    ];
    let value = to_int(address);
    PRIVATE
        .iter()
        .any(|(network, prefix)| value & netmask(*prefix) == *network)
}

/// Usable host addresses (excludes network and broadcast for prefixes below /31)
pub fn host_count(block: &CidrBlock) -> u64 {
    match block.prefix {
        32 => 1,
        31 => 2,
        _ => block.size() - 2,
    }
}

/// The n-th usable host of a block, 1-based
pub fn nth_host(block: &CidrBlock, n: u32) -> Option<Ipv4Addr> {
    if n == 0 || u64::from(n) > host_count(block) {
        return None;
    }
    let offset = if block.prefix >= 31 { n - 1 } else { n };
    Some(from_int(block.network + offset))
}

/// First usable host, conventionally the gateway
pub fn first_host(block: &CidrBlock) -> Option<Ipv4Addr> {
    nth_host(block, 1)
}

/// Convert a dotted netmask (255.255.255.0) into a prefix length
pub fn netmask_to_prefix(mask: &str) -> Result<u8, AddressError> {
    let value = to_int(parse_ipv4(mask)?);
    let prefix = value.leading_ones();
    if value.checked_shl(prefix).unwrap_or(0) != 0 {
        return Err(AddressError::InvalidPrefix { input: mask.to_string() });
    }
    Ok(prefix as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(text: &str) -> CidrBlock {
        parse_cidr(text).unwrap()
    }

    #[test]
    fn test_parse_cidr_alignment() {
        assert_eq!(block("192.168.1.0/24").to_string(), "192.168.1.0/24");
        assert!(matches!(
            parse_cidr("192.168.1.5/24"),
            Err(AddressError::Misaligned { .. })
        ));
        assert!(parse_cidr("0.0.0.0/0").is_ok());
        assert!(parse_cidr("10.1.2.3/32").is_ok());
    }

    #[test]
    fn test_parse_cidr_rejects_malformed() {
        let invalid = [
            "",
            "192.168.1.0",
            "192.168.1/24",
            "192.168.1.0/33",
            "192.168.1.0/-1",
            "256.1.1.0/24",
            "a.b.c.d/24",
            "192.168.1.0/",
            "192.168.1.0/24/1",
            "1.2.3.4.5/32",
        ];
        for text in invalid {
            assert!(parse_cidr(text).is_err(), "{} should be rejected", text);
        }
    }

    #[test]
    fn test_int_conversion_roundtrip() {
        let addr = parse_ipv4("172.16.16.1").unwrap();
        assert_eq!(to_int(addr), 0xAC10_1001);
        assert_eq!(from_int(to_int(addr)), addr);
        assert_eq!(from_int(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(from_int(u32::MAX), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn test_network_and_broadcast() {
        let b = block("10.0.0.0/8");
        assert_eq!(network_address(&b), Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(broadcast_address(&b), Ipv4Addr::new(10, 255, 255, 255));

        let host = block("192.168.5.7/32");
        assert_eq!(network_address(&host), Ipv4Addr::new(192, 168, 5, 7));
        assert_eq!(broadcast_address(&host), Ipv4Addr::new(192, 168, 5, 7));

        let all = block("0.0.0.0/0");
        assert_eq!(broadcast_address(&all), Ipv4Addr::new(255, 255, 255, 255));
    }

    #[test]
    fn test_overlaps_is_symmetric() {
        let blocks = [
            block("10.0.0.0/8"),
            block("10.1.0.0/16"),
            block("10.2.3.4/32"),
            block("192.168.0.0/24"),
            block("192.168.0.128/25"),
            block("192.168.1.0/24"),
        ];
        for a in &blocks {
            for b in &blocks {
                assert_eq!(overlaps(a, b), overlaps(b, a), "{} vs {}", a, b);
            }
        }
        assert!(overlaps(&blocks[0], &blocks[1]));
        assert!(overlaps(&blocks[3], &blocks[4]));
        assert!(!overlaps(&blocks[3], &blocks[5]));
        assert!(!overlaps(&blocks[1], &blocks[2]));
    }

    #[test]
    fn test_contains_and_private() {
        let lan = block("192.168.1.0/24");
        assert!(contains(&lan, Ipv4Addr::new(192, 168, 1, 0)));
        assert!(contains(&lan, Ipv4Addr::new(192, 168, 1, 255)));
        assert!(!contains(&lan, Ipv4Addr::new(192, 168, 2, 0)));

        assert!(is_private(Ipv4Addr::new(10, 200, 0, 1)));
        assert!(is_private(Ipv4Addr::new(172, 31, 255, 255)));
        assert!(!is_private(Ipv4Addr::new(172, 32, 0, 1)));
        assert!(is_private(Ipv4Addr::new(192, 168, 0, 1)));
        assert!(!is_private(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_normalized_clears_host_bits() {
        assert_eq!(CidrBlock::normalized("192.168.1.5/24").unwrap(), block("192.168.1.0/24"));
        assert_eq!(CidrBlock::normalized("10.0.0.9").unwrap(), block("10.0.0.9/32"));
        assert!(CidrBlock::normalized("fe80::1/64").is_err());
    }

    #[test]
    fn test_host_helpers() {
        let b = block("10.10.0.0/24");
        assert_eq!(first_host(&b), Some(Ipv4Addr::new(10, 10, 0, 1)));
        assert_eq!(nth_host(&b, 2), Some(Ipv4Addr::new(10, 10, 0, 2)));
        assert_eq!(nth_host(&b, 254), Some(Ipv4Addr::new(10, 10, 0, 254)));
        assert_eq!(nth_host(&b, 255), None);
        assert_eq!(host_count(&block("10.0.0.0/30")), 2);

        assert_eq!(netmask_to_prefix("255.255.255.0"), Ok(24));
        assert_eq!(netmask_to_prefix("255.255.240.0"), Ok(20));
        assert!(netmask_to_prefix("255.0.255.0").is_err());
    }

    #[test]
    fn test_covers() {
        assert!(block("10.0.0.0/8").covers(&block("10.5.0.0/16")));
        assert!(block("10.0.0.0/8").covers(&block("10.0.0.0/8")));
        assert!(!block("10.5.0.0/16").covers(&block("10.0.0.0/8")));
    }
}
