//! Configuration record for the network fabric.
//!
//! A record is built once from a flat key/value map and then passed by
//! reference into planning and reconciliation. Values are validated at
//! construction; keys the fabric does not know are kept as passthrough.

use serde::Serialize;
use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use crate::ip::cidr::{self, AddressError, CidrBlock};
use crate::utils::validation::{validate_sdn_id, validate_tenant_count, MAX_SDN_ID_LEN};

pub const LAN_CIDR: &str = "LAN_CIDR";
pub const LAN_GATEWAY: &str = "LAN_GATEWAY";
pub const TENANT_COUNT: &str = "TENANT_COUNT";
pub const VPN_TRANSIT_CIDR: &str = "VPN_TRANSIT_CIDR";
pub const VPN_TRANSIT_HOST: &str = "VPN_TRANSIT_HOST";
pub const VPN_POOL_CIDR: &str = "VPN_POOL_CIDR";
pub const TENANT_NETWORK_CIDR: &str = "TENANT_NETWORK_CIDR";
pub const SDN_ZONE: &str = "SDN_ZONE";
pub const TENANT_VNET_PREFIX: &str = "TENANT_VNET_PREFIX";
pub const TRANSIT_VNET: &str = "TRANSIT_VNET";
pub const NODE: &str = "NODE";

const KNOWN_KEYS: [&str; 11] = [
    LAN_CIDR,
    LAN_GATEWAY,
    TENANT_COUNT,
    VPN_TRANSIT_CIDR,
    VPN_TRANSIT_HOST,
    VPN_POOL_CIDR,
    TENANT_NETWORK_CIDR,
    SDN_ZONE,
    TENANT_VNET_PREFIX,
    TRANSIT_VNET,
    NODE,
];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration key {key}")]
    MissingKey { key: String },

    #[error("Invalid value '{value}' for {key}: {reason}")]
    InvalidValue { key: String, value: String, reason: String },

    #[error("Invalid address in {key}: {source}")]
    Address {
        key: String,
        #[source]
        source: AddressError,
    },

    #[error("Failed to read configuration file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration file {path:?}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Finished, validated configuration of one fabric
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConfigurationRecord {
    pub lan: CidrBlock,
    pub lan_gateway: Ipv4Addr,
    pub tenant_count: u32,
    pub vpn_transit: CidrBlock,
    /// Address of the VPN endpoint on the transit segment
    pub vpn_transit_host: Ipv4Addr,
    pub vpn_pool: CidrBlock,
    pub tenant_network: CidrBlock,
    pub sdn_zone: String,
    pub tenant_vnet_prefix: String,
    pub transit_vnet: String,
    pub node: String,
    /// Keys not interpreted by the fabric, kept verbatim
    pub passthrough: BTreeMap<String, String>,
}

fn required<'a>(values: &'a BTreeMap<String, String>, key: &str) -> Result<&'a str, ConfigError> {
    values
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ConfigError::MissingKey { key: key.to_string() })
}

fn optional<'a>(values: &'a BTreeMap<String, String>, key: &str, default: &'a str) -> &'a str {
    values
        .get(key)
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn block(values: &BTreeMap<String, String>, key: &str) -> Result<CidrBlock, ConfigError> {
    cidr::parse_cidr(required(values, key)?)
        .map_err(|source| ConfigError::Address { key: key.to_string(), source })
}

fn address(key: &str, text: &str) -> Result<Ipv4Addr, ConfigError> {
    cidr::parse_ipv4(text).map_err(|source| ConfigError::Address { key: key.to_string(), source })
}

fn invalid(key: &str, value: impl ToString, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue { key: key.to_string(), value: value.to_string(), reason: reason.into() }
}

/// A host address must fall inside the block and not be its network or
/// broadcast address
fn check_host_in(key: &str, host: Ipv4Addr, block: &CidrBlock, role: &str) -> Result<(), ConfigError> {
    if !cidr::contains(block, host) {
        return Err(invalid(key, host, format!("must be inside the {} {}", role, block)));
    }
    if block.prefix() < 31
        && (host == cidr::network_address(block) || host == cidr::broadcast_address(block))
    {
        return Err(invalid(key, host, format!("must be a usable host of the {} {}", role, block)));
    }
    Ok(())
}

impl ConfigurationRecord {
    /// Build and validate a record from a flat key/value map
    pub fn from_map(values: BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let lan = block(&values, LAN_CIDR)?;
        let lan_gateway = address(LAN_GATEWAY, required(&values, LAN_GATEWAY)?)?;
        check_host_in(LAN_GATEWAY, lan_gateway, &lan, "site LAN")?;

        let count_text = required(&values, TENANT_COUNT)?;
        let tenant_count: u32 = count_text
            .parse()
            .map_err(|_| invalid(TENANT_COUNT, count_text, "must be a positive integer"))?;
        validate_tenant_count(tenant_count).map_err(|reason| invalid(TENANT_COUNT, count_text, reason))?;

        let vpn_transit = block(&values, VPN_TRANSIT_CIDR)?;
        let vpn_transit_host = match values.get(VPN_TRANSIT_HOST).map(|v| v.trim()).filter(|v| !v.is_empty()) {
            Some(text) => address(VPN_TRANSIT_HOST, text)?,
            None => cidr::nth_host(&vpn_transit, 2).ok_or_else(|| {
                invalid(VPN_TRANSIT_CIDR, vpn_transit, "needs at least two usable hosts")
            })?,
        };
        check_host_in(VPN_TRANSIT_HOST, vpn_transit_host, &vpn_transit, "VPN transit block")?;

        let vpn_pool = block(&values, VPN_POOL_CIDR)?;
        let tenant_network = block(&values, TENANT_NETWORK_CIDR)?;

        let sdn_zone = optional(&values, SDN_ZONE, "fabric").to_string();
        validate_sdn_id(&sdn_zone, MAX_SDN_ID_LEN).map_err(|reason| invalid(SDN_ZONE, &sdn_zone, reason))?;

        let transit_vnet = optional(&values, TRANSIT_VNET, "vpntr").to_string();
        validate_sdn_id(&transit_vnet, MAX_SDN_ID_LEN)
            .map_err(|reason| invalid(TRANSIT_VNET, &transit_vnet, reason))?;

        let tenant_vnet_prefix = optional(&values, TENANT_VNET_PREFIX, "tnet").to_string();
        // The longest generated name carries the highest tenant index.
        let longest = format!("{}{}", tenant_vnet_prefix, tenant_count);
        validate_sdn_id(&longest, MAX_SDN_ID_LEN)
            .map_err(|reason| invalid(TENANT_VNET_PREFIX, &tenant_vnet_prefix, reason))?;

        let node = optional(&values, NODE, "localhost").to_string();

        let passthrough = values
            .into_iter()
            .filter(|(key, _)| !KNOWN_KEYS.contains(&key.as_str()))
            .collect();

        Ok(ConfigurationRecord {
            lan,
            lan_gateway,
            tenant_count,
            vpn_transit,
            vpn_transit_host,
            vpn_pool,
            tenant_network,
            sdn_zone,
            tenant_vnet_prefix,
            transit_vnet,
            node,
            passthrough,
        })
    }

    /// Vnet (and IP set) name of tenant `index`, 1-based
    pub fn tenant_vnet(&self, index: usize) -> String {
        format!("{}{}", self.tenant_vnet_prefix, index)
    }

    /// Look up an opaque passthrough value
    pub fn passthrough(&self, key: &str) -> Option<&str> {
        self.passthrough.get(key).map(String::as_str)
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn sample_values() -> BTreeMap<String, String> {
        [
            (LAN_CIDR, "192.168.1.0/24"),
            (LAN_GATEWAY, "192.168.1.1"),
            (TENANT_COUNT, "4"),
            (VPN_TRANSIT_CIDR, "10.99.0.0/30"),
            (VPN_POOL_CIDR, "10.8.0.0/24"),
            (TENANT_NETWORK_CIDR, "10.20.0.0/22"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
    }

    pub fn sample_record() -> ConfigurationRecord {
        ConfigurationRecord::from_map(sample_values()).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::sample_values;
    use super::*;

    #[test]
    fn test_defaults_applied() {
        let record = ConfigurationRecord::from_map(sample_values()).unwrap();
        assert_eq!(record.sdn_zone, "fabric");
        assert_eq!(record.transit_vnet, "vpntr");
        assert_eq!(record.node, "localhost");
        assert_eq!(record.vpn_transit_host, Ipv4Addr::new(10, 99, 0, 2));
        assert_eq!(record.tenant_vnet(3), "tnet3");
    }

    #[test]
    fn test_missing_key() {
        let mut values = sample_values();
        values.remove(VPN_POOL_CIDR);
        match ConfigurationRecord::from_map(values) {
            Err(ConfigError::MissingKey { key }) => assert_eq!(key, VPN_POOL_CIDR),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_misaligned_cidr_rejected() {
        let mut values = sample_values();
        values.insert(LAN_CIDR.to_string(), "192.168.1.5/24".to_string());
        assert!(matches!(
            ConfigurationRecord::from_map(values),
            Err(ConfigError::Address { source: AddressError::Misaligned { .. }, .. })
        ));
    }

    #[test]
    fn test_gateway_must_be_inside_lan() {
        let mut values = sample_values();
        values.insert(LAN_GATEWAY.to_string(), "192.168.2.1".to_string());
        assert!(matches!(ConfigurationRecord::from_map(values), Err(ConfigError::InvalidValue { .. })));

        let mut values = sample_values();
        values.insert(LAN_GATEWAY.to_string(), "192.168.1.255".to_string());
        assert!(ConfigurationRecord::from_map(values).is_err());
    }

    #[test]
    fn test_tenant_count_restricted() {
        for bad in ["3", "32", "zero", "-2"] {
            let mut values = sample_values();
            values.insert(TENANT_COUNT.to_string(), bad.to_string());
            let err = ConfigurationRecord::from_map(values).unwrap_err();
            assert!(err.to_string().contains(TENANT_COUNT), "{}", err);
        }
    }

    #[test]
    fn test_tenant_prefix_length_checked() {
        let mut values = sample_values();
        values.insert(TENANT_COUNT.to_string(), "16".to_string());
        values.insert(TENANT_VNET_PREFIX.to_string(), "tenantx".to_string());
        assert!(ConfigurationRecord::from_map(values).is_err());
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let mut values = sample_values();
        values.insert("WG_PORT".to_string(), "51820".to_string());
        let record = ConfigurationRecord::from_map(values).unwrap();
        assert_eq!(record.passthrough("WG_PORT"), Some("51820"));
        assert_eq!(record.passthrough(LAN_CIDR), None);
    }
}
