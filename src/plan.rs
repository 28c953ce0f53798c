//! Address plan derived from a configuration record.
//!
//! The plan fixes every block the fabric uses: the site LAN, the VPN
//! transit segment and its two endpoints, one segment per tenant, and the
//! VPN client pool split by protocol and by tenant.

use log::debug;
use serde::Serialize;
use std::net::Ipv4Addr;

use crate::config::{ConfigError, ConfigurationRecord, LAN_GATEWAY, VPN_TRANSIT_CIDR, VPN_TRANSIT_HOST};
use crate::ip::allocator::{self, AllocationError, AllocationPlan, VpnPoolSplit};
use crate::ip::cidr::{self, CidrBlock};
use crate::ip::discovery::ExistingNetworkSet;
use crate::utils::validation::find_role_overlap;

pub const ROLE_LAN: &str = "site LAN";
pub const ROLE_TRANSIT: &str = "VPN transit";
pub const ROLE_VPN_POOL: &str = "VPN client pool";
pub const ROLE_TENANTS: &str = "tenant networks";

#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Cannot allocate {role}: {source}")]
    Allocation {
        role: String,
        #[source]
        source: AllocationError,
    },

    #[error("{first} {first_block} overlaps {second} {second_block}")]
    Overlap {
        first: String,
        first_block: CidrBlock,
        second: String,
        second_block: CidrBlock,
    },

    #[error("Gateway {gateway} is outside the site LAN {lan}")]
    GatewayOutside { gateway: Ipv4Addr, lan: CidrBlock },
}

/// A planned block that collides with a network already in use
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub role: String,
    pub block: CidrBlock,
    pub existing: CidrBlock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkPlan {
    pub lan: CidrBlock,
    pub lan_gateway: Ipv4Addr,
    pub transit: CidrBlock,
    /// Host side of the transit segment, the vnet gateway
    pub transit_gateway: Ipv4Addr,
    /// VPN endpoint on the transit segment, next hop for the client pool
    pub vpn_host: Ipv4Addr,
    pub tenants: AllocationPlan,
    pub vpn: VpnPoolSplit,
}

impl NetworkPlan {
    pub fn build(record: &ConfigurationRecord) -> Result<Self, PlanError> {
        if !cidr::contains(&record.lan, record.lan_gateway) {
            return Err(PlanError::GatewayOutside { gateway: record.lan_gateway, lan: record.lan });
        }

        let roles = vec![
            (ROLE_LAN.to_string(), record.lan),
            (ROLE_TRANSIT.to_string(), record.vpn_transit),
            (ROLE_VPN_POOL.to_string(), record.vpn_pool),
            (ROLE_TENANTS.to_string(), record.tenant_network),
        ];
        if let Some((i, j)) = find_role_overlap(&roles) {
            return Err(PlanError::Overlap {
                first: roles[i].0.clone(),
                first_block: roles[i].1,
                second: roles[j].0.clone(),
                second_block: roles[j].1,
            });
        }

        let transit_gateway = cidr::first_host(&record.vpn_transit).ok_or_else(|| ConfigError::InvalidValue {
            key: VPN_TRANSIT_CIDR.to_string(),
            value: record.vpn_transit.to_string(),
            reason: "has no usable host".to_string(),
        })?;
        if record.vpn_transit_host == transit_gateway || !cidr::contains(&record.vpn_transit, record.vpn_transit_host) {
            return Err(ConfigError::InvalidValue {
                key: VPN_TRANSIT_HOST.to_string(),
                value: record.vpn_transit_host.to_string(),
                reason: format!("must be a host of {} other than the gateway {}", record.vpn_transit, transit_gateway),
            }
            .into());
        }
        if record.lan_gateway == cidr::network_address(&record.lan) && record.lan.prefix() < 31 {
            return Err(ConfigError::InvalidValue {
                key: LAN_GATEWAY.to_string(),
                value: record.lan_gateway.to_string(),
                reason: "is the network address of the site LAN".to_string(),
            }
            .into());
        }

        let tenants = allocator::subdivide(record.tenant_network, record.tenant_count)
            .map_err(|source| PlanError::Allocation { role: ROLE_TENANTS.to_string(), source })?
            .with_role("tenant");
        let vpn = allocator::split_vpn_pool(record.vpn_pool, record.tenant_count)
            .map_err(|source| PlanError::Allocation { role: ROLE_VPN_POOL.to_string(), source })?;

        debug!(
            "Planned {} tenant segments of /{} and VPN client blocks of /{}",
            tenants.len(),
            tenants.get(1).map_or(0, |b| b.prefix()),
            vpn.per_tenant_a.get(1).map_or(0, |b| b.prefix())
        );

        Ok(NetworkPlan {
            lan: record.lan,
            lan_gateway: record.lan_gateway,
            transit: record.vpn_transit,
            transit_gateway,
            vpn_host: record.vpn_transit_host,
            tenants,
            vpn,
        })
    }

    /// Blocks of tenant `index` (1-based): its segment, then its protocol A
    /// and protocol B client blocks
    pub fn tenant_blocks(&self, index: usize) -> Vec<CidrBlock> {
        [
            self.tenants.get(index),
            self.vpn.per_tenant_a.get(index),
            self.vpn.per_tenant_b.get(index),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    /// Every role block except the site LAN, which is expected to exist
    fn fabric_roles(&self) -> Vec<(String, CidrBlock)> {
        let mut roles = vec![
            (ROLE_TRANSIT.to_string(), self.transit),
            (ROLE_VPN_POOL.to_string(), self.vpn.pool),
        ];
        for tagged in self.tenants.iter() {
            roles.push((format!("tenant {}", tagged.index), tagged.block));
        }
        roles
    }

    /// Planned blocks that overlap networks already in use
    pub fn conflicts(&self, existing: &ExistingNetworkSet) -> Vec<Conflict> {
        self.fabric_roles()
            .into_iter()
            .filter_map(|(role, block)| {
                existing
                    .first_overlap(&block)
                    .map(|used| Conflict { role, block, existing: used })
            })
            .collect()
    }
}
