//! Objects implied by a network plan.

use serde::Serialize;

use crate::config::ConfigurationRecord;
use crate::controller::{FirewallRule, IpSet, IpSetEntry, Route, Subnet, Vnet, Zone};
use crate::ip::cidr;
use crate::plan::NetworkPlan;

/// IP set holding the site LAN
pub const IPSET_LAN: &str = "fabric_lan";
/// IP set holding the whole VPN client pool
pub const IPSET_VPN: &str = "fabric_vpn";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DesiredState {
    pub zone: Zone,
    pub vnets: Vec<Vnet>,
    pub subnets: Vec<Subnet>,
    pub ipsets: Vec<IpSet>,
    pub ipset_entries: Vec<IpSetEntry>,
    pub rules: Vec<FirewallRule>,
    pub pool_route: Route,
}

fn isolation_rule(source: &str, dest: &str) -> FirewallRule {
    FirewallRule::new("forward", "DROP")
        .source(format!("+{}", source))
        .dest(format!("+{}", dest))
        .comment(format!("isolate {} from {}", source, dest))
}

impl DesiredState {
    pub fn from_plan(plan: &NetworkPlan, record: &ConfigurationRecord) -> Self {
        let zone = Zone::simple(&record.sdn_zone);

        let mut transit_vnet = Vnet::new(&record.transit_vnet, &record.sdn_zone);
        transit_vnet.alias = Some("VPN transit".to_string());
        let mut vnets = vec![transit_vnet];
        let mut subnets = vec![Subnet::new(
            &record.transit_vnet,
            &plan.transit,
            Some(plan.transit_gateway.to_string()),
        )];

        let mut ipsets = vec![
            IpSet::new(IPSET_LAN, Some("site LAN".to_string())),
            IpSet::new(IPSET_VPN, Some("VPN client pool".to_string())),
        ];
        let mut ipset_entries = vec![
            IpSetEntry::new(IPSET_LAN, &plan.lan, None),
            IpSetEntry::new(IPSET_VPN, &plan.vpn.pool, None),
        ];

        let names: Vec<String> = plan.tenants.iter().map(|t| record.tenant_vnet(t.index)).collect();

        for (tagged, name) in plan.tenants.iter().zip(&names) {
            let mut vnet = Vnet::new(name, &record.sdn_zone);
            vnet.alias = Some(format!("tenant {}", tagged.index));
            vnets.push(vnet);
            subnets.push(Subnet::new(
                name,
                &tagged.block,
                cidr::first_host(&tagged.block).map(|gw| gw.to_string()),
            ));

            ipsets.push(IpSet::new(name, Some(format!("tenant {}", tagged.index))));
            for block in plan.tenant_blocks(tagged.index) {
                ipset_entries.push(IpSetEntry::new(name, &block, None));
            }
        }

        let mut rules = Vec::new();
        for name in &names {
            rules.push(isolation_rule(name, IPSET_LAN));
            for other in names.iter().filter(|other| *other != name) {
                rules.push(isolation_rule(name, other));
            }
        }

        let pool_route = Route::new(
            plan.vpn.pool.to_string(),
            Some(plan.vpn_host.to_string()),
            Some(record.transit_vnet.clone()),
        );

        DesiredState { zone, vnets, subnets, ipsets, ipset_entries, rules, pool_route }
    }
}
