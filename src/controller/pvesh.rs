//! Controller client backed by the `pvesh` management CLI.
//!
//! Every call maps to `pvesh <verb> <api path> [--param value ...]`; reads
//! request JSON output and are decoded into the types in [`super::types`].

use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;

use super::types::{
    FirewallOptions, FirewallRule, GuestConfig, GuestKind, IpSet, IpSetEntry, Subnet, Vnet, Zone,
};
use super::{ControllerClient, GuestInventory, ProviderError};
use crate::utils::command::CommandRunner;

const PVESH: &str = "pvesh";

pub struct PveshController<'a> {
    runner: &'a dyn CommandRunner,
    node: String,
}

#[derive(Debug, Deserialize)]
struct GuestListItem {
    vmid: u32,
}

impl<'a> PveshController<'a> {
    /// `node` selects the host whose firewall rules/options are managed
    pub fn new(runner: &'a dyn CommandRunner, node: impl Into<String>) -> Self {
        PveshController { runner, node: node.into() }
    }

    fn get<T: DeserializeOwned>(&self, path: &str, what: &str) -> Result<T, ProviderError> {
        let output = self.runner.run(PVESH, &["get", path, "--output-format", "json"])?;
        let trimmed = output.trim();
        // Some endpoints print nothing for an empty collection.
        let body = if trimmed.is_empty() { "[]" } else { trimmed };
        serde_json::from_str(body).map_err(|e| ProviderError::Decode {
            what: what.to_string(),
            message: e.to_string(),
        })
    }

    fn call(&self, verb: &str, path: &str, params: &[(&str, String)]) -> Result<(), ProviderError> {
        let mut args: Vec<String> = vec![verb.to_string(), path.to_string()];
        for (name, value) in params {
            args.push(format!("--{}", name));
            args.push(value.clone());
        }
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.runner.run(PVESH, &args)?;
        Ok(())
    }

    /// Options endpoints return an object; nothing printed means nothing set
    fn get_options(&self, path: &str, what: &str) -> Result<FirewallOptions, ProviderError> {
        let output = self.runner.run(PVESH, &["get", path, "--output-format", "json"])?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(FirewallOptions::default());
        }
        serde_json::from_str(trimmed).map_err(|e| ProviderError::Decode {
            what: what.to_string(),
            message: e.to_string(),
        })
    }

    fn rules_path(&self) -> String {
        format!("/nodes/{}/firewall/rules", self.node)
    }

    fn guest_configs(&self, kind: GuestKind) -> Result<Vec<GuestConfig>, ProviderError> {
        let segment = match kind {
            GuestKind::Qemu => "qemu",
            GuestKind::Lxc => "lxc",
        };
        let guests: Vec<GuestListItem> = self.get(&format!("/nodes/{}/{}", self.node, segment), "guest list")?;

        let mut configs = Vec::with_capacity(guests.len());
        for guest in guests {
            let path = format!("/nodes/{}/{}/{}/config", self.node, segment, guest.vmid);
            match self.get::<BTreeMap<String, Value>>(&path, "guest config") {
                Ok(raw) => {
                    let options = raw
                        .into_iter()
                        .map(|(key, value)| match value {
                            Value::String(text) => (key, text),
                            other => (key, other.to_string()),
                        })
                        .collect();
                    configs.push(GuestConfig { vmid: guest.vmid, kind, options });
                }
                Err(e) => warn!("Skipping guest {}: {}", guest.vmid, e),
            }
        }
        Ok(configs)
    }
}

fn push_opt(params: &mut Vec<(&'static str, String)>, name: &'static str, value: &Option<String>) {
    if let Some(value) = value {
        params.push((name, value.clone()));
    }
}

fn flag(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

impl ControllerClient for PveshController<'_> {
    fn list_zones(&self) -> Result<Vec<Zone>, ProviderError> {
        self.get("/cluster/sdn/zones", "zones")
    }

    fn list_vnets(&self) -> Result<Vec<Vnet>, ProviderError> {
        self.get("/cluster/sdn/vnets", "vnets")
    }

    fn list_subnets(&self, vnet: &str) -> Result<Vec<Subnet>, ProviderError> {
        let mut subnets: Vec<Subnet> = self.get(&format!("/cluster/sdn/vnets/{}/subnets", vnet), "subnets")?;
        for subnet in &mut subnets {
            if subnet.vnet.is_empty() {
                subnet.vnet = vnet.to_string();
            }
        }
        Ok(subnets)
    }

    fn list_ipsets(&self) -> Result<Vec<IpSet>, ProviderError> {
        self.get("/cluster/firewall/ipset", "ipsets")
    }

    fn list_ipset_entries(&self, ipset: &str) -> Result<Vec<IpSetEntry>, ProviderError> {
        let mut entries: Vec<IpSetEntry> =
            self.get(&format!("/cluster/firewall/ipset/{}", ipset), "ipset entries")?;
        for entry in &mut entries {
            entry.ipset = ipset.to_string();
        }
        Ok(entries)
    }

    fn list_firewall_rules(&self) -> Result<Vec<FirewallRule>, ProviderError> {
        self.get(&self.rules_path(), "firewall rules")
    }

    fn get_firewall_options(&self) -> Result<FirewallOptions, ProviderError> {
        self.get_options("/cluster/firewall/options", "datacenter firewall options")
    }

    fn get_host_firewall_options(&self) -> Result<FirewallOptions, ProviderError> {
        self.get_options(&format!("/nodes/{}/firewall/options", self.node), "host firewall options")
    }

    fn create_zone(&self, zone: &Zone) -> Result<(), ProviderError> {
        debug!("Creating zone {}", zone.zone);
        self.call(
            "create",
            "/cluster/sdn/zones",
            &[("zone", zone.zone.clone()), ("type", zone.zone_type.clone())],
        )
    }

    fn create_vnet(&self, vnet: &Vnet) -> Result<(), ProviderError> {
        let mut params = vec![("vnet", vnet.vnet.clone()), ("zone", vnet.zone.clone())];
        push_opt(&mut params, "alias", &vnet.alias);
        self.call("create", "/cluster/sdn/vnets", &params)
    }

    fn create_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError> {
        let mut params = vec![("subnet", subnet.cidr.clone()), ("type", "subnet".to_string())];
        push_opt(&mut params, "gateway", &subnet.gateway);
        self.call("create", &format!("/cluster/sdn/vnets/{}/subnets", subnet.vnet), &params)
    }

    fn create_ipset(&self, ipset: &IpSet) -> Result<(), ProviderError> {
        let mut params = vec![("name", ipset.name.clone())];
        push_opt(&mut params, "comment", &ipset.comment);
        self.call("create", "/cluster/firewall/ipset", &params)
    }

    fn create_ipset_entry(&self, entry: &IpSetEntry) -> Result<(), ProviderError> {
        let mut params = vec![("cidr", entry.cidr.clone())];
        push_opt(&mut params, "comment", &entry.comment);
        self.call("create", &format!("/cluster/firewall/ipset/{}", entry.ipset), &params)
    }

    fn create_firewall_rule(&self, rule: &FirewallRule) -> Result<(), ProviderError> {
        let mut params = vec![("type", rule.direction.clone()), ("action", rule.action.clone())];
        push_opt(&mut params, "macro", &rule.macro_name);
        push_opt(&mut params, "iface", &rule.iface);
        push_opt(&mut params, "source", &rule.source);
        push_opt(&mut params, "dest", &rule.dest);
        push_opt(&mut params, "proto", &rule.proto);
        push_opt(&mut params, "sport", &rule.sport);
        push_opt(&mut params, "dport", &rule.dport);
        push_opt(&mut params, "comment", &rule.comment);
        params.push(("enable", flag(rule.enable)));
        self.call("create", &self.rules_path(), &params)
    }

    fn delete_zone(&self, zone: &str) -> Result<(), ProviderError> {
        self.call("delete", &format!("/cluster/sdn/zones/{}", zone), &[])
    }

    fn delete_vnet(&self, vnet: &str) -> Result<(), ProviderError> {
        self.call("delete", &format!("/cluster/sdn/vnets/{}", vnet), &[])
    }

    fn delete_subnet(&self, subnet: &Subnet) -> Result<(), ProviderError> {
        let id = subnet.controller_id().ok_or_else(|| ProviderError::NotFound {
            kind: "subnet id".to_string(),
            identity: format!("{}/{}", subnet.vnet, subnet.cidr),
        })?;
        self.call("delete", &format!("/cluster/sdn/vnets/{}/subnets/{}", subnet.vnet, id), &[])
    }

    fn delete_ipset(&self, name: &str) -> Result<(), ProviderError> {
        self.call("delete", &format!("/cluster/firewall/ipset/{}", name), &[])
    }

    fn delete_ipset_entry(&self, ipset: &str, cidr: &str) -> Result<(), ProviderError> {
        self.call("delete", &format!("/cluster/firewall/ipset/{}/{}", ipset, cidr), &[])
    }

    fn delete_firewall_rule_at(&self, pos: u32) -> Result<(), ProviderError> {
        self.call("delete", &format!("{}/{}", self.rules_path(), pos), &[])
    }

    fn set_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError> {
        self.call("set", "/cluster/firewall/options", &[("enable", flag(options.enable))])
    }

    fn set_host_firewall_options(&self, options: &FirewallOptions) -> Result<(), ProviderError> {
        self.call(
            "set",
            &format!("/nodes/{}/firewall/options", self.node),
            &[("enable", flag(options.enable))],
        )
    }

    fn apply_pending_changes(&self) -> Result<(), ProviderError> {
        self.call("set", "/cluster/sdn", &[])
    }
}

impl GuestInventory for PveshController<'_> {
    fn list_guest_configs(&self) -> Result<Vec<GuestConfig>, ProviderError> {
        let mut configs = self.guest_configs(GuestKind::Qemu)?;
        configs.extend(self.guest_configs(GuestKind::Lxc)?);
        Ok(configs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::types::identity_of;
    use crate::utils::command::fake::ScriptedRunner;

    #[test]
    fn test_list_subnets_fills_vnet() {
        let runner = ScriptedRunner::new().respond(
            "pvesh get /cluster/sdn/vnets/tnet1/subnets",
            r#"[{"subnet":"fabric-10.20.1.0-24","cidr":"10.20.1.0/24","gateway":"10.20.1.1","zone":"fabric","type":"subnet"}]"#,
        );
        let controller = PveshController::new(&runner, "pve1");
        let subnets = controller.list_subnets("tnet1").unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].vnet, "tnet1");
        assert_eq!(subnets[0].id.as_deref(), Some("fabric-10.20.1.0-24"));
    }

    #[test]
    fn test_empty_output_is_empty_collection() {
        let runner = ScriptedRunner::new().respond("pvesh get /cluster/firewall/ipset", "\n");
        let controller = PveshController::new(&runner, "pve1");
        assert!(controller.list_ipsets().unwrap().is_empty());
    }

    #[test]
    fn test_decode_failure_is_reported() {
        let runner = ScriptedRunner::new().respond("pvesh get /cluster/sdn/zones", "not json");
        let controller = PveshController::new(&runner, "pve1");
        assert!(matches!(controller.list_zones(), Err(ProviderError::Decode { .. })));
    }

    #[test]
    fn test_create_rule_arguments() {
        let runner = ScriptedRunner::new();
        let controller = PveshController::new(&runner, "pve1");
        let rule = FirewallRule::new("forward", "DROP")
            .source("+tnet1")
            .dest("+fabric_lan")
            .comment("isolate tnet1");
        controller.create_firewall_rule(&rule).unwrap();
        assert_eq!(
            runner.calls(),
            vec!["pvesh create /nodes/pve1/firewall/rules --type forward --action DROP --source +tnet1 --dest +fabric_lan --comment isolate tnet1 --enable 1"]
        );
    }

    #[test]
    fn test_delete_paths() {
        let runner = ScriptedRunner::new();
        let controller = PveshController::new(&runner, "pve1");
        let mut subnet = Subnet::new("tnet2", &"10.20.2.0/24".parse().unwrap(), None);
        subnet.zone = Some("fabric".to_string());
        controller.delete_subnet(&subnet).unwrap();
        controller.delete_ipset_entry("tnet2", "10.20.2.0/24").unwrap();
        controller.delete_firewall_rule_at(3).unwrap();
        controller.apply_pending_changes().unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "pvesh delete /cluster/sdn/vnets/tnet2/subnets/fabric-10.20.2.0-24",
                "pvesh delete /cluster/firewall/ipset/tnet2/10.20.2.0/24",
                "pvesh delete /nodes/pve1/firewall/rules/3",
                "pvesh set /cluster/sdn",
            ]
        );
    }

    #[test]
    fn test_delete_subnet_without_id_fails() {
        let runner = ScriptedRunner::new();
        let controller = PveshController::new(&runner, "pve1");
        let subnet = Subnet::new("tnet2", &"10.20.2.0/24".parse().unwrap(), None);
        assert!(matches!(controller.delete_subnet(&subnet), Err(ProviderError::NotFound { .. })));
        assert!(runner.calls().is_empty());
    }

    #[test]
    fn test_rules_roundtrip_identity() {
        let runner = ScriptedRunner::new().respond(
            "pvesh get /nodes/pve1/firewall/rules",
            r#"[{"pos":0,"type":"forward","action":"DROP","source":"+tnet1","dest":"+tnet2","enable":1,"digest":"x","ipversion":4}]"#,
        );
        let controller = PveshController::new(&runner, "pve1");
        let rules = controller.list_firewall_rules().unwrap();
        let wanted = FirewallRule::new("forward", "DROP").source("+tnet1").dest("+tnet2");
        assert_eq!(identity_of(&rules[0]), identity_of(&wanted));
    }

    #[test]
    fn test_guest_configs_skip_unreadable_guest() {
        let runner = ScriptedRunner::new()
            .respond("pvesh get /nodes/pve1/qemu", r#"[{"vmid":100},{"vmid":101}]"#)
            .respond("pvesh get /nodes/pve1/qemu/100/config", r#"{"ipconfig0":"ip=10.30.0.5/24","cores":2}"#)
            .fail("pvesh get /nodes/pve1/qemu/101/config", "no such vm")
            .respond("pvesh get /nodes/pve1/lxc", r#"[]"#);
        let controller = PveshController::new(&runner, "pve1");
        let guests = controller.list_guest_configs().unwrap();
        assert_eq!(guests.len(), 1);
        assert_eq!(guests[0].vmid, 100);
        assert_eq!(guests[0].options.get("cores").map(String::as_str), Some("2"));
    }

    #[test]
    fn test_firewall_options() {
        let runner = ScriptedRunner::new()
            .respond("pvesh get /cluster/firewall/options", r#"{"enable":1,"policy_in":"DROP"}"#);
        let controller = PveshController::new(&runner, "pve1");
        assert!(controller.get_firewall_options().unwrap().enable);
        // Nothing printed for a host without options.
        assert!(!controller.get_host_firewall_options().unwrap().enable);
    }
}
