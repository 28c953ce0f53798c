//! Controller object model.
//!
//! These structures mirror what the SDN/firewall controller returns. Fields
//! the engine does not interpret are kept in `extra` so a captured baseline
//! preserves the object verbatim.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

use crate::ip::cidr::CidrBlock;

/// Tracked resource collections, in capture order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Zone,
    Vnet,
    Subnet,
    IpSet,
    IpSetEntry,
    FirewallRule,
    FirewallOptions,
    HostFirewallOptions,
    Route,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Zone,
        ResourceKind::Vnet,
        ResourceKind::Subnet,
        ResourceKind::IpSet,
        ResourceKind::IpSetEntry,
        ResourceKind::FirewallRule,
        ResourceKind::FirewallOptions,
        ResourceKind::HostFirewallOptions,
        ResourceKind::Route,
    ];

    /// Collection name used as the persistence key
    pub fn collection(&self) -> &'static str {
        match self {
            ResourceKind::Zone => "zones",
            ResourceKind::Vnet => "vnets",
            ResourceKind::Subnet => "subnets",
            ResourceKind::IpSet => "ipsets",
            ResourceKind::IpSetEntry => "ipset_entries",
            ResourceKind::FirewallRule => "firewall_rules",
            ResourceKind::FirewallOptions => "firewall_options",
            ResourceKind::HostFirewallOptions => "host_firewall_options",
            ResourceKind::Route => "routes",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ResourceKind::Zone => "zone",
            ResourceKind::Vnet => "vnet",
            ResourceKind::Subnet => "subnet",
            ResourceKind::IpSet => "ipset",
            ResourceKind::IpSetEntry => "ipset entry",
            ResourceKind::FirewallRule => "firewall rule",
            ResourceKind::FirewallOptions => "datacenter firewall options",
            ResourceKind::HostFirewallOptions => "host firewall options",
            ResourceKind::Route => "route",
        };
        write!(f, "{}", label)
    }
}

/// Stable identity used to compare live objects against the baseline
pub trait Identified {
    fn identity(&self) -> String;
}

/// The controller reports boolean flags as 0/1, "1", or true.
mod flag {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &bool, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(u8::from(*value))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
        Ok(match Raw::deserialize(deserializer)? {
            Raw::Bool(value) => value,
            Raw::Int(value) => value != 0,
            Raw::Text(value) => matches!(value.trim(), "1" | "true" | "yes" | "on"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub zone: String,
    #[serde(rename = "type")]
    pub zone_type: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Zone {
    pub fn simple(zone: impl Into<String>) -> Self {
        Zone { zone: zone.into(), zone_type: "simple".to_string(), extra: BTreeMap::new() }
    }
}

impl Identified for Zone {
    fn identity(&self) -> String {
        self.zone.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vnet {
    pub vnet: String,
    #[serde(default)]
    pub zone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Vnet {
    pub fn new(vnet: impl Into<String>, zone: impl Into<String>) -> Self {
        Vnet { vnet: vnet.into(), zone: zone.into(), alias: None, extra: BTreeMap::new() }
    }
}

impl Identified for Vnet {
    fn identity(&self) -> String {
        self.vnet.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    /// Owning vnet; the controller omits it on some endpoints.
    #[serde(default)]
    pub vnet: String,
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Controller-side subnet id, e.g. `zone-10.0.0.0-24`
    #[serde(default, rename = "subnet", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Subnet {
    pub fn new(vnet: impl Into<String>, block: &CidrBlock, gateway: Option<String>) -> Self {
        Subnet {
            vnet: vnet.into(),
            cidr: block.to_string(),
            gateway,
            id: None,
            zone: None,
            extra: BTreeMap::new(),
        }
    }

    /// Controller id, derived from zone and cidr when not reported
    pub fn controller_id(&self) -> Option<String> {
        if let Some(id) = &self.id {
            return Some(id.clone());
        }
        self.zone
            .as_ref()
            .map(|zone| format!("{}-{}", zone, self.cidr.replace('/', "-")))
    }
}

impl Identified for Subnet {
    fn identity(&self) -> String {
        format!("{}/{}", self.vnet, normalize_cidr(&self.cidr))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpSet {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl IpSet {
    pub fn new(name: impl Into<String>, comment: Option<String>) -> Self {
        IpSet { name: name.into(), comment, extra: BTreeMap::new() }
    }
}

impl Identified for IpSet {
    fn identity(&self) -> String {
        self.name.clone()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpSetEntry {
    /// Owning ipset; filled in by the client since the controller omits it.
    #[serde(default)]
    pub ipset: String,
    pub cidr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl IpSetEntry {
    pub fn new(ipset: impl Into<String>, block: &CidrBlock, comment: Option<String>) -> Self {
        IpSetEntry { ipset: ipset.into(), cidr: block.to_string(), comment, extra: BTreeMap::new() }
    }
}

impl Identified for IpSetEntry {
    fn identity(&self) -> String {
        format!("{}/{}", self.ipset, normalize_cidr(&self.cidr))
    }
}

/// A host-level firewall rule. `pos` is positional and never part of identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default)]
    pub pos: u32,
    #[serde(rename = "type")]
    pub direction: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iface: Option<String>,
    #[serde(default, rename = "macro", skip_serializing_if = "Option::is_none")]
    pub macro_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, with = "flag")]
    pub enable: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Comparable form of a firewall rule: everything that defines what the
/// rule does, with position, digest and similar bookkeeping stripped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleIdentity {
    pub direction: String,
    pub action: String,
    pub source: Option<String>,
    pub dest: Option<String>,
    pub proto: Option<String>,
    pub dport: Option<String>,
    pub sport: Option<String>,
    pub iface: Option<String>,
    pub macro_name: Option<String>,
    pub comment: Option<String>,
}

impl fmt::Display for RuleIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.direction.to_lowercase(), self.action.to_uppercase())?;
        let optional = [
            ("macro", &self.macro_name),
            ("iface", &self.iface),
            ("source", &self.source),
            ("dest", &self.dest),
            ("proto", &self.proto),
            ("sport", &self.sport),
            ("dport", &self.dport),
            ("comment", &self.comment),
        ];
        for (name, value) in optional {
            if let Some(value) = value {
                write!(f, " {}={}", name, value)?;
            }
        }
        Ok(())
    }
}

/// Strip non-identity fields from a rule
pub fn identity_of(rule: &FirewallRule) -> RuleIdentity {
    let clean = |value: &Option<String>| {
        value
            .as_ref()
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    RuleIdentity {
        direction: rule.direction.trim().to_lowercase(),
        action: rule.action.trim().to_uppercase(),
        source: clean(&rule.source),
        dest: clean(&rule.dest),
        proto: clean(&rule.proto),
        dport: clean(&rule.dport),
        sport: clean(&rule.sport),
        iface: clean(&rule.iface),
        macro_name: clean(&rule.macro_name),
        comment: clean(&rule.comment),
    }
}

impl FirewallRule {
    pub fn new(direction: impl Into<String>, action: impl Into<String>) -> Self {
        FirewallRule {
            pos: 0,
            direction: direction.into(),
            action: action.into(),
            source: None,
            dest: None,
            proto: None,
            dport: None,
            sport: None,
            iface: None,
            macro_name: None,
            comment: None,
            enable: true,
            extra: BTreeMap::new(),
        }
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn dest(mut self, dest: impl Into<String>) -> Self {
        self.dest = Some(dest.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

impl Identified for FirewallRule {
    fn identity(&self) -> String {
        identity_of(self).to_string()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FirewallOptions {
    #[serde(default, with = "flag")]
    pub enable: bool,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FirewallOptions {
    pub fn enabled(enable: bool) -> Self {
        FirewallOptions { enable, extra: BTreeMap::new() }
    }
}

/// Kernel routing table entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Route {
    #[serde(rename = "dst")]
    pub destination: String,
    #[serde(default, rename = "gateway", skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    #[serde(default, rename = "dev", skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Route {
    pub fn new(destination: impl Into<String>, via: Option<String>, device: Option<String>) -> Self {
        Route { destination: destination.into(), via, device, extra: BTreeMap::new() }
    }

    pub fn is_default(&self) -> bool {
        matches!(self.destination.as_str(), "default" | "0.0.0.0/0")
    }
}

impl Identified for Route {
    fn identity(&self) -> String {
        normalize_cidr(&self.destination)
    }
}

/// Kind of guest a hypervisor reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GuestKind {
    Qemu,
    Lxc,
}

/// Network-relevant configuration of one guest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    pub vmid: u32,
    pub kind: GuestKind,
    pub options: BTreeMap<String, String>,
}

/// Canonical text for a CIDR or host (`10.0.0.5` becomes `10.0.0.5/32`);
/// unparseable input is returned trimmed.
pub fn normalize_cidr(text: &str) -> String {
    CidrBlock::normalized(text)
        .map(|block| block.to_string())
        .unwrap_or_else(|_| text.trim().to_string())
}
