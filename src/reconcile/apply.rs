//! Idempotent creation of the desired fabric objects.
//!
//! Every object is created only if a live read, taken right before the
//! create, shows nothing with the same identity. What happens when a create
//! fails is decided per kind by [`ApplyPolicy`].

use log::{debug, info, warn};
use serde::Serialize;

use super::desired::DesiredState;
use crate::controller::{ControllerClient, Identified, ProviderError, ResourceKind, RouteClient};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    /// Stop the pass and return an error
    Fatal,
    /// Log, record as skipped and continue
    BestEffort,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApplyPolicy {
    pub zones: FailurePolicy,
    pub vnets: FailurePolicy,
    pub subnets: FailurePolicy,
    pub ipsets: FailurePolicy,
    pub ipset_entries: FailurePolicy,
    pub firewall_rules: FailurePolicy,
    pub pool_route: FailurePolicy,
}

impl Default for ApplyPolicy {
    fn default() -> Self {
        ApplyPolicy {
            zones: FailurePolicy::Fatal,
            vnets: FailurePolicy::Fatal,
            subnets: FailurePolicy::Fatal,
            ipsets: FailurePolicy::Fatal,
            ipset_entries: FailurePolicy::Fatal,
            firewall_rules: FailurePolicy::BestEffort,
            pool_route: FailurePolicy::BestEffort,
        }
    }
}

impl ApplyPolicy {
    pub fn for_kind(&self, kind: ResourceKind) -> FailurePolicy {
        match kind {
            ResourceKind::Zone => self.zones,
            ResourceKind::Vnet => self.vnets,
            ResourceKind::Subnet => self.subnets,
            ResourceKind::IpSet => self.ipsets,
            ResourceKind::IpSetEntry => self.ipset_entries,
            ResourceKind::FirewallRule => self.firewall_rules,
            ResourceKind::Route => self.pool_route,
            ResourceKind::FirewallOptions | ResourceKind::HostFirewallOptions => FailurePolicy::Fatal,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Failed to create required {kind} '{identity}': {source}")]
    Required {
        kind: ResourceKind,
        identity: String,
        #[source]
        source: ProviderError,
    },

    #[error("Failed to apply pending SDN changes: {0}")]
    Commit(#[source] ProviderError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub kind: ResourceKind,
    pub identity: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ApplyReport {
    pub created: Vec<(ResourceKind, String)>,
    pub existing: Vec<(ResourceKind, String)>,
    pub skipped: Vec<Skipped>,
    /// Whether pending SDN changes were committed
    pub committed: bool,
}

impl ApplyReport {
    pub fn created_count(&self, kind: ResourceKind) -> usize {
        self.created.iter().filter(|(k, _)| *k == kind).count()
    }
}

struct Applier<'p> {
    policy: &'p ApplyPolicy,
    report: ApplyReport,
}

impl Applier<'_> {
    /// Create `item` unless a live object with the same identity exists
    fn ensure<T: Identified>(
        &mut self,
        kind: ResourceKind,
        item: &T,
        list: impl FnOnce() -> Result<Vec<T>, ProviderError>,
        create: impl FnOnce(&T) -> Result<(), ProviderError>,
    ) -> Result<(), ApplyError> {
        let identity = item.identity();
        let result = list().and_then(|live| {
            if live.iter().any(|existing| existing.identity() == identity) {
                Ok(false)
            } else {
                create(item).map(|()| true)
            }
        });

        match result {
            Ok(true) => {
                info!("Created {} {}", kind, identity);
                self.report.created.push((kind, identity));
                Ok(())
            }
            Ok(false) => {
                debug!("{} {} already exists", kind, identity);
                self.report.existing.push((kind, identity));
                Ok(())
            }
            Err(source) => match self.policy.for_kind(kind) {
                FailurePolicy::Fatal => Err(ApplyError::Required { kind, identity, source }),
                FailurePolicy::BestEffort => {
                    warn!("Skipping {} {}: {}", kind, identity, source);
                    self.report.skipped.push(Skipped { kind, identity, reason: source.to_string() });
                    Ok(())
                }
            },
        }
    }
}

/// Create every object of `desired` that does not exist yet
pub fn apply_desired_state(
    controller: &dyn ControllerClient,
    routes: &dyn RouteClient,
    desired: &DesiredState,
    policy: &ApplyPolicy,
) -> Result<ApplyReport, ApplyError> {
    let mut applier = Applier { policy, report: ApplyReport::default() };

    applier.ensure(ResourceKind::Zone, &desired.zone, || controller.list_zones(), |z| controller.create_zone(z))?;
    for vnet in &desired.vnets {
        applier.ensure(ResourceKind::Vnet, vnet, || controller.list_vnets(), |v| controller.create_vnet(v))?;
    }
    for subnet in &desired.subnets {
        applier.ensure(
            ResourceKind::Subnet,
            subnet,
            || controller.list_subnets(&subnet.vnet),
            |s| controller.create_subnet(s),
        )?;
    }

    let sdn_created = applier
        .report
        .created
        .iter()
        .any(|(kind, _)| matches!(kind, ResourceKind::Zone | ResourceKind::Vnet | ResourceKind::Subnet));
    if sdn_created {
        info!("Applying pending SDN changes");
        controller.apply_pending_changes().map_err(ApplyError::Commit)?;
        applier.report.committed = true;
    }

    for ipset in &desired.ipsets {
        applier.ensure(ResourceKind::IpSet, ipset, || controller.list_ipsets(), |s| controller.create_ipset(s))?;
    }
    for entry in &desired.ipset_entries {
        applier.ensure(
            ResourceKind::IpSetEntry,
            entry,
            || {
                // Entries come back without their set name.
                controller.list_ipset_entries(&entry.ipset).map(|entries| {
                    entries
                        .into_iter()
                        .map(|mut e| {
                            e.ipset = entry.ipset.clone();
                            e
                        })
                        .collect()
                })
            },
            |e| controller.create_ipset_entry(e),
        )?;
    }

    for rule in &desired.rules {
        applier.ensure(
            ResourceKind::FirewallRule,
            rule,
            || controller.list_firewall_rules(),
            |r| controller.create_firewall_rule(r),
        )?;
    }

    let route = &desired.pool_route;
    applier.ensure(
        ResourceKind::Route,
        route,
        || routes.list_routes(),
        |r| routes.add_route(&r.destination, r.via.as_deref(), r.device.as_deref()),
    )?;

    let report = applier.report;
    info!(
        "Apply finished: {} created, {} already present, {} skipped",
        report.created.len(),
        report.existing.len(),
        report.skipped.len()
    );
    Ok(report)
}
