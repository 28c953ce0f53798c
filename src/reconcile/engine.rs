//! Baseline capture and restore.
//!
//! The engine has two states. Without a stored baseline the only thing it
//! does is capture one; once captured, the baseline never changes until
//! it is explicitly reset, and restore drives live state back to it by
//! deleting what the baseline does not contain.

use log::{debug, error, info, warn};

use super::baseline::{self, Baseline, BaselineError, BaselineStore, Snapshot};
use super::diff::{partition, Partition};
use super::report::{
    CollectionReport, DeleteOutcome, Deletion, PoolRouteOutcome, PoolRouteReport, ReconciliationReport,
    SettingOutcome, SettingReport,
};
use crate::config::ConfigurationRecord;
use crate::controller::{
    identity_of, ControllerClient, FirewallOptions, FirewallRule, Identified, IpSetEntry, ProviderError,
    ResourceKind, Route, RouteClient, Subnet,
};
use crate::ip::cidr::CidrBlock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    NoBaseline,
    BaselineCaptured,
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("A baseline was already captured; reset it explicitly before capturing again")]
    BaselineAlreadyCaptured,

    #[error("No baseline has been captured")]
    NoBaseline,

    #[error("Baseline store error: {0}")]
    Store(#[from] BaselineError),
}

pub struct ReconciliationEngine<'a> {
    controller: &'a dyn ControllerClient,
    routes: &'a dyn RouteClient,
    store: &'a dyn BaselineStore,
}

/// Routes restore tracks: non-default routes with a next hop
fn is_tracked_route(route: &Route, pool: &str) -> bool {
    !route.is_default() && route.via.is_some() && route.identity() != pool
}

fn degrade<T: Default>(kind: ResourceKind, result: Result<T, ProviderError>, unreadable: &mut Vec<ResourceKind>) -> T {
    match result {
        Ok(value) => value,
        Err(e) => {
            warn!("Failed to read {} during capture, recording it as empty: {}", kind.collection(), e);
            unreadable.push(kind);
            T::default()
        }
    }
}

impl<'a> ReconciliationEngine<'a> {
    pub fn new(
        controller: &'a dyn ControllerClient,
        routes: &'a dyn RouteClient,
        store: &'a dyn BaselineStore,
    ) -> Self {
        ReconciliationEngine { controller, routes, store }
    }

    pub fn state(&self) -> Result<EngineState, ReconcileError> {
        if self.store.is_complete()? {
            Ok(EngineState::BaselineCaptured)
        } else {
            Ok(EngineState::NoBaseline)
        }
    }

    fn read_subnets(&self) -> Result<Vec<Subnet>, ProviderError> {
        let mut subnets = Vec::new();
        for vnet in self.controller.list_vnets()? {
            for mut subnet in self.controller.list_subnets(&vnet.vnet)? {
                if subnet.vnet.is_empty() {
                    subnet.vnet = vnet.vnet.clone();
                }
                subnets.push(subnet);
            }
        }
        Ok(subnets)
    }

    fn read_ipset_entries(&self) -> Result<Vec<IpSetEntry>, ProviderError> {
        let mut entries = Vec::new();
        for ipset in self.controller.list_ipsets()? {
            for mut entry in self.controller.list_ipset_entries(&ipset.name)? {
                if entry.ipset.is_empty() {
                    entry.ipset = ipset.name.clone();
                }
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    /// Read every tracked collection; failed reads come back empty and
    /// are listed in the second element
    pub fn read_snapshot(&self) -> (Snapshot, Vec<ResourceKind>) {
        let mut unreadable = Vec::new();
        let snapshot = Snapshot {
            zones: degrade(ResourceKind::Zone, self.controller.list_zones(), &mut unreadable),
            vnets: degrade(ResourceKind::Vnet, self.controller.list_vnets(), &mut unreadable),
            subnets: degrade(ResourceKind::Subnet, self.read_subnets(), &mut unreadable),
            ipsets: degrade(ResourceKind::IpSet, self.controller.list_ipsets(), &mut unreadable),
            ipset_entries: degrade(ResourceKind::IpSetEntry, self.read_ipset_entries(), &mut unreadable),
            firewall_rules: degrade(ResourceKind::FirewallRule, self.controller.list_firewall_rules(), &mut unreadable),
            firewall_options: degrade(
                ResourceKind::FirewallOptions,
                self.controller.get_firewall_options(),
                &mut unreadable,
            ),
            host_firewall_options: degrade(
                ResourceKind::HostFirewallOptions,
                self.controller.get_host_firewall_options(),
                &mut unreadable,
            ),
            routes: degrade(ResourceKind::Route, self.routes.list_routes(), &mut unreadable),
        };
        (snapshot, unreadable)
    }

    /// Capture live state as the baseline. Fails if one already exists.
    pub fn capture_baseline(&self) -> Result<Baseline, ReconcileError> {
        if self.state()? == EngineState::BaselineCaptured {
            return Err(ReconcileError::BaselineAlreadyCaptured);
        }

        info!("Capturing baseline");
        let (snapshot, unreadable) = self.read_snapshot();
        let baseline = baseline::save_baseline(self.store, &snapshot, &unreadable)?;
        info!(
            "Baseline captured: {} zones, {} vnets, {} subnets, {} ipsets, {} rules, {} routes",
            snapshot.zones.len(),
            snapshot.vnets.len(),
            snapshot.subnets.len(),
            snapshot.ipsets.len(),
            snapshot.firewall_rules.len(),
            snapshot.routes.len()
        );
        Ok(baseline)
    }

    pub fn load_baseline(&self) -> Result<Baseline, ReconcileError> {
        baseline::load_baseline(self.store)?.ok_or(ReconcileError::NoBaseline)
    }

    /// Capture on first use, otherwise return the stored baseline
    pub fn ensure_baseline(&self) -> Result<Baseline, ReconcileError> {
        match self.state()? {
            EngineState::NoBaseline => self.capture_baseline(),
            EngineState::BaselineCaptured => {
                debug!("Baseline already captured, keeping it");
                self.load_baseline()
            }
        }
    }

    /// Delete everything live that the baseline does not contain and report
    /// baseline objects that are gone.
    ///
    /// Children are deleted before their parents. Individual failures are
    /// recorded and the pass continues.
    pub fn restore_to_baseline(&self, record: &ConfigurationRecord) -> Result<ReconciliationReport, ReconcileError> {
        let baseline = self.load_baseline()?;
        let base = &baseline.snapshot;
        let pool = record.vpn_pool.to_string();
        let mut report = ReconciliationReport::new();

        info!("Restoring controller state to baseline captured at {}", baseline.marker.captured_at);

        // Rules: highest position first so lower positions stay valid.
        report.collections.push(match self.controller.list_firewall_rules() {
            Ok(live) => {
                let mut diff = partition(&live, &base.firewall_rules, identity_of);
                diff.live_only.sort_by(|a, b| b.pos.cmp(&a.pos));
                self.delete_all(ResourceKind::FirewallRule, diff, |rule: &FirewallRule| {
                    self.controller.delete_firewall_rule_at(rule.pos)
                })
            }
            Err(e) => self.skip(ResourceKind::FirewallRule, e),
        });

        report.collections.push(match self.read_ipset_entries() {
            Ok(live) => {
                let diff = partition(&live, &base.ipset_entries, Identified::identity);
                self.delete_all(ResourceKind::IpSetEntry, diff, |entry: &IpSetEntry| {
                    self.controller.delete_ipset_entry(&entry.ipset, &entry.cidr)
                })
            }
            Err(e) => self.skip(ResourceKind::IpSetEntry, e),
        });

        report.collections.push(match self.controller.list_ipsets() {
            Ok(live) => {
                let diff = partition(&live, &base.ipsets, Identified::identity);
                self.delete_all(ResourceKind::IpSet, diff, |ipset| self.controller.delete_ipset(&ipset.name))
            }
            Err(e) => self.skip(ResourceKind::IpSet, e),
        });

        report.collections.push(match self.routes.list_routes() {
            Ok(live) => {
                let tracked: Vec<Route> = live.into_iter().filter(|r| is_tracked_route(r, &pool)).collect();
                let base_tracked: Vec<Route> =
                    base.routes.iter().filter(|r| is_tracked_route(r, &pool)).cloned().collect();
                let diff = partition(&tracked, &base_tracked, Identified::identity);
                self.delete_all(ResourceKind::Route, diff, |route: &Route| {
                    self.routes.delete_route(&route.destination)
                })
            }
            Err(e) => self.skip(ResourceKind::Route, e),
        });

        // Deleting the transit vnet takes its device and the pool route with
        // it, so the route is settled before any SDN object goes.
        report.pool_route = Some(self.reconcile_pool_route(&record.vpn_pool, &base.routes));

        let subnets = match self.read_subnets() {
            Ok(live) => {
                let diff = partition(&live, &base.subnets, Identified::identity);
                self.delete_all(ResourceKind::Subnet, diff, |subnet| self.controller.delete_subnet(subnet))
            }
            Err(e) => self.skip(ResourceKind::Subnet, e),
        };

        let vnets = match self.controller.list_vnets() {
            Ok(live) => {
                let diff = partition(&live, &base.vnets, Identified::identity);
                self.delete_all(ResourceKind::Vnet, diff, |vnet| self.controller.delete_vnet(&vnet.vnet))
            }
            Err(e) => self.skip(ResourceKind::Vnet, e),
        };

        let zones = match self.controller.list_zones() {
            Ok(live) => {
                let diff = partition(&live, &base.zones, Identified::identity);
                self.delete_all(ResourceKind::Zone, diff, |zone| self.controller.delete_zone(&zone.zone))
            }
            Err(e) => self.skip(ResourceKind::Zone, e),
        };

        let sdn_changed = subnets.deleted() + vnets.deleted() + zones.deleted() > 0;
        report.collections.extend([subnets, vnets, zones]);

        if sdn_changed {
            info!("Applying pending SDN changes");
            if let Err(e) = self.controller.apply_pending_changes() {
                error!("Failed to apply pending SDN changes: {}", e);
                report.commit_error = Some(e.to_string());
            }
        }

        report.settings.push(self.align_setting(ResourceKind::FirewallOptions, &base.firewall_options));
        report.settings.push(self.align_setting(ResourceKind::HostFirewallOptions, &base.host_firewall_options));

        info!(
            "Restore finished: {} deleted, {} failed, {} missing",
            report.deleted_count(),
            report.failed_count(),
            report.missing().len()
        );
        Ok(report)
    }

    fn skip(&self, kind: ResourceKind, e: ProviderError) -> CollectionReport {
        warn!("Failed to read live {}, skipping it: {}", kind.collection(), e);
        CollectionReport::skipped(kind, e)
    }

    fn delete_all<T: Identified>(
        &self,
        kind: ResourceKind,
        diff: Partition<T>,
        delete: impl Fn(&T) -> Result<(), ProviderError>,
    ) -> CollectionReport {
        let mut report = CollectionReport::new(kind);
        report.kept = diff.in_both.iter().map(Identified::identity).collect();

        for item in &diff.live_only {
            let identity = item.identity();
            let outcome = match delete(item) {
                Ok(()) => {
                    info!("Deleted {} {}", kind, identity);
                    DeleteOutcome::Deleted
                }
                Err(e) => {
                    error!("Failed to delete {} {}: {}", kind, identity, e);
                    DeleteOutcome::Failed(e.to_string())
                }
            };
            report.deletions.push(Deletion { identity, outcome });
        }

        for item in &diff.baseline_only {
            let identity = item.identity();
            warn!("{} {} is in the baseline but no longer present", kind, identity);
            report.missing.push(identity);
        }

        report
    }

    fn align_setting(&self, kind: ResourceKind, baseline: &FirewallOptions) -> SettingReport {
        let options = FirewallOptions::enabled(baseline.enable);
        let result = match kind {
            ResourceKind::HostFirewallOptions => self.controller.set_host_firewall_options(&options),
            _ => self.controller.set_firewall_options(&options),
        };
        let outcome = match result {
            Ok(()) => {
                debug!("Set {} enable={}", kind, u8::from(baseline.enable));
                SettingOutcome::Set(baseline.enable)
            }
            Err(e) => {
                error!("Failed to set {}: {}", kind, e);
                SettingOutcome::Failed(e.to_string())
            }
        };
        SettingReport { kind, outcome }
    }

    /// The pool return route is judged on its own against a fresh read
    fn reconcile_pool_route(&self, pool: &CidrBlock, baseline_routes: &[Route]) -> PoolRouteReport {
        let destination = pool.to_string();
        let in_baseline = baseline_routes.iter().any(|r| r.identity() == destination);

        let outcome = match self.routes.list_routes() {
            Err(e) => {
                warn!("Failed to read routes for the VPN pool route: {}", e);
                PoolRouteOutcome::ReadFailed(e.to_string())
            }
            Ok(live) => {
                let present = live.iter().find(|r| r.identity() == destination);
                match (in_baseline, present) {
                    (false, None) => PoolRouteOutcome::Absent,
                    (true, Some(_)) => PoolRouteOutcome::Present,
                    (true, None) => {
                        warn!("VPN pool route {} is in the baseline but no longer present", destination);
                        PoolRouteOutcome::Missing
                    }
                    (false, Some(route)) => match self.routes.delete_route(&route.destination) {
                        Ok(()) => {
                            info!("Deleted VPN pool route {}", destination);
                            PoolRouteOutcome::Deleted
                        }
                        Err(e) => {
                            error!("Failed to delete VPN pool route {}: {}", destination, e);
                            PoolRouteOutcome::DeleteFailed(e.to_string())
                        }
                    },
                }
            }
        };

        PoolRouteReport { destination, outcome }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::fixtures::sample_record;
    use crate::controller::{IpSet, MemoryController, MemoryRoutes, Vnet, Zone};
    use crate::reconcile::baseline::FileBaselineStore;
    use tempfile::TempDir;

    #[test]
    fn test_state_transitions() {
        let dir = TempDir::new().unwrap();
        let store = FileBaselineStore::new(dir.path());
        let controller = MemoryController::new();
        let routes = MemoryRoutes::new();
        let engine = ReconciliationEngine::new(&controller, &routes, &store);

        assert_eq!(engine.state().unwrap(), EngineState::NoBaseline);
        assert!(matches!(engine.load_baseline(), Err(ReconcileError::NoBaseline)));
        assert!(matches!(engine.restore_to_baseline(&sample_record()), Err(ReconcileError::NoBaseline)));

        engine.capture_baseline().unwrap();
        assert_eq!(engine.state().unwrap(), EngineState::BaselineCaptured);
        assert!(matches!(engine.capture_baseline(), Err(ReconcileError::BaselineAlreadyCaptured)));
    }

    #[test]
    fn test_capture_degrades_failed_reads() {
        let dir = TempDir::new().unwrap();
        let store = FileBaselineStore::new(dir.path());
        let controller = MemoryController::new();
        controller.create_zone(&Zone::simple("lab")).unwrap();
        controller.fail_reads(ResourceKind::FirewallRule);
        let routes = MemoryRoutes::new();
        routes.fail_reads(true);

        let engine = ReconciliationEngine::new(&controller, &routes, &store);
        let baseline = engine.capture_baseline().unwrap();
        assert_eq!(baseline.snapshot.zones.len(), 1);
        assert!(baseline.snapshot.firewall_rules.is_empty());
        assert_eq!(baseline.marker.unreadable, vec!["firewall_rules".to_string(), "routes".to_string()]);
    }

    #[test]
    fn test_subnets_deleted_before_vnets_and_committed() {
        let dir = TempDir::new().unwrap();
        let store = FileBaselineStore::new(dir.path());
        let controller = MemoryController::new();
        let routes = MemoryRoutes::new();
        let engine = ReconciliationEngine::new(&controller, &routes, &store);
        engine.capture_baseline().unwrap();

        controller.create_zone(&Zone::simple("fabric")).unwrap();
        controller.create_vnet(&Vnet::new("tnet1", "fabric")).unwrap();
        controller
            .create_subnet(&Subnet::new("tnet1", &"10.20.0.0/24".parse().unwrap(), None))
            .unwrap();
        controller.create_ipset(&IpSet::new("tnet1", None)).unwrap();
        controller
            .create_ipset_entry(&IpSetEntry::new("tnet1", &"10.20.0.0/24".parse().unwrap(), None))
            .unwrap();

        let report = engine.restore_to_baseline(&sample_record()).unwrap();
        assert_eq!(report.deleted_count(), 5, "{}", report);
        assert_eq!(report.failed_count(), 0);
        assert!(controller.state().zones.is_empty());
        assert!(controller.state().ipsets.is_empty());
        assert_eq!(controller.state().applied, 1);
    }

    #[test]
    fn test_tracked_route_filter() {
        let pool = "10.8.0.0/24";
        assert!(is_tracked_route(&Route::new("10.50.0.0/16", Some("192.168.1.254".into()), None), pool));
        assert!(!is_tracked_route(&Route::new("default", Some("192.168.1.1".into()), None), pool));
        assert!(!is_tracked_route(&Route::new("192.168.1.0/24", None, Some("vmbr0".into())), pool));
        assert!(!is_tracked_route(&Route::new("10.8.0.0/24", Some("10.99.0.2".into()), None), pool));
    }
}
