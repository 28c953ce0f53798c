//! Baseline capture, apply and restore against in-memory collaborators.

use std::collections::BTreeMap;

use netfabric::config::ConfigurationRecord;
use netfabric::controller::{
    ControllerClient, FirewallOptions, FirewallRule, IpSet, IpSetEntry, MemoryController, MemoryRoutes,
    ResourceKind, RouteClient, Subnet, Vnet, Zone,
};
use netfabric::ip::cidr::parse_cidr;
use netfabric::plan::NetworkPlan;
use netfabric::reconcile::report::{DeleteOutcome, PoolRouteOutcome};
use netfabric::reconcile::{
    apply_desired_state, ApplyPolicy, ApplyReport, BaselineStore, DesiredState, EngineState, FileBaselineStore,
    ReconcileError, ReconciliationEngine, ReconciliationReport,
};
use tempfile::TempDir;

fn record() -> ConfigurationRecord {
    let values: BTreeMap<String, String> = [
        ("LAN_CIDR", "192.168.1.0/24"),
        ("LAN_GATEWAY", "192.168.1.1"),
        ("TENANT_COUNT", "4"),
        ("VPN_TRANSIT_CIDR", "10.99.0.0/30"),
        ("VPN_POOL_CIDR", "10.8.0.0/24"),
        ("TENANT_NETWORK_CIDR", "10.20.0.0/22"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect();
    ConfigurationRecord::from_map(values).unwrap()
}

/// Controller and routing table with some pre-existing objects
fn preexisting() -> (MemoryController, MemoryRoutes) {
    let controller = MemoryController::new();
    controller.create_zone(&Zone::simple("lab")).unwrap();
    controller.create_vnet(&Vnet::new("labnet", "lab")).unwrap();
    controller
        .create_subnet(&Subnet::new("labnet", &parse_cidr("10.50.0.0/24").unwrap(), Some("10.50.0.1".into())))
        .unwrap();
    controller.create_ipset(&IpSet::new("mgmt", None)).unwrap();
    controller
        .create_ipset_entry(&IpSetEntry::new("mgmt", &parse_cidr("192.168.1.10/32").unwrap(), None))
        .unwrap();
    controller
        .create_firewall_rule(&FirewallRule::new("in", "ACCEPT").comment("ssh"))
        .unwrap();
    controller.set_firewall_options(&FirewallOptions::enabled(true)).unwrap();

    let routes = MemoryRoutes::new();
    routes.add_route("10.60.0.0/16", Some("192.168.1.254"), None).unwrap();
    routes.add_route("192.168.1.0/24", None, Some("vmbr0")).unwrap();
    (controller, routes)
}

fn apply(controller: &MemoryController, routes: &MemoryRoutes, record: &ConfigurationRecord) -> ApplyReport {
    let plan = NetworkPlan::build(record).unwrap();
    let desired = DesiredState::from_plan(&plan, record);
    apply_desired_state(controller, routes, &desired, &ApplyPolicy::default()).unwrap()
}

fn deleted(report: &ReconciliationReport) -> Vec<(ResourceKind, String)> {
    let mut deleted: Vec<(ResourceKind, String)> = report
        .collections
        .iter()
        .flat_map(|c| {
            c.deletions
                .iter()
                .filter(|d| d.outcome == DeleteOutcome::Deleted)
                .map(move |d| (c.kind, d.identity.clone()))
        })
        .collect();
    if let Some(route) = &report.pool_route {
        if route.outcome == PoolRouteOutcome::Deleted {
            deleted.push((ResourceKind::Route, route.destination.clone()));
        }
    }
    deleted.sort();
    deleted
}

#[test]
fn test_apply_twice_creates_nothing_new() {
    let (controller, routes) = preexisting();
    let record = record();

    let first = apply(&controller, &routes, &record);
    let second = apply(&controller, &routes, &record);

    assert!(!first.created.is_empty());
    assert!(second.created.is_empty());
    assert!(second.skipped.is_empty());
    assert_eq!(controller.state().rules.len(), first.created_count(ResourceKind::FirewallRule) + 1);
    assert_eq!(routes.routes().len(), 3);
}

#[test]
fn test_baseline_is_never_overwritten() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);

    let original = engine.ensure_baseline().unwrap();
    let zones_file = std::fs::read(dir.path().join("zones.json")).unwrap();

    apply(&controller, &routes, &record());

    assert!(matches!(engine.capture_baseline(), Err(ReconcileError::BaselineAlreadyCaptured)));
    let again = engine.ensure_baseline().unwrap();
    assert_eq!(again.snapshot, original.snapshot);
    assert_eq!(again.marker.captured_at, original.marker.captured_at);
    assert_eq!(std::fs::read(dir.path().join("zones.json")).unwrap(), zones_file);
    assert_eq!(engine.state().unwrap(), EngineState::BaselineCaptured);
}

#[test]
fn test_restore_from_superset_deletes_exactly_the_extras() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    let applied = apply(&controller, &routes, &record);
    let mut created = applied.created.clone();
    created.sort();

    let report = engine.restore_to_baseline(&record).unwrap();
    assert_eq!(deleted(&report), created);
    assert!(report.missing().is_empty(), "{}", report);
    assert_eq!(report.failed_count(), 0);

    let state = controller.state();
    assert_eq!(state.zones, vec![Zone::simple("lab")]);
    assert_eq!(state.vnets.len(), 1);
    assert_eq!(state.subnets.len(), 1);
    assert_eq!(state.ipsets.len(), 1);
    assert_eq!(state.ipset_entries.len(), 1);
    assert_eq!(state.rules.len(), 1);
    assert_eq!(state.rules[0].comment.as_deref(), Some("ssh"));
    assert!(state.applied >= 2);
    assert_eq!(routes.routes().len(), 2);
}

#[test]
fn test_restore_from_subset_reports_missing_and_deletes_nothing() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    {
        let mut state = controller.state_mut();
        state.subnets.clear();
        state.vnets.clear();
        state.ipset_entries.clear();
    }
    routes.delete_route("10.60.0.0/16").unwrap();

    let report = engine.restore_to_baseline(&record).unwrap();
    assert!(deleted(&report).is_empty(), "{}", report);

    let mut missing = report.missing();
    missing.sort();
    assert_eq!(
        missing,
        vec![
            (ResourceKind::Vnet, "labnet".to_string()),
            (ResourceKind::Subnet, "labnet/10.50.0.0/24".to_string()),
            (ResourceKind::IpSetEntry, "mgmt/192.168.1.10/32".to_string()),
            (ResourceKind::Route, "10.60.0.0/16".to_string()),
        ]
    );

    // Never recreated.
    assert!(controller.state().vnets.is_empty());
    assert!(routes.routes().iter().all(|r| r.destination != "10.60.0.0/16"));
    assert!(report.to_string().contains("vnet labnet: missing from baseline"));
}

#[test]
fn test_delete_failures_do_not_stop_the_pass() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();
    apply(&controller, &routes, &record);

    controller.fail_delete(ResourceKind::Vnet, "tnet2");
    controller.fail_delete(ResourceKind::IpSetEntry, "fabric_vpn/10.8.0.0/24");

    let report = engine.restore_to_baseline(&record).unwrap();

    // tnet2 stays, so the zone holding it cannot go either; fabric_vpn keeps
    // its entry, so the set stays too.
    let failed: Vec<(ResourceKind, String)> = report
        .collections
        .iter()
        .flat_map(|c| {
            c.deletions
                .iter()
                .filter(|d| d.outcome != DeleteOutcome::Deleted)
                .map(move |d| (c.kind, d.identity.clone()))
        })
        .collect();
    assert_eq!(
        failed,
        vec![
            (ResourceKind::IpSetEntry, "fabric_vpn/10.8.0.0/24".to_string()),
            (ResourceKind::IpSet, "fabric_vpn".to_string()),
            (ResourceKind::Vnet, "tnet2".to_string()),
            (ResourceKind::Zone, "fabric".to_string()),
        ]
    );

    let state = controller.state();
    assert_eq!(state.vnets.iter().map(|v| v.vnet.as_str()).collect::<Vec<_>>(), vec!["labnet", "tnet2"]);
    assert_eq!(state.rules.len(), 1);
    assert!(state.subnets.iter().all(|s| s.vnet == "labnet"));
    assert!(report.to_string().contains("vnet tnet2: delete failed"));
    assert!(!report.has_required_failure());
}

#[test]
fn test_unreadable_collection_is_skipped_during_restore() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();
    apply(&controller, &routes, &record);

    controller.fail_reads(ResourceKind::FirewallRule);
    let report = engine.restore_to_baseline(&record).unwrap();

    assert_eq!(report.skipped(), vec![ResourceKind::FirewallRule]);
    assert!(report.missing().is_empty());
    assert!(controller.state().rules.len() > 1);
    assert_eq!(controller.state().vnets.len(), 1);
}

#[test]
fn test_duplicate_rules_beyond_baseline_are_deleted() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    let rule = FirewallRule::new("in", "ACCEPT").comment("ssh");
    controller.create_firewall_rule(&rule).unwrap();
    controller.create_firewall_rule(&rule).unwrap();
    assert_eq!(controller.state().rules.len(), 3);

    let report = engine.restore_to_baseline(&record()).unwrap();
    assert_eq!(report.collection(ResourceKind::FirewallRule).unwrap().deleted(), 2);
    assert_eq!(controller.state().rules.len(), 1);
}

#[test]
fn test_firewall_flags_aligned_to_baseline() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    controller.set_firewall_options(&FirewallOptions::enabled(false)).unwrap();
    controller.set_host_firewall_options(&FirewallOptions::enabled(true)).unwrap();

    let report = engine.restore_to_baseline(&record()).unwrap();
    assert_eq!(report.settings.len(), 2);
    assert!(controller.get_firewall_options().unwrap().enable);
    assert!(!controller.get_host_firewall_options().unwrap().enable);
}

#[test]
fn test_pool_route_in_baseline_is_reported_not_readded() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    routes.add_route("10.8.0.0/24", Some("10.99.0.2"), Some("vpntr")).unwrap();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    routes.delete_route("10.8.0.0/24").unwrap();
    let report = engine.restore_to_baseline(&record).unwrap();

    let pool = report.pool_route.as_ref().unwrap();
    assert_eq!(pool.outcome, PoolRouteOutcome::Missing);
    assert_eq!(report.missing(), vec![(ResourceKind::Route, "10.8.0.0/24".to_string())]);
    assert!(routes.routes().iter().all(|r| r.destination != "10.8.0.0/24"));
}

#[test]
fn test_pool_route_not_in_baseline_is_deleted() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    routes.add_route("10.8.0.0/24", Some("10.99.0.2"), Some("vpntr")).unwrap();
    let report = engine.restore_to_baseline(&record).unwrap();

    assert_eq!(report.pool_route.as_ref().unwrap().outcome, PoolRouteOutcome::Deleted);
    // Handled by the singleton step only, not as a tracked route.
    assert_eq!(report.collection(ResourceKind::Route).unwrap().deletions.len(), 0);
    assert_eq!(routes.routes().len(), 2);
}

#[test]
fn test_pool_route_removed_before_transit_vnet() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    // The pool route sits on the transit vnet's device and vanishes with it.
    controller.link_routes(&routes);
    let record = record();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();

    let applied = apply(&controller, &routes, &record);
    assert!(applied.created.contains(&(ResourceKind::Route, "10.8.0.0/24".to_string())));
    let mut created = applied.created.clone();
    created.sort();

    let report = engine.restore_to_baseline(&record).unwrap();
    assert_eq!(report.pool_route.as_ref().unwrap().outcome, PoolRouteOutcome::Deleted, "{}", report);
    assert_eq!(deleted(&report), created);
    assert!(report.to_string().contains("VPN pool route 10.8.0.0/24: deleted"));
    assert_eq!(routes.routes().len(), 2);
}

#[test]
fn test_report_lists_kept_identities() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();
    apply(&controller, &routes, &record());

    let report = engine.restore_to_baseline(&record()).unwrap();
    assert_eq!(report.collection(ResourceKind::Zone).unwrap().kept, vec!["lab".to_string()]);
    assert_eq!(
        report.collection(ResourceKind::IpSetEntry).unwrap().kept,
        vec!["mgmt/192.168.1.10/32".to_string()]
    );
    assert_eq!(
        report.collection(ResourceKind::FirewallRule).unwrap().kept,
        vec!["in ACCEPT comment=ssh".to_string()]
    );
    assert_eq!(report.collection(ResourceKind::Route).unwrap().kept, vec!["10.60.0.0/16".to_string()]);
}

#[test]
fn test_capture_after_reset_starts_over() {
    let dir = TempDir::new().unwrap();
    let store = FileBaselineStore::new(dir.path());
    let (controller, routes) = preexisting();
    let engine = ReconciliationEngine::new(&controller, &routes, &store);
    engine.capture_baseline().unwrap();
    apply(&controller, &routes, &record());

    store.reset().unwrap();
    assert_eq!(engine.state().unwrap(), EngineState::NoBaseline);
    let fresh = engine.capture_baseline().unwrap();
    assert_eq!(fresh.snapshot.zones.len(), 2);
}
