//! High-level flows behind the command line.
//!
//! Each function wires the library pieces together for one command and
//! adds context to errors on the way out.

use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use log::{info, warn};
use std::path::PathBuf;

use crate::config::ConfigurationRecord;
use crate::controller::{ControllerClient, GuestInventory, RouteClient};
use crate::ip::allocator::{AddressClass, NetworkAllocator};
use crate::ip::cidr::CidrBlock;
use crate::ip::discovery::{
    ControllerSubnetSource, ExistingNetworkSet, GuestMetadataSource, InterfaceAddressSource, KernelRouteSource,
    NeighborCacheSource, StaticInterfacesSource,
};
use crate::plan::NetworkPlan;
use crate::reconcile::{
    apply_desired_state, ApplyPolicy, ApplyReport, BaselineStore, DesiredState, EngineState,
    ReconciliationEngine, ReconciliationReport,
};
use crate::utils::command::CommandRunner;

/// Everything the flows read from or write to
pub struct Collaborators<'a> {
    pub controller: &'a dyn ControllerClient,
    pub inventory: &'a dyn GuestInventory,
    pub routes: &'a dyn RouteClient,
    pub runner: &'a dyn CommandRunner,
    pub store: &'a dyn BaselineStore,
    pub interfaces_path: PathBuf,
}

impl<'a> Collaborators<'a> {
    /// Allocator over every discovery source, in priority order
    pub fn allocator(&self) -> NetworkAllocator<'a> {
        NetworkAllocator::new()
            .with_source(StaticInterfacesSource::new(&self.interfaces_path))
            .with_source(ControllerSubnetSource::new(self.controller))
            .with_source(KernelRouteSource::new(self.routes))
            .with_source(InterfaceAddressSource::new(self.runner))
            .with_source(NeighborCacheSource::new(self.runner))
            .with_source(GuestMetadataSource::new(self.inventory))
    }

    pub fn engine(&self) -> ReconciliationEngine<'a> {
        ReconciliationEngine::new(self.controller, self.routes, self.store)
    }
}

/// Build the plan for `record` and warn about blocks already in use
pub fn plan_fabric(record: &ConfigurationRecord, fabric: &Collaborators) -> Result<NetworkPlan> {
    let plan = NetworkPlan::build(record).wrap_err("Failed to build the network plan")?;

    let existing = fabric.allocator().discover_existing_networks();
    let conflicts = plan.conflicts(&existing);
    for conflict in &conflicts {
        warn!("{} {} overlaps existing network {}", conflict.role, conflict.block, conflict.existing);
    }
    if conflicts.is_empty() {
        info!("No planned block overlaps the {} discovered networks", existing.len());
    }

    let rendered = serde_yaml::to_string(&plan).wrap_err("Failed to render the plan")?;
    println!("{}", rendered);
    Ok(plan)
}

pub fn discover_networks(fabric: &Collaborators) -> ExistingNetworkSet {
    let existing = fabric.allocator().discover_existing_networks();
    for block in existing.blocks() {
        println!("{}", block);
    }
    info!("Discovered {} networks in use", existing.len());
    existing
}

pub fn find_block(fabric: &Collaborators, prefix: u8, class: AddressClass) -> Result<CidrBlock> {
    let block = fabric
        .allocator()
        .find_available_block(prefix, class)
        .wrap_err_with(|| format!("No free /{} block in {}", prefix, class))?;
    println!("{}", block);
    Ok(block)
}

pub fn propose(fabric: &Collaborators, requests: &[(String, u8)], class: AddressClass) -> Result<Vec<(String, CidrBlock)>> {
    let proposals = fabric
        .allocator()
        .propose_blocks(requests, class)
        .wrap_err("Failed to propose blocks")?;
    for (role, block) in &proposals {
        println!("{}: {}", role, block);
    }
    Ok(proposals)
}

/// Record the baseline if this is the first run, then create the fabric
pub fn apply_fabric(record: &ConfigurationRecord, fabric: &Collaborators, policy: &ApplyPolicy) -> Result<ApplyReport> {
    let plan = NetworkPlan::build(record).wrap_err("Failed to build the network plan")?;

    let baseline = fabric
        .engine()
        .ensure_baseline()
        .wrap_err("Failed to establish the pre-provisioning baseline")?;
    info!("Using baseline captured at {}", baseline.marker.captured_at);

    let desired = DesiredState::from_plan(&plan, record);
    let report = apply_desired_state(fabric.controller, fabric.routes, &desired, policy)
        .wrap_err("Failed to create a required fabric object")?;

    for skipped in &report.skipped {
        println!("skipped {} {}: {}", skipped.kind, skipped.identity, skipped.reason);
    }
    println!(
        "{} created, {} already present, {} skipped",
        report.created.len(),
        report.existing.len(),
        report.skipped.len()
    );
    Ok(report)
}

pub fn capture_baseline(fabric: &Collaborators) -> Result<()> {
    let baseline = fabric.engine().capture_baseline().wrap_err("Failed to capture the baseline")?;
    println!("Baseline captured at {}", baseline.marker.captured_at);
    if !baseline.marker.unreadable.is_empty() {
        println!("Recorded as empty after failed reads: {}", baseline.marker.unreadable.join(", "));
    }
    Ok(())
}

pub fn baseline_status(fabric: &Collaborators) -> Result<EngineState> {
    let engine = fabric.engine();
    let state = engine.state().wrap_err("Failed to read the baseline store")?;
    match state {
        EngineState::NoBaseline => println!("No baseline captured"),
        EngineState::BaselineCaptured => {
            let baseline = engine.load_baseline().wrap_err("Failed to load the baseline")?;
            println!("Baseline captured at {}", baseline.marker.captured_at);
            for collection in &baseline.marker.collections {
                println!("  {}", collection);
            }
        }
    }
    Ok(state)
}

pub fn reset_baseline(fabric: &Collaborators) -> Result<()> {
    warn!("Resetting the baseline; the next apply will capture a new one");
    fabric.store.reset().wrap_err("Failed to reset the baseline store")?;
    Ok(())
}

/// Restore to the baseline. Delete failures are reported, not raised; only
/// a failed commit of SDN changes makes this an error.
pub fn restore(record: &ConfigurationRecord, fabric: &Collaborators) -> Result<ReconciliationReport> {
    let report = fabric
        .engine()
        .restore_to_baseline(record)
        .wrap_err("Failed to restore the baseline")?;
    println!("{}", report);
    if report.has_required_failure() {
        return Err(eyre!("Restore could not commit SDN changes"));
    }
    Ok(report)
}
