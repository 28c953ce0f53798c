use clap::{Parser, Subcommand};
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use env_logger::Env;
use log::info;
use std::path::{Path, PathBuf};

use netfabric::config::ConfigurationRecord;
use netfabric::config_loader;
use netfabric::controller::{IpRouteClient, PveshController};
use netfabric::ip::allocator::AddressClass;
use netfabric::ip::discovery::INTERFACES_PATH;
use netfabric::orchestrator::{self, Collaborators};
use netfabric::reconcile::{ApplyPolicy, FileBaselineStore};
use netfabric::utils::command::SystemRunner;

/// Plan, provision and restore a multi-tenant SDN network fabric
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Directory holding the captured baseline
    #[arg(long, global = true, default_value = "/var/lib/netfabric")]
    state_dir: PathBuf,

    /// Controller node name, used when no configuration file is given
    #[arg(long, global = true, default_value = "localhost")]
    node: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the address plan and check it against networks in use
    Plan {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Propose free blocks for several roles at once
    Propose {
        /// ROLE=PREFIX, e.g. transit=30
        #[arg(long = "request", value_parser = parse_request, required = true)]
        requests: Vec<(String, u8)>,
        /// Private class to search: 10, 172 or 192
        #[arg(long, default_value = "10")]
        class: AddressClass,
    },
    /// List networks currently in use
    Discover,
    /// Find one free block of the given prefix length
    FindBlock {
        #[arg(long)]
        prefix: u8,
        /// Private class to search: 10, 172 or 192
        #[arg(long, default_value = "192")]
        class: AddressClass,
    },
    /// Capture the baseline on first run, then create the fabric
    Apply {
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Inspect or manage the baseline
    Baseline {
        #[command(subcommand)]
        action: BaselineAction,
    },
    /// Delete everything created since the baseline
    Restore {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum BaselineAction {
    Capture,
    Status,
    Reset,
}

fn parse_request(text: &str) -> Result<(String, u8), String> {
    let (role, prefix) = text
        .split_once('=')
        .ok_or_else(|| format!("expected ROLE=PREFIX, got '{}'", text))?;
    let prefix: u8 = prefix
        .trim()
        .trim_start_matches('/')
        .parse()
        .map_err(|_| format!("invalid prefix length in '{}'", text))?;
    if prefix > 32 {
        return Err(format!("prefix length {} is larger than 32", prefix));
    }
    Ok((role.trim().to_string(), prefix))
}

fn load(config: &Path) -> Result<ConfigurationRecord> {
    config_loader::load_record(config)
        .wrap_err_with(|| format!("Failed to load configuration '{}'", config.display()))
}

fn loaded(record: &Option<ConfigurationRecord>) -> Result<&ConfigurationRecord> {
    record.as_ref().ok_or_else(|| eyre!("This command needs a configuration file"))
}

fn main() -> Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    // Parse command-line arguments
    let args = Args::parse();

    // Initialize logging with default filter level of "info"
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let record = match &args.command {
        Command::Plan { config } | Command::Apply { config } | Command::Restore { config } => Some(load(config)?),
        _ => None,
    };
    let node = record.as_ref().map_or(args.node.as_str(), |r| r.node.as_str());
    info!("Using node {} and state directory {:?}", node, args.state_dir);

    let runner = SystemRunner;
    let controller = PveshController::new(&runner, node);
    let routes = IpRouteClient::new(&runner);
    let store = FileBaselineStore::new(&args.state_dir);
    let fabric = Collaborators {
        controller: &controller,
        inventory: &controller,
        routes: &routes,
        runner: &runner,
        store: &store,
        interfaces_path: PathBuf::from(INTERFACES_PATH),
    };

    match &args.command {
        Command::Plan { .. } => {
            orchestrator::plan_fabric(loaded(&record)?, &fabric)?;
        }
        Command::Apply { .. } => {
            orchestrator::apply_fabric(loaded(&record)?, &fabric, &ApplyPolicy::default())?;
        }
        Command::Restore { .. } => {
            orchestrator::restore(loaded(&record)?, &fabric)?;
        }
        Command::Propose { requests, class } => {
            orchestrator::propose(&fabric, requests, *class)?;
        }
        Command::Discover => {
            orchestrator::discover_networks(&fabric);
        }
        Command::FindBlock { prefix, class } => {
            orchestrator::find_block(&fabric, *prefix, *class)?;
        }
        Command::Baseline { action } => match action {
            BaselineAction::Capture => orchestrator::capture_baseline(&fabric)?,
            BaselineAction::Status => {
                orchestrator::baseline_status(&fabric)?;
            }
            BaselineAction::Reset => orchestrator::reset_baseline(&fabric)?,
        },
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let args = Args::parse_from(&["netfabric", "apply", "--config", "fabric.env"]);

        assert_eq!(args.state_dir, PathBuf::from("/var/lib/netfabric"));
        match args.command {
            Command::Apply { config } => assert_eq!(config, PathBuf::from("fabric.env")),
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_state_dir() {
        let args = Args::parse_from(&["netfabric", "baseline", "status", "--state-dir", "/tmp/fabric"]);
        assert_eq!(args.state_dir, PathBuf::from("/tmp/fabric"));
        assert!(matches!(args.command, Command::Baseline { action: BaselineAction::Status }));
    }

    #[test]
    fn test_propose_requests() {
        let args = Args::parse_from(&[
            "netfabric",
            "propose",
            "--request",
            "transit=30",
            "--request",
            "tenants=/21",
            "--class",
            "172",
        ]);
        match args.command {
            Command::Propose { requests, class } => {
                assert_eq!(requests, vec![("transit".to_string(), 30), ("tenants".to_string(), 21)]);
                assert_eq!(class, AddressClass::OneSevenTwo);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_bad_arguments_rejected() {
        assert!(Args::try_parse_from(&["netfabric", "propose", "--request", "transit=40"]).is_err());
        assert!(Args::try_parse_from(&["netfabric", "find-block", "--prefix", "24", "--class", "11"]).is_err());
        assert!(Args::try_parse_from(&["netfabric", "plan"]).is_err());
    }
}
