//! Kernel routing table via iproute2.

use log::debug;

use super::types::Route;
use super::{ProviderError, RouteClient};
use crate::utils::command::CommandRunner;

pub struct IpRouteClient<'a> {
    runner: &'a dyn CommandRunner,
}

impl<'a> IpRouteClient<'a> {
    pub fn new(runner: &'a dyn CommandRunner) -> Self {
        IpRouteClient { runner }
    }
}

impl RouteClient for IpRouteClient<'_> {
    fn list_routes(&self) -> Result<Vec<Route>, ProviderError> {
        let output = self.runner.run("ip", &["-j", "-4", "route", "show"])?;
        let trimmed = output.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).map_err(|e| ProviderError::Decode {
            what: "kernel routes".to_string(),
            message: e.to_string(),
        })
    }

    fn add_route(&self, destination: &str, via: Option<&str>, device: Option<&str>) -> Result<(), ProviderError> {
        let mut args = vec!["route", "add", destination];
        if let Some(via) = via {
            args.extend(["via", via]);
        }
        if let Some(device) = device {
            args.extend(["dev", device]);
        }
        debug!("Adding route {}", destination);
        self.runner.run("ip", &args)?;
        Ok(())
    }

    fn delete_route(&self, destination: &str) -> Result<(), ProviderError> {
        self.runner.run("ip", &["route", "del", destination])?;
        Ok(())
    }
}
