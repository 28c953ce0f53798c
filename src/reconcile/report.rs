//! Outcome of a restore pass.

use serde::Serialize;
use std::fmt;

use crate::controller::ResourceKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Deleted,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deletion {
    pub identity: String,
    pub outcome: DeleteOutcome,
}

/// Partition and deletion results for one collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CollectionReport {
    pub kind: ResourceKind,
    /// Identities present both live and in the baseline
    pub kept: Vec<String>,
    pub deletions: Vec<Deletion>,
    /// Baseline identities absent from live state
    pub missing: Vec<String>,
    /// Set when the live read failed and the collection was skipped
    pub read_error: Option<String>,
}

impl CollectionReport {
    pub fn new(kind: ResourceKind) -> Self {
        CollectionReport { kind, kept: Vec::new(), deletions: Vec::new(), missing: Vec::new(), read_error: None }
    }

    pub fn skipped(kind: ResourceKind, error: impl ToString) -> Self {
        CollectionReport { read_error: Some(error.to_string()), ..Self::new(kind) }
    }

    pub fn deleted(&self) -> usize {
        self.deletions.iter().filter(|d| d.outcome == DeleteOutcome::Deleted).count()
    }

    pub fn failed(&self) -> usize {
        self.deletions.len() - self.deleted()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum SettingOutcome {
    Set(bool),
    Failed(String),
}

/// Result of aligning one firewall enablement flag
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettingReport {
    pub kind: ResourceKind,
    pub outcome: SettingOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum PoolRouteOutcome {
    /// Not in the baseline and not present
    Absent,
    /// In the baseline and still present
    Present,
    /// Not in the baseline, removed
    Deleted,
    DeleteFailed(String),
    /// In the baseline but no longer present; never re-added
    Missing,
    ReadFailed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolRouteReport {
    pub destination: String,
    pub outcome: PoolRouteOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub collections: Vec<CollectionReport>,
    /// Error from committing SDN deletions, the only required step
    pub commit_error: Option<String>,
    pub settings: Vec<SettingReport>,
    pub pool_route: Option<PoolRouteReport>,
}

impl ReconciliationReport {
    pub fn new() -> Self {
        ReconciliationReport { collections: Vec::new(), commit_error: None, settings: Vec::new(), pool_route: None }
    }

    pub fn collection(&self, kind: ResourceKind) -> Option<&CollectionReport> {
        self.collections.iter().find(|c| c.kind == kind)
    }

    pub fn deleted_count(&self) -> usize {
        let routes = matches!(self.pool_route.as_ref().map(|r| &r.outcome), Some(PoolRouteOutcome::Deleted));
        self.collections.iter().map(CollectionReport::deleted).sum::<usize>() + usize::from(routes)
    }

    pub fn failed_count(&self) -> usize {
        let routes = matches!(
            self.pool_route.as_ref().map(|r| &r.outcome),
            Some(PoolRouteOutcome::DeleteFailed(_))
        );
        self.collections.iter().map(CollectionReport::failed).sum::<usize>() + usize::from(routes)
    }

    /// Every missing baseline identity with its collection
    pub fn missing(&self) -> Vec<(ResourceKind, String)> {
        let mut missing: Vec<(ResourceKind, String)> = self
            .collections
            .iter()
            .flat_map(|c| c.missing.iter().map(move |identity| (c.kind, identity.clone())))
            .collect();
        if let Some(route) = &self.pool_route {
            if route.outcome == PoolRouteOutcome::Missing {
                missing.push((ResourceKind::Route, route.destination.clone()));
            }
        }
        missing
    }

    /// Collections that could not be read and were skipped
    pub fn skipped(&self) -> Vec<ResourceKind> {
        self.collections.iter().filter(|c| c.read_error.is_some()).map(|c| c.kind).collect()
    }

    /// True when a step that must succeed failed
    pub fn has_required_failure(&self) -> bool {
        self.commit_error.is_some()
    }
}

impl Default for ReconciliationReport {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ReconciliationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for collection in &self.collections {
            if let Some(error) = &collection.read_error {
                writeln!(f, "{}: skipped, read failed: {}", collection.kind.collection(), error)?;
                continue;
            }
            for deletion in &collection.deletions {
                match &deletion.outcome {
                    DeleteOutcome::Deleted => writeln!(f, "{} {}: deleted", collection.kind, deletion.identity)?,
                    DeleteOutcome::Failed(reason) => {
                        writeln!(f, "{} {}: delete failed: {}", collection.kind, deletion.identity, reason)?
                    }
                }
            }
            for identity in &collection.missing {
                writeln!(f, "{} {}: missing from baseline", collection.kind, identity)?;
            }
        }

        if let Some(error) = &self.commit_error {
            writeln!(f, "apply pending changes: failed: {}", error)?;
        }

        for setting in &self.settings {
            match &setting.outcome {
                SettingOutcome::Set(enable) => writeln!(f, "{}: enable set to {}", setting.kind, u8::from(*enable))?,
                SettingOutcome::Failed(reason) => writeln!(f, "{}: set failed: {}", setting.kind, reason)?,
            }
        }

        if let Some(route) = &self.pool_route {
            let status = match &route.outcome {
                PoolRouteOutcome::Absent => "absent".to_string(),
                PoolRouteOutcome::Present => "present".to_string(),
                PoolRouteOutcome::Deleted => "deleted".to_string(),
                PoolRouteOutcome::DeleteFailed(reason) => format!("delete failed: {}", reason),
                PoolRouteOutcome::Missing => "missing from baseline".to_string(),
                PoolRouteOutcome::ReadFailed(reason) => format!("read failed: {}", reason),
            };
            writeln!(f, "VPN pool route {}: {}", route.destination, status)?;
        }

        write!(
            f,
            "{} deleted, {} failed, {} missing",
            self.deleted_count(),
            self.failed_count(),
            self.missing().len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_lines() {
        let mut report = ReconciliationReport::new();
        let mut rules = CollectionReport::new(ResourceKind::FirewallRule);
        rules.deletions.push(Deletion {
            identity: "forward DROP source=+tnet1 dest=+fabric_lan".to_string(),
            outcome: DeleteOutcome::Deleted,
        });
        rules.deletions.push(Deletion {
            identity: "forward DROP source=+tnet2 dest=+fabric_lan".to_string(),
            outcome: DeleteOutcome::Failed("timeout".to_string()),
        });
        report.collections.push(rules);

        let mut zones = CollectionReport::new(ResourceKind::Zone);
        zones.missing.push("lab".to_string());
        report.collections.push(zones);
        report.collections.push(CollectionReport::skipped(ResourceKind::Route, "no permission"));
        report.pool_route = Some(PoolRouteReport {
            destination: "10.8.0.0/24".to_string(),
            outcome: PoolRouteOutcome::Deleted,
        });

        let text = report.to_string();
        assert!(text.contains("firewall rule forward DROP source=+tnet1 dest=+fabric_lan: deleted"));
        assert!(text.contains("source=+tnet2 dest=+fabric_lan: delete failed: timeout"));
        assert!(text.contains("zone lab: missing from baseline"));
        assert!(text.contains("routes: skipped, read failed: no permission"));
        assert!(text.ends_with("2 deleted, 1 failed, 1 missing"));
        assert_eq!(report.skipped(), vec![ResourceKind::Route]);
        assert!(!report.has_required_failure());
    }
}
