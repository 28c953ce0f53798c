//! Baseline persistence.
//!
//! A baseline is the set of controller collections captured before the
//! fabric was provisioned. Each collection is stored under its own key and
//! a completion marker is written last; a baseline without the marker does
//! not exist as far as the engine is concerned.

use chrono::{DateTime, Utc};
use log::debug;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::controller::{
    FirewallOptions, FirewallRule, IpSet, IpSetEntry, ResourceKind, Route, Subnet, Vnet, Zone,
};

pub const MARKER_FILE: &str = "baseline.complete";

#[derive(Debug, thiserror::Error)]
pub enum BaselineError {
    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to encode or decode baseline collection {collection}: {source}")]
    Serde {
        collection: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Baseline is marked complete but collection {collection} is missing")]
    Incomplete { collection: String },
}

/// Every tracked collection, as read from the controller and kernel
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub zones: Vec<Zone>,
    pub vnets: Vec<Vnet>,
    pub subnets: Vec<Subnet>,
    pub ipsets: Vec<IpSet>,
    pub ipset_entries: Vec<IpSetEntry>,
    pub firewall_rules: Vec<FirewallRule>,
    pub firewall_options: FirewallOptions,
    pub host_firewall_options: FirewallOptions,
    pub routes: Vec<Route>,
}

/// Contents of the completion marker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureMarker {
    pub captured_at: DateTime<Utc>,
    pub collections: Vec<String>,
    /// Collections whose read failed at capture time and were stored empty
    #[serde(default)]
    pub unreadable: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Baseline {
    pub marker: CaptureMarker,
    pub snapshot: Snapshot,
}

/// Durable storage keyed by collection name, plus the completion marker
pub trait BaselineStore {
    fn marker(&self) -> Result<Option<CaptureMarker>, BaselineError>;
    fn write_collection(&self, collection: &str, value: &Value) -> Result<(), BaselineError>;
    fn read_collection(&self, collection: &str) -> Result<Option<Value>, BaselineError>;
    fn mark_complete(&self, marker: &CaptureMarker) -> Result<(), BaselineError>;
    /// Remove the marker, then every collection
    fn reset(&self) -> Result<(), BaselineError>;

    fn is_complete(&self) -> Result<bool, BaselineError> {
        Ok(self.marker()?.is_some())
    }
}

fn encode<T: Serialize>(kind: ResourceKind, value: &T) -> Result<(ResourceKind, Value), BaselineError> {
    let value = serde_json::to_value(value)
        .map_err(|source| BaselineError::Serde { collection: kind.collection().to_string(), source })?;
    Ok((kind, value))
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> BaselineError {
    let path = path.to_path_buf();
    move |source| BaselineError::Io { path, source }
}

fn decode<T: DeserializeOwned>(
    store: &dyn BaselineStore,
    kind: ResourceKind,
) -> Result<T, BaselineError> {
    let collection = kind.collection();
    let value = store
        .read_collection(collection)?
        .ok_or_else(|| BaselineError::Incomplete { collection: collection.to_string() })?;
    serde_json::from_value(value)
        .map_err(|source| BaselineError::Serde { collection: collection.to_string(), source })
}

/// Write every collection of `snapshot`, then the marker
pub fn save_baseline(
    store: &dyn BaselineStore,
    snapshot: &Snapshot,
    unreadable: &[ResourceKind],
) -> Result<Baseline, BaselineError> {
    let collections = vec![
        encode(ResourceKind::Zone, &snapshot.zones)?,
        encode(ResourceKind::Vnet, &snapshot.vnets)?,
        encode(ResourceKind::Subnet, &snapshot.subnets)?,
        encode(ResourceKind::IpSet, &snapshot.ipsets)?,
        encode(ResourceKind::IpSetEntry, &snapshot.ipset_entries)?,
        encode(ResourceKind::FirewallRule, &snapshot.firewall_rules)?,
        encode(ResourceKind::FirewallOptions, &snapshot.firewall_options)?,
        encode(ResourceKind::HostFirewallOptions, &snapshot.host_firewall_options)?,
        encode(ResourceKind::Route, &snapshot.routes)?,
    ];

    for (kind, value) in &collections {
        store.write_collection(kind.collection(), value)?;
    }

    let marker = CaptureMarker {
        captured_at: Utc::now(),
        collections: collections.iter().map(|(kind, _)| kind.collection().to_string()).collect(),
        unreadable: unreadable.iter().map(|kind| kind.collection().to_string()).collect(),
    };
    store.mark_complete(&marker)?;

    Ok(Baseline { marker, snapshot: snapshot.clone() })
}

/// Load the stored baseline, `None` when no completed capture exists
pub fn load_baseline(store: &dyn BaselineStore) -> Result<Option<Baseline>, BaselineError> {
    let marker = match store.marker()? {
        Some(marker) => marker,
        None => return Ok(None),
    };

    let snapshot = Snapshot {
        zones: decode(store, ResourceKind::Zone)?,
        vnets: decode(store, ResourceKind::Vnet)?,
        subnets: decode(store, ResourceKind::Subnet)?,
        ipsets: decode(store, ResourceKind::IpSet)?,
        ipset_entries: decode(store, ResourceKind::IpSetEntry)?,
        firewall_rules: decode(store, ResourceKind::FirewallRule)?,
        firewall_options: decode(store, ResourceKind::FirewallOptions)?,
        host_firewall_options: decode(store, ResourceKind::HostFirewallOptions)?,
        routes: decode(store, ResourceKind::Route)?,
    };

    Ok(Some(Baseline { marker, snapshot }))
}

/// Baseline kept as JSON files in a state directory
#[derive(Debug, Clone)]
pub struct FileBaselineStore {
    dir: PathBuf,
}

impl FileBaselineStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileBaselineStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn collection_path(&self, collection: &str) -> PathBuf {
        self.dir.join(format!("{}.json", collection))
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(MARKER_FILE)
    }

    /// Write through a temp file and rename so readers never see a partial file
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), BaselineError> {
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;
        let temp_path = path.with_extension("tmp");
        let mut file = fs::File::create(&temp_path).map_err(io_error(&temp_path))?;
        file.write_all(bytes).map_err(io_error(&temp_path))?;
        file.sync_all().map_err(io_error(&temp_path))?;
        fs::rename(&temp_path, path).map_err(io_error(path))?;
        Ok(())
    }

    fn read_optional(&self, path: &Path) -> Result<Option<Vec<u8>>, BaselineError> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(BaselineError::Io { path: path.to_path_buf(), source }),
        }
    }

    fn remove_optional(&self, path: &Path) -> Result<(), BaselineError> {
        match fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(BaselineError::Io { path: path.to_path_buf(), source }),
        }
    }
}

impl BaselineStore for FileBaselineStore {
    fn marker(&self) -> Result<Option<CaptureMarker>, BaselineError> {
        let bytes = match self.read_optional(&self.marker_path())? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BaselineError::Serde { collection: MARKER_FILE.to_string(), source })
    }

    fn write_collection(&self, collection: &str, value: &Value) -> Result<(), BaselineError> {
        let bytes = serde_json::to_vec_pretty(value)
            .map_err(|source| BaselineError::Serde { collection: collection.to_string(), source })?;
        let path = self.collection_path(collection);
        debug!("Writing baseline collection {} to {:?}", collection, path);
        self.write_atomic(&path, &bytes)
    }

    fn read_collection(&self, collection: &str) -> Result<Option<Value>, BaselineError> {
        let bytes = match self.read_optional(&self.collection_path(collection))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| BaselineError::Serde { collection: collection.to_string(), source })
    }

    fn mark_complete(&self, marker: &CaptureMarker) -> Result<(), BaselineError> {
        let bytes = serde_json::to_vec_pretty(marker)
            .map_err(|source| BaselineError::Serde { collection: MARKER_FILE.to_string(), source })?;
        self.write_atomic(&self.marker_path(), &bytes)
    }

    fn reset(&self) -> Result<(), BaselineError> {
        self.remove_optional(&self.marker_path())?;
        for kind in ResourceKind::ALL {
            self.remove_optional(&self.collection_path(kind.collection()))?;
        }
        Ok(())
    }
}
