//! Device snapshots that survive a restart

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use onvif_discovery::DeviceIdentity;
use onvif_stream::{route_key, SubscriptionRecord};
use soap_client::{AuthState, ServiceEndpoints};

use crate::config::CACHE_DIR_NAME;
use crate::error::Result;

/// What is kept for a device between runs.
///
/// A stale `subscription` is released on the next start; it is never
/// resumed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub identity: DeviceIdentity,
    #[serde(default)]
    pub auth: Option<AuthState>,
    #[serde(default)]
    pub subscription: Option<SubscriptionRecord>,
    #[serde(default)]
    pub endpoints: Option<ServiceEndpoints>,
}

impl DeviceSnapshot {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            auth: None,
            subscription: None,
            endpoints: None,
        }
    }

    pub fn urn(&self) -> &str {
        &self.identity.urn
    }
}

/// Storage backend for device snapshots
pub trait PersistStore: Send + Sync {
    fn load(&self, urn: &str) -> Result<Option<DeviceSnapshot>>;
    fn save(&self, snapshot: &DeviceSnapshot) -> Result<()>;
    fn remove(&self, urn: &str) -> Result<()>;
    fn load_all(&self) -> Result<Vec<DeviceSnapshot>>;
}

/// One JSON file per device in a directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<cache dir>/onvif-sdk`, if the platform has a cache directory
    pub fn default_location() -> Option<PathBuf> {
        dirs::cache_dir().map(|dir| dir.join(CACHE_DIR_NAME))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, urn: &str) -> PathBuf {
        self.dir.join(format!("{}.json", route_key(urn)))
    }

    fn read(path: &Path) -> Result<DeviceSnapshot> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }
}

impl PersistStore for JsonFileStore {
    fn load(&self, urn: &str) -> Result<Option<DeviceSnapshot>> {
        let path = self.path_for(urn);
        if !path.exists() {
            return Ok(None);
        }
        let snapshot = Self::read(&path)?;
        // Sanitized names can collide
        if snapshot.urn() != urn {
            return Ok(None);
        }
        Ok(Some(snapshot))
    }

    fn save(&self, snapshot: &DeviceSnapshot) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(snapshot.urn());
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(snapshot)?)?;
        fs::rename(&tmp, &path)?;
        debug!(urn = snapshot.urn(), path = %path.display(), "Saved device snapshot");
        Ok(())
    }

    fn remove(&self, urn: &str) -> Result<()> {
        let path = self.path_for(urn);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn load_all(&self) -> Result<Vec<DeviceSnapshot>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }

        let mut snapshots = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match Self::read(&path) {
                Ok(snapshot) => snapshots.push(snapshot),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot"),
            }
        }
        snapshots.sort_by(|a, b| a.identity.urn.cmp(&b.identity.urn));
        Ok(snapshots)
    }
}
