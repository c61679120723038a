//! ONVIF device discovery library
//!
//! This crate finds ONVIF devices on the local network using WS-Discovery
//! multicast Probes, falls back to direct HTTP probes of configured hosts,
//! and keeps looking for devices that dropped off the network with
//! exponential backoff.
//!
//! # Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//!
//! # async fn example() -> onvif_discovery::Result<()> {
//! let devices = onvif_discovery::discover(Duration::from_secs(3)).await?;
//! for device in devices {
//!     println!("Found {} at {}", device.urn, device.ip);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Stream-based Discovery
//!
//! ```no_run
//! use futures::StreamExt;
//! use onvif_discovery::{Discovery, DiscoveryConfig};
//! use std::time::Duration;
//!
//! # async fn example() -> onvif_discovery::Result<()> {
//! let discovery = Discovery::new(DiscoveryConfig::default())?;
//! let mut devices = discovery.discover(Duration::from_secs(3));
//! while let Some(device) = devices.next().await {
//!     println!("Found: {:?}", device.name);
//! }
//! # Ok(())
//! # }
//! ```

mod config;
mod discovery;
mod error;
pub mod probe;
pub mod rediscovery;

use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use config::{BackoffConfig, DiscoveryConfig, ProbeTarget, MULTICAST_ADDR};
pub use discovery::Discovery;
pub use error::{DiscoveryError, DiscoveryParseError, Result};
pub use rediscovery::{Rediscovery, RediscoveryCallback};

/// How a device was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiscoveryMethod {
    /// Answered a multicast Probe
    Multicast,
    /// Found by probing a configured host directly
    UnicastDirect,
    /// Added by the user; never rediscovered
    Manual,
}

/// Everything known about a device before talking SOAP to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    /// Stable key, taken from the endpoint reference. Never changes.
    pub urn: String,
    pub ip: IpAddr,
    pub port: u16,
    /// Device service URL from XAddrs
    pub device_service_address: String,
    pub vendor_name: Option<String>,
    pub hardware_model: Option<String>,
    /// Values of the `onvif://www.onvif.org/Profile/` scopes
    pub discovered_profiles: BTreeSet<String>,
    pub discovery_method: DiscoveryMethod,
    pub name: Option<String>,
    pub location: Option<String>,
    /// Advertised `Types`, as sent
    pub device_types: Vec<String>,
    pub metadata_version: Option<u32>,
    /// Placeholder for a host that never answered a probe
    pub rtsp_only: bool,
}

/// Identity shared between the engine and the rediscovery task.
pub type SharedIdentity = Arc<RwLock<DeviceIdentity>>;

impl DeviceIdentity {
    /// Identity for a user-supplied host.
    pub fn manual(ip: IpAddr, port: u16) -> Self {
        Self::bare(format!("urn:manual:{}", host(ip, port)), ip, port, DiscoveryMethod::Manual)
    }

    /// Best-effort identity for a configured host that did not answer.
    pub fn synthetic(ip: IpAddr, port: u16) -> Self {
        let mut identity = Self::bare(format!("urn:synthetic:{}", ip), ip, port, DiscoveryMethod::UnicastDirect);
        identity.rtsp_only = true;
        identity
    }

    fn bare(urn: String, ip: IpAddr, port: u16, discovery_method: DiscoveryMethod) -> Self {
        Self {
            urn,
            ip,
            port,
            device_service_address: device_service_url(ip, port),
            vendor_name: None,
            hardware_model: None,
            discovered_profiles: BTreeSet::new(),
            discovery_method,
            name: None,
            location: None,
            device_types: Vec::new(),
            metadata_version: None,
            rtsp_only: false,
        }
    }

    /// Update in place from a fresh sighting of the same device.
    ///
    /// The urn is kept. Optional fields the new sighting lacks keep their
    /// previous values.
    pub fn refresh_from(&mut self, seen: &DeviceIdentity) {
        self.ip = seen.ip;
        self.port = seen.port;
        self.device_service_address = seen.device_service_address.clone();
        self.discovery_method = seen.discovery_method;
        self.rtsp_only = seen.rtsp_only;
        if seen.vendor_name.is_some() {
            self.vendor_name = seen.vendor_name.clone();
        }
        if seen.hardware_model.is_some() {
            self.hardware_model = seen.hardware_model.clone();
        }
        if seen.name.is_some() {
            self.name = seen.name.clone();
        }
        if seen.location.is_some() {
            self.location = seen.location.clone();
        }
        if !seen.discovered_profiles.is_empty() {
            self.discovered_profiles = seen.discovered_profiles.clone();
        }
        if !seen.device_types.is_empty() {
            self.device_types = seen.device_types.clone();
        }
        if seen.metadata_version.is_some() {
            self.metadata_version = seen.metadata_version;
        }
    }

    /// `ip:port`, bracketing IPv6 addresses.
    pub fn host(&self) -> String {
        host(self.ip, self.port)
    }

    pub fn into_shared(self) -> SharedIdentity {
        Arc::new(RwLock::new(self))
    }
}

fn host(ip: IpAddr, port: u16) -> String {
    match ip {
        IpAddr::V4(ip) => format!("{}:{}", ip, port),
        IpAddr::V6(ip) => format!("[{}]:{}", ip, port),
    }
}

/// Conventional ONVIF device service URL for a host.
pub fn device_service_url(ip: IpAddr, port: u16) -> String {
    format!("http://{}/onvif/device_service", host(ip, port))
}

/// Discover devices with the default configuration.
pub async fn discover(timeout: Duration) -> Result<Vec<DeviceIdentity>> {
    discover_with_config(DiscoveryConfig::default(), timeout).await
}

/// Discover devices with a custom configuration.
pub async fn discover_with_config(config: DiscoveryConfig, timeout: Duration) -> Result<Vec<DeviceIdentity>> {
    let discovery = Discovery::new(config)?;
    let mut devices = Vec::new();
    discovery.run(timeout, |device| devices.push(device)).await?;
    Ok(devices)
}
