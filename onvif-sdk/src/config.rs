//! Engine configuration

use std::path::PathBuf;
use std::time::Duration;

use callback_server::ServerConfig;
use onvif_discovery::DiscoveryConfig;
use onvif_stream::SubscriptionConfig;
use soap_client::capabilities::VendorQuirks;
use soap_client::{AuthConfig, Credentials, DispatchConfig};

use crate::error::{Result, SdkError};

/// Directory name under the platform cache directory.
pub const CACHE_DIR_NAME: &str = "onvif-sdk";

/// Configuration for [`OnvifEngine`](crate::OnvifEngine).
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub dispatch: DispatchConfig,
    pub auth: AuthConfig,
    pub discovery: DiscoveryConfig,
    pub subscription: SubscriptionConfig,

    /// Push listener. `None` restricts event delivery to pull points.
    pub callback: Option<ServerConfig>,

    pub quirks: VendorQuirks,

    /// Credentials used for devices without their own
    pub default_credentials: Option<Credentials>,

    /// Devices initialized concurrently
    /// Default: 4
    pub device_permits: usize,

    /// How long an initialization waits for a free slot
    /// Default: 30 seconds
    pub device_admission_timeout: Duration,

    /// Where device snapshots are stored. `None` disables persistence.
    /// Default: `<cache dir>/onvif-sdk`
    pub persist_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            dispatch: DispatchConfig::default(),
            auth: AuthConfig::default(),
            discovery: DiscoveryConfig::default(),
            subscription: SubscriptionConfig::default(),
            callback: Some(ServerConfig::default()),
            quirks: VendorQuirks::default(),
            default_credentials: None,
            device_permits: 4,
            device_admission_timeout: Duration::from_secs(30),
            persist_dir: dirs::cache_dir().map(|dir| dir.join(CACHE_DIR_NAME)),
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// No callback server; every device is polled through a pull point
    pub fn pull_only() -> Self {
        Self {
            callback: None,
            subscription: SubscriptionConfig::pull_only(),
            ..Default::default()
        }
    }

    /// Short timings throughout, no persistence. Meant for tests and labs.
    pub fn fast() -> Self {
        Self {
            dispatch: DispatchConfig::fast_retry(),
            discovery: DiscoveryConfig::fast(),
            subscription: SubscriptionConfig::fast(),
            device_admission_timeout: Duration::from_secs(5),
            persist_dir: None,
            ..Default::default()
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.default_credentials = Some(credentials);
        self
    }

    pub fn with_callback(mut self, callback: Option<ServerConfig>) -> Self {
        self.callback = callback;
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchConfig) -> Self {
        self.dispatch = dispatch;
        self
    }

    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    pub fn with_subscription(mut self, subscription: SubscriptionConfig) -> Self {
        self.subscription = subscription;
        self
    }

    pub fn with_device_permits(mut self, permits: usize) -> Self {
        self.device_permits = permits;
        self
    }

    pub fn with_persist_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.persist_dir = Some(dir.into());
        self
    }

    pub fn without_persistence(mut self) -> Self {
        self.persist_dir = None;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.device_permits == 0 {
            return Err(SdkError::Configuration(
                "Device permits must be greater than 0".to_string(),
            ));
        }
        self.dispatch.validate()?;
        self.discovery.validate()?;
        self.subscription.validate()?;
        Ok(())
    }
}
