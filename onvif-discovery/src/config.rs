//! Discovery configuration

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::{DiscoveryError, Result};

/// WS-Discovery multicast group and port.
pub const MULTICAST_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(239, 255, 255, 250)), 3702);

/// One `Types` entry sent in a Probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeTarget {
    pub prefix: String,
    pub namespace: String,
    pub local_name: String,
}

impl ProbeTarget {
    pub fn new(prefix: impl Into<String>, namespace: impl Into<String>, local_name: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            namespace: namespace.into(),
            local_name: local_name.into(),
        }
    }

    /// `tds:Device`
    pub fn device() -> Self {
        Self::new("tds", "http://www.onvif.org/ver10/device/wsdl", "Device")
    }

    /// `dn:NetworkVideoTransmitter`
    pub fn network_video_transmitter() -> Self {
        Self::new("dn", "http://www.onvif.org/ver10/network/wsdl", "NetworkVideoTransmitter")
    }

    /// `tdc:Door`, advertised by door stations and doorbells
    pub fn door() -> Self {
        Self::new("tdc", "http://www.onvif.org/ver10/doorcontrol/wsdl", "Door")
    }

    pub fn qualified(&self) -> String {
        format!("{}:{}", self.prefix, self.local_name)
    }
}

/// Exponential backoff used between rediscovery attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// First delay
    /// Default: 15 seconds
    pub base: Duration,

    /// Growth factor per attempt
    /// Default: 2.0
    pub factor: f64,

    /// Random extra delay as a fraction of the computed delay
    /// Default: 0.25
    pub jitter: f64,

    /// Upper bound before jitter
    /// Default: 300 seconds
    pub cap: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(15),
            factor: 2.0,
            jitter: 0.25,
            cap: Duration::from_secs(300),
        }
    }
}

impl BackoffConfig {
    pub fn validate(&self) -> Result<()> {
        if self.base == Duration::ZERO {
            return Err(DiscoveryError::Configuration(
                "Backoff base must be greater than 0".to_string(),
            ));
        }
        if self.cap < self.base {
            return Err(DiscoveryError::Configuration(
                "Backoff cap must not be below the base delay".to_string(),
            ));
        }
        if self.factor < 1.0 {
            return Err(DiscoveryError::Configuration(
                "Backoff factor must be at least 1".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(DiscoveryError::Configuration(
                "Backoff jitter must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}

/// Configuration for [`Discovery`](crate::Discovery) and
/// [`Rediscovery`](crate::Rediscovery).
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// One multicast Probe is sent per target
    pub probe_targets: Vec<ProbeTarget>,

    /// Multicast destination
    pub multicast_addr: SocketAddr,

    /// Hosts probed directly over HTTP after the multicast window
    pub unicast_targets: Vec<IpAddr>,

    /// HTTP port for unicast probes
    /// Default: 80
    pub unicast_port: u16,

    /// Per-host budget for a unicast probe
    /// Default: 3 seconds
    pub unicast_timeout: Duration,

    /// Produce a placeholder identity when a unicast target does not answer
    /// Default: true
    pub synthesize_unresponsive: bool,

    /// Receive buffer per datagram
    /// Default: 8192 bytes
    pub max_datagram: usize,

    /// Rediscovery backoff
    pub backoff: BackoffConfig,

    /// Length of each rediscovery multicast window
    /// Default: 3 seconds
    pub rediscovery_window: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            probe_targets: vec![
                ProbeTarget::device(),
                ProbeTarget::network_video_transmitter(),
                ProbeTarget::door(),
            ],
            multicast_addr: MULTICAST_ADDR,
            unicast_targets: Vec::new(),
            unicast_port: 80,
            unicast_timeout: Duration::from_secs(3),
            synthesize_unresponsive: true,
            max_datagram: 8192,
            backoff: BackoffConfig::default(),
            rediscovery_window: Duration::from_secs(3),
        }
    }
}

impl DiscoveryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// No multicast targets; only the given hosts are probed
    pub fn unicast_only(targets: Vec<IpAddr>) -> Self {
        Self {
            probe_targets: Vec::new(),
            unicast_targets: targets,
            ..Default::default()
        }
    }

    /// Short windows and backoff for tests and small networks
    pub fn fast() -> Self {
        Self {
            unicast_timeout: Duration::from_millis(500),
            rediscovery_window: Duration::from_millis(500),
            backoff: BackoffConfig {
                base: Duration::from_millis(100),
                cap: Duration::from_secs(1),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn with_unicast_target(mut self, ip: IpAddr) -> Self {
        self.unicast_targets.push(ip);
        self
    }

    pub fn with_unicast_port(mut self, port: u16) -> Self {
        self.unicast_port = port;
        self
    }

    pub fn with_probe_target(mut self, target: ProbeTarget) -> Self {
        self.probe_targets.push(target);
        self
    }

    pub fn with_synthesize_unresponsive(mut self, enabled: bool) -> Self {
        self.synthesize_unresponsive = enabled;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Local names of the device categories this engine accepts.
    pub fn accepted_types(&self) -> Vec<&str> {
        self.probe_targets.iter().map(|t| t.local_name.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_targets.is_empty() && self.unicast_targets.is_empty() {
            return Err(DiscoveryError::Configuration(
                "Nothing to probe: no probe targets and no unicast targets".to_string(),
            ));
        }
        if self.max_datagram < 512 {
            return Err(DiscoveryError::Configuration(
                "Datagram buffer must be at least 512 bytes".to_string(),
            ));
        }
        self.backoff.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DiscoveryConfig::default();
        assert_eq!(config.multicast_addr.to_string(), "239.255.255.250:3702");
        assert_eq!(config.backoff.base, Duration::from_secs(15));
        assert_eq!(config.backoff.cap, Duration::from_secs(300));
        assert_eq!(config.accepted_types(), vec!["Device", "NetworkVideoTransmitter", "Door"]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(DiscoveryConfig::fast().validate().is_ok());
        let unicast = DiscoveryConfig::unicast_only(vec!["10.0.0.5".parse().unwrap()]);
        assert!(unicast.validate().is_ok());
        assert!(DiscoveryConfig::unicast_only(Vec::new()).validate().is_err());
    }

    #[test]
    fn test_invalid_backoff() {
        let mut backoff = BackoffConfig::default();
        backoff.cap = Duration::from_secs(1);
        assert!(backoff.validate().is_err());

        let mut backoff = BackoffConfig::default();
        backoff.jitter = 1.5;
        assert!(backoff.validate().is_err());

        let mut backoff = BackoffConfig::default();
        backoff.factor = 0.5;
        assert!(backoff.validate().is_err());
    }
}
