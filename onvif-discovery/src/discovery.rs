//! Multicast and unicast discovery runs.
//!
//! A run sends one Probe per configured target to the multicast group,
//! collects ProbeMatches on the same socket until the window closes, then
//! probes configured hosts directly over HTTP. Devices are reported once
//! per run, keyed by urn.

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use futures::future::join_all;
use futures::Stream;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{DiscoveryError, DiscoveryParseError, Result};
use crate::probe::{parse_probe_matches, Probe, PROBE_ACTION};
use crate::{device_service_url, DeviceIdentity, DiscoveryMethod};

/// WS-Discovery client.
#[derive(Debug, Clone)]
pub struct Discovery {
    config: DiscoveryConfig,
    http: reqwest::Client,
}

/// Per-run bookkeeping. Dropped at the end of each run.
pub(crate) struct DiscoveryRun {
    accepted: Vec<String>,
    message_ids: HashSet<String>,
    seen_urns: HashSet<String>,
    seen_ips: HashSet<IpAddr>,
}

impl DiscoveryRun {
    pub(crate) fn new(config: &DiscoveryConfig) -> Self {
        Self {
            accepted: config.accepted_types().into_iter().map(str::to_string).collect(),
            message_ids: HashSet::new(),
            seen_urns: HashSet::new(),
            seen_ips: HashSet::new(),
        }
    }

    pub(crate) fn track(&mut self, message_id: &str) {
        self.message_ids.insert(message_id.to_string());
    }

    /// Decode a response and return the identities not yet reported.
    pub(crate) fn accept_payload(
        &mut self,
        payload: &str,
        method: DiscoveryMethod,
    ) -> std::result::Result<Vec<DeviceIdentity>, DiscoveryParseError> {
        let parsed = parse_probe_matches(payload)?;
        if let Some(relates_to) = &parsed.relates_to {
            if !self.message_ids.contains(relates_to) {
                return Err(DiscoveryParseError::UnrelatedMessage(relates_to.clone()));
            }
        }

        let accepted_owned = self.accepted.clone();
        let accepted: Vec<&str> = accepted_owned.iter().map(String::as_str).collect();
        let mut found = Vec::new();
        for probe_match in parsed.matches {
            if !accepted.is_empty() && !probe_match.supports_any(&accepted) {
                debug!(
                    endpoint = %probe_match.endpoint,
                    "Discarding probe match: {}",
                    DiscoveryParseError::UnsupportedTypes(probe_match.types.join(" "))
                );
                continue;
            }
            let endpoint = probe_match.endpoint.clone();
            match probe_match.into_identity(method) {
                Ok(identity) => {
                    if let Some(identity) = self.admit(identity) {
                        found.push(identity);
                    }
                }
                Err(e) => debug!(endpoint = %endpoint, "Discarding probe match: {}", e),
            }
        }
        Ok(found)
    }

    /// Record `identity` and return it if its urn is new to this run.
    pub(crate) fn admit(&mut self, identity: DeviceIdentity) -> Option<DeviceIdentity> {
        if !self.seen_urns.insert(identity.urn.clone()) {
            debug!(urn = %identity.urn, "Duplicate discovery response");
            return None;
        }
        self.seen_ips.insert(identity.ip);
        Some(identity)
    }

    pub(crate) fn has_ip(&self, ip: &IpAddr) -> bool {
        self.seen_ips.contains(ip)
    }
}

impl Discovery {
    /// Create a discovery client
    pub fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .timeout(config.unicast_timeout)
            .connect_timeout(config.unicast_timeout)
            .build()
            .map_err(|e| DiscoveryError::Network(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    /// Run one discovery pass, calling `on_found` once per device.
    ///
    /// Returns the number of devices reported.
    pub async fn run<F>(&self, timeout: Duration, on_found: F) -> Result<usize>
    where
        F: FnMut(DeviceIdentity),
    {
        self.run_with_targets(timeout, &[], on_found).await
    }

    /// Like [`run`](Self::run), also probing `extra_targets` directly.
    pub async fn run_with_targets<F>(&self, timeout: Duration, extra_targets: &[IpAddr], mut on_found: F) -> Result<usize>
    where
        F: FnMut(DeviceIdentity),
    {
        let mut run = DiscoveryRun::new(&self.config);
        let mut reported = 0;

        let unicast_configured = !self.config.unicast_targets.is_empty() || !extra_targets.is_empty();
        if !self.config.probe_targets.is_empty() {
            match self.multicast(&mut run, timeout, &mut on_found).await {
                Ok(count) => reported += count,
                Err(e) if unicast_configured => warn!("Multicast probe failed, continuing with unicast: {}", e),
                Err(e) => return Err(e),
            }
        }

        let mut targets: Vec<IpAddr> = Vec::new();
        for ip in self.config.unicast_targets.iter().chain(extra_targets) {
            if !run.has_ip(ip) && !targets.contains(ip) {
                targets.push(*ip);
            }
        }
        if !targets.is_empty() {
            reported += self.unicast(&mut run, &targets, &mut on_found).await;
        }

        info!("Discovery run finished with {} device(s)", reported);
        Ok(reported)
    }

    /// Stream devices from a background run.
    ///
    /// The stream ends when the run finishes. Errors are logged.
    pub fn discover(&self, timeout: Duration) -> impl Stream<Item = DeviceIdentity> + Send + Unpin + 'static {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let discovery = self.clone();
        tokio::spawn(async move {
            let result = discovery
                .run(timeout, |device| {
                    let _ = tx.send(device);
                })
                .await;
            if let Err(e) = result {
                warn!("Discovery run failed: {}", e);
            }
        });
        UnboundedReceiverStream::new(rx)
    }

    async fn multicast<F>(&self, run: &mut DiscoveryRun, timeout: Duration, on_found: &mut F) -> Result<usize>
    where
        F: FnMut(DeviceIdentity),
    {
        let bind_addr: SocketAddr = if self.config.multicast_addr.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let socket = UdpSocket::bind(bind_addr)
            .await
            .map_err(|e| DiscoveryError::Network(format!("Failed to bind UDP socket: {}", e)))?;
        if self.config.multicast_addr.ip().is_multicast() && self.config.multicast_addr.is_ipv4() {
            if let Err(e) = socket.set_multicast_ttl_v4(4) {
                debug!("Could not set multicast TTL: {}", e);
            }
        }

        let mut sent = 0;
        for target in &self.config.probe_targets {
            let probe = Probe::new(std::slice::from_ref(target));
            match socket.send_to(probe.xml.as_bytes(), self.config.multicast_addr).await {
                Ok(_) => {
                    debug!(types = %target.qualified(), message_id = %probe.message_id, "Sent multicast probe");
                    run.track(&probe.message_id);
                    sent += 1;
                }
                Err(e) => warn!(types = %target.qualified(), "Failed to send probe: {}", e),
            }
        }
        if sent == 0 {
            return Err(DiscoveryError::Network("No probe could be sent".to_string()));
        }

        let deadline = Instant::now() + timeout;
        let mut buf = vec![0u8; self.config.max_datagram];
        let mut reported = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (size, from) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => break,
                Ok(Err(e)) => {
                    debug!("Error receiving probe response: {}", e);
                    continue;
                }
                Ok(Ok(received)) => received,
            };

            let text = String::from_utf8_lossy(&buf[..size]);
            match run.accept_payload(&text, DiscoveryMethod::Multicast) {
                Ok(devices) => {
                    for device in devices {
                        info!(urn = %device.urn, ip = %device.ip, "Discovered device");
                        on_found(device);
                        reported += 1;
                    }
                }
                Err(e) => debug!(from = %from, "Discarding discovery response: {}", e),
            }
        }
        Ok(reported)
    }

    async fn unicast<F>(&self, run: &mut DiscoveryRun, targets: &[IpAddr], on_found: &mut F) -> usize
    where
        F: FnMut(DeviceIdentity),
    {
        let probes = targets.iter().map(|ip| async move {
            let probe = Probe::new(&self.config.probe_targets);
            let result = self.probe_host(*ip, &probe).await;
            (*ip, probe.message_id, result)
        });

        let mut reported = 0;
        for (ip, message_id, result) in join_all(probes).await {
            run.track(&message_id);
            let devices = match result {
                Ok(text) => match run.accept_payload(&text, DiscoveryMethod::UnicastDirect) {
                    Ok(devices) => devices,
                    Err(e) => {
                        debug!(ip = %ip, "Discarding unicast probe response: {}", e);
                        Vec::new()
                    }
                },
                Err(e) => {
                    debug!(ip = %ip, "Unicast probe failed: {}", e);
                    Vec::new()
                }
            };

            let devices = if devices.is_empty() && !run.has_ip(&ip) && self.config.synthesize_unresponsive {
                info!(ip = %ip, "No probe answer, using a synthetic identity");
                run.admit(DeviceIdentity::synthetic(ip, self.config.unicast_port))
                    .into_iter()
                    .collect()
            } else {
                devices
            };

            for device in devices {
                on_found(device);
                reported += 1;
            }
        }
        reported
    }

    /// POST a Probe to a host's device service and return the reply text.
    async fn probe_host(&self, ip: IpAddr, probe: &Probe) -> Result<String> {
        let url = device_service_url(ip, self.config.unicast_port);
        let response = self
            .http
            .post(&url)
            .header(
                reqwest::header::CONTENT_TYPE,
                format!("application/soap+xml; charset=utf-8; action=\"{}\"", PROBE_ACTION),
            )
            .body(probe.xml.clone())
            .send()
            .await
            .map_err(|e| DiscoveryError::Network(format!("Probe to {} failed: {}", url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DiscoveryError::Network(format!("Probe to {} returned {}", url, status)));
        }
        response
            .text()
            .await
            .map_err(|e| DiscoveryError::Network(format!("Failed to read probe reply from {}: {}", url, e)))
    }
}
