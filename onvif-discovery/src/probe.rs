//! WS-Discovery Probe encoding and ProbeMatch parsing.

use std::collections::BTreeSet;
use std::net::IpAddr;

use percent_encoding::percent_decode_str;
use soap_client::xml;
use url::Url;

use crate::config::ProbeTarget;
use crate::error::DiscoveryParseError;
use crate::{DeviceIdentity, DiscoveryMethod};

pub const DISCOVERY_NS: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery";
pub const ADDRESSING_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
pub const PROBE_ACTION: &str = "http://schemas.xmlsoap.org/ws/2005/04/discovery/Probe";
const DISCOVERY_TO: &str = "urn:schemas-xmlsoap-org:ws:2005:04:discovery";
const ANONYMOUS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const SCOPE_PREFIX: &str = "onvif://www.onvif.org/";

/// An encoded Probe and the MessageID replies must relate to.
#[derive(Debug, Clone)]
pub struct Probe {
    pub message_id: String,
    pub xml: String,
}

impl Probe {
    /// Build a Probe for `targets` with a fresh MessageID.
    ///
    /// An empty slice produces a Probe without `Types`, which every
    /// WS-Discovery target answers.
    pub fn new(targets: &[ProbeTarget]) -> Self {
        let message_id = format!("urn:uuid:{}", uuid::Uuid::new_v4());

        let mut namespaces = String::new();
        for target in targets {
            namespaces.push_str(&format!(" xmlns:{}=\"{}\"", target.prefix, xml::escape(&target.namespace)));
        }
        let types = if targets.is_empty() {
            String::new()
        } else {
            let names: Vec<String> = targets.iter().map(ProbeTarget::qualified).collect();
            format!("<d:Types>{}</d:Types>", names.join(" "))
        };

        let xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="{soap}" xmlns:a="{wsa}" xmlns:d="{wsd}"{namespaces}><s:Header><a:Action s:mustUnderstand="1">{PROBE_ACTION}</a:Action><a:MessageID>{message_id}</a:MessageID><a:ReplyTo><a:Address>{ANONYMOUS}</a:Address></a:ReplyTo><a:To s:mustUnderstand="1">{DISCOVERY_TO}</a:To></s:Header><s:Body><d:Probe>{types}</d:Probe></s:Body></s:Envelope>"#,
            soap = xml::SOAP_ENV_NS,
            wsa = ADDRESSING_NS,
            wsd = DISCOVERY_NS,
        );

        Self { message_id, xml }
    }
}

/// All matches carried by one ProbeMatches response.
#[derive(Debug, Clone, Default)]
pub struct ProbeMatches {
    pub relates_to: Option<String>,
    pub matches: Vec<ProbeMatch>,
}

/// A single `ProbeMatch` entry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProbeMatch {
    /// `EndpointReference/Address`, the stable device key
    pub endpoint: String,
    pub types: Vec<String>,
    pub scopes: Vec<String>,
    pub xaddrs: Vec<String>,
    pub metadata_version: Option<u32>,
}

/// Parse a ProbeMatches envelope.
pub fn parse_probe_matches(text: &str) -> Result<ProbeMatches, DiscoveryParseError> {
    let payload = xml::payload(text).ok_or_else(|| DiscoveryParseError::Malformed("no XML content".to_string()))?;
    let envelope = xml::parse(payload).map_err(|e| DiscoveryParseError::Malformed(e.to_string()))?;

    let relates_to = xml::child_text(&envelope, &["Header", "RelatesTo"]).filter(|s| !s.is_empty());

    let container = xml::find(&envelope, "ProbeMatches").ok_or(DiscoveryParseError::NoMatch)?;
    let mut matches = Vec::new();
    for entry in xml::find_all(container, "ProbeMatch") {
        let endpoint = xml::child_text(entry, &["EndpointReference", "Address"])
            .filter(|s| !s.is_empty())
            .ok_or(DiscoveryParseError::MissingEndpoint)?;

        matches.push(ProbeMatch {
            endpoint,
            types: split_list(xml::child_text(entry, &["Types"])),
            scopes: split_list(xml::child_text(entry, &["Scopes"])),
            xaddrs: split_list(xml::child_text(entry, &["XAddrs"])),
            metadata_version: xml::child_text(entry, &["MetadataVersion"]).and_then(|v| v.parse().ok()),
        });
    }

    if matches.is_empty() {
        return Err(DiscoveryParseError::NoMatch);
    }
    Ok(ProbeMatches { relates_to, matches })
}

fn split_list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

impl ProbeMatch {
    /// First XAddr with an http(s) scheme and a host.
    pub fn http_xaddr(&self) -> Option<Url> {
        self.xaddrs
            .iter()
            .filter_map(|addr| Url::parse(addr).ok())
            .find(|url| matches!(url.scheme(), "http" | "https") && url.host().is_some())
    }

    /// True if any advertised type has one of the `accepted` local names.
    pub fn supports_any(&self, accepted: &[&str]) -> bool {
        self.types
            .iter()
            .any(|t| accepted.contains(&xml::local_name(t)))
    }

    /// Decoded values of every scope under `onvif://www.onvif.org/<kind>/`.
    pub fn scope_values(&self, kind: &str) -> Vec<String> {
        let prefix = format!("{SCOPE_PREFIX}{kind}/");
        self.scopes
            .iter()
            .filter_map(|scope| scope.strip_prefix(prefix.as_str()))
            .filter(|value| !value.is_empty())
            .map(percent_decode)
            .collect()
    }

    pub fn scope(&self, kind: &str) -> Option<String> {
        self.scope_values(kind).into_iter().next()
    }

    /// Convert into a [`DeviceIdentity`].
    pub fn into_identity(self, method: DiscoveryMethod) -> Result<DeviceIdentity, DiscoveryParseError> {
        let url = self.http_xaddr().ok_or(DiscoveryParseError::MissingXAddrs)?;
        let ip: IpAddr = match url.host() {
            Some(url::Host::Ipv4(ip)) => IpAddr::V4(ip),
            Some(url::Host::Ipv6(ip)) => IpAddr::V6(ip),
            _ => return Err(DiscoveryParseError::MissingXAddrs),
        };
        let port = url.port_or_known_default().unwrap_or(80);

        let discovered_profiles: BTreeSet<String> = self.scope_values("Profile").into_iter().collect();

        Ok(DeviceIdentity {
            urn: self.endpoint.clone(),
            ip,
            port,
            device_service_address: url.to_string(),
            vendor_name: self.scope("mfr").or_else(|| self.scope("manufacturer")),
            hardware_model: self.scope("hardware"),
            discovered_profiles,
            discovery_method: method,
            name: self.scope("name"),
            location: self.scope("location"),
            device_types: self.types,
            metadata_version: self.metadata_version,
            rtsp_only: false,
        })
    }
}

/// Decode `%XX` escapes. Invalid sequences are kept verbatim.
fn percent_decode(value: &str) -> String {
    percent_decode_str(value).decode_utf8_lossy().into_owned()
}
