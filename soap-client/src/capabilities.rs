//! Device and capability queries used while initializing a device.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xmltree::Element;

use crate::error::{Result, SoapError};
use crate::xml::{self, DEVICE_NS, EVENTS_NS, MEDIA_NS};
use crate::{DeviceSession, SoapClient};

const GET_SYSTEM_DATE_AND_TIME: &str = "http://www.onvif.org/ver10/device/wsdl/GetSystemDateAndTime";
const GET_DEVICE_INFORMATION: &str = "http://www.onvif.org/ver10/device/wsdl/GetDeviceInformation";
const GET_CAPABILITIES: &str = "http://www.onvif.org/ver10/device/wsdl/GetCapabilities";
const GET_SERVICES: &str = "http://www.onvif.org/ver10/device/wsdl/GetServices";
const GET_EVENT_PROPERTIES: &str =
    "http://www.onvif.org/ver10/events/wsdl/EventPortType/GetEventPropertiesRequest";

/// `GetDeviceInformation` result.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInformation {
    pub manufacturer: String,
    pub model: String,
    pub firmware_version: String,
    pub serial_number: String,
    pub hardware_id: String,
}

/// Media streaming transports the device advertises.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamingFlags {
    pub rtp_multicast: bool,
    pub rtp_tcp: bool,
    pub rtp_rtsp_tcp: bool,
}

/// How an expiring subscription is extended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RenewalMode {
    /// Standard WS-BaseNotification `Renew`
    #[default]
    Renew,
    /// Full `Subscribe` in place of `Renew`
    Resubscribe,
}

/// Service addresses and event capabilities learned from a device.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceEndpoints {
    pub device_service_address: String,
    pub media_service_address: Option<String>,
    pub event_service_address: Option<String>,
    pub supports_ws_subscription: bool,
    pub supports_pull_point: bool,
    pub streaming_transport_flags: StreamingFlags,
    pub device_info: DeviceInformation,
    /// Topic paths from `GetEventProperties`, prefixes removed
    pub event_topics: Vec<String>,
    pub renewal_mode: RenewalMode,
}

/// Vendor-specific behavior switches.
#[derive(Debug, Clone)]
pub struct VendorQuirks {
    /// Manufacturers whose devices need a full resubscribe instead of Renew.
    /// Matched case-insensitively as a substring of the manufacturer name.
    pub resubscribe_vendors: Vec<String>,
}

impl Default for VendorQuirks {
    fn default() -> Self {
        Self {
            resubscribe_vendors: vec!["Reolink".to_string()],
        }
    }
}

impl VendorQuirks {
    pub fn requires_resubscribe(&self, manufacturer: &str) -> bool {
        let manufacturer = manufacturer.to_ascii_lowercase();
        self.resubscribe_vendors
            .iter()
            .any(|vendor| manufacturer.contains(&vendor.to_ascii_lowercase()))
    }

    /// Decide once how this device's subscriptions are extended.
    ///
    /// `Renew` needs the event service on the same host as the device
    /// service and a vendor that handles it.
    pub fn renewal_mode(&self, device_url: &str, event_url: Option<&str>, manufacturer: &str) -> RenewalMode {
        if self.requires_resubscribe(manufacturer) {
            return RenewalMode::Resubscribe;
        }
        match event_url {
            Some(event_url) if same_origin(device_url, event_url) => RenewalMode::Renew,
            _ => RenewalMode::Resubscribe,
        }
    }
}

fn same_origin(a: &str, b: &str) -> bool {
    match (url::Url::parse(a), url::Url::parse(b)) {
        (Ok(a), Ok(b)) => a.host_str() == b.host_str() && a.port_or_known_default() == b.port_or_known_default(),
        _ => false,
    }
}

/// Parse a `GetSystemDateAndTimeResponse` into the device's UTC time.
pub fn parse_system_date_and_time(response: &Element) -> Result<DateTime<Utc>> {
    let utc = xml::find(response, "UTCDateTime")
        .ok_or_else(|| SoapError::Parse("Missing UTCDateTime".to_string()))?;

    let year = number(utc, &["Date", "Year"])? as i32;
    let (month, day) = (number(utc, &["Date", "Month"])?, number(utc, &["Date", "Day"])?);
    let (hour, minute, second) = (
        number(utc, &["Time", "Hour"])?,
        number(utc, &["Time", "Minute"])?,
        number(utc, &["Time", "Second"])?,
    );

    let date = NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hour, minute, second))
        .ok_or_else(|| SoapError::Parse("Invalid UTCDateTime".to_string()))?;

    Ok(date.and_utc())
}

fn number(element: &Element, path: &[&str]) -> Result<u32> {
    xml::child_text(element, path)
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| SoapError::Parse(format!("Missing or invalid {}", path.join("/"))))
}

pub fn parse_device_information(response: &Element) -> DeviceInformation {
    let text = |name: &str| xml::child_text(response, &[name]).unwrap_or_default();
    DeviceInformation {
        manufacturer: text("Manufacturer"),
        model: text("Model"),
        firmware_version: text("FirmwareVersion"),
        serial_number: text("SerialNumber"),
        hardware_id: text("HardwareId"),
    }
}

/// Fill `endpoints` from a `GetCapabilitiesResponse`.
pub fn apply_capabilities(endpoints: &mut ServiceEndpoints, response: &Element) {
    let Some(capabilities) = response.get_child("Capabilities") else {
        return;
    };

    if let Some(media) = capabilities.get_child("Media") {
        endpoints.media_service_address = xml::child_text(media, &["XAddr"]);
        if let Some(streaming) = media.get_child("StreamingCapabilities") {
            let flag = |name: &str| xml::child_text(streaming, &[name]).map_or(false, |v| xml::parse_bool(&v));
            endpoints.streaming_transport_flags = StreamingFlags {
                rtp_multicast: flag("RTPMulticast"),
                rtp_tcp: flag("RTP_TCP"),
                rtp_rtsp_tcp: flag("RTP_RTSP_TCP"),
            };
        }
    }

    if let Some(events) = capabilities.get_child("Events") {
        endpoints.event_service_address = xml::child_text(events, &["XAddr"]);
        endpoints.supports_ws_subscription = xml::child_text(events, &["WSSubscriptionPolicySupport"])
            .map_or(false, |v| xml::parse_bool(&v));
        endpoints.supports_pull_point =
            xml::child_text(events, &["WSPullPointSupport"]).map_or(false, |v| xml::parse_bool(&v));
    }
}

/// Fill `endpoints` from a `GetServicesResponse`.
pub fn apply_services(endpoints: &mut ServiceEndpoints, response: &Element) {
    for service in xml::children(response).filter(|e| e.name == "Service") {
        let namespace = xml::child_text(service, &["Namespace"]).unwrap_or_default();
        let address = xml::child_text(service, &["XAddr"]);
        match namespace.as_str() {
            MEDIA_NS => endpoints.media_service_address = address,
            EVENTS_NS => {
                endpoints.event_service_address = address;
                if let Some(caps) = xml::find(service, "Capabilities").and_then(|c| c.get_child("Capabilities")) {
                    let attr = |name: &str| caps.attributes.get(name).map_or(false, |v| xml::parse_bool(v));
                    endpoints.supports_ws_subscription = attr("WSSubscriptionPolicySupport");
                    endpoints.supports_pull_point = attr("WSPullPointSupport");
                } else {
                    // Events service present without capability details
                    endpoints.supports_ws_subscription = true;
                }
            }
            _ => {}
        }
    }
}

/// Topic paths flagged `topic="true"` in a `GetEventPropertiesResponse`.
pub fn parse_event_topics(response: &Element) -> Vec<String> {
    let mut topics = Vec::new();
    if let Some(topic_set) = response.get_child("TopicSet") {
        for child in xml::children(topic_set) {
            walk_topics(child, &mut Vec::new(), &mut topics);
        }
    }
    topics
}

fn walk_topics(element: &Element, path: &mut Vec<String>, topics: &mut Vec<String>) {
    // Message descriptions are payload schema, not topics
    if element.name == "MessageDescription" {
        return;
    }
    path.push(element.name.clone());
    if element.attributes.get("topic").map_or(false, |v| xml::parse_bool(v)) {
        topics.push(path.join("/"));
    }
    for child in xml::children(element) {
        walk_topics(child, path, topics);
    }
    path.pop();
}

impl SoapClient {
    /// Query the device clock and store the offset for WS-Security timestamps.
    pub async fn get_system_date_and_time(
        &self,
        session: &DeviceSession,
        device_url: &str,
    ) -> Result<DateTime<Utc>> {
        let body = format!(r#"<tds:GetSystemDateAndTime xmlns:tds="{}"/>"#, DEVICE_NS);
        let response = self
            .send(session, GET_SYSTEM_DATE_AND_TIME, device_url, &body, None)
            .await?;
        let device_time = parse_system_date_and_time(response.response("GetSystemDateAndTimeResponse")?)?;

        let offset = device_time - Utc::now();
        session.auth().set_clock_offset(offset);
        debug!(urn = session.urn(), offset_secs = offset.num_seconds(), "device clock offset");
        Ok(device_time)
    }

    pub async fn get_device_information(
        &self,
        session: &DeviceSession,
        device_url: &str,
    ) -> Result<DeviceInformation> {
        let body = format!(r#"<tds:GetDeviceInformation xmlns:tds="{}"/>"#, DEVICE_NS);
        let response = self
            .send(session, GET_DEVICE_INFORMATION, device_url, &body, None)
            .await?;
        Ok(parse_device_information(response.response("GetDeviceInformationResponse")?))
    }

    pub async fn get_capabilities(&self, session: &DeviceSession, device_url: &str) -> Result<ServiceEndpoints> {
        let body = format!(
            r#"<tds:GetCapabilities xmlns:tds="{}"><tds:Category>All</tds:Category></tds:GetCapabilities>"#,
            DEVICE_NS
        );
        let response = self.send(session, GET_CAPABILITIES, device_url, &body, None).await?;

        let mut endpoints = ServiceEndpoints {
            device_service_address: device_url.to_string(),
            ..Default::default()
        };
        apply_capabilities(&mut endpoints, response.response("GetCapabilitiesResponse")?);
        Ok(endpoints)
    }

    pub async fn get_services(&self, session: &DeviceSession, device_url: &str) -> Result<ServiceEndpoints> {
        let body = format!(
            r#"<tds:GetServices xmlns:tds="{}"><tds:IncludeCapability>true</tds:IncludeCapability></tds:GetServices>"#,
            DEVICE_NS
        );
        let response = self.send(session, GET_SERVICES, device_url, &body, None).await?;

        let mut endpoints = ServiceEndpoints {
            device_service_address: device_url.to_string(),
            ..Default::default()
        };
        apply_services(&mut endpoints, response.response("GetServicesResponse")?);
        Ok(endpoints)
    }

    pub async fn get_event_properties(&self, session: &DeviceSession, event_url: &str) -> Result<Vec<String>> {
        let body = format!(r#"<tev:GetEventProperties xmlns:tev="{}"/>"#, EVENTS_NS);
        let response = self
            .send(session, GET_EVENT_PROPERTIES, event_url, &body, None)
            .await?;
        Ok(parse_event_topics(response.response("GetEventPropertiesResponse")?))
    }

    /// Run the initialization queries and assemble [`ServiceEndpoints`].
    ///
    /// The clock query runs first so WS-Security timestamps are right from
    /// the first authenticated call. `GetServices` is the fallback when
    /// `GetCapabilities` faults.
    pub async fn query_endpoints(
        &self,
        session: &DeviceSession,
        device_url: &str,
        quirks: &VendorQuirks,
    ) -> Result<ServiceEndpoints> {
        if let Err(err) = self.get_system_date_and_time(session, device_url).await {
            if err.is_transport() {
                return Err(err);
            }
            warn!(urn = session.urn(), error = %err, "clock query failed, using local time");
        }

        let device_info = self.get_device_information(session, device_url).await?;

        let mut endpoints = match self.get_capabilities(session, device_url).await {
            Ok(endpoints) => endpoints,
            Err(err @ SoapError::Fault { .. }) | Err(err @ SoapError::Http(_)) => {
                debug!(urn = session.urn(), error = %err, "GetCapabilities failed, trying GetServices");
                self.get_services(session, device_url).await?
            }
            Err(err) => return Err(err),
        };

        if let Some(event_url) = endpoints.event_service_address.clone() {
            match self.get_event_properties(session, &event_url).await {
                Ok(topics) => endpoints.event_topics = topics,
                Err(err) if err.is_transport() => return Err(err),
                Err(err) => warn!(urn = session.urn(), error = %err, "event properties unavailable"),
            }
        }

        endpoints.renewal_mode = quirks.renewal_mode(
            device_url,
            endpoints.event_service_address.as_deref(),
            &device_info.manufacturer,
        );
        endpoints.device_info = device_info;

        info!(
            urn = session.urn(),
            manufacturer = %endpoints.device_info.manufacturer,
            model = %endpoints.device_info.model,
            events = endpoints.event_service_address.is_some(),
            renewal = ?endpoints.renewal_mode,
            "device endpoints resolved"
        );
        Ok(endpoints)
    }
}
