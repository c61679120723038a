//! WS-BaseNotification and ONVIF event service messages.

use std::time::Duration;

use chrono::{DateTime, Utc};
use soap_client::xml::{self, EVENTS_NS, WSNT_NS};
use soap_client::{SoapRequest, SoapResponse};
use tracing::debug;
use xmltree::{Element, EmitterConfig, XMLNode};

use crate::error::{Result, StreamError};
use crate::notification::{parse_messages, Notification};

pub const SUBSCRIBE_ACTION: &str = "http://docs.oasis-open.org/wsn/bw-2/NotificationProducer/SubscribeRequest";
pub const RENEW_ACTION: &str = "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/RenewRequest";
pub const UNSUBSCRIBE_ACTION: &str = "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/UnsubscribeRequest";
pub const CREATE_PULL_POINT_ACTION: &str =
    "http://www.onvif.org/ver10/events/wsdl/EventPortType/CreatePullPointSubscriptionRequest";
pub const PULL_MESSAGES_ACTION: &str =
    "http://www.onvif.org/ver10/events/wsdl/PullPointSubscription/PullMessagesRequest";
pub const SET_SYNCHRONIZATION_POINT_ACTION: &str =
    "http://www.onvif.org/ver10/events/wsdl/PullPointSubscription/SetSynchronizationPointRequest";

pub fn subscribe_body(consumer_url: &str, filter: Option<&str>, lifetime: Duration) -> String {
    let filter = filter
        .map(|expression| format!("<wsnt:Filter>{expression}</wsnt:Filter>"))
        .unwrap_or_default();
    format!(
        r#"<wsnt:Subscribe xmlns:wsnt="{WSNT_NS}"><wsnt:ConsumerReference><wsa:Address>{}</wsa:Address></wsnt:ConsumerReference>{filter}<wsnt:InitialTerminationTime>{}</wsnt:InitialTerminationTime></wsnt:Subscribe>"#,
        xml::escape(consumer_url),
        xml::duration(lifetime.as_secs())
    )
}

pub fn create_pull_point_body(filter: Option<&str>, lifetime: Duration) -> String {
    let filter = filter
        .map(|expression| format!("<tev:Filter>{expression}</tev:Filter>"))
        .unwrap_or_default();
    format!(
        r#"<tev:CreatePullPointSubscription xmlns:tev="{EVENTS_NS}" xmlns:wsnt="{WSNT_NS}">{filter}<tev:InitialTerminationTime>{}</tev:InitialTerminationTime></tev:CreatePullPointSubscription>"#,
        xml::duration(lifetime.as_secs())
    )
}

pub fn renew_body(lifetime: Duration) -> String {
    format!(
        r#"<wsnt:Renew xmlns:wsnt="{WSNT_NS}"><wsnt:TerminationTime>{}</wsnt:TerminationTime></wsnt:Renew>"#,
        xml::duration(lifetime.as_secs())
    )
}

pub fn unsubscribe_body() -> String {
    format!(r#"<wsnt:Unsubscribe xmlns:wsnt="{WSNT_NS}"/>"#)
}

pub fn pull_messages_body(timeout: Duration, message_limit: u32) -> String {
    format!(
        r#"<tev:PullMessages xmlns:tev="{EVENTS_NS}"><tev:Timeout>{}</tev:Timeout><tev:MessageLimit>{message_limit}</tev:MessageLimit></tev:PullMessages>"#,
        xml::duration(timeout.as_secs().max(1))
    )
}

pub fn set_synchronization_point_body() -> String {
    format!(r#"<tev:SetSynchronizationPoint xmlns:tev="{EVENTS_NS}"/>"#)
}

/// Request sent to a subscription manager endpoint.
///
/// Reference parameters handed out with the subscription are echoed as
/// header blocks.
pub fn addressed_request(action: &str, body: String, reference_parameters: &[String]) -> SoapRequest {
    reference_parameters
        .iter()
        .fold(SoapRequest::new(action, body).with_addressing(), |request, parameter| {
            request.with_header(parameter.clone())
        })
}

/// `CurrentTime` / `TerminationTime` pair reported by the device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Lease {
    pub current_time: Option<DateTime<Utc>>,
    pub termination_time: Option<DateTime<Utc>>,
}

impl Lease {
    pub fn from_response(response: &Element) -> Self {
        let time = |name: &str| {
            response
                .get_child(name)
                .and_then(|el| xml::parse_datetime(&xml::text(el)))
        };
        Self {
            current_time: time("CurrentTime"),
            termination_time: time("TerminationTime"),
        }
    }

    /// Granted lifetime measured on the device clock.
    ///
    /// Without `CurrentTime` the local clock stands in. Without
    /// `TerminationTime` the lifetime we asked for is assumed. A
    /// termination time in the past yields zero.
    pub fn lifetime(&self, requested: Duration) -> Duration {
        let Some(termination) = self.termination_time else {
            return requested;
        };
        let current = self.current_time.unwrap_or_else(Utc::now);
        (termination - current).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Subscription handed out by `Subscribe` or `CreatePullPointSubscription`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionGrant {
    /// Subscription manager endpoint
    pub reference_address: String,
    /// Serialized `ReferenceParameters` children
    pub reference_parameters: Vec<String>,
    /// Device-assigned `SubscriptionId`, or the reference address
    pub subscription_id: String,
    pub lease: Lease,
}

/// Parse the `response_name` element (`SubscribeResponse` or
/// `CreatePullPointSubscriptionResponse`) of `response`.
pub fn parse_grant(response: &SoapResponse, response_name: &str) -> Result<SubscriptionGrant> {
    let element = response.response(response_name)?;
    let reference = element
        .get_child("SubscriptionReference")
        .ok_or_else(|| StreamError::Parse(format!("{response_name} without SubscriptionReference")))?;
    let reference_address = xml::child_text(reference, &["Address"])
        .ok_or_else(|| StreamError::Parse("SubscriptionReference without Address".to_string()))?;

    let subscription_id = xml::find(reference, "SubscriptionId")
        .map(xml::text)
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| reference_address.clone());

    Ok(SubscriptionGrant {
        reference_parameters: reference_parameters(&response.body),
        subscription_id,
        lease: Lease::from_response(element),
        reference_address,
    })
}

/// Children of `ReferenceParameters`, serialized with their namespaces.
pub fn reference_parameters(raw: &str) -> Vec<String> {
    let Some(payload) = xml::payload(raw) else {
        return Vec::new();
    };
    let root = match Element::parse(payload.as_bytes()) {
        Ok(root) => root,
        Err(e) => {
            debug!("Could not re-read response for reference parameters: {}", e);
            return Vec::new();
        }
    };
    let Some(parameters) = xml::find(&root, "ReferenceParameters") else {
        return Vec::new();
    };

    let config = EmitterConfig::new().write_document_declaration(false);
    parameters
        .children
        .iter()
        .filter_map(|node| match node {
            XMLNode::Element(child) => {
                let mut buffer = Vec::new();
                child.write_with_config(&mut buffer, config.clone()).ok()?;
                String::from_utf8(buffer).ok()
            }
            _ => None,
        })
        .collect()
}

/// One `PullMessagesResponse`.
#[derive(Debug, Clone, PartialEq)]
pub struct PullBatch {
    pub lease: Lease,
    pub notifications: Vec<Notification>,
}

pub fn parse_pull_response(response: &SoapResponse) -> Result<PullBatch> {
    let element = response.response("PullMessagesResponse")?;
    Ok(PullBatch {
        lease: Lease::from_response(element),
        notifications: parse_messages(element),
    })
}
