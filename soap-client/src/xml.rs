//! SOAP 1.2 envelope building and namespace-agnostic XML access.
//!
//! Devices disagree wildly on namespace prefixes, so every parsed document
//! has its prefixes and namespace bindings stripped before lookup. After
//! stripping, elements are addressed by local name only.

use chrono::{DateTime, NaiveDateTime, Utc};
use xmltree::{Element, XMLNode};

use crate::error::{Result, SoapError};

pub const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
pub const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
pub const WSSE_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-secext-1.0.xsd";
pub const WSU_NS: &str =
    "http://docs.oasis-open.org/wss/2004/01/oasis-200401-wss-wssecurity-utility-1.0.xsd";
pub const DEVICE_NS: &str = "http://www.onvif.org/ver10/device/wsdl";
pub const MEDIA_NS: &str = "http://www.onvif.org/ver10/media/wsdl";
pub const EVENTS_NS: &str = "http://www.onvif.org/ver10/events/wsdl";
pub const SCHEMA_NS: &str = "http://www.onvif.org/ver10/schema";
pub const WSNT_NS: &str = "http://docs.oasis-open.org/wsn/b-2";
pub const TOPICS_NS: &str = "http://www.onvif.org/ver10/topics";

/// Wrap `body` in a SOAP 1.2 envelope. Header blocks are inserted verbatim.
pub fn envelope(headers: &[String], body: &str) -> String {
    let header = if headers.is_empty() {
        String::new()
    } else {
        format!("<s:Header>{}</s:Header>", headers.concat())
    };
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:wsa="{WSA_NS}">{header}<s:Body>{body}</s:Body></s:Envelope>"#
    )
}

/// WS-Addressing header blocks addressed to `to`.
pub fn addressing_headers(action: &str, to: &str) -> Vec<String> {
    vec![
        format!("<wsa:MessageID>urn:uuid:{}</wsa:MessageID>", uuid::Uuid::new_v4()),
        format!("<wsa:To s:mustUnderstand=\"1\">{}</wsa:To>", escape(to)),
        format!("<wsa:Action s:mustUnderstand=\"1\">{}</wsa:Action>", escape(action)),
    ]
}

/// Parse `text` into a tree with all namespace information removed.
pub fn parse(text: &str) -> Result<Element> {
    let mut root = Element::parse(text.as_bytes()).map_err(|e| SoapError::Parse(e.to_string()))?;
    strip_namespaces(&mut root);
    Ok(root)
}

/// Drop prefixes and namespace bindings from `element` and its subtree.
pub fn strip_namespaces(element: &mut Element) {
    element.prefix = None;
    element.namespace = None;
    element.namespaces = None;
    for child in element.children.iter_mut() {
        if let XMLNode::Element(child) = child {
            strip_namespaces(child);
        }
    }
}

/// Slice of `raw` starting at the first `<`.
///
/// Push deliveries sometimes carry stray bytes before the document.
pub fn payload(raw: &str) -> Option<&str> {
    raw.find('<').map(|start| &raw[start..])
}

/// The envelope's `Body` element.
pub fn body(envelope: &Element) -> Result<&Element> {
    envelope
        .get_child("Body")
        .ok_or_else(|| SoapError::Parse("Missing SOAP Body".to_string()))
}

/// Depth-first search for the first element named `name`, including `element` itself.
pub fn find<'a>(element: &'a Element, name: &str) -> Option<&'a Element> {
    if element.name == name {
        return Some(element);
    }
    element.children.iter().find_map(|node| match node {
        XMLNode::Element(child) => find(child, name),
        _ => None,
    })
}

/// All elements named `name` in document order. Matches are not searched
/// for nested matches.
pub fn find_all<'a>(element: &'a Element, name: &str) -> Vec<&'a Element> {
    let mut found = Vec::new();
    collect(element, name, &mut found);
    found
}

fn collect<'a>(element: &'a Element, name: &str, found: &mut Vec<&'a Element>) {
    if element.name == name {
        found.push(element);
        return;
    }
    for node in &element.children {
        if let XMLNode::Element(child) = node {
            collect(child, name, found);
        }
    }
}

/// Direct element children of `element`.
pub fn children(element: &Element) -> impl Iterator<Item = &Element> {
    element.children.iter().filter_map(|node| match node {
        XMLNode::Element(child) => Some(child),
        _ => None,
    })
}

/// Follow `path` of child names from `element`.
pub fn descend<'a>(element: &'a Element, path: &[&str]) -> Option<&'a Element> {
    path.iter().try_fold(element, |current, name| current.get_child(*name))
}

/// Trimmed text of `element`, empty when it has none.
pub fn text(element: &Element) -> String {
    element
        .get_text()
        .map(|t| t.trim().to_string())
        .unwrap_or_default()
}

/// Trimmed, non-empty text found by following `path`.
pub fn child_text(element: &Element, path: &[&str]) -> Option<String> {
    descend(element, path)
        .map(text)
        .filter(|t| !t.is_empty())
}

/// Parse an `xs:boolean`.
pub fn parse_bool(value: &str) -> bool {
    matches!(value.trim(), "true" | "1")
}

/// Local part of a qualified name such as `ter:NotAuthorized`.
pub fn local_name(qualified: &str) -> &str {
    let qualified = qualified.trim();
    qualified.rsplit(':').next().unwrap_or(qualified)
}

/// Escape text for inclusion in element content or attribute values.
pub fn escape(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

/// Parse an `xs:dateTime`. Values without a zone are taken as UTC.
pub fn parse_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(value, format).ok())
        .map(|naive| naive.and_utc())
}

/// Format a duration in seconds as an `xs:duration`.
pub fn duration(seconds: u64) -> String {
    format!("PT{}S", seconds)
}

/// SOAP fault extracted from a response envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Code values from outermost to innermost subcode, prefixes removed
    pub codes: Vec<String>,
    pub reason: String,
}

impl Fault {
    /// Extract a SOAP 1.2 (or 1.1) fault from a stripped envelope.
    pub fn from_envelope(envelope: &Element) -> Option<Self> {
        let fault = envelope.get_child("Body")?.get_child("Fault")?;

        let mut codes = Vec::new();
        let mut code = fault.get_child("Code");
        while let Some(current) = code {
            if let Some(value) = current.get_child("Value") {
                codes.push(local_name(&text(value)).to_string());
            }
            code = current.get_child("Subcode");
        }
        if codes.is_empty() {
            if let Some(value) = fault.get_child("faultcode") {
                codes.push(local_name(&text(value)).to_string());
            }
        }

        let reason = child_text(fault, &["Reason", "Text"])
            .or_else(|| child_text(fault, &["faultstring"]))
            .unwrap_or_default();

        Some(Self { codes, reason })
    }

    /// Innermost code, the most specific one.
    pub fn code(&self) -> &str {
        self.codes.last().map(String::as_str).unwrap_or("Unknown")
    }

    /// Sender faults repeat identically when the same request is resent.
    pub fn is_sender(&self) -> bool {
        matches!(self.codes.first().map(String::as_str), Some("Sender") | Some("Client"))
    }

    /// Fault signatures devices use to demand WS-Security credentials.
    pub fn is_auth_failure(&self) -> bool {
        const AUTH_CODES: [&str; 4] = [
            "NotAuthorized",
            "FailedAuthentication",
            "InvalidSecurity",
            "FailedCheck",
        ];
        self.codes.iter().any(|c| AUTH_CODES.contains(&c.as_str()))
            || self.reason.to_ascii_lowercase().contains("not authorized")
    }
}

impl From<Fault> for SoapError {
    fn from(fault: Fault) -> Self {
        SoapError::Fault {
            code: fault.code().to_string(),
            reason: fault.reason,
        }
    }
}
