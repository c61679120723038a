//! Notification parsing.
//!
//! Pushed `Notify` bodies and `PullMessagesResponse` bodies share the
//! `NotificationMessage` structure. Some devices push bare `Message`
//! blocks without the WS-BaseNotification wrapper; those are picked up by
//! a permissive second pass.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use soap_client::xml;
use tracing::debug;
use xmltree::{Element, XMLNode};

use crate::error::{Result, StreamError};
use crate::topic::{normalize_path, EventTopic};

/// One `SimpleItem` name/value pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimpleItem {
    pub name: String,
    pub value: String,
}

/// A parsed event message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Topic path with prefixes removed
    pub topic_path: String,
    pub topic: EventTopic,
    pub source: Vec<SimpleItem>,
    pub data: Vec<SimpleItem>,
    pub utc_time: Option<DateTime<Utc>>,
    /// `Initialized`, `Changed` or `Deleted`
    pub property_operation: Option<String>,
}

impl Notification {
    /// `(topic_path, item_name, item_value)` for each data item, or for
    /// each source item when the message carries no data.
    pub fn tuples(&self) -> Vec<(String, String, String)> {
        let items = if self.data.is_empty() { &self.source } else { &self.data };
        items
            .iter()
            .map(|item| (self.topic_path.clone(), item.name.clone(), item.value.clone()))
            .collect()
    }

    /// Value of the named data item.
    pub fn data_value(&self, name: &str) -> Option<&str> {
        self.data
            .iter()
            .find(|item| item.name == name)
            .map(|item| item.value.as_str())
    }
}

/// Parse a pushed notification body.
///
/// Bytes before the first `<` are ignored.
pub fn parse_notify(raw: &str) -> Result<Vec<Notification>> {
    let payload = xml::payload(raw).ok_or_else(|| StreamError::Parse("notification without XML".to_string()))?;
    let root = xml::parse(payload).map_err(|e| StreamError::Parse(e.to_string()))?;
    Ok(parse_messages(&root))
}

/// Extract every notification under `root`.
pub fn parse_messages(root: &Element) -> Vec<Notification> {
    let wrapped = xml::find_all(root, "NotificationMessage");
    if !wrapped.is_empty() {
        return wrapped.into_iter().filter_map(parse_notification_message).collect();
    }

    let mut found = Vec::new();
    scan_bare_messages(root, &mut None, &mut found);
    if !found.is_empty() {
        debug!("Parsed {} notification(s) without NotificationMessage wrapper", found.len());
    }
    found
}

fn parse_notification_message(element: &Element) -> Option<Notification> {
    let topic = element.get_child("Topic").map(xml::text).unwrap_or_default();
    let outer = element.get_child("Message")?;
    // tt:Message nested in wsnt:Message; some devices omit one level
    let message = outer.get_child("Message").unwrap_or(outer);
    Some(build(&topic, message))
}

/// Depth-first walk for `Message` elements carrying `Source` or `Data`,
/// remembering the last `Topic` seen in document order.
fn scan_bare_messages(element: &Element, topic: &mut Option<String>, found: &mut Vec<Notification>) {
    if element.name == "Topic" {
        *topic = Some(xml::text(element));
        return;
    }
    if element.name == "Message" && is_event_message(element) {
        found.push(build(topic.as_deref().unwrap_or_default(), element));
        return;
    }
    for node in &element.children {
        if let XMLNode::Element(child) = node {
            scan_bare_messages(child, topic, found);
        }
    }
}

fn is_event_message(element: &Element) -> bool {
    element.get_child("Source").is_some() || element.get_child("Data").is_some()
}

fn build(topic: &str, message: &Element) -> Notification {
    let topic_path = normalize_path(topic);
    Notification {
        topic: EventTopic::classify(&topic_path),
        topic_path,
        source: simple_items(message.get_child("Source")),
        data: simple_items(message.get_child("Data")),
        utc_time: message.attributes.get("UtcTime").and_then(|t| xml::parse_datetime(t)),
        property_operation: message.attributes.get("PropertyOperation").cloned(),
    }
}

fn simple_items(container: Option<&Element>) -> Vec<SimpleItem> {
    let Some(container) = container else {
        return Vec::new();
    };
    xml::find_all(container, "SimpleItem")
        .into_iter()
        .filter_map(|item| {
            Some(SimpleItem {
                name: item.attributes.get("Name")?.clone(),
                value: item.attributes.get("Value").cloned().unwrap_or_default(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOTIFY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<env:Envelope xmlns:env="http://www.w3.org/2003/05/soap-envelope"
    xmlns:wsnt="http://docs.oasis-open.org/wsn/b-2"
    xmlns:tt="http://www.onvif.org/ver10/schema"
    xmlns:tns1="http://www.onvif.org/ver10/topics">
  <env:Body>
    <wsnt:Notify>
      <wsnt:NotificationMessage>
        <wsnt:Topic Dialect="http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet">tns1:RuleEngine/CellMotionDetector/Motion</wsnt:Topic>
        <wsnt:Message>
          <tt:Message UtcTime="2024-05-01T10:15:30Z" PropertyOperation="Changed">
            <tt:Source>
              <tt:SimpleItem Name="VideoSourceConfigurationToken" Value="VideoSourceToken"/>
              <tt:SimpleItem Name="Rule" Value="MyMotionDetectorRule"/>
            </tt:Source>
            <tt:Data>
              <tt:SimpleItem Name="IsMotion" Value="true"/>
            </tt:Data>
          </tt:Message>
        </wsnt:Message>
      </wsnt:NotificationMessage>
      <wsnt:NotificationMessage>
        <wsnt:Topic>tns1:RuleEngine/TamperDetector/Tamper</wsnt:Topic>
        <wsnt:Message>
          <tt:Message UtcTime="2024-05-01T10:15:31Z">
            <tt:Data><tt:SimpleItem Name="IsTamper" Value="false"/></tt:Data>
          </tt:Message>
        </wsnt:Message>
      </wsnt:NotificationMessage>
    </wsnt:Notify>
  </env:Body>
</env:Envelope>"#;

    #[test]
    fn test_parse_wrapped_notifications() {
        let notifications = parse_notify(NOTIFY).unwrap();
        assert_eq!(notifications.len(), 2);

        let motion = &notifications[0];
        assert_eq!(motion.topic, EventTopic::Motion);
        assert_eq!(motion.topic_path, "RuleEngine/CellMotionDetector/Motion");
        assert_eq!(motion.data_value("IsMotion"), Some("true"));
        assert_eq!(motion.source.len(), 2);
        assert_eq!(motion.property_operation.as_deref(), Some("Changed"));
        assert_eq!(
            motion.utc_time.unwrap().to_rfc3339(),
            "2024-05-01T10:15:30+00:00"
        );

        assert_eq!(notifications[1].topic, EventTopic::Tamper);
    }

    #[test]
    fn test_tuples() {
        let notifications = parse_notify(NOTIFY).unwrap();
        assert_eq!(
            notifications[0].tuples(),
            vec![(
                "RuleEngine/CellMotionDetector/Motion".to_string(),
                "IsMotion".to_string(),
                "true".to_string()
            )]
        );
    }

    #[test]
    fn test_tuples_fall_back_to_source() {
        let notification = Notification {
            topic_path: "Device/Trigger/DigitalInput".into(),
            topic: EventTopic::Other("Device/Trigger/DigitalInput".into()),
            source: vec![SimpleItem {
                name: "InputToken".into(),
                value: "DI_0".into(),
            }],
            data: Vec::new(),
            utc_time: None,
            property_operation: None,
        };
        assert_eq!(notification.tuples()[0].1, "InputToken");
    }

    #[test]
    fn test_leading_bytes_ignored() {
        let raw = format!("\r\n\r\n{}", NOTIFY);
        assert_eq!(parse_notify(&raw).unwrap().len(), 2);
    }

    #[test]
    fn test_permissive_bare_messages() {
        let raw = r#"<Envelope><Body><Notify>
            <Topic>tns1:RuleEngine/MyRuleDetector/Visitor</Topic>
            <Message><Message UtcTime="2024-05-01T10:15:30Z">
              <Source><SimpleItem Name="Source" Value="Doorbell"/></Source>
              <Data><SimpleItem Name="State" Value="true"/></Data>
            </Message></Message>
        </Notify></Body></Envelope>"#;

        let notifications = parse_notify(raw).unwrap();
        assert_eq!(notifications.len(), 1);
        assert_eq!(notifications[0].topic, EventTopic::Visitor);
        assert_eq!(notifications[0].data_value("State"), Some("true"));
    }

    #[test]
    fn test_single_message_level() {
        let raw = r#"<Notify><NotificationMessage>
            <Topic>tns1:RuleEngine/LineDetector/Crossed</Topic>
            <Message><Data><SimpleItem Name="ObjectId" Value="7"/></Data></Message>
        </NotificationMessage></Notify>"#;

        let notifications = parse_notify(raw).unwrap();
        assert_eq!(notifications[0].topic, EventTopic::LineCross);
        assert_eq!(notifications[0].data_value("ObjectId"), Some("7"));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(parse_notify("no xml here").is_err());
        assert!(parse_notify("<unclosed").is_err());
        assert!(parse_notify("<Envelope><Body/></Envelope>").unwrap().is_empty());
    }
}
