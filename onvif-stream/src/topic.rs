//! Event topic classification.
//!
//! Topic paths are resolved to an [`EventTopic`] once, when a notification
//! is parsed. Everything downstream dispatches on the enum.

use std::fmt;

use serde::{Deserialize, Serialize};
use soap_client::xml;

/// `TopicExpression` dialect for `|`-separated concrete topic paths.
pub const CONCRETE_SET_DIALECT: &str = "http://www.onvif.org/ver10/tev/topicExpression/ConcreteSet";

/// Event categories the engine understands.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventTopic {
    Motion,
    Tamper,
    LineCross,
    Visitor,
    Other(String),
}

impl EventTopic {
    /// Classify a topic path such as `tns1:RuleEngine/CellMotionDetector/Motion`.
    pub fn classify(topic_path: &str) -> Self {
        let path = normalize_path(topic_path);
        let lower = path.to_ascii_lowercase();

        if lower.contains("tamper") {
            EventTopic::Tamper
        } else if lower.contains("linedetector") || lower.contains("linecross") || lower.contains("crossed") {
            EventTopic::LineCross
        } else if lower.contains("visitor") || lower.contains("doorbell") {
            EventTopic::Visitor
        } else if lower.contains("motion") {
            EventTopic::Motion
        } else {
            EventTopic::Other(path)
        }
    }

    /// The four categories subscribed to by default.
    pub fn defaults() -> Vec<EventTopic> {
        vec![
            EventTopic::Motion,
            EventTopic::Visitor,
            EventTopic::Tamper,
            EventTopic::LineCross,
        ]
    }
}

impl fmt::Display for EventTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventTopic::Motion => f.write_str("motion"),
            EventTopic::Tamper => f.write_str("tamper"),
            EventTopic::LineCross => f.write_str("line-cross"),
            EventTopic::Visitor => f.write_str("visitor"),
            EventTopic::Other(path) => f.write_str(path),
        }
    }
}

/// Strip namespace prefixes from every segment of a topic path.
pub fn normalize_path(topic_path: &str) -> String {
    topic_path
        .trim()
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(xml::local_name)
        .collect::<Vec<_>>()
        .join("/")
}

/// Concrete topic paths from `supported` that fall into `wanted`.
pub fn select_topics<'a>(supported: &'a [String], wanted: &[EventTopic]) -> Vec<&'a str> {
    supported
        .iter()
        .map(String::as_str)
        .filter(|path| wanted.contains(&EventTopic::classify(path)))
        .collect()
}

/// `wsnt:TopicExpression` for the wanted topics the device supports.
///
/// `None` when nothing matches; the subscription is then unfiltered and
/// notifications are filtered on receipt.
pub fn topic_expression(supported: &[String], wanted: &[EventTopic]) -> Option<String> {
    let selected = select_topics(supported, wanted);
    if selected.is_empty() {
        return None;
    }
    let expression = selected
        .iter()
        .map(|path| format!("tns1:{}", xml::escape(path)))
        .collect::<Vec<_>>()
        .join("|");
    Some(format!(
        r#"<wsnt:TopicExpression Dialect="{CONCRETE_SET_DIALECT}" xmlns:tns1="{}">{expression}</wsnt:TopicExpression>"#,
        xml::TOPICS_NS
    ))
}
