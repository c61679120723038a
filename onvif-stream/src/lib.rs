//! Event subscriptions for ONVIF devices.
//!
//! Subscribes devices to motion, visitor, tamper and line-crossing events
//! and keeps the subscriptions alive. Notifications arrive either pushed to
//! an embedded callback server or by polling a pull point, and are handed
//! to a per-device sink as `(topic_path, item_name, item_value)` tuples.
//!
//! # Features
//!
//! - **Push and pull**: WS-BaseNotification `Subscribe` when the host is
//!   reachable, `CreatePullPointSubscription` otherwise
//! - **Topic filtering**: `ConcreteSet` topic expressions built from the
//!   topics a device advertises
//! - **Renewal**: timers armed at lifetime minus a random margin; devices
//!   that mishandle `Renew` are resubscribed instead
//! - **Recovery**: pull points that stop answering are replaced
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use onvif_stream::{EventSink, SubscriptionConfig, SubscriptionManager};
//! use soap_client::{AuthConfig, DeviceSession, SoapClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = SoapClient::new()?;
//! let session = Arc::new(DeviceSession::new("urn:uuid:cam-1", None, AuthConfig::default()));
//! let endpoints = client
//!     .query_endpoints(&session, "http://192.168.1.20/onvif/device_service", &Default::default())
//!     .await?;
//!
//! let manager = SubscriptionManager::new(client, SubscriptionConfig::pull_only(), None).await?;
//! let sink: EventSink = Arc::new(|topic, name, value| println!("{topic} {name}={value}"));
//! manager.subscribe(session, &endpoints, sink).await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod manager;
pub mod messages;
pub mod notification;
pub mod subscription;
pub mod topic;

pub use config::SubscriptionConfig;
pub use error::{Result, StreamError};
pub use manager::{choose_mode, route_key, EventSink, SubscriptionEvent, SubscriptionManager};
pub use notification::{parse_notify, Notification, SimpleItem};
pub use subscription::{DeliveryMode, SubscriptionRecord, SubscriptionState, TimerHandle};
pub use topic::{EventTopic, CONCRETE_SET_DIALECT};
