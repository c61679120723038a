//! ONVIF client engine
//!
//! Discovers ONVIF cameras and doorbells on the local network, negotiates
//! authentication with each of them and keeps their event subscriptions
//! alive across renewals, address changes and restarts.
//!
//! # Features
//!
//! - **Discovery**: WS-Discovery multicast probes with unicast fallback
//! - **Authentication**: WS-Security UsernameToken, HTTP Digest and Basic, chosen per device
//! - **Liveness**: devices that stop answering are reported offline and rediscovered with backoff
//! - **Events**: push delivery through a local callback server or pull-point polling
//! - **Persistence**: identity and auth state are saved and restored between runs
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use onvif_sdk::{Credentials, EngineConfig, OnvifEngine};
//! use std::net::{IpAddr, Ipv4Addr};
//!
//! # async fn example() -> Result<(), onvif_sdk::SdkError> {
//! let config = EngineConfig::default().with_credentials(Credentials::new("admin", "secret"));
//! let engine = OnvifEngine::new(config).await?;
//!
//! let doorbell = engine.add_manual_device(IpAddr::V4(Ipv4Addr::new(192, 168, 1, 40)), 80);
//! engine.initialize_device(&doorbell).await?;
//! engine
//!     .subscribe_events(&doorbell, |topic, name, value| {
//!         println!("{topic}: {name}={value}");
//!     })
//!     .await?;
//!
//! println!("{}", doorbell.status_text());
//! # Ok(())
//! # }
//! ```

pub mod config;
mod context;
mod engine;
mod error;
pub mod logging;
pub mod persist;

pub use config::EngineConfig;
pub use context::{DeviceContext, DeviceHandle, DeviceStatus};
pub use engine::{LivenessEvent, OnvifEngine};
pub use error::{Result, SdkError};
pub use persist::{DeviceSnapshot, JsonFileStore, PersistStore};

pub use onvif_discovery::{DeviceIdentity, DiscoveryConfig, DiscoveryMethod};
pub use onvif_stream::{DeliveryMode, EventTopic, SubscriptionConfig, SubscriptionEvent, SubscriptionRecord, SubscriptionState};
pub use soap_client::{AuthConfig, Credentials, DispatchConfig, ServiceEndpoints};
