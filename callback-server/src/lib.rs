//! HTTP callback server for push event delivery.
//!
//! Devices subscribed in push mode send their notifications to this server.
//! It knows nothing about ONVIF: it accepts `POST` or `NOTIFY` requests on
//! `/event/<route_key>`, enforces a body limit, and forwards the raw body of
//! registered routes to a channel. Parsing happens in the consuming crate.
//!
//! # Example
//!
//! ```no_run
//! use callback_server::{CallbackServer, NotificationPayload, ServerConfig};
//! use tokio::sync::mpsc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), callback_server::CallbackError> {
//!     let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
//!     let server = CallbackServer::new(ServerConfig::default(), tx).await?;
//!
//!     server.router().register("cam-1".to_string()).await?;
//!
//!     tokio::spawn(async move {
//!         while let Some(notification) = rx.recv().await {
//!             println!("{}: {} bytes", notification.route_key, notification.body.len());
//!         }
//!     });
//!
//!     server.shutdown().await
//! }
//! ```

mod error;
pub mod router;
mod server;

pub use error::{CallbackError, Result};
pub use router::{EventRouter, NotificationPayload};
pub use server::{CallbackServer, ServerConfig, DEFAULT_BODY_LIMIT, ROUTE_PREFIX};
