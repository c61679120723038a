//! Event routing for push notifications.
//!
//! The `EventRouter` keeps the set of active route keys, one per push
//! subscription, and forwards bodies received on a registered route to a
//! channel.

use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

use crate::error::{CallbackError, Result};

/// Unparsed notification received on a route.
#[derive(Debug, Clone)]
pub struct NotificationPayload {
    /// Route key from the request path
    pub route_key: String,
    /// Raw request body
    pub body: String,
}

/// Routes request bodies to a channel by route key.
#[derive(Clone)]
pub struct EventRouter {
    routes: Arc<RwLock<HashSet<String>>>,
    event_sender: mpsc::UnboundedSender<NotificationPayload>,
}

impl EventRouter {
    /// Create a new event router.
    ///
    /// # Example
    ///
    /// ```
    /// use tokio::sync::mpsc;
    /// use callback_server::router::{EventRouter, NotificationPayload};
    ///
    /// let (tx, mut rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// let router = EventRouter::new(tx);
    /// ```
    pub fn new(event_sender: mpsc::UnboundedSender<NotificationPayload>) -> Self {
        Self {
            routes: Arc::new(RwLock::new(HashSet::new())),
            event_sender,
        }
    }

    /// Register a route key.
    ///
    /// Keys become a single path segment, so they are limited to
    /// ASCII letters, digits, `-`, `_` and `.`.
    ///
    /// ```
    /// # use tokio::sync::mpsc;
    /// # use callback_server::router::{EventRouter, NotificationPayload};
    /// # #[tokio::main]
    /// # async fn main() {
    /// # let (tx, _rx) = mpsc::unbounded_channel::<NotificationPayload>();
    /// # let router = EventRouter::new(tx);
    /// router.register("cam-1".to_string()).await.unwrap();
    /// # }
    /// ```
    pub async fn register(&self, route_key: String) -> Result<()> {
        if !is_valid_key(&route_key) {
            return Err(CallbackError::InvalidRouteKey(route_key));
        }
        self.routes.write().await.insert(route_key);
        Ok(())
    }

    /// Unregister a route key. Returns whether it was registered.
    pub async fn unregister(&self, route_key: &str) -> bool {
        self.routes.write().await.remove(route_key)
    }

    pub async fn is_registered(&self, route_key: &str) -> bool {
        self.routes.read().await.contains(route_key)
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Forward `body` if `route_key` is registered.
    ///
    /// Returns `false` when the key is unknown and the body was dropped.
    pub async fn route_event(&self, route_key: String, body: String) -> bool {
        let routes = self.routes.read().await;
        if !routes.contains(&route_key) {
            debug!(route = %route_key, "Dropping notification for unknown route");
            return false;
        }

        // Receiver gone means the engine is shutting down
        let _ = self.event_sender.send(NotificationPayload { route_key, body });
        true
    }
}

/// True for keys usable as one URL path segment.
pub fn is_valid_key(key: &str) -> bool {
    !key.is_empty()
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        && key != "."
        && key != ".."
}
