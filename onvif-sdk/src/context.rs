//! Per-device context owned by the engine

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use onvif_discovery::{DeviceIdentity, DiscoveryMethod, SharedIdentity};
use onvif_stream::EventSink;
use soap_client::{Credentials, DeviceSession, ServiceEndpoints};

/// Coarse device status for display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DeviceStatus {
    #[default]
    Responding,
    NotResponding,
    Subscribed,
    Unsubscribed,
    UnsupportedAuth,
}

impl DeviceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceStatus::Responding => "Responding",
            DeviceStatus::NotResponding => "Not responding",
            DeviceStatus::Subscribed => "Subscribed",
            DeviceStatus::Unsubscribed => "Unsubscribed",
            DeviceStatus::UnsupportedAuth => "Unsupported auth",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a registered device
pub type DeviceHandle = Arc<DeviceContext>;

/// Everything the engine tracks for one device.
///
/// The identity is shared with rediscovery, which refreshes it in place when
/// the device comes back at a new address.
pub struct DeviceContext {
    identity: SharedIdentity,
    session: RwLock<Arc<DeviceSession>>,
    credentials: RwLock<Option<Credentials>>,
    endpoints: RwLock<Option<ServiceEndpoints>>,
    status: RwLock<DeviceStatus>,
    online: AtomicBool,
    subscribed: AtomicBool,
    sink: RwLock<Option<EventSink>>,
}

impl DeviceContext {
    pub(crate) fn new(identity: SharedIdentity, session: DeviceSession, credentials: Option<Credentials>) -> Self {
        Self {
            identity,
            session: RwLock::new(Arc::new(session)),
            credentials: RwLock::new(credentials),
            endpoints: RwLock::new(None),
            status: RwLock::new(DeviceStatus::Responding),
            online: AtomicBool::new(true),
            subscribed: AtomicBool::new(false),
            sink: RwLock::new(None),
        }
    }

    pub fn urn(&self) -> String {
        self.identity.read().urn.clone()
    }

    /// Snapshot of the current identity
    pub fn identity(&self) -> DeviceIdentity {
        self.identity.read().clone()
    }

    pub(crate) fn shared_identity(&self) -> SharedIdentity {
        Arc::clone(&self.identity)
    }

    /// Device service URL at the last known address
    pub fn device_url(&self) -> String {
        self.identity.read().device_service_address.clone()
    }

    pub fn is_manual(&self) -> bool {
        self.identity.read().discovery_method == DiscoveryMethod::Manual
    }

    pub fn session(&self) -> Arc<DeviceSession> {
        Arc::clone(&self.session.read())
    }

    pub(crate) fn replace_session(&self, session: DeviceSession) {
        *self.session.write() = Arc::new(session);
    }

    pub fn credentials(&self) -> Option<Credentials> {
        self.credentials.read().clone()
    }

    pub(crate) fn set_credentials(&self, credentials: Option<Credentials>) {
        *self.credentials.write() = credentials;
    }

    /// Endpoints from the last successful initialization
    pub fn endpoints(&self) -> Option<ServiceEndpoints> {
        self.endpoints.read().clone()
    }

    pub(crate) fn set_endpoints(&self, endpoints: Option<ServiceEndpoints>) {
        *self.endpoints.write() = endpoints;
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.read()
    }

    /// Display string for the current status
    pub fn status_text(&self) -> &'static str {
        self.status().as_str()
    }

    pub(crate) fn set_status(&self, status: DeviceStatus) {
        *self.status.write() = status;
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value
    pub(crate) fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }

    pub(crate) fn set_subscribed(&self, subscribed: bool) {
        self.subscribed.store(subscribed, Ordering::SeqCst);
    }

    /// Status to show once the device answers again
    pub(crate) fn reachable_status(&self) -> DeviceStatus {
        if self.is_subscribed() {
            DeviceStatus::Subscribed
        } else {
            DeviceStatus::Responding
        }
    }

    pub(crate) fn sink(&self) -> Option<EventSink> {
        self.sink.read().clone()
    }

    pub(crate) fn set_sink(&self, sink: Option<EventSink>) {
        *self.sink.write() = sink;
    }
}

impl fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceContext")
            .field("urn", &self.urn())
            .field("status", &self.status())
            .field("online", &self.is_online())
            .finish()
    }
}
