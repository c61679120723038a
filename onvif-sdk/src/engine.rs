//! OnvifEngine - host-facing entry point
//!
//! Owns the device registry and wires the pieces together: discovery feeds
//! identities in, the dispatcher reports liveness back, rediscovery brings
//! lost devices home and the subscription manager keeps events flowing.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use admission::Semaphore;
use futures::stream::{Stream, StreamExt};
use onvif_discovery::{DeviceIdentity, Discovery, Rediscovery, RediscoveryCallback, SharedIdentity};
use onvif_stream::{EventSink, StreamError, SubscriptionEvent, SubscriptionManager, SubscriptionRecord};
use parking_lot::{Mutex, RwLock};
use soap_client::{DeviceSession, LivenessSink, ServiceEndpoints, SoapClient, SoapError};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::context::{DeviceContext, DeviceHandle, DeviceStatus};
use crate::error::{Result, SdkError};
use crate::persist::{DeviceSnapshot, JsonFileStore, PersistStore};

type DeviceMap = Arc<RwLock<HashMap<String, DeviceHandle>>>;

/// Reachability transitions reported by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessEvent {
    Online { urn: String },
    Offline { urn: String, reason: String },
}

impl LivenessEvent {
    pub fn urn(&self) -> &str {
        match self {
            LivenessEvent::Online { urn } | LivenessEvent::Offline { urn, .. } => urn,
        }
    }
}

/// Main engine entry point
///
/// # Example
///
/// ```rust,no_run
/// use onvif_sdk::{EngineConfig, OnvifEngine};
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), onvif_sdk::SdkError> {
/// let engine = OnvifEngine::new(EngineConfig::default()).await?;
///
/// for device in engine.discover_devices(Duration::from_secs(3)).await? {
///     engine.initialize_device(&device).await?;
///     engine
///         .subscribe_events(&device, |topic, name, value| {
///             println!("{topic}: {name}={value}");
///         })
///         .await?;
/// }
///
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct OnvifEngine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    config: EngineConfig,
    client: SoapClient,
    discovery: Discovery,
    rediscovery: Arc<Rediscovery>,
    subscriptions: SubscriptionManager,
    devices: DeviceMap,
    admission: Arc<Semaphore>,
    liveness: broadcast::Sender<LivenessEvent>,
    store: Option<Arc<dyn PersistStore>>,
    root: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Dispatcher liveness hook. Updates device status and parks automatically
/// discovered devices for rediscovery.
struct LivenessBridge {
    devices: DeviceMap,
    rediscovery: Arc<Rediscovery>,
    events: broadcast::Sender<LivenessEvent>,
    recovered: mpsc::UnboundedSender<String>,
}

impl LivenessSink for LivenessBridge {
    fn mark_online(&self, urn: &str) {
        let Some(device) = self.devices.read().get(urn).cloned() else {
            return;
        };
        if device.set_online(true) {
            return;
        }

        info!(urn = %urn, "Device responding again");
        device.set_status(device.reachable_status());
        self.rediscovery.cancel(urn);
        let _ = self.events.send(LivenessEvent::Online { urn: urn.to_string() });
    }

    fn mark_offline(&self, urn: &str, reason: &str) {
        let Some(device) = self.devices.read().get(urn).cloned() else {
            return;
        };

        if device.set_online(false) {
            warn!(urn = %urn, reason = %reason, "Device not responding");
            device.set_status(DeviceStatus::NotResponding);
            let _ = self.events.send(LivenessEvent::Offline {
                urn: urn.to_string(),
                reason: reason.to_string(),
            });
        }

        if device.is_manual() {
            return;
        }
        let recovered = self.recovered.clone();
        let callback: RediscoveryCallback = Arc::new(move |identity: SharedIdentity| {
            let urn = identity.read().urn.clone();
            let _ = recovered.send(urn);
        });
        self.rediscovery.schedule(device.shared_identity(), callback);
    }
}

impl OnvifEngine {
    /// Create the engine and restore devices saved by a previous run
    ///
    /// Subscriptions left over from the previous run are released in the
    /// background; they are never resumed.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let store = config
            .persist_dir
            .clone()
            .map(|dir| Arc::new(JsonFileStore::new(dir)) as Arc<dyn PersistStore>);
        Self::with_store(config, store).await
    }

    /// Create the engine with a custom snapshot store, or none
    pub async fn with_store(config: EngineConfig, store: Option<Arc<dyn PersistStore>>) -> Result<Self> {
        config.validate()?;

        let root = CancellationToken::new();
        let devices: DeviceMap = Arc::new(RwLock::new(HashMap::new()));
        let (liveness, _) = broadcast::channel(64);
        let (recovered_tx, recovered_rx) = mpsc::unbounded_channel();

        let discovery = Discovery::new(config.discovery.clone())?;
        let rediscovery = Rediscovery::new(config.discovery.clone(), root.child_token())?;

        let bridge = LivenessBridge {
            devices: Arc::clone(&devices),
            rediscovery: Arc::clone(&rediscovery),
            events: liveness.clone(),
            recovered: recovered_tx,
        };
        let client = SoapClient::with_config(config.dispatch.clone())?.with_liveness(Arc::new(bridge));
        let subscriptions =
            SubscriptionManager::new(client.clone(), config.subscription.clone(), config.callback.clone()).await?;

        let inner = Arc::new(EngineInner {
            admission: Arc::new(Semaphore::new(config.device_permits)),
            config,
            client,
            discovery,
            rediscovery,
            subscriptions,
            devices,
            liveness,
            store,
            root,
            tasks: Mutex::new(Vec::new()),
        });

        inner.rediscovery.start();
        {
            let mut tasks = inner.tasks.lock();
            tasks.push(tokio::spawn(recovery(
                Arc::downgrade(&inner),
                recovered_rx,
                inner.root.clone(),
            )));
            tasks.push(tokio::spawn(watch_subscriptions(
                Arc::downgrade(&inner),
                inner.subscriptions.subscribe_events(),
                inner.root.clone(),
            )));
        }

        inner.restore();
        info!(devices = inner.devices.read().len(), "ONVIF engine started");
        Ok(Self { inner })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    // ========================================================================
    // Discovery
    // ========================================================================

    /// Run one discovery pass and register every device found
    ///
    /// Devices already known are refreshed in place and returned with the
    /// same handle.
    pub async fn discover_devices(&self, timeout: Duration) -> Result<Vec<DeviceHandle>> {
        let mut found = Vec::new();
        self.inner.discovery.run(timeout, |identity| found.push(identity)).await?;
        self.inner.rediscovery.resolve(&found);

        Ok(found.into_iter().map(|identity| self.inner.register(identity)).collect())
    }

    /// Like [`discover_devices`](Self::discover_devices), yielding handles
    /// as responses arrive
    pub fn discover_stream(&self, timeout: Duration) -> impl Stream<Item = DeviceHandle> + Send + Unpin + 'static {
        let inner = Arc::clone(&self.inner);
        self.inner.discovery.discover(timeout).map(move |identity| {
            inner.rediscovery.resolve(std::slice::from_ref(&identity));
            inner.register(identity)
        })
    }

    /// Register a device by address. Manual devices are never rediscovered.
    pub fn add_manual_device(&self, ip: IpAddr, port: u16) -> DeviceHandle {
        self.inner.register(DeviceIdentity::manual(ip, port))
    }

    // ========================================================================
    // Device lifecycle
    // ========================================================================

    /// Replace a device's credentials. Negotiated auth state is discarded.
    pub fn set_credentials(&self, device: &DeviceHandle, credentials: soap_client::Credentials) {
        device.set_credentials(Some(credentials.clone()));
        device.replace_session(DeviceSession::new(
            device.urn(),
            Some(credentials),
            self.inner.config.auth.clone(),
        ));
        if device.status() == DeviceStatus::UnsupportedAuth {
            device.set_status(DeviceStatus::Responding);
        }
        self.inner.persist(device);
    }

    /// Query the device's clock, information and service addresses
    ///
    /// # Errors
    ///
    /// * `SdkError::Admission` - too many initializations in flight for too long
    /// * `SdkError::Soap` - the device rejected or did not answer; auth
    ///   failures leave the device in `UnsupportedAuth`
    pub async fn initialize_device(&self, device: &DeviceHandle) -> Result<ServiceEndpoints> {
        self.inner.initialize(device).await
    }

    /// Subscribe to the device's events
    ///
    /// `on_event` receives `(topic_path, item_name, item_value)` for every
    /// item of every notification. Any previous subscription for the device
    /// is replaced.
    pub async fn subscribe_events<F>(&self, device: &DeviceHandle, on_event: F) -> Result<SubscriptionRecord>
    where
        F: Fn(&str, &str, &str) + Send + Sync + 'static,
    {
        let sink: EventSink = Arc::new(on_event);
        device.set_sink(Some(Arc::clone(&sink)));
        self.inner.subscribe(device, sink).await
    }

    /// Re-run initialization and, when events were requested, subscribe again
    pub async fn refresh(&self, device: &DeviceHandle) -> Result<ServiceEndpoints> {
        self.inner.refresh(device).await
    }

    /// Remove a device: unsubscribe (best effort), stop waiting for it and
    /// forget its saved state
    pub async fn teardown(&self, device: &DeviceHandle) {
        self.inner.teardown(device).await;
    }

    /// Release every subscription, save device state and stop background tasks
    pub async fn shutdown(&self) {
        info!("Shutting down ONVIF engine");
        self.inner.subscriptions.shutdown().await;
        for device in self.devices() {
            device.set_subscribed(false);
            self.inner.persist(&device);
        }
        self.inner.rediscovery.shutdown().await;
        self.inner.root.cancel();

        let tasks: Vec<_> = self.inner.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                error!("Engine task failed: {}", e);
            }
        }
    }

    // ========================================================================
    // Registry
    // ========================================================================

    pub fn devices(&self) -> Vec<DeviceHandle> {
        self.inner.devices.read().values().cloned().collect()
    }

    pub fn device(&self, urn: &str) -> Option<DeviceHandle> {
        self.inner.device(urn)
    }

    pub fn liveness_events(&self) -> broadcast::Receiver<LivenessEvent> {
        self.inner.liveness.subscribe()
    }

    pub fn subscription_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.inner.subscriptions.subscribe_events()
    }

    /// Base URL of the push listener, if one is running
    pub fn listener_url(&self) -> Option<&str> {
        self.inner.subscriptions.listener_url()
    }

    pub fn is_waiting_for_rediscovery(&self, urn: &str) -> bool {
        self.inner.rediscovery.is_waiting(urn)
    }
}

impl Drop for OnvifEngine {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

impl EngineInner {
    fn device(&self, urn: &str) -> Option<DeviceHandle> {
        self.devices.read().get(urn).cloned()
    }

    fn session_for(&self, urn: &str, credentials: Option<soap_client::Credentials>) -> DeviceSession {
        DeviceSession::new(urn, credentials, self.config.auth.clone())
    }

    /// Known devices are refreshed in place and keep their handle.
    fn register(&self, identity: DeviceIdentity) -> DeviceHandle {
        let mut devices = self.devices.write();
        if let Some(existing) = devices.get(&identity.urn) {
            existing.shared_identity().write().refresh_from(&identity);
            return Arc::clone(existing);
        }

        let urn = identity.urn.clone();
        let credentials = self.config.default_credentials.clone();
        let session = self.session_for(&urn, credentials.clone());
        let device = Arc::new(DeviceContext::new(identity.into_shared(), session, credentials));
        devices.insert(urn.clone(), Arc::clone(&device));
        debug!(urn = %urn, "Registered device");
        device
    }

    fn restore(self: &Arc<Self>) {
        let Some(store) = &self.store else {
            return;
        };
        let snapshots = match store.load_all() {
            Ok(snapshots) => snapshots,
            Err(e) => {
                warn!("Could not load saved devices: {}", e);
                return;
            }
        };

        for snapshot in snapshots {
            let DeviceSnapshot {
                identity,
                auth,
                subscription,
                endpoints,
            } = snapshot;
            let urn = identity.urn.clone();
            let credentials = self.config.default_credentials.clone();
            let mut session = self.session_for(&urn, credentials.clone());
            if let Some(state) = auth {
                session = session.with_auth_state(state);
            }

            let device = Arc::new(DeviceContext::new(identity.into_shared(), session, credentials));
            device.set_endpoints(endpoints);
            self.devices.write().insert(urn.clone(), Arc::clone(&device));
            debug!(urn = %urn, "Restored device");

            if let Some(record) = subscription {
                let weak = Arc::downgrade(self);
                let session = device.session();
                let token = self.root.child_token();
                self.tasks.lock().push(tokio::spawn(async move {
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = inner.subscriptions.release(&session, &record) => {
                            debug!(urn = %record.device_urn, "Released stale subscription");
                        }
                    }
                }));
            }
        }
    }

    async fn initialize(&self, device: &DeviceHandle) -> Result<ServiceEndpoints> {
        let _permit = self
            .admission
            .acquire_owned(Some(self.config.device_admission_timeout))
            .await?;

        let urn = device.urn();
        let session = device.session();
        match self
            .client
            .query_endpoints(&session, &device.device_url(), &self.config.quirks)
            .await
        {
            Ok(endpoints) => {
                info!(
                    urn = %urn,
                    manufacturer = %endpoints.device_info.manufacturer,
                    events = endpoints.event_service_address.is_some(),
                    "Device initialized"
                );
                device.set_endpoints(Some(endpoints.clone()));
                if device.status() != DeviceStatus::NotResponding {
                    device.set_status(device.reachable_status());
                }
                self.persist(device);
                Ok(endpoints)
            }
            Err(err) => {
                if matches!(err, SoapError::Auth(_)) {
                    warn!(urn = %urn, error = %err, "Authentication not possible");
                    device.set_status(DeviceStatus::UnsupportedAuth);
                } else {
                    warn!(urn = %urn, error = %err, "Device initialization failed");
                }
                Err(err.into())
            }
        }
    }

    async fn subscribe(&self, device: &DeviceHandle, sink: EventSink) -> Result<SubscriptionRecord> {
        let urn = device.urn();
        let endpoints = device
            .endpoints()
            .ok_or_else(|| SdkError::NotInitialized(urn.clone()))?;

        match self.subscriptions.subscribe(device.session(), &endpoints, sink).await {
            Ok(record) => {
                device.set_subscribed(true);
                device.set_status(DeviceStatus::Subscribed);
                self.persist(device);
                Ok(record)
            }
            Err(err) => {
                device.set_subscribed(false);
                match &err {
                    StreamError::Soap(SoapError::Auth(_)) => device.set_status(DeviceStatus::UnsupportedAuth),
                    StreamError::Soap(soap) if soap.is_transport() => {}
                    _ => {
                        if device.is_online() {
                            device.set_status(DeviceStatus::Unsubscribed);
                        }
                    }
                }
                Err(err.into())
            }
        }
    }

    async fn refresh(&self, device: &DeviceHandle) -> Result<ServiceEndpoints> {
        let endpoints = self.initialize(device).await?;
        if let Some(sink) = device.sink() {
            self.subscribe(device, sink).await?;
        }
        Ok(endpoints)
    }

    async fn teardown(&self, device: &DeviceHandle) {
        let urn = device.urn();
        self.rediscovery.cancel(&urn);
        device.set_sink(None);

        match self.subscriptions.unsubscribe(&urn).await {
            Ok(()) | Err(StreamError::NotSubscribed(_)) => {}
            Err(e) => warn!(urn = %urn, error = %e, "Teardown unsubscribe failed"),
        }

        device.set_subscribed(false);
        device.set_status(DeviceStatus::Unsubscribed);
        self.devices.write().remove(&urn);
        if let Some(store) = &self.store {
            if let Err(e) = store.remove(&urn) {
                warn!(urn = %urn, error = %e, "Could not remove saved device");
            }
        }
        info!(urn = %urn, "Device removed");
    }

    fn persist(&self, device: &DeviceContext) {
        let Some(store) = &self.store else {
            return;
        };
        let urn = device.urn();
        let snapshot = DeviceSnapshot {
            identity: device.identity(),
            auth: Some(device.session().auth().state()),
            subscription: self.subscriptions.record(&urn),
            endpoints: device.endpoints(),
        };
        if let Err(e) = store.save(&snapshot) {
            warn!(urn = %urn, error = %e, "Could not save device state");
        }
    }
}

/// Refresh devices that rediscovery found again.
async fn recovery(inner: Weak<EngineInner>, mut rx: mpsc::UnboundedReceiver<String>, cancel: CancellationToken) {
    loop {
        let urn = tokio::select! {
            _ = cancel.cancelled() => break,
            urn = rx.recv() => match urn {
                Some(urn) => urn,
                None => break,
            },
        };
        let Some(engine) = inner.upgrade() else {
            break;
        };
        let Some(device) = engine.device(&urn) else {
            continue;
        };

        info!(urn = %urn, address = %device.device_url(), "Refreshing rediscovered device");
        let token = cancel.child_token();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                result = engine.refresh(&device) => {
                    if let Err(e) = result {
                        warn!(urn = %urn, error = %e, "Refresh after rediscovery failed");
                    }
                }
            }
        });
    }
    debug!("Recovery task stopped");
}

/// Mirror subscription lifecycle into device status.
async fn watch_subscriptions(
    inner: Weak<EngineInner>,
    mut rx: broadcast::Receiver<SubscriptionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => event,
        };
        let event = match event {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Missed {} subscription events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let Some(engine) = inner.upgrade() else {
            break;
        };

        match event {
            SubscriptionEvent::Subscribed { urn, .. } | SubscriptionEvent::Resubscribed { urn, .. } => {
                if let Some(device) = engine.device(&urn) {
                    device.set_subscribed(true);
                    if device.is_online() {
                        device.set_status(DeviceStatus::Subscribed);
                    }
                }
            }
            SubscriptionEvent::Failed { urn, reason } => {
                warn!(urn = %urn, reason = %reason, "Subscription lost");
                if let Some(device) = engine.device(&urn) {
                    device.set_subscribed(false);
                    if device.is_online() {
                        device.set_status(DeviceStatus::Unsubscribed);
                    }
                }
            }
            SubscriptionEvent::Unsubscribed { urn } => {
                if let Some(device) = engine.device(&urn) {
                    device.set_subscribed(false);
                }
            }
            SubscriptionEvent::Renewed { .. } => {}
        }
    }
    debug!("Subscription watcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    async fn engine() -> OnvifEngine {
        OnvifEngine::new(EngineConfig::fast().with_callback(None)).await.unwrap()
    }

    #[tokio::test]
    async fn test_manual_device_registration() {
        let engine = engine().await;
        let ip = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 64));

        let first = engine.add_manual_device(ip, 80);
        let second = engine.add_manual_device(ip, 80);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(engine.devices().len(), 1);
        assert!(engine.device(&first.urn()).is_some());
        assert!(first.is_manual());
    }

    #[tokio::test]
    async fn test_subscribe_requires_initialization() {
        let engine = engine().await;
        let device = engine.add_manual_device(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);

        let err = engine.subscribe_events(&device, |_, _, _| {}).await.unwrap_err();
        assert!(matches!(err, SdkError::NotInitialized(_)));
    }

    #[tokio::test]
    async fn test_teardown_forgets_device() {
        let engine = engine().await;
        let device = engine.add_manual_device(IpAddr::V4(Ipv4Addr::LOCALHOST), 8080);
        engine.teardown(&device).await;

        assert!(engine.devices().is_empty());
        assert_eq!(device.status(), DeviceStatus::Unsubscribed);
    }

    #[tokio::test]
    async fn test_bridge_parks_discovered_devices_only() {
        let engine = engine().await;
        let manual = engine.add_manual_device(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 1)), 80);

        let mut discovered = DeviceIdentity::manual(IpAddr::V4(Ipv4Addr::new(10, 1, 1, 2)), 80);
        discovered.urn = "urn:uuid:cam-2".to_string();
        discovered.discovery_method = onvif_discovery::DiscoveryMethod::Multicast;
        let auto = engine.inner.register(discovered);

        let (recovered, _rx) = mpsc::unbounded_channel();
        let bridge = LivenessBridge {
            devices: Arc::clone(&engine.inner.devices),
            rediscovery: Arc::clone(&engine.inner.rediscovery),
            events: engine.inner.liveness.clone(),
            recovered,
        };
        let mut liveness = engine.liveness_events();

        bridge.mark_offline(&manual.urn(), "connection refused");
        bridge.mark_offline(&auto.urn(), "connection refused");

        assert_eq!(manual.status(), DeviceStatus::NotResponding);
        assert!(!engine.is_waiting_for_rediscovery(&manual.urn()));
        assert!(engine.is_waiting_for_rediscovery(&auto.urn()));
        assert!(matches!(liveness.recv().await.unwrap(), LivenessEvent::Offline { .. }));

        bridge.mark_online(&auto.urn());
        assert!(auto.is_online());
        assert_eq!(auto.status(), DeviceStatus::Responding);
        assert!(!engine.is_waiting_for_rediscovery(&auto.urn()));
    }
}
