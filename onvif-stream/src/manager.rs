//! Subscription lifecycle for all devices.
//!
//! Each device gets a slot with its own async gate. Subscribe, renew,
//! resubscribe and teardown for one device run one at a time through that
//! gate; different devices proceed in parallel. Renewal timers and pull
//! loops are spawned tasks holding child tokens of the device token, so
//! dropping a device cancels everything it owns.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use admission::Semaphore;
use callback_server::{CallbackServer, EventRouter, NotificationPayload, ServerConfig, ROUTE_PREFIX};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use soap_client::{DeviceSession, RenewalMode, ServiceEndpoints, SoapClient};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SubscriptionConfig;
use crate::error::{Result, StreamError};
use crate::messages::{
    addressed_request, create_pull_point_body, parse_grant, parse_pull_response, pull_messages_body,
    renew_body, set_synchronization_point_body, subscribe_body, unsubscribe_body, Lease,
    CREATE_PULL_POINT_ACTION, PULL_MESSAGES_ACTION, RENEW_ACTION, SET_SYNCHRONIZATION_POINT_ACTION,
    SUBSCRIBE_ACTION, UNSUBSCRIBE_ACTION,
};
use crate::notification::{parse_notify, Notification};
use crate::subscription::{
    pick_jitter, renewal_delay, DeliveryMode, SubscriptionRecord, SubscriptionState, TimerHandle,
};
use crate::topic::{topic_expression, EventTopic};

/// Receives `(topic_path, item_name, item_value)` for every delivered item.
pub type EventSink = Arc<dyn Fn(&str, &str, &str) + Send + Sync>;

/// Lifecycle notifications broadcast by the manager.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Subscribed {
        urn: String,
        mode: DeliveryMode,
        lifetime: Duration,
    },
    Renewed {
        urn: String,
        lifetime: Duration,
    },
    Resubscribed {
        urn: String,
        mode: DeliveryMode,
    },
    /// The subscription was lost and could not be re-established
    Failed {
        urn: String,
        reason: String,
    },
    Unsubscribed {
        urn: String,
    },
}

/// Pick push or pull for a device.
///
/// Push needs a running callback server. Pull points are used when push
/// is unavailable or not wanted. Devices advertising neither are tried
/// with push when a listener exists.
pub fn choose_mode(endpoints: &ServiceEndpoints, has_listener: bool, prefer_pull: bool) -> DeliveryMode {
    if endpoints.supports_ws_subscription && has_listener && !prefer_pull {
        DeliveryMode::Push
    } else if endpoints.supports_pull_point {
        DeliveryMode::Pull
    } else if has_listener && !prefer_pull {
        DeliveryMode::Push
    } else {
        DeliveryMode::Pull
    }
}

/// Callback path segment for a device urn.
///
/// Characters outside `[A-Za-z0-9_.-]` become `-`.
pub fn route_key(urn: &str) -> String {
    let key: String = urn
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '-'
            }
        })
        .collect();
    match key.as_str() {
        "" | "." | ".." => "device".to_string(),
        _ => key,
    }
}

struct Listener {
    base_url: String,
    router: Arc<EventRouter>,
    server: tokio::sync::Mutex<Option<CallbackServer>>,
}

struct SlotState {
    phase: SubscriptionState,
    record: Option<SubscriptionRecord>,
    session: Arc<DeviceSession>,
    endpoints: ServiceEndpoints,
    sink: EventSink,
    pull_loop: Option<TimerHandle>,
}

impl SlotState {
    fn stop_tasks(&mut self) {
        if let Some(record) = self.record.as_mut() {
            record.cancel_timer();
        }
        if let Some(pull_loop) = self.pull_loop.take() {
            pull_loop.cancel();
        }
    }
}

struct DeviceSlot {
    urn: String,
    gate: tokio::sync::Mutex<()>,
    state: parking_lot::Mutex<SlotState>,
    token: CancellationToken,
}

struct Inner {
    client: SoapClient,
    config: SubscriptionConfig,
    devices: DashMap<String, Arc<DeviceSlot>>,
    /// route key -> device urn
    routes: DashMap<String, String>,
    listener: Option<Listener>,
    event_gate: Arc<Semaphore>,
    events: broadcast::Sender<SubscriptionEvent>,
    root: CancellationToken,
}

/// Manages event subscriptions for every device.
///
/// # Example
///
/// ```rust,no_run
/// use std::sync::Arc;
/// use onvif_stream::{EventSink, SubscriptionConfig, SubscriptionManager};
/// use soap_client::{AuthConfig, DeviceSession, ServiceEndpoints, SoapClient};
/// use callback_server::ServerConfig;
///
/// # async fn example(endpoints: ServiceEndpoints) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = SubscriptionManager::new(
///     SoapClient::new()?,
///     SubscriptionConfig::default(),
///     Some(ServerConfig::default()),
/// )
/// .await?;
///
/// let session = Arc::new(DeviceSession::new("urn:uuid:cam-1", None, AuthConfig::default()));
/// let sink: EventSink = Arc::new(|topic, name, value| println!("{topic}: {name}={value}"));
/// manager.subscribe(session, &endpoints, sink).await?;
///
/// manager.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SubscriptionManager {
    inner: Arc<Inner>,
}

impl SubscriptionManager {
    /// Create a manager. With a `server` config a callback server is
    /// started for push delivery; without one only pull points are used.
    pub async fn new(
        client: SoapClient,
        config: SubscriptionConfig,
        server: Option<ServerConfig>,
    ) -> Result<Self> {
        config.validate()?;

        let (listener, intake_rx) = match server {
            Some(server_config) => {
                let (tx, rx) = mpsc::unbounded_channel();
                let server = CallbackServer::new(server_config, tx).await?;
                let listener = Listener {
                    base_url: server.base_url().to_string(),
                    router: Arc::clone(server.router()),
                    server: tokio::sync::Mutex::new(Some(server)),
                };
                (Some(listener), Some(rx))
            }
            None => (None, None),
        };

        let (events, _) = broadcast::channel(256);
        let inner = Arc::new(Inner {
            client,
            event_gate: Arc::new(Semaphore::new(config.event_permits)),
            config,
            devices: DashMap::new(),
            routes: DashMap::new(),
            listener,
            events,
            root: CancellationToken::new(),
        });

        if let Some(rx) = intake_rx {
            tokio::spawn(intake(Arc::downgrade(&inner), rx, inner.root.clone()));
        }

        Ok(Self { inner })
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.inner.config
    }

    /// Base URL of the callback server, when push delivery is available.
    pub fn listener_url(&self) -> Option<&str> {
        self.inner.listener.as_ref().map(|l| l.base_url.as_str())
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SubscriptionEvent> {
        self.inner.events.subscribe()
    }

    /// Subscribe `session`'s device to events, replacing any existing
    /// subscription for the same urn.
    ///
    /// # Process
    ///
    /// 1. Cancel the old subscription's timers and unsubscribe it (best effort)
    /// 2. Subscribe with push or create a pull point, filtered to the wanted topics
    /// 3. Arm the renewal timer from the granted lifetime
    /// 4. Start the pull loop for pull subscriptions
    ///
    /// # Errors
    ///
    /// * `StreamError::Unsupported` - the device has no event service
    /// * `StreamError::SubscriptionExpired` - the granted lifetime is too short to renew
    /// * `StreamError::Soap` - the device rejected or did not answer the request
    pub async fn subscribe(
        &self,
        session: Arc<DeviceSession>,
        endpoints: &ServiceEndpoints,
        sink: EventSink,
    ) -> Result<SubscriptionRecord> {
        let urn = session.urn().to_string();
        let slot = match self.inner.devices.entry(urn.clone()) {
            Entry::Occupied(entry) => {
                let slot = Arc::clone(entry.get());
                let mut state = slot.state.lock();
                state.session = session;
                state.endpoints = endpoints.clone();
                state.sink = sink;
                drop(state);
                slot
            }
            Entry::Vacant(entry) => {
                let slot = Arc::new(DeviceSlot {
                    urn: urn.clone(),
                    gate: tokio::sync::Mutex::new(()),
                    state: parking_lot::Mutex::new(SlotState {
                        phase: SubscriptionState::Unsubscribed,
                        record: None,
                        session,
                        endpoints: endpoints.clone(),
                        sink,
                        pull_loop: None,
                    }),
                    token: self.inner.root.child_token(),
                });
                entry.insert(Arc::clone(&slot));
                slot
            }
        };

        let result = self.inner.establish(&slot).await;
        if result.is_err() {
            // Drop the slot only if nothing replaced it meanwhile
            self.inner
                .devices
                .remove_if(&urn, |_, current| Arc::ptr_eq(current, &slot) && current.state.lock().record.is_none());
        }
        result
    }

    /// Unsubscribe and forget a device.
    ///
    /// Timers are cancelled and the callback route is removed even when the
    /// device cannot be reached.
    pub async fn unsubscribe(&self, urn: &str) -> Result<()> {
        let (_, slot) = self
            .inner
            .devices
            .remove(urn)
            .ok_or_else(|| StreamError::NotSubscribed(urn.to_string()))?;
        self.inner.teardown(&slot).await;
        Ok(())
    }

    /// Best-effort Unsubscribe of a subscription this manager does not
    /// track, such as one restored from a previous run.
    pub async fn release(&self, session: &DeviceSession, record: &SubscriptionRecord) {
        self.inner.release_remote(session, record).await;
    }

    pub fn state(&self, urn: &str) -> SubscriptionState {
        self.inner
            .devices
            .get(urn)
            .map(|slot| slot.state.lock().phase)
            .unwrap_or_default()
    }

    pub fn record(&self, urn: &str) -> Option<SubscriptionRecord> {
        self.inner
            .devices
            .get(urn)
            .and_then(|slot| slot.state.lock().record.clone())
    }

    /// Urns with a tracked subscription.
    pub fn devices(&self) -> Vec<String> {
        self.inner.devices.iter().map(|e| e.key().clone()).collect()
    }

    /// Tear down every subscription and stop the callback server.
    pub async fn shutdown(&self) {
        let urns = self.devices();
        for urn in urns {
            if let Some((_, slot)) = self.inner.devices.remove(&urn) {
                self.inner.teardown(&slot).await;
            }
        }
        self.inner.root.cancel();

        if let Some(listener) = &self.inner.listener {
            if let Some(server) = listener.server.lock().await.take() {
                if let Err(e) = server.shutdown().await {
                    warn!("Callback server shutdown failed: {}", e);
                }
            }
        }
        info!("Subscription manager stopped");
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.inner.root.cancel();
    }
}

impl Inner {
    /// Subscribe the slot's device from scratch.
    async fn establish(self: &Arc<Self>, slot: &Arc<DeviceSlot>) -> Result<SubscriptionRecord> {
        let _gate = slot.gate.lock().await;
        if slot.token.is_cancelled() {
            return Err(StreamError::NotSubscribed(slot.urn.clone()));
        }

        let (previous, session, endpoints) = {
            let mut state = slot.state.lock();
            state.stop_tasks();
            state.phase = SubscriptionState::Subscribing;
            (state.record.take(), Arc::clone(&state.session), state.endpoints.clone())
        };
        if let Some(previous) = previous {
            debug!(urn = %slot.urn, id = %previous.subscription_id, "Superseding existing subscription");
            self.release_remote(&session, &previous).await;
        }

        let mode = choose_mode(&endpoints, self.listener.is_some(), self.config.prefer_pull);
        let mut record = match self.create(&slot.urn, &session, &endpoints, mode).await {
            Ok(record) => record,
            Err(e) => {
                warn!(urn = %slot.urn, mode = %mode, error = %e, "Subscribe failed");
                self.abandon(slot).await;
                return Err(e);
            }
        };

        let delay = match self.next_renewal(record.lifetime) {
            Ok(delay) => delay,
            Err(e) => {
                warn!(urn = %slot.urn, lifetime = ?record.lifetime, "Granted lifetime too short to renew");
                self.release_remote(&session, &record).await;
                self.abandon(slot).await;
                return Err(e);
            }
        };

        let timer = TimerHandle::new(slot.token.child_token());
        record.renewal_timer = Some(timer.clone());
        let pull_loop = (mode == DeliveryMode::Pull).then(|| TimerHandle::new(slot.token.child_token()));
        {
            let mut state = slot.state.lock();
            state.record = Some(record.clone());
            state.phase = SubscriptionState::Subscribed;
            state.pull_loop = pull_loop.clone();
        }

        tokio::spawn(renewal_loop(
            Arc::clone(self),
            Arc::clone(slot),
            timer.token().clone(),
            delay,
        ));
        if let Some(handle) = pull_loop {
            tokio::spawn(pull_loop_task(Arc::clone(self), Arc::clone(slot), handle.token().clone()));
        }

        info!(
            urn = %slot.urn,
            mode = %mode,
            id = %record.subscription_id,
            lifetime = ?record.lifetime,
            renew_in = ?delay,
            "Subscribed to events"
        );
        let _ = self.events.send(SubscriptionEvent::Subscribed {
            urn: slot.urn.clone(),
            mode,
            lifetime: record.lifetime,
        });
        Ok(record)
    }

    async fn create(
        &self,
        urn: &str,
        session: &DeviceSession,
        endpoints: &ServiceEndpoints,
        mode: DeliveryMode,
    ) -> Result<SubscriptionRecord> {
        let event_url = endpoints
            .event_service_address
            .as_deref()
            .ok_or_else(|| StreamError::Unsupported(format!("{urn} has no event service")))?;
        let filter = topic_expression(&endpoints.event_topics, &self.config.topics);
        let lifetime = self.config.requested_lifetime;

        match mode {
            DeliveryMode::Push => {
                let listener = self.listener.as_ref().ok_or_else(|| {
                    StreamError::Unsupported("push delivery needs a callback server".to_string())
                })?;
                let key = self.route_key_for(urn);
                listener.router.register(key.clone()).await?;
                let consumer = format!("{}/{}/{}", listener.base_url, ROUTE_PREFIX, key);

                let body = subscribe_body(&consumer, filter.as_deref(), lifetime);
                let response = self
                    .client
                    .send(session, SUBSCRIBE_ACTION, event_url, &body, None)
                    .await?;
                let grant = parse_grant(&response, "SubscribeResponse")?;

                let mut record =
                    SubscriptionRecord::from_grant(urn, grant, mode, endpoints.renewal_mode, lifetime);
                record.route_key = Some(key);
                Ok(record)
            }
            DeliveryMode::Pull => {
                self.release_route(urn).await;

                let body = create_pull_point_body(filter.as_deref(), lifetime);
                let response = self
                    .client
                    .send(session, CREATE_PULL_POINT_ACTION, event_url, &body, None)
                    .await?;
                let grant = parse_grant(&response, "CreatePullPointSubscriptionResponse")?;

                let record =
                    SubscriptionRecord::from_grant(urn, grant, mode, endpoints.renewal_mode, lifetime);
                self.synchronize(session, &record).await;
                Ok(record)
            }
        }
    }

    /// Ask the pull point to report current property states.
    async fn synchronize(&self, session: &DeviceSession, record: &SubscriptionRecord) {
        let request = addressed_request(
            SET_SYNCHRONIZATION_POINT_ACTION,
            set_synchronization_point_body(),
            &record.reference_parameters,
        );
        if let Err(e) = self
            .client
            .send_request(session, &record.reference_address, &request, None)
            .await
        {
            debug!(urn = %record.device_urn, error = %e, "SetSynchronizationPoint not accepted");
        }
    }

    /// Best-effort Unsubscribe on the device.
    async fn release_remote(&self, session: &DeviceSession, record: &SubscriptionRecord) {
        let request = addressed_request(UNSUBSCRIBE_ACTION, unsubscribe_body(), &record.reference_parameters);
        match self
            .client
            .send_request(session, &record.reference_address, &request, None)
            .await
        {
            Ok(_) => debug!(urn = %record.device_urn, id = %record.subscription_id, "Unsubscribed"),
            Err(e) => warn!(
                urn = %record.device_urn,
                id = %record.subscription_id,
                error = %e,
                "Unsubscribe failed"
            ),
        }
    }

    /// Renew, or resubscribe, the slot's subscription.
    ///
    /// `Ok(None)` when the timer has been superseded.
    async fn renew(self: &Arc<Self>, slot: &Arc<DeviceSlot>, token: &CancellationToken) -> Result<Option<Duration>> {
        let _gate = slot.gate.lock().await;
        if token.is_cancelled() {
            return Ok(None);
        }

        let (record, session, endpoints) = {
            let state = slot.state.lock();
            match &state.record {
                Some(record) => (record.clone(), Arc::clone(&state.session), state.endpoints.clone()),
                None => return Ok(None),
            }
        };

        if record.renewal_mode == RenewalMode::Renew {
            slot.state.lock().phase = SubscriptionState::Renewing;
            match self.send_renew(&session, &record).await {
                Ok(lifetime) => match self.next_renewal(lifetime) {
                    Ok(delay) => {
                        {
                            let mut state = slot.state.lock();
                            if let Some(current) = state.record.as_mut() {
                                current.extend(lifetime);
                            }
                            state.phase = SubscriptionState::Subscribed;
                        }
                        debug!(urn = %slot.urn, lifetime = ?lifetime, renew_in = ?delay, "Subscription renewed");
                        let _ = self.events.send(SubscriptionEvent::Renewed {
                            urn: slot.urn.clone(),
                            lifetime,
                        });
                        return Ok(Some(delay));
                    }
                    Err(_) => {
                        warn!(urn = %slot.urn, lifetime = ?lifetime, "Renew granted too little time, resubscribing")
                    }
                },
                Err(e) => warn!(urn = %slot.urn, error = %e, "Renew failed, resubscribing"),
            }
        }

        self.resubscribe(slot, &session, &endpoints, record).await.map(Some)
    }

    async fn send_renew(&self, session: &DeviceSession, record: &SubscriptionRecord) -> Result<Duration> {
        let request = addressed_request(
            RENEW_ACTION,
            renew_body(self.config.requested_lifetime),
            &record.reference_parameters,
        );
        let response = self
            .client
            .send_request(session, &record.reference_address, &request, None)
            .await?;
        let element = response.response("RenewResponse")?;
        Ok(Lease::from_response(element).lifetime(self.config.requested_lifetime))
    }

    /// Replace the subscription with a new one in the same delivery mode.
    async fn resubscribe(
        &self,
        slot: &Arc<DeviceSlot>,
        session: &DeviceSession,
        endpoints: &ServiceEndpoints,
        record: SubscriptionRecord,
    ) -> Result<Duration> {
        slot.state.lock().phase = SubscriptionState::Resubscribing;
        self.release_remote(session, &record).await;

        let mut fresh = match self.create(&slot.urn, session, endpoints, record.mode).await {
            Ok(fresh) => fresh,
            Err(e) => {
                self.abandon(slot).await;
                return Err(e);
            }
        };
        let delay = match self.next_renewal(fresh.lifetime) {
            Ok(delay) => delay,
            Err(e) => {
                self.release_remote(session, &fresh).await;
                self.abandon(slot).await;
                return Err(e);
            }
        };

        fresh.renewal_timer = record.renewal_timer;
        {
            let mut state = slot.state.lock();
            state.record = Some(fresh);
            state.phase = SubscriptionState::Subscribed;
        }
        info!(urn = %slot.urn, mode = %record.mode, renew_in = ?delay, "Resubscribed");
        let _ = self.events.send(SubscriptionEvent::Resubscribed {
            urn: slot.urn.clone(),
            mode: record.mode,
        });
        Ok(delay)
    }

    /// Drop local subscription state after a failure.
    async fn abandon(&self, slot: &DeviceSlot) {
        {
            let mut state = slot.state.lock();
            state.stop_tasks();
            state.record = None;
            state.phase = SubscriptionState::Unsubscribed;
        }
        self.release_route(&slot.urn).await;
    }

    async fn teardown(&self, slot: &DeviceSlot) {
        slot.token.cancel();
        let _gate = slot.gate.lock().await;

        let (record, session) = {
            let mut state = slot.state.lock();
            state.stop_tasks();
            state.phase = SubscriptionState::Unsubscribed;
            (state.record.take(), Arc::clone(&state.session))
        };
        self.release_route(&slot.urn).await;
        if let Some(record) = record {
            self.release_remote(&session, &record).await;
        }

        info!(urn = %slot.urn, "Subscription torn down");
        let _ = self.events.send(SubscriptionEvent::Unsubscribed { urn: slot.urn.clone() });
    }

    fn next_renewal(&self, lifetime: Duration) -> Result<Duration> {
        let jitter = pick_jitter(&self.config, &mut rand::thread_rng());
        renewal_delay(lifetime, jitter, self.config.renewal_floor)
    }

    /// Route key owned by `urn`, allocating one on first use.
    fn route_key_for(&self, urn: &str) -> String {
        if let Some(existing) = self
            .routes
            .iter()
            .find(|entry| entry.value() == urn)
            .map(|entry| entry.key().clone())
        {
            return existing;
        }

        let base = route_key(urn);
        let mut candidate = base.clone();
        let mut suffix = 2;
        loop {
            match self.routes.entry(candidate.clone()) {
                Entry::Vacant(entry) => {
                    entry.insert(urn.to_string());
                    return candidate;
                }
                Entry::Occupied(entry) if entry.get() == urn => return candidate,
                Entry::Occupied(_) => {
                    candidate = format!("{base}-{suffix}");
                    suffix += 1;
                }
            }
        }
    }

    async fn release_route(&self, urn: &str) {
        let keys: Vec<String> = self
            .routes
            .iter()
            .filter(|entry| entry.value() == urn)
            .map(|entry| entry.key().clone())
            .collect();
        for key in keys {
            self.routes.remove(&key);
            if let Some(listener) = &self.listener {
                listener.router.unregister(&key).await;
            }
        }
    }

    fn wants(&self, topic: &EventTopic) -> bool {
        self.config.topics.is_empty() || self.config.topics.contains(topic)
    }

    /// Hand notifications to the device's sink, holding an event permit.
    async fn deliver(&self, urn: &str, sink: &EventSink, notifications: Vec<Notification>) {
        let _permit = match self
            .event_gate
            .acquire_owned(Some(self.config.event_admission_timeout))
            .await
        {
            Ok(permit) => permit,
            Err(e) => {
                warn!(urn, count = notifications.len(), error = %e, "Dropping notifications");
                return;
            }
        };

        for notification in notifications.iter().filter(|n| self.wants(&n.topic)) {
            for (topic, name, value) in notification.tuples() {
                sink(&topic, &name, &value);
            }
        }
    }
}

async fn renewal_loop(inner: Arc<Inner>, slot: Arc<DeviceSlot>, token: CancellationToken, mut delay: Duration) {
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }

        match inner.renew(&slot, &token).await {
            Ok(Some(next)) => delay = next,
            Ok(None) => return,
            Err(e) => {
                error!(urn = %slot.urn, error = %e, "Subscription lost");
                let _ = inner.events.send(SubscriptionEvent::Failed {
                    urn: slot.urn.clone(),
                    reason: e.to_string(),
                });
                return;
            }
        }
    }
}

async fn pull_loop_task(inner: Arc<Inner>, slot: Arc<DeviceSlot>, token: CancellationToken) {
    let body = pull_messages_body(inner.config.pull_timeout, inner.config.pull_message_limit);
    let timeout = inner.config.pull_timeout + inner.client.config().default_timeout;
    let mut misses = 0u32;

    loop {
        let current = {
            let state = slot.state.lock();
            state.record.as_ref().map(|record| {
                (
                    Arc::clone(&state.session),
                    record.reference_address.clone(),
                    addressed_request(PULL_MESSAGES_ACTION, body.clone(), &record.reference_parameters),
                    Arc::clone(&state.sink),
                )
            })
        };
        let Some((session, address, request, sink)) = current else {
            return;
        };

        let outcome = tokio::select! {
            _ = token.cancelled() => return,
            reply = inner.client.send_request(&session, &address, &request, Some(timeout)) => {
                reply.map_err(StreamError::from).and_then(|response| parse_pull_response(&response))
            }
        };

        match outcome {
            Ok(batch) if !batch.notifications.is_empty() => {
                misses = 0;
                debug!(urn = %slot.urn, count = batch.notifications.len(), "Pulled notifications");
                inner.deliver(&slot.urn, &sink, batch.notifications).await;
            }
            Ok(_) => {
                misses += 1;
                debug!(urn = %slot.urn, misses, "Empty pull");
            }
            Err(e) => {
                misses += 1;
                warn!(urn = %slot.urn, misses, error = %e, "PullMessages failed");
                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(inner.config.pull_retry_delay) => {}
                }
            }
        }

        if misses >= inner.config.pull_failure_threshold {
            warn!(urn = %slot.urn, misses, "Pull point unresponsive, subscribing again");
            tokio::spawn(restart(inner, slot));
            return;
        }
    }
}

fn restart(inner: Arc<Inner>, slot: Arc<DeviceSlot>) -> BoxFuture<'static, ()> {
    async move {
        if let Err(e) = inner.establish(&slot).await {
            error!(urn = %slot.urn, error = %e, "Resubscribe after pull failures failed");
            let _ = inner.events.send(SubscriptionEvent::Failed {
                urn: slot.urn.clone(),
                reason: e.to_string(),
            });
        }
    }
    .boxed()
}

/// Route pushed notifications to their device's queue.
async fn intake(
    inner: Weak<Inner>,
    mut rx: mpsc::UnboundedReceiver<NotificationPayload>,
    token: CancellationToken,
) {
    let mut queues: HashMap<String, mpsc::UnboundedSender<PushedBatch>> = HashMap::new();
    loop {
        let payload = tokio::select! {
            _ = token.cancelled() => break,
            payload = rx.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };
        let Some(manager) = inner.upgrade() else {
            break;
        };

        let Some(urn) = manager.routes.get(&payload.route_key).map(|e| e.value().clone()) else {
            debug!(route = %payload.route_key, "Notification for released route");
            continue;
        };
        let Some(slot) = manager.devices.get(&urn).map(|e| Arc::clone(e.value())) else {
            continue;
        };
        let sink = Arc::clone(&slot.state.lock().sink);

        queues.retain(|urn, queue| !queue.is_closed() && manager.devices.contains_key(urn));
        let queue = queues.entry(urn.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(delivery_queue(Weak::clone(&inner), urn, rx, token.child_token()));
            tx
        });
        let _ = queue.send((sink, payload.body));
    }
    debug!("Notification intake stopped");
}

type PushedBatch = (EventSink, String);

/// Deliver one device's pushed payloads in arrival order.
async fn delivery_queue(
    inner: Weak<Inner>,
    urn: String,
    mut rx: mpsc::UnboundedReceiver<PushedBatch>,
    token: CancellationToken,
) {
    loop {
        let (sink, body) = tokio::select! {
            _ = token.cancelled() => break,
            batch = rx.recv() => match batch {
                Some(batch) => batch,
                None => break,
            },
        };
        let Some(manager) = inner.upgrade() else {
            break;
        };
        match parse_notify(&body) {
            Ok(notifications) => manager.deliver(&urn, &sink, notifications).await,
            Err(e) => debug!(urn = %urn, error = %e, "Discarding undecodable notification"),
        }
    }
}
