//! Backoff rediscovery of devices that stopped responding.
//!
//! Devices are parked here by urn when the dispatcher marks them offline.
//! A supervised task runs short discovery windows with exponential backoff
//! per entry. When a parked device shows up again its shared identity is
//! refreshed in place, its callback fires and the entry is removed.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::BackoffConfig;
use crate::discovery::Discovery;
use crate::error::Result;
use crate::{DeviceIdentity, DiscoveryConfig, SharedIdentity};

/// Invoked with the refreshed identity when a parked device reappears.
pub type RediscoveryCallback = Arc<dyn Fn(SharedIdentity) + Send + Sync>;

struct WaitEntry {
    identity: SharedIdentity,
    callback: RediscoveryCallback,
    attempts: u32,
    next_attempt: Instant,
}

impl WaitEntry {
    /// True if `seen` is the parked device. Synthetic placeholders match by address.
    fn matches(&self, urn: &str, seen: &DeviceIdentity) -> bool {
        if seen.urn == urn {
            return true;
        }
        let identity = self.identity.read();
        identity.rtsp_only && identity.ip == seen.ip
    }
}

/// Delay before attempt `attempt` (0-based), without jitter.
pub fn backoff_delay(config: &BackoffConfig, attempt: u32) -> Duration {
    let factor = config.factor.powi(attempt.min(64) as i32);
    let delay = config.base.as_secs_f64() * factor;
    if !delay.is_finite() || delay >= config.cap.as_secs_f64() {
        config.cap
    } else {
        Duration::from_secs_f64(delay)
    }
}

/// Add up to `config.jitter` of `delay` at random.
pub fn with_jitter<R: Rng>(config: &BackoffConfig, delay: Duration, rng: &mut R) -> Duration {
    if config.jitter <= 0.0 {
        return delay;
    }
    let extra = rng.gen_range(0.0..config.jitter);
    delay + delay.mul_f64(extra)
}

/// Jittered delay before attempt `attempt`.
pub fn next_backoff(config: &BackoffConfig, attempt: u32) -> Duration {
    with_jitter(config, backoff_delay(config, attempt), &mut rand::thread_rng())
}

/// Pending map plus the task that works it.
pub struct Rediscovery {
    discovery: Discovery,
    backoff: BackoffConfig,
    window: Duration,
    pending: Mutex<HashMap<String, WaitEntry>>,
    wake: Notify,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Rediscovery {
    /// Build from a discovery configuration. Synthetic identities are
    /// disabled so an unresponsive host never counts as reappeared.
    pub fn new(config: DiscoveryConfig, cancel: CancellationToken) -> Result<Arc<Self>> {
        let backoff = config.backoff.clone();
        let window = config.rediscovery_window;
        let discovery = Discovery::new(config.with_synthesize_unresponsive(false))?;
        Ok(Arc::new(Self {
            discovery,
            backoff,
            window,
            pending: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            cancel,
            task: Mutex::new(None),
        }))
    }

    /// Park a device until it reappears. Returns false if it is already waiting.
    pub fn schedule(&self, identity: SharedIdentity, callback: RediscoveryCallback) -> bool {
        let urn = identity.read().urn.clone();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&urn) {
                debug!(urn = %urn, "Already waiting for rediscovery");
                return false;
            }
            pending.insert(
                urn.clone(),
                WaitEntry {
                    identity,
                    callback,
                    attempts: 0,
                    next_attempt: Instant::now() + next_backoff(&self.backoff, 0),
                },
            );
        }
        info!(urn = %urn, "Scheduled rediscovery");
        self.wake.notify_one();
        true
    }

    /// Stop waiting for a device without invoking its callback.
    pub fn cancel(&self, urn: &str) -> bool {
        let removed = self.pending.lock().remove(urn).is_some();
        if removed {
            debug!(urn = %urn, "Cancelled rediscovery");
            self.wake.notify_one();
        }
        removed
    }

    pub fn is_waiting(&self, urn: &str) -> bool {
        self.pending.lock().contains_key(urn)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Spawn the supervised rediscovery task. Calling twice is a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut task = self.task.lock();
        if task.is_some() {
            return;
        }
        let this = Arc::clone(self);
        *task = Some(tokio::spawn(async move { this.work().await }));
    }

    /// Cancel the task and wait for it to exit. Pending entries are dropped.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Rediscovery task failed: {}", e);
            }
        }
        self.pending.lock().clear();
    }

    async fn work(self: Arc<Self>) {
        loop {
            let next = self.pending.lock().values().map(|e| e.next_attempt).min();
            match next {
                None => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.wake.notified() => continue,
                    }
                }
                Some(at) => {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.wake.notified() => continue,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
            }
            self.attempt().await;
        }
    }

    /// One discovery window for every due entry.
    async fn attempt(&self) {
        let now = Instant::now();
        let due: Vec<IpAddr> = self
            .pending
            .lock()
            .values()
            .filter(|e| e.next_attempt <= now)
            .map(|e| e.identity.read().ip)
            .collect();
        if due.is_empty() {
            return;
        }

        debug!("Rediscovery attempt for {} device(s)", due.len());
        let mut seen = Vec::new();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.discovery.run_with_targets(self.window, &due, |identity| seen.push(identity)) => result,
        };
        if let Err(e) = result {
            debug!("Rediscovery window failed: {}", e);
        }

        self.resolve(&seen);
        self.back_off_due(Instant::now());
    }

    /// Push every entry due at `now` to its next, longer delay.
    fn back_off_due(&self, now: Instant) {
        let mut pending = self.pending.lock();
        for entry in pending.values_mut().filter(|e| e.next_attempt <= now) {
            entry.attempts += 1;
            entry.next_attempt = now + next_backoff(&self.backoff, entry.attempts);
        }
    }

    /// Match sightings against parked devices. Returns how many reappeared.
    pub fn resolve(&self, seen: &[DeviceIdentity]) -> usize {
        let mut reappeared = Vec::new();
        {
            let mut pending = self.pending.lock();
            for identity in seen {
                let urn = pending
                    .iter()
                    .find(|(urn, entry)| entry.matches(urn, identity))
                    .map(|(urn, _)| urn.clone());
                if let Some(entry) = urn.and_then(|urn| pending.remove(&urn)) {
                    reappeared.push((entry, identity));
                }
            }
        }

        let count = reappeared.len();
        for (entry, seen) in reappeared {
            entry.identity.write().refresh_from(seen);
            info!(urn = %entry.identity.read().urn, ip = %seen.ip, "Device reappeared");
            (entry.callback)(Arc::clone(&entry.identity));
        }
        count
    }
}

impl Drop for Rediscovery {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
