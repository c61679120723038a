//! Subscription record and renewal scheduling.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use soap_client::RenewalMode;
use tokio_util::sync::CancellationToken;

use crate::config::SubscriptionConfig;
use crate::error::{Result, StreamError};
use crate::messages::SubscriptionGrant;

/// How notifications reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeliveryMode {
    /// Device POSTs `Notify` to our callback server
    Push,
    /// We call `PullMessages` in a loop
    Pull,
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMode::Push => f.write_str("push"),
            DeliveryMode::Pull => f.write_str("pull"),
        }
    }
}

/// Lifecycle of a device's subscription.
///
/// `Unsubscribed → Subscribing → Subscribed → (Renewing | Resubscribing) → Subscribed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    Subscribing,
    Subscribed,
    Renewing,
    Resubscribing,
}

impl SubscriptionState {
    /// True while a subscription exists on the device.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SubscriptionState::Subscribed | SubscriptionState::Renewing | SubscriptionState::Resubscribing
        )
    }
}

/// Cancels the task driving a renewal timer or pull loop.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    pub fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A subscription held on a device.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub device_urn: String,
    pub subscription_id: String,
    /// Subscription manager endpoint used for Renew, Unsubscribe and PullMessages
    pub reference_address: String,
    #[serde(default)]
    pub reference_parameters: Vec<String>,
    pub mode: DeliveryMode,
    pub renewal_mode: RenewalMode,
    pub lifetime: Duration,
    pub expires_at: DateTime<Utc>,
    /// Callback path segment for push subscriptions
    pub route_key: Option<String>,
    #[serde(skip)]
    pub renewal_timer: Option<TimerHandle>,
}

impl SubscriptionRecord {
    pub fn from_grant(
        device_urn: &str,
        grant: SubscriptionGrant,
        mode: DeliveryMode,
        renewal_mode: RenewalMode,
        requested: Duration,
    ) -> Self {
        let lifetime = grant.lease.lifetime(requested);
        Self {
            device_urn: device_urn.to_string(),
            subscription_id: grant.subscription_id,
            reference_address: grant.reference_address,
            reference_parameters: grant.reference_parameters,
            mode,
            renewal_mode,
            lifetime,
            expires_at: expires_at(lifetime),
            route_key: None,
            renewal_timer: None,
        }
    }

    /// Device needs a full Subscribe instead of Renew.
    pub fn vendor_resubscribe_required(&self) -> bool {
        self.renewal_mode == RenewalMode::Resubscribe
    }

    /// Apply a new lifetime after a successful Renew.
    pub fn extend(&mut self, lifetime: Duration) {
        self.lifetime = lifetime;
        self.expires_at = expires_at(lifetime);
    }

    pub fn cancel_timer(&mut self) {
        if let Some(timer) = self.renewal_timer.take() {
            timer.cancel();
        }
    }
}

fn expires_at(lifetime: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(lifetime)
        .ok()
        .and_then(|delta| Utc::now().checked_add_signed(delta))
        .unwrap_or_else(Utc::now)
}

/// Delay before renewing a subscription granted for `lifetime`.
///
/// Returns `SubscriptionExpired` when `lifetime` does not exceed `jitter`;
/// otherwise `lifetime - jitter`, never less than `floor`.
pub fn renewal_delay(lifetime: Duration, jitter: Duration, floor: Duration) -> Result<Duration> {
    match lifetime.checked_sub(jitter) {
        Some(delay) if !delay.is_zero() => Ok(delay.max(floor)),
        _ => Err(StreamError::SubscriptionExpired { lifetime }),
    }
}

/// Random renewal margin within the configured bounds.
pub fn pick_jitter<R: Rng + ?Sized>(config: &SubscriptionConfig, rng: &mut R) -> Duration {
    let min = config.renewal_jitter_min.as_millis() as u64;
    let max = config.renewal_jitter_max.as_millis() as u64;
    if max <= min {
        return config.renewal_jitter_min;
    }
    Duration::from_millis(rng.gen_range(min..=max))
}
