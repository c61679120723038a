//! Subscription manager configuration

use std::time::Duration;

use crate::error::{Result, StreamError};
use crate::topic::EventTopic;

/// Configuration for [`SubscriptionManager`](crate::SubscriptionManager).
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// Lifetime requested in Subscribe and Renew
    /// Default: 600 seconds
    pub requested_lifetime: Duration,

    /// Renewal fires this much before expiry, chosen at random per timer
    /// Default: 45 to 60 seconds
    pub renewal_jitter_min: Duration,
    pub renewal_jitter_max: Duration,

    /// Shortest delay a renewal timer is armed with
    /// Default: 5 seconds
    pub renewal_floor: Duration,

    /// Device-side wait in PullMessages
    /// Default: 10 seconds
    pub pull_timeout: Duration,

    /// MessageLimit in PullMessages
    /// Default: 32
    pub pull_message_limit: u32,

    /// Consecutive empty or failed pulls before resubscribing from scratch
    /// Default: 5
    pub pull_failure_threshold: u32,

    /// Pause after a failed pull
    /// Default: 1 second
    pub pull_retry_delay: Duration,

    /// Event categories to subscribe to and deliver
    pub topics: Vec<EventTopic>,

    /// Use pull points even where push is possible
    /// Default: false
    pub prefer_pull: bool,

    /// Concurrent notification batches being processed
    /// Default: 4
    pub event_permits: usize,

    /// How long a notification batch waits for a processing slot
    /// Default: 5 seconds
    pub event_admission_timeout: Duration,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            requested_lifetime: Duration::from_secs(600),
            renewal_jitter_min: Duration::from_secs(45),
            renewal_jitter_max: Duration::from_secs(60),
            renewal_floor: Duration::from_secs(5),
            pull_timeout: Duration::from_secs(10),
            pull_message_limit: 32,
            pull_failure_threshold: 5,
            pull_retry_delay: Duration::from_secs(1),
            topics: EventTopic::defaults(),
            prefer_pull: false,
            event_permits: 4,
            event_admission_timeout: Duration::from_secs(5),
        }
    }
}

impl SubscriptionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pull points only, for hosts devices cannot connect back to
    pub fn pull_only() -> Self {
        Self {
            prefer_pull: true,
            ..Default::default()
        }
    }

    /// Short timings for tests and lab setups
    pub fn fast() -> Self {
        Self {
            renewal_jitter_min: Duration::from_millis(100),
            renewal_jitter_max: Duration::from_millis(200),
            renewal_floor: Duration::from_millis(50),
            pull_timeout: Duration::from_secs(1),
            pull_retry_delay: Duration::from_millis(50),
            event_admission_timeout: Duration::from_secs(1),
            ..Default::default()
        }
    }

    pub fn with_requested_lifetime(mut self, lifetime: Duration) -> Self {
        self.requested_lifetime = lifetime;
        self
    }

    pub fn with_topics(mut self, topics: Vec<EventTopic>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_prefer_pull(mut self, prefer_pull: bool) -> Self {
        self.prefer_pull = prefer_pull;
        self
    }

    pub fn with_pull_failure_threshold(mut self, threshold: u32) -> Self {
        self.pull_failure_threshold = threshold;
        self
    }

    pub fn with_event_permits(mut self, permits: usize) -> Self {
        self.event_permits = permits;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.requested_lifetime.as_secs() == 0 {
            return Err(StreamError::Configuration(
                "Requested lifetime must be at least one second".to_string(),
            ));
        }
        if self.renewal_jitter_min > self.renewal_jitter_max {
            return Err(StreamError::Configuration(
                "Renewal jitter minimum exceeds maximum".to_string(),
            ));
        }
        if self.renewal_floor == Duration::ZERO {
            return Err(StreamError::Configuration(
                "Renewal floor must be greater than 0".to_string(),
            ));
        }
        if self.pull_message_limit == 0 {
            return Err(StreamError::Configuration(
                "Pull message limit must be greater than 0".to_string(),
            ));
        }
        if self.pull_failure_threshold == 0 {
            return Err(StreamError::Configuration(
                "Pull failure threshold must be greater than 0".to_string(),
            ));
        }
        if self.event_permits == 0 {
            return Err(StreamError::Configuration(
                "Event permits must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
