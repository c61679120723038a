//! Dispatch configuration

use std::time::Duration;

use crate::error::{Result, SoapError};

/// Retry and timeout behavior of [`SoapClient`](crate::SoapClient).
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Attempts per request, including the first
    /// Default: 3
    pub max_attempts: u32,

    /// Fixed delay between attempts
    /// Default: 2 seconds
    pub retry_delay: Duration,

    /// Per-call timeout when the caller does not pass one
    /// Default: 5 seconds
    pub default_timeout: Duration,

    /// TCP connect timeout
    /// Default: 5 seconds
    pub connect_timeout: Duration,

    /// `User-Agent` header
    pub user_agent: String,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Duration::from_secs(2),
            default_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            user_agent: concat!("onvif-sdk/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Short delays for LAN setups where devices answer quickly
    pub fn fast_retry() -> Self {
        Self {
            retry_delay: Duration::from_millis(250),
            default_timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Single attempt, no retry
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(SoapError::Configuration(
                "Max attempts must be greater than 0".to_string(),
            ));
        }
        if self.default_timeout == Duration::ZERO {
            return Err(SoapError::Configuration(
                "Default timeout must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}
