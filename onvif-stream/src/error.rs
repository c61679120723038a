//! Error types for the onvif-stream crate.

use std::time::Duration;

use soap_client::SoapError;

/// Errors from subscription management.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Request to the device failed
    #[error("SOAP error: {0}")]
    Soap(#[from] SoapError),

    /// Granted lifetime is too short to schedule a renewal
    #[error("Subscription expired: granted lifetime {lifetime:?} leaves no time to renew")]
    SubscriptionExpired { lifetime: Duration },

    /// Device cannot deliver events the way we need
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Push listener problem
    #[error("Callback server error: {0}")]
    Callback(String),

    /// Response or notification could not be understood
    #[error("Parse error: {0}")]
    Parse(String),

    /// No subscription is tracked for the device
    #[error("Device not subscribed: {0}")]
    NotSubscribed(String),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<callback_server::CallbackError> for StreamError {
    fn from(err: callback_server::CallbackError) -> Self {
        StreamError::Callback(err.to_string())
    }
}

/// Convenience type alias for Results using StreamError.
pub type Result<T> = std::result::Result<T, StreamError>;
