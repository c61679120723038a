//! Error types for the SOAP client

use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during SOAP communication
#[derive(Debug, Error)]
pub enum SoapError {
    /// Connection-level failure before any HTTP response arrived
    #[error("Transport error ({kind}): {message}")]
    Transport { kind: TransportKind, message: String },

    /// No response within the per-call timeout
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// SOAP fault returned by the device
    #[error("SOAP fault {code}: {reason}")]
    Fault { code: String, reason: String },

    /// XML parsing error
    #[error("XML parsing error: {0}")]
    Parse(String),

    /// Non-200 status without a parseable fault
    #[error("Unexpected HTTP status {0}")]
    Http(u16),

    /// Authentication could not be negotiated
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Invalid client configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl SoapError {
    /// True for failures where the device never answered.
    pub fn is_transport(&self) -> bool {
        matches!(self, SoapError::Transport { .. } | SoapError::Timeout(_))
    }

    /// True when retrying is pointless because the host is gone.
    pub fn is_host_down(&self) -> bool {
        matches!(
            self,
            SoapError::Transport {
                kind: TransportKind::Refused | TransportKind::Unreachable,
                ..
            }
        )
    }

    pub(crate) fn from_reqwest(err: reqwest::Error, timeout: Duration) -> Self {
        if err.is_timeout() {
            return SoapError::Timeout(timeout);
        }

        let message = error_chain(&err);
        let kind = TransportKind::classify(&message);
        if kind == TransportKind::Timeout {
            return SoapError::Timeout(timeout);
        }
        SoapError::Transport { kind, message }
    }
}

/// Coarse classification of a transport failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Refused,
    Unreachable,
    Timeout,
    Other,
}

impl TransportKind {
    /// Classify an error message by the patterns OS network stacks use.
    pub fn classify(message: &str) -> Self {
        let message = message.to_ascii_lowercase();
        if message.contains("connection refused") || message.contains("actively refused") {
            TransportKind::Refused
        } else if message.contains("unreachable") || message.contains("no route to host") {
            TransportKind::Unreachable
        } else if message.contains("timed out") || message.contains("timeout") {
            TransportKind::Timeout
        } else {
            TransportKind::Other
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            TransportKind::Refused => "connection refused",
            TransportKind::Unreachable => "host unreachable",
            TransportKind::Timeout => "timeout",
            TransportKind::Other => "other",
        };
        f.write_str(label)
    }
}

/// Errors raised by the auth negotiator. These are never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Unsupported authentication: {0}")]
    Unsupported(String),

    #[error("Device requires credentials but none are configured")]
    MissingCredentials,

    #[error("Malformed authentication challenge: {0}")]
    MalformedChallenge(String),

    #[error("Credentials rejected by device")]
    Rejected,
}

/// Result type for SOAP operations
pub type Result<T> = std::result::Result<T, SoapError>;

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        let text = cause.to_string();
        if !message.contains(&text) {
            message.push_str(": ");
            message.push_str(&text);
        }
        source = cause.source();
    }
    message
}
