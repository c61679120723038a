//! Error types for the discovery system.

use thiserror::Error;

/// Error type for discovery operations.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// Socket creation, multicast send or HTTP probe failure
    #[error("Network error: {0}")]
    Network(String),

    /// A response that could not be understood
    #[error(transparent)]
    Parse(#[from] DiscoveryParseError),

    /// Invalid discovery configuration
    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Reasons a ProbeMatch is discarded.
///
/// These never abort a discovery run; the response is logged and skipped.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DiscoveryParseError {
    #[error("Malformed probe response: {0}")]
    Malformed(String),

    #[error("Probe response without ProbeMatch")]
    NoMatch,

    #[error("ProbeMatch without endpoint address")]
    MissingEndpoint,

    #[error("ProbeMatch without usable XAddrs")]
    MissingXAddrs,

    #[error("Response relates to unknown message {0}")]
    UnrelatedMessage(String),

    #[error("Unsupported device types: {0}")]
    UnsupportedTypes(String),
}

impl From<std::io::Error> for DiscoveryError {
    fn from(err: std::io::Error) -> Self {
        DiscoveryError::Network(err.to_string())
    }
}

/// Convenience Result type alias for discovery operations.
pub type Result<T> = std::result::Result<T, DiscoveryError>;
