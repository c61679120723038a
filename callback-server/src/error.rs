//! Error types for the callback server

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CallbackError {
    #[error("No available port found in range {start}-{end}")]
    NoAvailablePort { start: u16, end: u16 },

    #[error("Failed to detect local IP address")]
    LocalIp,

    #[error("Server failed to start: {0}")]
    Startup(String),

    #[error("Invalid route key: {0:?}")]
    InvalidRouteKey(String),
}

pub type Result<T> = std::result::Result<T, CallbackError>;
