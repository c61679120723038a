use std::time::Duration;
use thiserror::Error;

/// Errors returned by the async side of the semaphore.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AdmissionError {
    #[error("Timed out after {0:?} waiting for a permit")]
    Timeout(Duration),

    #[error("Semaphore dropped before a permit was granted")]
    Closed,
}

pub type Result<T> = std::result::Result<T, AdmissionError>;
