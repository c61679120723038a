use thiserror::Error;

#[derive(Error, Debug)]
pub enum SdkError {
    #[error("SOAP error: {0}")]
    Soap(#[from] soap_client::SoapError),

    #[error("Discovery error: {0}")]
    Discovery(#[from] onvif_discovery::DiscoveryError),

    #[error("Subscription error: {0}")]
    Stream(#[from] onvif_stream::StreamError),

    #[error("Admission error: {0}")]
    Admission(#[from] admission::AdmissionError),

    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Device not initialized: {0}")]
    NotInitialized(String),

    #[error("Persistence error: {0}")]
    Persist(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<std::io::Error> for SdkError {
    fn from(err: std::io::Error) -> Self {
        SdkError::Persist(err.to_string())
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Persist(err.to_string())
    }
}

impl SdkError {
    /// True when the device rejected or could not be offered our credentials.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            SdkError::Soap(soap_client::SoapError::Auth(_))
                | SdkError::Stream(onvif_stream::StreamError::Soap(soap_client::SoapError::Auth(_)))
        )
    }

    /// True when the device could not be reached.
    pub fn is_transport(&self) -> bool {
        match self {
            SdkError::Soap(err) | SdkError::Stream(onvif_stream::StreamError::Soap(err)) => err.is_transport(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, SdkError>;
