//! vSphere client errors

use thiserror::Error;

/// Errors that can occur when talking to vCenter or managing sessions
#[derive(Debug, Error)]
pub enum VSphereError {
    /// HTTP request/response error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// vCenter returned an error
    #[error("vSphere API error: {0}")]
    Api(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Login rejected or session no longer valid
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// The server endpoint could not be parsed
    #[error("error parsing vSphere URL {0:?}")]
    InvalidUrl(String),

    /// TLS configuration error (e.g. malformed thumbprint)
    #[error("TLS error: {0}")]
    Tls(String),

    /// The session has no underlying client
    #[error("vSphere client is not initialized")]
    NotInitialized,
}

impl VSphereError {
    /// Whether the error means the object does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, VSphereError::NotFound(_))
    }
}
