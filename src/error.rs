//! Error types for the asset gateway

use thiserror::Error;

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GateError>;

/// Error types that can occur while servicing a request
///
/// The enum is `Clone` so that a single failed production job can be handed
/// to every request that was waiting on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GateError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("Image processing error: {message}")]
    ImageProcessing { status: u16, message: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<std::io::Error> for GateError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            GateError::NotFound(err.to_string())
        } else {
            GateError::IoError(err.to_string())
        }
    }
}

impl From<serde_json::Error> for GateError {
    fn from(err: serde_json::Error) -> Self {
        GateError::ParseError(err.to_string())
    }
}

impl GateError {
    /// Convert error to HTTP status code
    ///
    /// - User-correctable request problems map to 400
    /// - Missing assets, recipes, routes and domains map to 404
    /// - Codec failures carry their own status
    /// - Origin failures map to 502, timeouts to 504
    pub fn status_code(&self) -> u16 {
        match self {
            GateError::BadRequest(_) => 400,
            GateError::ParseError(_) => 400,
            GateError::Unauthorized(_) => 401,
            GateError::NotFound(_) => 404,
            GateError::ImageProcessing { status, .. } => *status,
            GateError::Storage(_) => 502,
            GateError::HttpError(_) => 502,
            GateError::Timeout(_) => 504,
            GateError::ConfigError(_) => 500,
            GateError::CacheError(_) => 500,
            GateError::IoError(_) => 500,
            GateError::InternalError(_) => 500,
        }
    }

    /// Whether this error describes an absent asset
    pub fn is_not_found(&self) -> bool {
        matches!(self, GateError::NotFound(_))
    }

    /// Create an ImageProcessing error with the default 500 status
    pub fn image_processing(message: impl Into<String>) -> Self {
        GateError::ImageProcessing {
            status: 500,
            message: message.into(),
        }
    }

    /// Create an error from an origin HTTP status code
    ///
    /// A 404 becomes `NotFound` so the missing-asset fallback can take over;
    /// every other non-success status is an origin failure.
    pub fn from_http_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            404 => GateError::NotFound(message),
            400..=599 => GateError::Storage(format!("origin returned {}: {}", status, message)),
            _ => GateError::HttpError(format!("HTTP {}: {}", status, message)),
        }
    }
}
