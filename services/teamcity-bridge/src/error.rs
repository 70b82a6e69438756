//! Error types for the TeamCity bridge

/// Errors that can occur in the TeamCity bridge
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("TeamCity unavailable: {0}")]
    Unavailable(String),

    #[error("Post failed: {0}")]
    PostFailed(String),

    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BridgeError {
    /// Whether a retry may succeed where this attempt failed
    pub fn is_transient(&self) -> bool {
        matches!(self, BridgeError::Unavailable(_) | BridgeError::Http(_))
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
