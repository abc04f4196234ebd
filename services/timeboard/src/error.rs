//! Error types for the timeboard service

/// Errors that can occur in the timeboard service
#[derive(Debug, thiserror::Error)]
pub enum TimeboardError {
    /// The request never produced a response (connection refused, timeout, ...)
    #[error("{0}")]
    Network(String),

    #[error("Request failed with status code {status}")]
    HttpStatus { url: String, status: u16 },

    #[error("Invalid response body: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for timeboard operations
pub type Result<T> = std::result::Result<T, TimeboardError>;
