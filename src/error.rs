/// Error handling for the certificate lifecycle manager
use thiserror::Error;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, CertError>;

/// Error types surfaced by the orchestrator and its collaborators
#[derive(Error, Debug)]
pub enum CertError {
    /// Operation rejected by input or source/status validation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Duplicate record or concurrent mutation of an in-flight certificate
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Record not found by id, domain, or folder name
    #[error("Not found: {0}")]
    NotFound(String),

    /// ACME endpoint refused issuance for rate-limit reasons
    #[error("Rate limited, retry after: {retry_after}")]
    RateLimited { retry_after: String },

    /// ACME subprocess failure that is not a rate limit
    #[error("ACME failure: {0}")]
    AcmeFailure(String),

    /// PEM or X.509 structure could not be read
    #[error("Parse error: {0}")]
    Parse(String),

    /// Database persistence error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Cache read/write error
    #[error("Cache error: {0}")]
    Cache(String),

    /// Event bus produce/consume error
    #[error("Bus error: {0}")]
    Bus(String),

    /// HTTP or socket transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Operation timeout
    #[error("Timeout: {0}")]
    Timeout(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CertError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(msg: S) -> Self {
        CertError::Validation(msg.into())
    }

    /// Create a conflict error
    pub fn conflict<S: Into<String>>(msg: S) -> Self {
        CertError::Conflict(msg.into())
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        CertError::NotFound(msg.into())
    }

    /// Create an ACME failure error
    pub fn acme<S: Into<String>>(msg: S) -> Self {
        CertError::AcmeFailure(msg.into())
    }

    /// Create a parse error
    pub fn parse<S: Into<String>>(msg: S) -> Self {
        CertError::Parse(msg.into())
    }

    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        CertError::Storage(msg.into())
    }

    /// Create a cache error
    pub fn cache<S: Into<String>>(msg: S) -> Self {
        CertError::Cache(msg.into())
    }

    /// Create a bus error
    pub fn bus<S: Into<String>>(msg: S) -> Self {
        CertError::Bus(msg.into())
    }

    /// Create a transport error
    pub fn transport<S: Into<String>>(msg: S) -> Self {
        CertError::Transport(msg.into())
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        CertError::Configuration(msg.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        CertError::Timeout(msg.into())
    }
}
