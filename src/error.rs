//! Custom error types for the servlet engine

use thiserror::Error;

/// Engine-specific error types
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Application not found: {0}")]
    ApplicationNotFound(String),

    #[error("Servlet not found: {0}")]
    ServletNotFound(String),

    #[error("Session not started")]
    SessionNotStarted,

    #[error("Operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("Data not serializable: {0}")]
    DataNotSerializable(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Session data not readable: {0}")]
    SessionDataNotReadable(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Servlet(#[from] anyhow::Error),

    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl EngineError {
    /// HTTP status used when the error reaches a client-visible response
    pub fn status_code(&self) -> u16 {
        match self {
            EngineError::ApplicationNotFound(_) => status::BAD_REQUEST,
            EngineError::ServletNotFound(_) => status::NOT_FOUND,
            EngineError::ServiceUnavailable(_) => status::SERVICE_UNAVAILABLE,
            _ => status::INTERNAL_ERROR,
        }
    }

    /// Routing failures are never retried and keep their own status class
    pub fn is_routing(&self) -> bool {
        matches!(
            self,
            EngineError::ApplicationNotFound(_) | EngineError::ServletNotFound(_)
        )
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// HTTP status codes the core itself produces
pub mod status {
    pub const OK: u16 = 200;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const INTERNAL_ERROR: u16 = 500;
    pub const SERVICE_UNAVAILABLE: u16 = 503;
}

// ============================================================================
// TESTS
// ============================================================================
