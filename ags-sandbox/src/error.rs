use thiserror::Error;

/// Errors raised by sandbox backends and the runners.
///
/// Payloads are strings so a single failure can be cloned onto every task
/// that depended on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SandboxError {
    #[error("failed to create sandbox: {0}")]
    Create(String),

    #[error("failed to connect to instance {instance_id}: {message}")]
    Connect { instance_id: String, message: String },

    #[error("failed to execute code: {0}")]
    Execution(String),

    #[error("failed to destroy sandbox {sandbox_id}: {message}")]
    Destroy { sandbox_id: String, message: String },

    #[error("file operation failed: {0}")]
    Filesystem(String),

    #[error("{backend} backend does not support {operation}")]
    Unsupported { backend: String, operation: String },

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("token cache error: {0}")]
    Cache(String),

    #[error("cancelled before start")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<reqwest::Error> for SandboxError {
    fn from(err: reqwest::Error) -> Self {
        SandboxError::Http(err.to_string())
    }
}

impl From<serde_json::Error> for SandboxError {
    fn from(err: serde_json::Error) -> Self {
        SandboxError::Internal(format!("JSON error: {}", err))
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
