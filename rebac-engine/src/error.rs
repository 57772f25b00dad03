use thiserror::Error;

#[derive(Error, Debug)]
pub enum RebacError {
    /// Malformed tuple, pattern or request. Raised before any state mutation.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Exact delete of a tuple that is not stored.
    #[error("Relation tuple not found: {0}")]
    NotFound(String),

    #[error("Invalid namespace configuration: {0}")]
    InvalidNamespaceConfig(String),

    #[error("Failed to parse relation tuple: {0}")]
    Parse(String),

    /// The per-check deadline expired before the traversal finished.
    #[error("Check deadline of {0} ms exceeded")]
    DeadlineExceeded(u64),

    /// Failure reported by the service boundary the caller talks to.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RebacError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Whether a caller may reasonably retry the failed operation.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::DeadlineExceeded(_))
    }
}

pub type Result<T> = std::result::Result<T, RebacError>;
