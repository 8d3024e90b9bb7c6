//! Error types for the rate limiting engine.

use thiserror::Error;

/// Main error type for ratewarden operations.
#[derive(Error, Debug)]
pub enum RateLimitError {
    /// A limiter configuration violated its invariants (capacity, window or rate).
    #[error("Invalid limiter configuration: {0}")]
    InvalidConfig(String),

    /// The requested cost can never be admitted by the limiter.
    #[error("Invalid cost {cost}: must be between 1 and capacity {capacity}")]
    InvalidCost { cost: u64, capacity: u64 },

    /// A different configuration was supplied for a key that already has state.
    #[error("Configuration mismatch for existing key {key}")]
    ConfigMismatch { key: String },

    /// No limiter configuration is registered for the key's class.
    #[error("No limit configured for key class '{0}'")]
    UnknownClass(String),

    /// The registry has reached its key bound and nothing was idle enough to evict.
    #[error("Limiter registry is full ({max_keys} keys)")]
    RegistryFull { max_keys: usize },

    /// Configuration loading or parsing errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RateLimitError {
    fn from(err: config::ConfigError) -> Self {
        RateLimitError::Config(err.to_string())
    }
}

/// Result type alias for ratewarden operations.
pub type Result<T> = std::result::Result<T, RateLimitError>;
