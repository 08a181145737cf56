//! Error types for cachelimit.

use thiserror::Error;

/// Errors reported by a [`CounterStore`](crate::store::CounterStore).
///
/// "Not found" is not an error: stores signal it with `Ok(None)`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The backend could not be reached or failed the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The backend did not answer in time.
    #[error("Store operation timed out")]
    Timeout,

    /// The backend refused the request (bad key, non-numeric increment, ...).
    #[error("Store rejected operation: {0}")]
    Rejected(String),
}

/// Main error type for limiter operations.
#[derive(Error, Debug)]
pub enum LimiterError {
    /// Invalid limiter parameters or configuration source
    #[error("Configuration error: {0}")]
    Config(String),

    /// Identity plus description does not fit the store's key limit
    #[error("Key too long: {len} bytes exceeds the {max} byte store limit")]
    KeyTooLong { len: usize, max: usize },

    /// Any store failure other than "not found"
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A bucket held something other than a decimal counter
    #[error("Invalid counter value stored at {key}")]
    InvalidCounter { key: String },

    /// The caller's context was cancelled before the decision completed
    #[error("Operation canceled")]
    Canceled,
}

impl LimiterError {
    /// True when the failure came from the backing store.
    pub fn is_store_error(&self) -> bool {
        matches!(self, LimiterError::Store(_))
    }
}

impl From<config::ConfigError> for LimiterError {
    fn from(err: config::ConfigError) -> Self {
        LimiterError::Config(err.to_string())
    }
}

/// Result type alias for limiter operations.
pub type Result<T> = std::result::Result<T, LimiterError>;
