//! Contains the errors reported by the keeper.
//!
//! We distinguish four cases. A **Configuration** error is raised while setting up a keeper
//! and is never the result of a read or delete. **StoreUnavailable** signals that the backing
//! [CacheStore](crate::store::CacheStore) could not be reached or failed to execute an operation.
//! A **Reload** error wraps whatever the caller supplied reloader reported. Finally, **Codec**
//! signals that a value could not be converted from or into its stored representation.
//!
//! Note that a reload result which is not committed because its lease was fenced out by a
//! concurrent delete is **not** an error. The caller still receives the freshly reloaded value.
use thiserror::Error;

/// Represents an error reported by the keeper or its builders.
#[derive(Debug, Error)]
pub enum KeeperError {
    /// The configuration is incomplete or inconsistent.
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// The backing store failed to execute an operation.
    #[error("Cache store unavailable: {0:#}")]
    StoreUnavailable(anyhow::Error),

    /// The caller supplied reloader failed.
    #[error("Failed to reload value: {0:#}")]
    Reload(anyhow::Error),

    /// A value couldn't be encoded or a stored payload couldn't be decoded.
    #[error("Failed to encode or decode a cached value: {0:#}")]
    Codec(anyhow::Error),
}

impl KeeperError {
    /// Creates a **Configuration** error with the given message.
    pub fn configuration(message: impl Into<String>) -> Self {
        KeeperError::Configuration(message.into())
    }

    /// Determines if this error was caused by the store (and a retry might therefore succeed).
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, KeeperError::StoreUnavailable(_))
    }
}

/// Shortcut for results produced by the keeper.
pub type KeeperResult<T> = std::result::Result<T, KeeperError>;
