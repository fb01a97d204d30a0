//! Provides the lease tokens which guard each reload.
//!
//! A lease identifies a single reload *attempt*, not a cache key. It is registered in the store
//! before the reloader runs and has to be still registered when the reload result is committed.
//! As a delete clears all registered leases, any reload which was overtaken by a delete is
//! unable to commit its (potentially stale) result.
//!
//! Tokens are drawn from a random source (UUID v4) so that they can neither be predicted nor
//! forged by other tenants sharing the same store. A token is never reused.
use std::fmt;
use std::fmt::Display;

/// Represents an opaque lease token.
///
/// # Examples
/// ```
/// # use cachekeeper::lease::LeaseToken;
/// let first = LeaseToken::generate();
/// let second = LeaseToken::generate();
///
/// assert_ne!(first, second);
/// assert_eq!(first.as_str().len(), 32);
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct LeaseToken(String);

impl LeaseToken {
    /// Mints a new and globally unique lease token.
    ///
    /// The token is rendered as 32 lower case hex digits without any separators.
    pub fn generate() -> Self {
        LeaseToken(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Returns the string representation of this token as stored in the lease registry.
    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }
}

impl Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
