//! Defines the contract between the keeper and the storage backend.
//!
//! A [CacheStore] keeps two things: the cache entries themselves (each with a finite TTL) and the
//! **lease registry**, which is the set of lease tokens currently permitted to commit a reload
//! result. All of the keeper's consistency guarantees boil down to a single requirement placed
//! on the store: [commit_if_lease_live](CacheStore::commit_if_lease_live) has to check the lease
//! and write the entry as one indivisible operation with respect to
//! [clear_all_leases](CacheStore::clear_all_leases).
//!
//! Two implementations are provided:
//! * [MemoryStore](memory::MemoryStore): an in-process actor which serializes all operations.
//! * [RedisStore](redis::RedisStore): a Redis backend which performs the conditional commit as
//!   a server side Lua script.
//!
//! Stores report failures as **anyhow** errors. The keeper turns these into
//! [StoreUnavailable](crate::error::KeeperError::StoreUnavailable).
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::lease::LeaseToken;

pub mod lru;
pub mod memory;
pub mod redis;

/// Signals that the data stored for a key is not an encoded [Entry].
///
/// Stores which decode entries themselves report this (wrapped in their **anyhow** error) so that
/// the keeper can tell broken data apart from a broken store.
#[derive(Debug, Error)]
#[error("Found an unknown entry format: '{0}'")]
pub struct UnknownEntryFormat(String);

/// Represents what is stored for a cache key.
///
/// Next to an actual (serialized) value, the store can also hold an **absence marker**. This
/// records that the data source has no value for this key and is used to prevent cache
/// penetration. Note that an absence marker is a cache *hit*, in contrast to a key for which
/// nothing is stored at all.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Entry {
    /// A value as serialized by the keeper.
    Value(String),
    /// Marks that the data source has no value for this key.
    Absent,
}

impl Entry {
    /// Encodes this entry into a single string for stores which only handle plain strings.
    ///
    /// A value is prefixed with **+**, the absence marker is a lone **-**.
    ///
    /// # Examples
    /// ```
    /// # use cachekeeper::store::Entry;
    /// assert_eq!(Entry::Value("\"Jane\"".to_owned()).encode(), "+\"Jane\"");
    /// assert_eq!(Entry::Absent.encode(), "-");
    /// ```
    pub fn encode(&self) -> String {
        match self {
            Entry::Value(value) => format!("+{}", value),
            Entry::Absent => "-".to_owned(),
        }
    }

    /// Decodes a string created by [encode](Entry::encode).
    ///
    /// # Errors
    /// Fails if the given data doesn't start with a known marker, e.g. because the key was
    /// written by another application.
    ///
    /// # Examples
    /// ```
    /// # use cachekeeper::store::Entry;
    /// assert_eq!(Entry::decode("+42").unwrap(), Entry::Value("42".to_owned()));
    /// assert_eq!(Entry::decode("-").unwrap(), Entry::Absent);
    /// assert_eq!(Entry::decode("42").is_err(), true);
    /// ```
    pub fn decode(data: &str) -> Result<Entry, UnknownEntryFormat> {
        if let Some(value) = data.strip_prefix('+') {
            Ok(Entry::Value(value.to_owned()))
        } else if data == "-" {
            Ok(Entry::Absent)
        } else {
            Err(UnknownEntryFormat(data.chars().take(32).collect()))
        }
    }
}

impl lru::ByteSize for Entry {
    fn allocated_size(&self) -> usize {
        match self {
            Entry::Value(value) => lru::ByteSize::allocated_size(value),
            Entry::Absent => 0,
        }
    }
}

/// Describes a backing store which can hold cache entries and the lease registry.
///
/// Keys are plain strings, as computed by the keeper from the caller's key and the configured
/// namespace.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the entry stored for the given key.
    ///
    /// Returns **None** if nothing is stored or if the stored entry has expired. Data which
    /// cannot be decoded is reported as [UnknownEntryFormat].
    async fn get(&self, key: &str) -> anyhow::Result<Option<Entry>>;

    /// Adds the given lease to the lease registry.
    async fn register_lease(&self, lease: &LeaseToken) -> anyhow::Result<()>;

    /// Removes the given lease from the registry without committing anything.
    ///
    /// This is used for reloads which have nothing to commit. Releasing an unknown lease is not
    /// an error.
    async fn release_lease(&self, lease: &LeaseToken) -> anyhow::Result<()>;

    /// Stores the given entry for the given key and TTL, but only if the given lease is still
    /// registered.
    ///
    /// Returns **true** if the entry was written and **false** if the lease was no longer live.
    /// In the latter case, the store must not be modified at all. A store may also reply
    /// **false** for an entry it refuses to hold (e.g. one larger than the whole store), as
    /// long as it doesn't modify the existing entry. The check and the write must
    /// be atomic with respect to [clear_all_leases](CacheStore::clear_all_leases).
    async fn commit_if_lease_live(
        &self,
        key: &str,
        entry: Entry,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> anyhow::Result<bool>;

    /// Removes all leases from the registry.
    async fn clear_all_leases(&self) -> anyhow::Result<()>;

    /// Removes the entry for the given key. Removing an unknown key is not an error.
    async fn delete(&self, key: &str) -> anyhow::Result<()>;

    /// Removes the entry for the given key and clears the whole lease registry.
    ///
    /// The default implementation clears the registry *first*. Doing it the other way round would
    /// permit a commit to slip in between the two steps and resurrect a stale value. Stores which
    /// can do both in one atomic step should override this.
    async fn delete_and_clear_leases(&self, key: &str) -> anyhow::Result<()> {
        self.clear_all_leases().await?;
        self.delete(key).await
    }
}
