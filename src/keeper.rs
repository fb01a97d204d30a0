//! Implements the lease guarded read-through protocol.
//!
//! A [CacheKeeper] sits between a caller and its data source. Reads are answered from the
//! [CacheStore] whenever possible. On a miss, the caller supplied **reloader** is invoked and its
//! result is written back into the store, but only if no delete happened in the meantime.
//!
//! # The protocol
//! * **read_cache**: A hit (including a cached absence marker) is returned right away. On a miss,
//!   a fresh [LeaseToken] is registered in the store *before* the reloader runs. Once the reloader
//!   completes, its result is committed via
//!   [commit_if_lease_live](CacheStore::commit_if_lease_live). If the lease was cleared in the
//!   meantime, the commit is silently dropped and the caller still receives the reloaded value.
//! * **delete_cache**: Removes the entry and clears *all* registered leases. Any reload which is
//!   still in flight (for any key) will therefore not be able to commit its result.
//!
//! Note that two concurrent misses for the same key will both invoke their reloader. Leases
//! prevent stale writes, not duplicate work.
//!
//! # Cancellation
//! Dropping the future returned by [read_cache](CacheKeeper::read_cache) while the reloader is
//! running abandons the reload. Nothing is committed and the lease is left behind, where it is
//! harmless and removed by the next delete. Reloads which complete without anything to commit
//! (a failure, or an absence which isn't cached) release their lease right away.
use std::fmt::Display;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::{KeeperConfig, PenetrationPolicy};
use crate::error::{KeeperError, KeeperResult};
use crate::lease::LeaseToken;
use crate::metrics::KeeperMetrics;
use crate::store::{CacheStore, Entry, UnknownEntryFormat};

/// Provides read-through access to a cache for keys of type **K** and values of type **V**.
///
/// A keeper is cheap to clone. All clones share the same store and metrics. Values are stored
/// as JSON, the storage key is the configured namespace followed by the key itself.
///
/// # Examples
/// ```
/// # use cachekeeper::config::{KeeperConfig, PenetrationStrategy};
/// # use cachekeeper::keeper::CacheKeeper;
/// # use cachekeeper::store::memory::MemoryStore;
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let config = KeeperConfig::builder()
///     .cache_expire_time(Duration::from_secs(60))
///     .penetration_strategy(PenetrationStrategy::CacheAbsence)
///     .absence_ttl(Duration::from_secs(10))
///     .build()
///     .unwrap();
/// let keeper: CacheKeeper<u32, String> =
///     CacheKeeper::new(config, Arc::new(MemoryStore::new(1024, 1024 * 1024)));
///
/// // The first read invokes the reloader...
/// let value = keeper.read_cache(&7, |_| async { Ok(None) }).await.unwrap();
/// assert_eq!(value, None);
///
/// // ...and the cached absence suppresses the next one.
/// let value = keeper
///     .read_cache(&7, |_| async { Ok(Some("Surprise".to_owned())) })
///     .await
///     .unwrap();
/// assert_eq!(value, None);
///
/// // Deleting the entry permits a fresh reload.
/// keeper.delete_cache(&7).await.unwrap();
/// let value = keeper
///     .read_cache(&7, |_| async { Ok(Some("Surprise".to_owned())) })
///     .await
///     .unwrap();
/// assert_eq!(value.as_deref(), Some("Surprise"));
/// # }
/// ```
pub struct CacheKeeper<K, V> {
    config: KeeperConfig,
    store: Arc<dyn CacheStore>,
    metrics: Arc<KeeperMetrics>,
    _types: PhantomData<fn(K) -> V>,
}

impl<K, V> Clone for CacheKeeper<K, V> {
    fn clone(&self) -> Self {
        CacheKeeper {
            config: self.config.clone(),
            store: self.store.clone(),
            metrics: self.metrics.clone(),
            _types: PhantomData,
        }
    }
}

impl<K, V> CacheKeeper<K, V> {
    /// Creates a new keeper which operates on the given store.
    pub fn new(config: KeeperConfig, store: Arc<dyn CacheStore>) -> Self {
        CacheKeeper {
            config,
            store,
            metrics: Arc::new(KeeperMetrics::default()),
            _types: PhantomData,
        }
    }

    /// Returns the config of this keeper.
    pub fn config(&self) -> &KeeperConfig {
        &self.config
    }

    /// Returns the metrics shared by all clones of this keeper.
    pub fn metrics(&self) -> &KeeperMetrics {
        &self.metrics
    }

    fn store_failure(&self, error: anyhow::Error) -> KeeperError {
        self.metrics.record_store_failure();
        log::warn!("The cache store failed: {:#}", error);

        KeeperError::StoreUnavailable(error)
    }
}

impl<K, V> CacheKeeper<K, V>
where
    K: Display + Clone,
    V: Serialize + DeserializeOwned,
{
    /// Computes the key under which the entry for the given key is stored.
    pub fn storage_key(&self, key: &K) -> String {
        format!("{}{}", self.config.namespace(), key)
    }

    /// Returns the value for the given key, either from the cache or by invoking the reloader.
    ///
    /// The reloader is invoked at most once and only on a cache miss. It returns **None** if the
    /// data source has no value for the key. Depending on the
    /// [PenetrationPolicy](crate::config::PenetrationPolicy), such an absence is cached or not.
    ///
    /// # Errors
    /// * **StoreUnavailable** if the store cannot be accessed. Nothing is retried.
    /// * **Reload** if the reloader fails. Nothing is committed in this case.
    /// * **Codec** if the value cannot be serialized or if a cached value cannot be decoded.
    ///
    /// Note that a reload result which cannot be committed because a delete cleared its lease (or
    /// because the store refuses to hold it) is *not* an error. The reloaded value is still
    /// returned.
    pub async fn read_cache<F, Fut>(&self, key: &K, reloader: F) -> KeeperResult<Option<V>>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        let storage_key = self.storage_key(key);

        match self.store.get(&storage_key).await.map_err(|error| {
            if error.downcast_ref::<UnknownEntryFormat>().is_some() {
                KeeperError::Codec(error.context(format!(
                    "Cannot decode the cached entry of '{}'",
                    storage_key
                )))
            } else {
                self.store_failure(error)
            }
        })? {
            Some(Entry::Value(data)) => {
                self.metrics.record_hit();
                return serde_json::from_str(&data).map(Some).map_err(|error| {
                    KeeperError::Codec(anyhow::Error::new(error).context(format!(
                        "Cannot decode the cached value of '{}'",
                        storage_key
                    )))
                });
            }
            Some(Entry::Absent) => {
                self.metrics.record_hit();
                log::debug!("Found an absence marker for '{}'.", storage_key);
                return Ok(None);
            }
            None => self.metrics.record_miss(),
        }

        let lease = LeaseToken::generate();
        self.store
            .register_lease(&lease)
            .await
            .map_err(|error| self.store_failure(error))?;
        log::debug!("Reloading '{}' using lease {}...", storage_key, lease);

        let watch = Instant::now();
        let value = match reloader(key.clone()).await {
            Ok(value) => value,
            Err(error) => {
                self.metrics.record_reload_failure();
                log::debug!("Reloading '{}' failed: {:#}", storage_key, error);
                self.release(&storage_key, &lease).await;
                return Err(KeeperError::Reload(error));
            }
        };
        self.metrics.record_reload(
            watch.elapsed().as_micros().min(u32::MAX as u128) as u32,
            value.is_some(),
        );

        match value {
            Some(value) => {
                let data = match serde_json::to_string(&value) {
                    Ok(data) => data,
                    Err(error) => {
                        self.release(&storage_key, &lease).await;
                        return Err(KeeperError::Codec(anyhow::Error::new(error).context(
                            format!("Cannot encode the value of '{}'", storage_key),
                        )));
                    }
                };
                self.commit(
                    &storage_key,
                    Entry::Value(data),
                    &lease,
                    self.config.cache_expire_time(),
                )
                .await?;

                Ok(Some(value))
            }
            None => {
                match self.config.penetration_policy() {
                    PenetrationPolicy::CacheAbsence(absence_ttl) => {
                        self.commit(&storage_key, Entry::Absent, &lease, absence_ttl)
                            .await?
                    }
                    PenetrationPolicy::None => self.release(&storage_key, &lease).await,
                }

                Ok(None)
            }
        }
    }

    /// Removes a lease which has nothing to commit from the registry.
    ///
    /// A failure is only logged, as a left over lease is harmless and removed by the next delete.
    async fn release(&self, storage_key: &str, lease: &LeaseToken) {
        if let Err(error) = self.store.release_lease(lease).await {
            self.metrics.record_store_failure();
            log::warn!(
                "Failed to release lease {} for '{}': {:#}",
                lease,
                storage_key,
                error
            );
        }
    }

    async fn commit(
        &self,
        storage_key: &str,
        entry: Entry,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> KeeperResult<()> {
        let committed = self
            .store
            .commit_if_lease_live(storage_key, entry, lease, ttl)
            .await
            .map_err(|error| self.store_failure(error))?;

        self.metrics.record_commit(committed);
        if !committed {
            log::debug!(
                "Discarded the reloaded entry for '{}' (lease {} cleared or entry rejected).",
                storage_key,
                lease
            );
        }

        Ok(())
    }

    /// Removes the entry for the given key and fences all reloads which are currently in flight.
    ///
    /// Deleting a key which isn't cached is fine.
    pub async fn delete_cache(&self, key: &K) -> KeeperResult<()> {
        let storage_key = self.storage_key(key);

        self.store
            .delete_and_clear_leases(&storage_key)
            .await
            .map_err(|error| self.store_failure(error))?;

        self.metrics.record_delete();
        log::debug!("Deleted '{}' and cleared all leases.", storage_key);

        Ok(())
    }
}
