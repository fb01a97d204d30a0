//! Provides a [CacheStore] backed by a Redis server.
//!
//! Entries are stored as plain strings (see [Entry::encode]) with a millisecond TTL. The lease
//! registry is a Redis SET. The conditional commit is a Lua script so that checking the lease
//! and writing the entry happens as one atomic step on the server. Deleting an entry and
//! clearing the registry is done within a single **MULTI** transaction.
//!
//! We use blocking connections on tokio's blocking thread pool, as the async API of the redis
//! crate doesn't play well with the tokio version we use. Each operation obtains a fresh
//! connection, pooling is left to a proxy or the host service.
//!
//! Note that in a Redis Cluster, the cache keys and the lease registry have to reside in the
//! same hash slot (e.g. by using a hash tag like `{cache}` in the namespace and registry key).
//!
//! # Configuration
//! When loaded via [RedisStore::from_yaml], a **redis** object is expected:
//!
//! ```yaml
//! redis:
//!     url: "redis://127.0.0.1:6379/0"
//!     # Optional: the SET which holds all live leases
//!     lease_registry: "cachekeeper:leases"
//!     # Optional: the connect timeout
//!     timeout: 2s
//! ```
use std::time::Duration;

use ::redis::{Client, Connection, RedisResult};
use anyhow::Context;
use async_trait::async_trait;
use yaml_rust::YamlLoader;

use crate::error::{KeeperError, KeeperResult};
use crate::fmt::{format_duration, parse_duration};
use crate::lease::LeaseToken;
use crate::store::{CacheStore, Entry};

/// Contains the name of the SET which holds all live leases unless configured otherwise.
pub const DEFAULT_LEASE_REGISTRY: &str = "cachekeeper:leases";

/// Contains the connect timeout unless configured otherwise.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

lazy_static::lazy_static! {
    /// Writes ARGV[2] into KEYS[1] with a TTL of ARGV[3] milliseconds, if the lease ARGV[1] is
    /// still a member of the registry KEYS[2]. The lease is consumed in this case.
    static ref COMMIT_IF_LEASE_LIVE: ::redis::Script = ::redis::Script::new(
        r"
        if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 1 then
            redis.call('SREM', KEYS[2], ARGV[1])
            redis.call('SET', KEYS[1], ARGV[2], 'PX', ARGV[3])
            return 1
        end
        return 0
        "
    );
}

/// Provides a store which keeps entries and leases in Redis.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    lease_registry: String,
    timeout: Duration,
}

impl RedisStore {
    /// Creates a store for the server at the given URL like `redis://127.0.0.1:6379/0`.
    ///
    /// Note that this only validates the URL, no connection is established yet.
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let client =
            Client::open(url).with_context(|| format!("Invalid Redis URL: '{}'", url))?;

        Ok(RedisStore {
            client,
            lease_registry: DEFAULT_LEASE_REGISTRY.to_owned(),
            timeout: DEFAULT_TIMEOUT,
        })
    }

    /// Specifies the key of the SET which holds the live leases.
    ///
    /// All keepers which share cache entries have to share the same registry.
    pub fn with_lease_registry(mut self, lease_registry: impl Into<String>) -> Self {
        self.lease_registry = lease_registry.into();
        self
    }

    /// Specifies the timeout used when connecting to the server.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Returns the key of the SET which holds the live leases.
    pub fn lease_registry(&self) -> &str {
        &self.lease_registry
    }

    /// Creates a store based on the **redis** object in the given YAML document.
    ///
    /// # Errors
    /// Fails with a **Configuration** error if no valid **url** is given or if the timeout
    /// cannot be parsed.
    pub fn from_yaml(data: &str) -> KeeperResult<Self> {
        let docs = YamlLoader::load_from_str(data).map_err(|error| {
            KeeperError::configuration(format!("Cannot parse the redis config: {}", error))
        })?;
        let redis = docs
            .first()
            .map(|doc| &doc["redis"])
            .filter(|redis| redis.as_hash().is_some())
            .ok_or_else(|| KeeperError::configuration("The config has no 'redis' object."))?;

        let url = redis["url"]
            .as_str()
            .ok_or_else(|| KeeperError::configuration("redis.url must be set."))?;
        let mut store = RedisStore::open(url)
            .map_err(|error| KeeperError::configuration(format!("{:#}", error)))?;

        if let Some(lease_registry) = redis["lease_registry"].as_str() {
            store = store.with_lease_registry(lease_registry);
        }
        if let Some(timeout) = redis["timeout"].as_str() {
            store = store.with_timeout(parse_duration(timeout).map_err(|error| {
                KeeperError::configuration(format!("Invalid redis.timeout: {}", error))
            })?);
        }

        log::info!(
            "Using Redis store with lease registry '{}' (connect timeout: {})...",
            store.lease_registry,
            format_duration(store.timeout)
        );

        Ok(store)
    }

    /// Executes the given operation on a blocking worker thread.
    async fn execute<T, F>(&self, operation: F) -> anyhow::Result<T>
    where
        F: FnOnce(&mut Connection) -> RedisResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let client = self.client.clone();
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || {
            let mut connection = client.get_connection_with_timeout(timeout)?;
            operation(&mut connection)
        })
        .await
        .context("A Redis worker crashed")?
        .context("Failed to execute a Redis command")
    }
}

#[async_trait]
impl CacheStore for RedisStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Entry>> {
        let key = key.to_owned();
        let data = self
            .execute(move |connection| {
                ::redis::cmd("GET")
                    .arg(key)
                    .query::<Option<String>>(connection)
            })
            .await?;

        Ok(data.map(|data| Entry::decode(&data)).transpose()?)
    }

    async fn register_lease(&self, lease: &LeaseToken) -> anyhow::Result<()> {
        let registry = self.lease_registry.clone();
        let lease = lease.to_string();
        self.execute(move |connection| {
            ::redis::cmd("SADD")
                .arg(registry)
                .arg(lease)
                .query::<()>(connection)
        })
        .await
    }

    async fn release_lease(&self, lease: &LeaseToken) -> anyhow::Result<()> {
        let registry = self.lease_registry.clone();
        let lease = lease.to_string();
        self.execute(move |connection| {
            ::redis::cmd("SREM")
                .arg(registry)
                .arg(lease)
                .query::<()>(connection)
        })
        .await
    }

    async fn commit_if_lease_live(
        &self,
        key: &str,
        entry: Entry,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let key = key.to_owned();
        let registry = self.lease_registry.clone();
        let lease = lease.to_string();
        let ttl_millis = ttl.as_millis().max(1) as u64;

        let committed = self
            .execute(move |connection| {
                COMMIT_IF_LEASE_LIVE
                    .key(key)
                    .key(registry)
                    .arg(lease)
                    .arg(entry.encode())
                    .arg(ttl_millis)
                    .invoke::<i32>(connection)
            })
            .await?;

        Ok(committed == 1)
    }

    async fn clear_all_leases(&self) -> anyhow::Result<()> {
        let registry = self.lease_registry.clone();
        self.execute(move |connection| ::redis::cmd("DEL").arg(registry).query::<()>(connection))
            .await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_owned();
        self.execute(move |connection| ::redis::cmd("DEL").arg(key).query::<()>(connection))
            .await
    }

    async fn delete_and_clear_leases(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_owned();
        let registry = self.lease_registry.clone();
        self.execute(move |connection| {
            ::redis::pipe()
                .atomic()
                .cmd("DEL")
                .arg(registry)
                .ignore()
                .cmd("DEL")
                .arg(key)
                .ignore()
                .query::<()>(connection)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use crate::lease::LeaseToken;
    use crate::store::redis::{RedisStore, DEFAULT_LEASE_REGISTRY, DEFAULT_TIMEOUT};
    use crate::store::{CacheStore, Entry, UnknownEntryFormat};
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    /// Creates a store with a private lease registry, so that tests can run in parallel.
    fn test_store() -> Option<RedisStore> {
        let url = crate::testing::redis_url()?;
        Some(
            RedisStore::open(&url)
                .unwrap()
                .with_lease_registry(format!("cachekeeper:test:{}", LeaseToken::generate())),
        )
    }

    fn test_key() -> String {
        format!("cachekeeper:test:key:{}", LeaseToken::generate())
    }

    #[test]
    fn invalid_urls_are_rejected() {
        assert_eq!(RedisStore::open("not a url").is_err(), true);
    }

    #[test]
    fn stores_can_be_configured_via_yaml() {
        let store = RedisStore::from_yaml(
            "
redis:
    url: redis://127.0.0.1:6379/0
    lease_registry: \"{cache}:leases\"
    timeout: 500ms
",
        )
        .unwrap();
        assert_eq!(store.lease_registry(), "{cache}:leases");
        assert_eq!(store.timeout, Duration::from_millis(500));

        let store = RedisStore::from_yaml("redis:\n    url: redis://localhost\n").unwrap();
        assert_eq!(store.lease_registry(), DEFAULT_LEASE_REGISTRY);
        assert_eq!(store.timeout, DEFAULT_TIMEOUT);

        assert_eq!(RedisStore::from_yaml("redis:\n    timeout: 1s\n").is_err(), true);
        assert_eq!(
            RedisStore::from_yaml("redis:\n    url: redis://localhost\n    timeout: soon\n")
                .is_err(),
            true
        );
    }

    #[test]
    fn an_unreachable_server_is_reported() {
        crate::testing::test_async(async {
            let store = RedisStore::open("redis://127.0.0.1:1")
                .unwrap()
                .with_timeout(Duration::from_millis(200));
            assert_eq!(store.get("foo").await.is_err(), true);
            assert_eq!(
                store.register_lease(&LeaseToken::generate()).await.is_err(),
                true
            );
        });
    }

    #[test]
    fn commits_require_a_live_lease() {
        crate::testing::test_async(async {
            let store = match test_store() {
                Some(store) => store,
                None => return,
            };
            let key = test_key();

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live(&key, Entry::Value("a".to_owned()), &lease, HOUR)
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(
                store
                    .commit_if_lease_live(&key, Entry::Value("b".to_owned()), &lease, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(
                store.get(&key).await.unwrap(),
                Some(Entry::Value("a".to_owned()))
            );

            store.delete(&key).await.unwrap();
            store.delete(&key).await.unwrap();
            assert_eq!(store.get(&key).await.unwrap(), None);
        });
    }

    #[test]
    fn deletes_fence_pending_commits() {
        crate::testing::test_async(async {
            let store = match test_store() {
                Some(store) => store,
                None => return,
            };
            let key = test_key();

            let stale = LeaseToken::generate();
            store.register_lease(&stale).await.unwrap();
            store.delete_and_clear_leases(&key).await.unwrap();

            assert_eq!(
                store
                    .commit_if_lease_live(&key, Entry::Value("stale".to_owned()), &stale, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get(&key).await.unwrap(), None);

            let fresh = LeaseToken::generate();
            store.register_lease(&fresh).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live(&key, Entry::Absent, &fresh, HOUR)
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(store.get(&key).await.unwrap(), Some(Entry::Absent));

            store.delete_and_clear_leases(&key).await.unwrap();
        });
    }

    #[test]
    fn released_leases_cannot_commit() {
        crate::testing::test_async(async {
            let store = match test_store() {
                Some(store) => store,
                None => return,
            };
            let key = test_key();

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            store.release_lease(&lease).await.unwrap();
            store.release_lease(&lease).await.unwrap();

            assert_eq!(
                store
                    .commit_if_lease_live(&key, Entry::Value("a".to_owned()), &lease, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get(&key).await.unwrap(), None);
        });
    }

    #[test]
    fn foreign_data_is_reported_as_such() {
        crate::testing::test_async(async {
            let store = match test_store() {
                Some(store) => store,
                None => return,
            };
            let key = test_key();

            let foreign_key = key.clone();
            store
                .execute(move |connection| {
                    ::redis::cmd("SET")
                        .arg(foreign_key)
                        .arg("foreign")
                        .arg("PX")
                        .arg(60_000)
                        .query::<()>(connection)
                })
                .await
                .unwrap();

            let error = store.get(&key).await.unwrap_err();
            assert_eq!(error.downcast_ref::<UnknownEntryFormat>().is_some(), true);

            store.delete(&key).await.unwrap();
        });
    }

    #[test]
    fn entries_carry_a_ttl() {
        crate::testing::test_async(async {
            let store = match test_store() {
                Some(store) => store,
                None => return,
            };
            let key = test_key();

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            let _ = store
                .commit_if_lease_live(
                    &key,
                    Entry::Value("a".to_owned()),
                    &lease,
                    Duration::from_millis(100),
                )
                .await
                .unwrap();

            tokio::time::sleep(Duration::from_millis(250)).await;
            assert_eq!(store.get(&key).await.unwrap(), None);
        });
    }
}
