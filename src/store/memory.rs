//! Provides an in-process [CacheStore] which is run as an actor.
//!
//! The store owns a [TtlCache] for the entries and a set of live lease tokens. Both are only
//! ever touched by a single tokio task which processes one command after another. Therefore
//! each command, especially **commit if lease is live**, is atomic with respect to all others
//! without any locking.
//!
//! A [MemoryStore] is only a handle to the queue of this actor and can be cloned and shared
//! freely. Once the last handle is dropped (or [MemoryStore::shutdown] is invoked), the actor
//! terminates.
//!
//! # Configuration
//! When loaded via [MemoryStore::from_yaml], a **store** object is expected:
//!
//! ```yaml
//! store:
//!     # Specifies the maximal number of entries to keep
//!     size: 1024
//!     # Specifies the maximal amount of memory to use (in bytes).
//!     # Supports common suffixes like: k, m, g, t
//!     max_memory: 16m
//! ```
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

use async_trait::async_trait;
use fnv::FnvHashSet;
use tokio::sync::{mpsc, oneshot};
use yaml_rust::YamlLoader;

use crate::error::{KeeperError, KeeperResult};
use crate::fmt::{format_size, parse_size};
use crate::lease::LeaseToken;
use crate::store::lru::TtlCache;
use crate::store::{CacheStore, Entry};

/// Limits the number of commands which can be queued up for the actor.
const QUEUE_SIZE: usize = 1024;

/// Enumerates the commands processed by the actor.
enum Command {
    Get(String, oneshot::Sender<Option<Entry>>),
    Ttl(String, oneshot::Sender<Option<Duration>>),
    RegisterLease(LeaseToken, oneshot::Sender<()>),
    ReleaseLease(LeaseToken, oneshot::Sender<()>),
    Commit {
        key: String,
        entry: Entry,
        lease: LeaseToken,
        ttl: Duration,
        reply: oneshot::Sender<bool>,
    },
    ClearLeases(oneshot::Sender<()>),
    Delete(String, oneshot::Sender<()>),
    DeleteAndClearLeases(String, oneshot::Sender<()>),
    Stats(oneshot::Sender<MemoryStats>),
    Shutdown,
}

/// Provides a snapshot of the state of a [MemoryStore].
#[derive(Clone, Debug, PartialEq)]
pub struct MemoryStats {
    /// Contains the number of entries (which might include expired but not yet evicted ones).
    pub entries: usize,
    /// Contains the max number of entries.
    pub capacity: usize,
    /// Contains the number of lease tokens currently registered.
    pub live_leases: usize,
    /// Contains the memory allocated by keys and values in bytes.
    pub allocated_memory: usize,
    /// Contains the max amount of memory to occupy.
    pub max_memory: usize,
    /// Contains the number of lookups performed.
    pub reads: usize,
    /// Contains the number of lookups which found a live entry.
    pub hits: usize,
    /// Contains the number of writes and removals performed.
    pub writes: usize,
}

impl Display for MemoryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{:<30} {:>20}", "Num Entries", self.entries)?;
        writeln!(f, "{:<30} {:>20}", "Max Entries", self.capacity)?;
        writeln!(f, "{:<30} {:>20}", "Live Leases", self.live_leases)?;
        writeln!(
            f,
            "{:<30} {:>20}",
            "Allocated Memory",
            format_size(self.allocated_memory)
        )?;
        writeln!(f, "{:<30} {:>20}", "Max Memory", format_size(self.max_memory))?;
        writeln!(f, "{:<30} {:>20}", "Reads", self.reads)?;
        writeln!(f, "{:<30} {:>20}", "Hits", self.hits)?;
        writeln!(f, "{:<30} {:>20}", "Writes", self.writes)
    }
}

/// Provides a handle to an in-memory store.
///
/// # Examples
/// ```
/// # use cachekeeper::store::memory::MemoryStore;
/// # use cachekeeper::store::{CacheStore, Entry};
/// # use cachekeeper::lease::LeaseToken;
/// # use std::time::Duration;
/// # #[tokio::main]
/// # async fn main() {
/// let store = MemoryStore::new(1024, 1024 * 1024);
///
/// let lease = LeaseToken::generate();
/// store.register_lease(&lease).await.unwrap();
///
/// // A live lease permits a commit...
/// let entry = Entry::Value("42".to_owned());
/// let ttl = Duration::from_secs(60);
/// assert_eq!(store.commit_if_lease_live("answer", entry, &lease, ttl).await.unwrap(), true);
/// assert_eq!(store.get("answer").await.unwrap(), Some(Entry::Value("42".to_owned())));
///
/// // ...but once it has been used, it is gone.
/// let entry = Entry::Value("43".to_owned());
/// assert_eq!(store.commit_if_lease_live("answer", entry, &lease, ttl).await.unwrap(), false);
/// assert_eq!(store.get("answer").await.unwrap(), Some(Entry::Value("42".to_owned())));
/// # }
/// ```
#[derive(Clone)]
pub struct MemoryStore {
    queue: mpsc::Sender<Command>,
}

impl MemoryStore {
    /// Creates a new store which keeps up to **capacity** entries or as many as fit into
    /// **max_memory** bytes.
    ///
    /// Note that this spawns the actor task and therefore has to be invoked within a tokio
    /// runtime.
    pub fn new(capacity: usize, max_memory: usize) -> Self {
        let (queue, endpoint) = mpsc::channel(QUEUE_SIZE);
        std::mem::drop(tokio::spawn(actor(
            TtlCache::new(capacity, max_memory),
            endpoint,
        )));

        MemoryStore { queue }
    }

    /// Creates a new store based on the **store** object in the given YAML document.
    ///
    /// # Errors
    /// Fails with a **Configuration** error if the document cannot be parsed or if either
    /// **size** or **max_memory** is missing or invalid.
    pub fn from_yaml(data: &str) -> KeeperResult<Self> {
        let docs = YamlLoader::load_from_str(data).map_err(|error| {
            KeeperError::configuration(format!("Cannot parse the store config: {}", error))
        })?;
        let store = docs
            .first()
            .map(|doc| &doc["store"])
            .filter(|store| store.as_hash().is_some())
            .ok_or_else(|| KeeperError::configuration("The config has no 'store' object."))?;

        let capacity = store["size"]
            .as_i64()
            .filter(|size| *size > 0)
            .ok_or_else(|| KeeperError::configuration("store.size must be a positive number."))?
            as usize;

        let max_memory = match &store["max_memory"] {
            yaml_rust::Yaml::Integer(size) if *size > 0 => *size as usize,
            yaml_rust::Yaml::String(size) => parse_size(size).map_err(|error| {
                KeeperError::configuration(format!("Invalid store.max_memory: {}", error))
            })?,
            _ => {
                return Err(KeeperError::configuration(
                    "store.max_memory must be a size like '16m'.",
                ))
            }
        };

        log::info!(
            "Creating memory store for {} entries using up to {}...",
            capacity,
            format_size(max_memory)
        );

        Ok(MemoryStore::new(capacity, max_memory))
    }

    /// Sends a command to the actor and awaits its reply.
    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> anyhow::Result<T> {
        let (reply, response) = oneshot::channel();
        if self.queue.send(command(reply)).await.is_err() {
            return Err(anyhow::anyhow!("The memory store has been shut down."));
        }

        response
            .await
            .map_err(|_| anyhow::anyhow!("The memory store didn't reply."))
    }

    /// Returns the remaining time to live of the entry for the given key.
    ///
    /// Returns **None** if nothing is stored or if the entry has expired.
    pub async fn ttl(&self, key: &str) -> anyhow::Result<Option<Duration>> {
        let key = key.to_owned();
        self.call(|reply| Command::Ttl(key, reply)).await
    }

    /// Returns a snapshot of the internal state and metrics of this store.
    pub async fn stats(&self) -> anyhow::Result<MemoryStats> {
        self.call(Command::Stats).await
    }

    /// Stops the actor of this store.
    ///
    /// All subsequent calls (through any handle) will fail.
    pub async fn shutdown(&self) {
        let _ = self.queue.send(Command::Shutdown).await;
    }
}

/// Processes all commands sent to a memory store.
async fn actor(mut cache: TtlCache<Entry>, mut endpoint: mpsc::Receiver<Command>) {
    let mut leases: FnvHashSet<LeaseToken> = FnvHashSet::default();

    while let Some(command) = endpoint.recv().await {
        match command {
            Command::Get(key, reply) => {
                let _ = reply.send(cache.get(&key).cloned());
            }
            Command::Ttl(key, reply) => {
                let _ = reply.send(cache.ttl(&key));
            }
            Command::RegisterLease(lease, reply) => {
                let _ = leases.insert(lease);
                let _ = reply.send(());
            }
            Command::ReleaseLease(lease, reply) => {
                let _ = leases.remove(&lease);
                let _ = reply.send(());
            }
            Command::Commit {
                key,
                entry,
                lease,
                ttl,
                reply,
            } => {
                // A rejected entry (too large, TTL out of range) consumes the lease but is
                // simply not cached.
                let committed = leases.remove(&lease)
                    && match cache.put(key, entry, ttl) {
                        Ok(()) => true,
                        Err(error) => {
                            log::warn!("Not caching a reloaded entry: {:#}", error);
                            false
                        }
                    };
                let _ = reply.send(committed);
            }
            Command::ClearLeases(reply) => {
                leases.clear();
                let _ = reply.send(());
            }
            Command::Delete(key, reply) => {
                cache.remove(&key);
                let _ = reply.send(());
            }
            Command::DeleteAndClearLeases(key, reply) => {
                leases.clear();
                cache.remove(&key);
                let _ = reply.send(());
            }
            Command::Stats(reply) => {
                let _ = reply.send(MemoryStats {
                    entries: cache.len(),
                    capacity: cache.capacity(),
                    live_leases: leases.len(),
                    allocated_memory: cache.allocated_memory(),
                    max_memory: cache.max_memory(),
                    reads: cache.reads(),
                    hits: cache.hits(),
                    writes: cache.writes(),
                });
            }
            Command::Shutdown => break,
        }
    }

    log::debug!("Memory store terminated...");
}

#[async_trait]
impl CacheStore for MemoryStore {
    async fn get(&self, key: &str) -> anyhow::Result<Option<Entry>> {
        let key = key.to_owned();
        self.call(|reply| Command::Get(key, reply)).await
    }

    async fn register_lease(&self, lease: &LeaseToken) -> anyhow::Result<()> {
        let lease = lease.clone();
        self.call(|reply| Command::RegisterLease(lease, reply)).await
    }

    async fn release_lease(&self, lease: &LeaseToken) -> anyhow::Result<()> {
        let lease = lease.clone();
        self.call(|reply| Command::ReleaseLease(lease, reply)).await
    }

    async fn commit_if_lease_live(
        &self,
        key: &str,
        entry: Entry,
        lease: &LeaseToken,
        ttl: Duration,
    ) -> anyhow::Result<bool> {
        let key = key.to_owned();
        let lease = lease.clone();
        self.call(|reply| Command::Commit {
            key,
            entry,
            lease,
            ttl,
            reply,
        })
        .await
    }

    async fn clear_all_leases(&self) -> anyhow::Result<()> {
        self.call(Command::ClearLeases).await
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_owned();
        self.call(|reply| Command::Delete(key, reply)).await
    }

    async fn delete_and_clear_leases(&self, key: &str) -> anyhow::Result<()> {
        let key = key.to_owned();
        self.call(|reply| Command::DeleteAndClearLeases(key, reply))
            .await
    }
}

#[cfg(test)]
mod tests {
    use crate::lease::LeaseToken;
    use crate::store::memory::MemoryStore;
    use crate::store::{CacheStore, Entry};
    use mock_instant::global::MockClock;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(60 * 60);

    fn value(data: &str) -> Entry {
        Entry::Value(data.to_owned())
    }

    #[test]
    fn commits_require_a_live_lease() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            // A lease which was never registered cannot commit...
            let unknown = LeaseToken::generate();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("a"), &unknown, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get("foo").await.unwrap(), None);

            // ...a registered one can, but only once.
            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("b"), &lease, HOUR)
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("c"), &lease, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get("foo").await.unwrap(), Some(value("b")));
            assert_eq!(store.stats().await.unwrap().live_leases, 0);
        });
    }

    #[test]
    fn clearing_leases_fences_pending_commits() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let stale = LeaseToken::generate();
            store.register_lease(&stale).await.unwrap();
            store.delete_and_clear_leases("foo").await.unwrap();

            // A lease granted after the delete is honored...
            let fresh = LeaseToken::generate();
            store.register_lease(&fresh).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("fresh"), &fresh, HOUR)
                    .await
                    .unwrap(),
                true
            );

            // ...while the one granted before it must not overwrite the fresh value.
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("stale"), &stale, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get("foo").await.unwrap(), Some(value("fresh")));
        });
    }

    #[test]
    fn clearing_leases_is_global() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let first = LeaseToken::generate();
            let second = LeaseToken::generate();
            store.register_lease(&first).await.unwrap();
            store.register_lease(&second).await.unwrap();
            assert_eq!(store.stats().await.unwrap().live_leases, 2);

            // Deleting an unrelated key fences every reload in flight...
            store.delete_and_clear_leases("other").await.unwrap();
            assert_eq!(store.stats().await.unwrap().live_leases, 0);
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("a"), &first, HOUR)
                    .await
                    .unwrap(),
                false
            );

            // ...and so does clearing the registry on its own.
            store.register_lease(&second).await.unwrap();
            store.clear_all_leases().await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("a"), &second, HOUR)
                    .await
                    .unwrap(),
                false
            );
        });
    }

    #[test]
    fn absence_markers_are_stored() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("missing", Entry::Absent, &lease, HOUR)
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(store.get("missing").await.unwrap(), Some(Entry::Absent));
            assert_eq!(store.get("unknown").await.unwrap(), None);
        });
    }

    #[test]
    fn entries_expire() {
        let _guard = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            let _ = store
                .commit_if_lease_live("foo", value("bar"), &lease, Duration::from_secs(5))
                .await
                .unwrap();
            assert_eq!(store.get("foo").await.unwrap(), Some(value("bar")));

            MockClock::advance(Duration::from_secs(6));
            assert_eq!(store.get("foo").await.unwrap(), None);
        });
    }

    #[test]
    fn deleting_twice_is_fine() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            let _ = store
                .commit_if_lease_live("foo", value("bar"), &lease, HOUR)
                .await
                .unwrap();

            store.delete("foo").await.unwrap();
            store.delete("foo").await.unwrap();
            assert_eq!(store.get("foo").await.unwrap(), None);
        });
    }

    #[test]
    fn oversized_entries_are_not_cached() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 16);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value(&"X".repeat(64)), &lease, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(store.get("foo").await.unwrap(), None);
            assert_eq!(store.stats().await.unwrap().live_leases, 0);

            // The store is still fully operational...
            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("bar"), &lease, HOUR)
                    .await
                    .unwrap(),
                true
            );
        });
    }

    #[test]
    fn out_of_range_ttls_do_not_stop_the_store() {
        let _guard = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);
            MockClock::advance(Duration::from_secs(1));

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("bar"), &lease, Duration::MAX)
                    .await
                    .unwrap(),
                false
            );

            // Other keys are still served...
            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            assert_eq!(
                store
                    .commit_if_lease_live("other", value("baz"), &lease, HOUR)
                    .await
                    .unwrap(),
                true
            );
            assert_eq!(store.get("other").await.unwrap(), Some(value("baz")));
        });
    }

    #[test]
    fn released_leases_cannot_commit() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let kept = LeaseToken::generate();
            let released = LeaseToken::generate();
            store.register_lease(&kept).await.unwrap();
            store.register_lease(&released).await.unwrap();

            store.release_lease(&released).await.unwrap();
            // Releasing twice is fine...
            store.release_lease(&released).await.unwrap();
            assert_eq!(store.stats().await.unwrap().live_leases, 1);

            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("a"), &released, HOUR)
                    .await
                    .unwrap(),
                false
            );
            assert_eq!(
                store
                    .commit_if_lease_live("foo", value("b"), &kept, HOUR)
                    .await
                    .unwrap(),
                true
            );
        });
    }

    #[test]
    fn ttls_are_reported() {
        let _guard = crate::testing::lock_clock();
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            let _ = store
                .commit_if_lease_live("foo", value("bar"), &lease, Duration::from_secs(10))
                .await
                .unwrap();
            assert_eq!(
                store.ttl("foo").await.unwrap(),
                Some(Duration::from_secs(10))
            );

            MockClock::advance(Duration::from_secs(4));
            assert_eq!(
                store.ttl("foo").await.unwrap(),
                Some(Duration::from_secs(6))
            );
            assert_eq!(store.ttl("unknown").await.unwrap(), None);
        });
    }

    #[test]
    fn a_stopped_store_reports_errors() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024);
            let handle = store.clone();

            store.shutdown().await;
            assert_eq!(handle.get("foo").await.is_err(), true);
            assert_eq!(
                handle
                    .register_lease(&LeaseToken::generate())
                    .await
                    .is_err(),
                true
            );
            assert_eq!(handle.delete_and_clear_leases("foo").await.is_err(), true);
        });
    }

    #[test]
    fn stats_are_reported() {
        crate::testing::test_async(async {
            let store = MemoryStore::new(128, 1024 * 1024);

            let lease = LeaseToken::generate();
            store.register_lease(&lease).await.unwrap();
            let _ = store
                .commit_if_lease_live("foo", value("bar"), &lease, HOUR)
                .await
                .unwrap();
            let _ = store.get("foo").await.unwrap();
            let _ = store.get("baz").await.unwrap();

            let stats = store.stats().await.unwrap();
            assert_eq!(stats.entries, 1);
            assert_eq!(stats.capacity, 128);
            assert_eq!(stats.reads, 2);
            assert_eq!(stats.hits, 1);
            assert_eq!(stats.writes, 1);
            assert_eq!(format!("{}", stats).contains("Live Leases"), true);
        });
    }

    #[test]
    fn stores_can_be_configured_via_yaml() {
        crate::testing::test_async(async {
            let store = MemoryStore::from_yaml(
                "
store:
    size: 512
    max_memory: 4k
",
            )
            .unwrap();
            let stats = store.stats().await.unwrap();
            assert_eq!(stats.capacity, 512);
            assert_eq!(stats.max_memory, 4096);

            assert_eq!(MemoryStore::from_yaml("store:\n    size: 512\n").is_err(), true);
            assert_eq!(
                MemoryStore::from_yaml("store:\n    size: 0\n    max_memory: 1m\n").is_err(),
                true
            );
            assert_eq!(MemoryStore::from_yaml("other: 1\n").is_err(), true);
        });
    }
}
