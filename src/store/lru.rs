//! Provides a size constrained LRU map in which every entry carries its own TTL.
//!
//! This is the storage engine behind the [MemoryStore](crate::store::memory::MemoryStore). The
//! keeper requires each entry to expire at some point, therefore [TtlCache::put] always takes a
//! TTL. Additionally the cache drops the least recently used entries once it grows beyond its
//! limits (max number of entries and max allocated memory).
//!
//! Expired entries are evicted lazily, that is, once they are accessed or once the cache needs
//! to make room.
#[cfg(test)]
use mock_instant::global::Instant;
#[cfg(not(test))]
use std::time::Instant;

use std::time::Duration;

use linked_hash_map::LinkedHashMap;

/// Returns the allocated memory in bytes.
pub trait ByteSize {
    /// Returns the amount of allocated heap memory in bytes.
    ///
    /// This is most probably an approximation, but it should account for the largest part of an
    /// instance (e.g. the bytes allocated on the heap for a string).
    fn allocated_size(&self) -> usize;
}

impl ByteSize for String {
    fn allocated_size(&self) -> usize {
        self.capacity()
    }
}

/// Provides a size constrained LRU cache with per entry TTLs.
///
/// # Examples
/// ```
/// # use cachekeeper::store::lru::TtlCache;
/// # use std::time::Duration;
/// // Permits up to 128 entries which can allocate up to 1 KiB of memory...
/// let mut cache = TtlCache::new(128, 1024);
///
/// cache.put("Foo".to_owned(), "Bar".to_owned(), Duration::from_secs(60)).unwrap();
/// assert_eq!(cache.get("Foo").unwrap(), &"Bar".to_owned());
///
/// // A large entry pushes the least recently used ones out...
/// cache.put("Foo1".to_owned(), "X".repeat(1020), Duration::from_secs(60)).unwrap();
/// assert_eq!(cache.get("Foo"), None);
/// assert_eq!(cache.get("Foo1").is_some(), true);
///
/// // ...and an entry which is larger than the whole cache is rejected.
/// assert_eq!(cache.put("Foo2".to_owned(), "X".repeat(2048), Duration::from_secs(60)).is_err(), true);
/// ```
pub struct TtlCache<V: ByteSize> {
    capacity: usize,
    allocated_memory: usize,
    max_memory: usize,
    reads: usize,
    hits: usize,
    writes: usize,
    map: LinkedHashMap<String, Entry<V>>,
}

struct Entry<V: ByteSize> {
    mem_size: usize,
    expires: Instant,
    value: V,
}

impl<V: ByteSize> TtlCache<V> {
    /// Creates a new cache which can store up to **capacity** entries or as many as fit into
    /// **max_memory** bytes.
    pub fn new(capacity: usize, max_memory: usize) -> Self {
        TtlCache {
            capacity,
            allocated_memory: 0,
            max_memory,
            reads: 0,
            hits: 0,
            writes: 0,
            map: LinkedHashMap::new(),
        }
    }

    /// Stores the given value for the given key which will expire after the given TTL.
    ///
    /// # Errors
    /// Fails if the entry is larger than **max_memory** (the max total size of the cache) or if
    /// the TTL is too large to compute an expiry time. The cache is left untouched in this case.
    pub fn put(&mut self, key: String, value: V, ttl: Duration) -> anyhow::Result<()> {
        let expires = Instant::now().checked_add(ttl).ok_or_else(|| {
            anyhow::anyhow!("The TTL for '{}' is out of range ({:?})!", key, ttl)
        })?;
        let entry = Entry {
            mem_size: key.len() + value.allocated_size(),
            expires,
            value,
        };

        if entry.mem_size > self.max_memory {
            return Err(anyhow::anyhow!(
                "The entry for '{}' is larger than the whole cache!",
                key
            ));
        }

        self.writes += 1;
        self.allocated_memory += entry.mem_size;
        if let Some(previous) = self.map.insert(key, entry) {
            self.allocated_memory -= previous.mem_size;
        }

        self.enforce_constraints();

        Ok(())
    }

    fn enforce_constraints(&mut self) {
        while self.map.len() > self.capacity || self.allocated_memory > self.max_memory {
            match self.map.pop_front() {
                Some((_, evicted)) => self.allocated_memory -= evicted.mem_size,
                None => unreachable!("Failed to enforce the constraints of a TTL cache!"),
            }
        }
    }

    /// Returns the value stored for the given key or **None** if no value is present or if it
    /// has expired.
    ///
    /// An expired entry is removed right away.
    pub fn get(&mut self, key: &str) -> Option<&V> {
        self.reads += 1;

        let now = Instant::now();
        let expired = match self.map.get_refresh(key) {
            Some(entry) => entry.expires <= now,
            None => return None,
        };

        if expired {
            self.evict(key);
            return None;
        }

        self.hits += 1;
        self.map.get(key).map(|entry| &entry.value)
    }

    /// Returns the remaining time to live of the given key or **None** if it isn't present.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.map
            .get(key)
            .filter(|entry| entry.expires > now)
            .map(|entry| entry.expires.duration_since(now))
    }

    /// Removes the entry for the given key if present.
    pub fn remove(&mut self, key: &str) {
        self.writes += 1;
        self.evict(key);
    }

    fn evict(&mut self, key: &str) {
        if let Some(entry) = self.map.remove(key) {
            self.allocated_memory -= entry.mem_size;
        }
    }

    /// Returns the number of entries in the cache.
    ///
    /// Note that this might include expired entries which haven't been evicted yet.
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Determines if the cache is completely empty.
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Returns the max number of entries in this cache.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the max amount of memory to be (roughly) occupied by this cache.
    pub fn max_memory(&self) -> usize {
        self.max_memory
    }

    /// Returns the amount of memory allocated by the keys and values of this cache in bytes.
    pub fn allocated_memory(&self) -> usize {
        self.allocated_memory
    }

    /// Returns the total number of reads performed.
    pub fn reads(&self) -> usize {
        self.reads
    }

    /// Returns the number of reads which found a live entry.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Returns the total number of writes performed.
    pub fn writes(&self) -> usize {
        self.writes
    }

    /// Returns the cache hit rate in percent.
    pub fn hit_rate(&self) -> f32 {
        match self.reads {
            0 => 0.,
            n => self.hits as f32 / n as f32 * 100.,
        }
    }
}
