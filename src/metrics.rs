//! Keeps track of what a [CacheKeeper](crate::keeper::CacheKeeper) is doing.
//!
//! All counters are plain atomics so that recording a metric never blocks a read. The metrics of
//! a keeper are shared by all of its clones and can be obtained via
//! [CacheKeeper::metrics](crate::keeper::CacheKeeper::metrics).
//!
//! # Example
//! ```
//! # use cachekeeper::metrics::KeeperMetrics;
//! let metrics = KeeperMetrics::default();
//! metrics.record_hit();
//! metrics.record_miss();
//! metrics.record_reload(1_500, true);
//!
//! assert_eq!(metrics.hits(), 1);
//! assert_eq!(metrics.misses(), 1);
//! assert_eq!(metrics.reloads(), 1);
//! assert_eq!(metrics.avg_reload_micros(), 1_500);
//! ```
use std::fmt;
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::fmt::format_micros;

/// Computes a sliding average over the most recent values.
///
/// The sum and the number of values are packed into a single u64 so that both can be updated
/// with a single compare-and-swap.
#[derive(Default)]
struct SlidingAverage {
    sum_and_count: AtomicU64,
}

impl SlidingAverage {
    const WINDOW: u64 = 100;

    fn unpack(packed: u64) -> (u64, u64) {
        (packed >> 32, packed & 0xFFFF_FFFF)
    }

    fn add(&self, value: u32) {
        let _ = self
            .sum_and_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |packed| {
                let (mut sum, mut count) = Self::unpack(packed);

                // Halve the window once it is full or once the sum would no longer fit.
                while count > 0 && (count >= Self::WINDOW || sum + value as u64 > u32::MAX as u64)
                {
                    sum = sum / count * (count / 2);
                    count /= 2;
                }

                Some(((sum + value as u64) << 32) | (count + 1))
            });
    }

    fn avg(&self) -> u64 {
        let (sum, count) = Self::unpack(self.sum_and_count.load(Ordering::Relaxed));
        if count == 0 {
            0
        } else {
            sum / count
        }
    }
}

/// Collects the counters of a keeper.
#[derive(Default)]
pub struct KeeperMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    reloads: AtomicU64,
    absent_reloads: AtomicU64,
    reload_failures: AtomicU64,
    commits: AtomicU64,
    fenced_commits: AtomicU64,
    store_failures: AtomicU64,
    deletes: AtomicU64,
    reload_duration: SlidingAverage,
}

impl KeeperMetrics {
    /// Records a read which was answered by the cache (including absence markers).
    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a read which had to invoke the reloader.
    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed reload along with its duration in microseconds.
    pub fn record_reload(&self, micros: u32, found: bool) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
        if !found {
            self.absent_reloads.fetch_add(1, Ordering::Relaxed);
        }
        self.reload_duration.add(micros);
    }

    /// Records a reloader which reported an error.
    pub fn record_reload_failure(&self) {
        self.reload_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records the outcome of a conditional commit.
    pub fn record_commit(&self, committed: bool) {
        if committed {
            self.commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.fenced_commits.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a failed store operation.
    pub fn record_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a successful delete.
    pub fn record_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of reads answered by the cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Returns the number of reads which missed the cache.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Returns the number of completed reloads.
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Returns the number of reloads which found no value in the data source.
    pub fn absent_reloads(&self) -> u64 {
        self.absent_reloads.load(Ordering::Relaxed)
    }

    /// Returns the number of failed reloads.
    pub fn reload_failures(&self) -> u64 {
        self.reload_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of reload results which were written to the store.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of reload results which were not written, as their lease was cleared or
    /// the store refused to hold them.
    pub fn fenced_commits(&self) -> u64 {
        self.fenced_commits.load(Ordering::Relaxed)
    }

    /// Returns the number of failed store operations.
    pub fn store_failures(&self) -> u64 {
        self.store_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of deletes.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    /// Returns the sliding average of the reload duration in microseconds.
    pub fn avg_reload_micros(&self) -> u64 {
        self.reload_duration.avg()
    }

    /// Returns the share of reads answered by the cache in percent.
    pub fn hit_rate(&self) -> f32 {
        let hits = self.hits();
        let reads = hits + self.misses();
        if reads == 0 {
            0.
        } else {
            hits as f32 / reads as f32 * 100.
        }
    }

    /// Renders all metrics as a table.
    pub fn report(&self) -> String {
        self.to_string()
    }
}

impl Display for KeeperMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Use the 'read' counters to judge the cache efficiency.")?;
        writeln!(f, "{}", "-".repeat(60))?;
        let reads = format!("{} / {}", self.hits(), self.misses());
        writeln!(f, "{:<40} {:>19}", "Reads (hits / misses)", reads)?;
        writeln!(f, "{:<40} {:>18.1}%", "Hit rate", self.hit_rate())?;
        writeln!(f, "{:<40} {:>19}", "Reloads", self.reloads())?;
        writeln!(f, "{:<40} {:>19}", "Reloads without value", self.absent_reloads())?;
        writeln!(f, "{:<40} {:>19}", "Failed reloads", self.reload_failures())?;

        let mut avg = String::new();
        format_micros(self.avg_reload_micros().min(i32::MAX as u64) as i32, &mut avg)?;
        writeln!(f, "{:<40} {:>19}", "Avg. reload duration", avg)?;

        writeln!(f, "{:<40} {:>19}", "Commits", self.commits())?;
        writeln!(f, "{:<40} {:>19}", "Fenced commits", self.fenced_commits())?;
        writeln!(f, "{:<40} {:>19}", "Deletes", self.deletes())?;
        writeln!(f, "{:<40} {:>19}", "Store failures", self.store_failures())?;
        write!(f, "{}", "-".repeat(60))
    }
}
