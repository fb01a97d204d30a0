//! Cachekeeper is a read-through caching layer which keeps a cache and its backing data source
//! consistent by means of leases.
//!
//! # Introduction
//! A read-through cache is simple enough: look up a key, and if nothing is there, ask the data
//! source (a database, an upstream service) and remember the result. However, two classic hazards
//! come with this approach:
//!
//! * **Cache penetration**: A key which legitimately doesn't exist in the data source is never
//!   cached. Therefore every read of such a key ends up hitting the data source, which can be
//!   abused or simply overloads the source under load.
//! * **Stale writes**: A reload which takes a while might compute its value *before* the
//!   underlying data is updated and the cache entry is deleted. If this slow reload commits its
//!   result *after* the deletion, an outdated value becomes visible and stays there until it
//!   expires.
//!
//! **Cachekeeper** addresses both. Absent values can be cached as an explicit "absence marker"
//! for a configurable period (see [PenetrationPolicy](config::PenetrationPolicy)). Each reload is
//! guarded by a [LeaseToken](lease::LeaseToken) which is registered in the store *before* the
//! reload starts. Deleting a cache entry clears all registered leases, and a reload result is
//! only ever committed by an atomic "commit if the lease is still live" operation. Therefore a
//! reload which was overtaken by a delete can never write its result.
//!
//! # Modules
//! * **Keeper**: The [CacheKeeper](keeper::CacheKeeper) orchestrates the read and delete
//!   protocol. It is stateless apart from its configuration and can be cloned and shared freely.
//! * **Stores**: A [CacheStore](store::CacheStore) holds entries and leases. An in-process
//!   [MemoryStore](store::memory::MemoryStore) and a [RedisStore](store::redis::RedisStore) are
//!   provided.
//! * **Config**: [KeeperConfig](config::KeeperConfig) is either built in code or loaded from a
//!   YAML file and validated eagerly.
//!
//! # Example
//! ```
//! # use cachekeeper::builder::Builder;
//! # use cachekeeper::config::KeeperConfig;
//! # use cachekeeper::store::memory::MemoryStore;
//! # use std::time::Duration;
//! # #[tokio::main]
//! # async fn main() {
//! let config = KeeperConfig::builder()
//!     .cache_expire_time(Duration::from_secs(60))
//!     .build()
//!     .unwrap();
//!
//! let keeper = Builder::new()
//!     .config(config)
//!     .store(MemoryStore::new(1024, 16 * 1024 * 1024))
//!     .build::<String, String>()
//!     .unwrap();
//!
//! let value = keeper
//!     .read_cache(&"user-42".to_owned(), |_| async { Ok(Some("Jane".to_owned())) })
//!     .await
//!     .unwrap();
//! assert_eq!(value.as_deref(), Some("Jane"));
//! # }
//! ```
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unused_extern_crates,
    unused_import_braces
)]
use simplelog::{format_description, ConfigBuilder, LevelFilter, SimpleLogger};
use std::sync::Once;

pub mod builder;
pub mod config;
pub mod error;
pub mod fmt;
pub mod keeper;
pub mod lease;
pub mod metrics;
pub mod store;

/// Contains the version of the Cachekeeper library.
pub const CACHEKEEPER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initializes the logging system.
///
/// Note that most probably the simplest way is to use a [Builder](builder::Builder) to set up the
/// keeper, which will also set up logging if enabled.
pub fn init_logging() {
    static INIT_LOGGING: Once = Once::new();

    // Tests and embedding host services might both try to set up logging...
    INIT_LOGGING.call_once(|| {
        if let Err(error) = SimpleLogger::init(
            LevelFilter::Debug,
            ConfigBuilder::new()
                .set_time_format_custom(format_description!(
                    "[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]"
                ))
                .set_thread_level(LevelFilter::Trace)
                .set_target_level(LevelFilter::Error)
                .set_location_level(LevelFilter::Trace)
                .build(),
        ) {
            // Another logger is already installed by the host. That's fine, we log through
            // whatever is there...
            log::debug!("Not installing a logger: {}", error);
        }
    });
}
