//! Provides a builder which assembles a [CacheKeeper] from its parts.
//!
//! A keeper needs a validated [KeeperConfig] and a [CacheStore]. The store is injected, therefore
//! selecting a backend is a matter of passing another implementation. Optionally, the builder
//! also sets up logging.
//!
//! # Example
//! ```
//! # use cachekeeper::builder::Builder;
//! # use cachekeeper::config::KeeperConfig;
//! # use cachekeeper::store::memory::MemoryStore;
//! #[tokio::main]
//! async fn main() {
//!     let config = KeeperConfig::from_yaml("
//!     keeper:
//!         cache_expire_time: 10m
//!     ").unwrap();
//!
//!     let keeper = Builder::new()
//!         .enable_logging()
//!         .config(config)
//!         .store(MemoryStore::new(1024, 16 * 1024 * 1024))
//!         .build::<String, String>()
//!         .unwrap();
//!
//!     assert_eq!(keeper.config().namespace(), "");
//! }
//! ```
use std::sync::Arc;

use crate::config::KeeperConfig;
use crate::error::{KeeperError, KeeperResult};
use crate::keeper::CacheKeeper;
use crate::store::CacheStore;
use crate::{init_logging, CACHEKEEPER_VERSION};

/// Collects the parts of a keeper and creates it once everything is in place.
#[derive(Default)]
pub struct Builder {
    setup_logging: bool,
    config: Option<KeeperConfig>,
    store: Option<Arc<dyn CacheStore>>,
}

impl Builder {
    /// Creates a new builder.
    pub fn new() -> Self {
        Builder {
            setup_logging: false,
            config: None,
            store: None,
        }
    }

    /// Enables the automatic setup of the logging system.
    ///
    /// This initializes **simplelog** to log to stdout. If the host application has already
    /// installed a logger, this is a no-op.
    pub fn enable_logging(mut self) -> Self {
        self.setup_logging = true;
        self
    }

    /// Disables the automatic setup of the logging system.
    pub fn disable_logging(mut self) -> Self {
        self.setup_logging = false;
        self
    }

    /// Specifies the config to use.
    pub fn config(mut self, config: KeeperConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Specifies the store to use.
    pub fn store(self, store: impl CacheStore + 'static) -> Self {
        self.shared_store(Arc::new(store))
    }

    /// Specifies a store which is shared with other keepers (e.g. for other value types).
    pub fn shared_store(mut self, store: Arc<dyn CacheStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Creates the keeper.
    ///
    /// # Errors
    /// Fails with a **Configuration** error if either the config or the store is missing.
    pub fn build<K, V>(self) -> KeeperResult<CacheKeeper<K, V>> {
        if self.setup_logging {
            init_logging();
        }

        let config = self
            .config
            .ok_or_else(|| KeeperError::configuration("No config has been provided."))?;
        let store = self
            .store
            .ok_or_else(|| KeeperError::configuration("No cache store has been provided."))?;

        log::info!(
            "||. CACHEKEEPER (v {}) running with {}",
            CACHEKEEPER_VERSION,
            config
        );

        Ok(CacheKeeper::new(config, store))
    }
}
