//! Contains the configuration of a [CacheKeeper](crate::keeper::CacheKeeper).
//!
//! A config is either assembled in code via [KeeperConfig::builder] or loaded from a YAML file.
//! In both cases it is validated once when it is built. Therefore an invalid config is reported
//! during startup and never by a read or delete.
//!
//! # Configuration file
//! A config file has to contain a **keeper** object:
//!
//! ```yaml
//! keeper:
//!     # Specifies how long a reloaded value is kept in the cache.
//!     # Supports common suffixes like: ms, s, m, h, d
//!     cache_expire_time: 10m
//!     # Specifies how to treat keys which are absent in the data source. Either "none", which
//!     # never caches an absence, or "cache_absence" which stores an absence marker.
//!     penetration_strategy: cache_absence
//!     # Specifies how long an absence marker is kept. Required for "cache_absence".
//!     absence_ttl: 10s
//!     # Optional: a prefix which is put in front of each cache key.
//!     namespace: "users:"
//! ```
//!
//! # Examples
//! ```
//! # use cachekeeper::config::{KeeperConfig, PenetrationPolicy, PenetrationStrategy};
//! # use std::time::Duration;
//! let config = KeeperConfig::builder()
//!     .cache_expire_time(Duration::from_secs(600))
//!     .penetration_strategy(PenetrationStrategy::CacheAbsence)
//!     .absence_ttl(Duration::from_secs(10))
//!     .build()
//!     .unwrap();
//! assert_eq!(config.penetration_policy(), PenetrationPolicy::CacheAbsence(Duration::from_secs(10)));
//!
//! // Caching absences without specifying for how long is rejected...
//! assert_eq!(KeeperConfig::builder()
//!     .cache_expire_time(Duration::from_secs(600))
//!     .penetration_strategy(PenetrationStrategy::CacheAbsence)
//!     .build()
//!     .is_err(), true);
//! ```
use std::fmt;
use std::fmt::Display;
use std::path::Path;
use std::time::Duration;

use yaml_rust::{Yaml, YamlLoader};

use crate::error::{KeeperError, KeeperResult};
use crate::fmt::{format_duration, parse_duration};

/// Contains the largest TTL accepted for values and absence markers (ten years).
pub const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Enumerates the strategies which can be selected to deal with keys absent in the data source.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum PenetrationStrategy {
    /// Absences are never cached. Each read of an absent key invokes the reloader.
    #[default]
    None,
    /// Absences are cached as explicit marker for the configured **absence_ttl**.
    CacheAbsence,
}

impl PenetrationStrategy {
    /// Parses a strategy name as used in config files ("none" or "cache_absence").
    pub fn parse(name: &str) -> KeeperResult<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(PenetrationStrategy::None),
            "cache_absence" => Ok(PenetrationStrategy::CacheAbsence),
            other => Err(KeeperError::configuration(format!(
                "Unknown penetration strategy '{}'. Use 'none' or 'cache_absence'.",
                other
            ))),
        }
    }
}

/// Represents the validated penetration policy of a keeper.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PenetrationPolicy {
    /// Absent results are never cached.
    None,
    /// Absent results are cached as absence marker for the given TTL.
    CacheAbsence(Duration),
}

impl Display for PenetrationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PenetrationPolicy::None => write!(f, "none"),
            PenetrationPolicy::CacheAbsence(ttl) => {
                write!(f, "cache_absence ({})", format_duration(*ttl))
            }
        }
    }
}

/// Contains the validated settings of a keeper.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeeperConfig {
    cache_expire_time: Duration,
    penetration_policy: PenetrationPolicy,
    namespace: String,
}

impl KeeperConfig {
    /// Creates a new builder to assemble a config.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Returns the TTL applied to reloaded values.
    pub fn cache_expire_time(&self) -> Duration {
        self.cache_expire_time
    }

    /// Returns the policy to apply if the data source has no value for a key.
    pub fn penetration_policy(&self) -> PenetrationPolicy {
        self.penetration_policy
    }

    /// Returns the prefix to put in front of each cache key.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Parses a config from the **keeper** object in the given YAML document.
    ///
    /// # Example
    /// ```
    /// # use cachekeeper::config::{KeeperConfig, PenetrationPolicy};
    /// # use std::time::Duration;
    /// let config = KeeperConfig::from_yaml("
    /// keeper:
    ///     cache_expire_time: 10m
    ///     penetration_strategy: cache_absence
    ///     absence_ttl: 10s
    /// ").unwrap();
    ///
    /// assert_eq!(config.cache_expire_time(), Duration::from_secs(600));
    /// assert_eq!(config.penetration_policy(), PenetrationPolicy::CacheAbsence(Duration::from_secs(10)));
    /// ```
    pub fn from_yaml(data: &str) -> KeeperResult<Self> {
        let docs = YamlLoader::load_from_str(data).map_err(|error| {
            KeeperError::configuration(format!("Cannot parse the config: {}", error))
        })?;
        let keeper = docs
            .first()
            .map(|doc| &doc["keeper"])
            .filter(|keeper| keeper.as_hash().is_some())
            .ok_or_else(|| KeeperError::configuration("The config has no 'keeper' object."))?;

        let mut builder = KeeperConfig::builder();
        if let Some(expire_time) = read_duration(keeper, "cache_expire_time")? {
            builder = builder.cache_expire_time(expire_time);
        }
        if let Some(absence_ttl) = read_duration(keeper, "absence_ttl")? {
            builder = builder.absence_ttl(absence_ttl);
        }
        match &keeper["penetration_strategy"] {
            Yaml::String(name) => {
                builder = builder.penetration_strategy(PenetrationStrategy::parse(name)?)
            }
            Yaml::BadValue | Yaml::Null => (),
            _ => {
                return Err(KeeperError::configuration(
                    "keeper.penetration_strategy must be 'none' or 'cache_absence'.",
                ))
            }
        }
        if let Some(namespace) = keeper["namespace"].as_str() {
            builder = builder.namespace(namespace);
        }

        builder.build()
    }

    /// Loads the config from the given YAML file.
    pub async fn load(path: impl AsRef<Path>) -> KeeperResult<Self> {
        let path = path.as_ref();
        log::info!("Loading config file {}...", path.display());

        let data = tokio::fs::read_to_string(path).await.map_err(|error| {
            KeeperError::configuration(format!(
                "Cannot load config file {}: {}",
                path.display(),
                error
            ))
        })?;

        KeeperConfig::from_yaml(&data)
    }
}

/// Reads an optional duration. Integers are treated as milliseconds.
fn read_duration(element: &Yaml, name: &str) -> KeeperResult<Option<Duration>> {
    match &element[name] {
        Yaml::BadValue | Yaml::Null => Ok(None),
        Yaml::Integer(millis) if *millis >= 0 => Ok(Some(Duration::from_millis(*millis as u64))),
        Yaml::String(value) => parse_duration(value).map(Some).map_err(|error| {
            KeeperError::configuration(format!("Invalid keeper.{}: {}", name, error))
        }),
        _ => Err(KeeperError::configuration(format!(
            "keeper.{} must be a duration like '10s'.",
            name
        ))),
    }
}

impl Display for KeeperConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expire: {}, penetration: {}",
            format_duration(self.cache_expire_time),
            self.penetration_policy
        )?;
        if !self.namespace.is_empty() {
            write!(f, ", namespace: '{}'", self.namespace)?;
        }

        Ok(())
    }
}

/// Assembles and validates a [KeeperConfig].
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    cache_expire_time: Option<Duration>,
    penetration_strategy: PenetrationStrategy,
    absence_ttl: Option<Duration>,
    namespace: String,
}

impl ConfigBuilder {
    /// Specifies the TTL of reloaded values. This is required.
    pub fn cache_expire_time(mut self, cache_expire_time: Duration) -> Self {
        self.cache_expire_time = Some(cache_expire_time);
        self
    }

    /// Specifies how to treat keys which are absent in the data source. Defaults to **None**.
    pub fn penetration_strategy(mut self, penetration_strategy: PenetrationStrategy) -> Self {
        self.penetration_strategy = penetration_strategy;
        self
    }

    /// Specifies the TTL of absence markers. Required for **CacheAbsence**.
    pub fn absence_ttl(mut self, absence_ttl: Duration) -> Self {
        self.absence_ttl = Some(absence_ttl);
        self
    }

    /// Specifies a prefix to put in front of each cache key.
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Validates the settings and builds the config.
    ///
    /// # Errors
    /// Fails if no (or a zero) **cache_expire_time** is given or if **CacheAbsence** is selected
    /// without a positive **absence_ttl**. Every cache entry must expire at some point. Both
    /// TTLs are also limited to [MAX_TTL].
    pub fn build(self) -> KeeperResult<KeeperConfig> {
        let cache_expire_time = match self.cache_expire_time {
            None => return Err(KeeperError::configuration("cache_expire_time must be set.")),
            Some(ttl) if ttl.is_zero() => {
                return Err(KeeperError::configuration(
                    "cache_expire_time must be positive.",
                ))
            }
            Some(ttl) if ttl > MAX_TTL => {
                return Err(KeeperError::configuration(format!(
                    "cache_expire_time must not exceed {}.",
                    format_duration(MAX_TTL)
                )))
            }
            Some(ttl) => ttl,
        };

        let penetration_policy = match (self.penetration_strategy, self.absence_ttl) {
            (PenetrationStrategy::None, None) => PenetrationPolicy::None,
            (PenetrationStrategy::None, Some(absence_ttl)) => {
                log::debug!(
                    "Ignoring absence_ttl ({}) as absences are not cached.",
                    format_duration(absence_ttl)
                );
                PenetrationPolicy::None
            }
            (PenetrationStrategy::CacheAbsence, None) => {
                return Err(KeeperError::configuration(
                    "absence_ttl must be set when the penetration strategy is cache_absence.",
                ))
            }
            (PenetrationStrategy::CacheAbsence, Some(absence_ttl)) if absence_ttl.is_zero() => {
                return Err(KeeperError::configuration("absence_ttl must be positive."))
            }
            (PenetrationStrategy::CacheAbsence, Some(absence_ttl)) if absence_ttl > MAX_TTL => {
                return Err(KeeperError::configuration(format!(
                    "absence_ttl must not exceed {}.",
                    format_duration(MAX_TTL)
                )))
            }
            (PenetrationStrategy::CacheAbsence, Some(absence_ttl)) => {
                PenetrationPolicy::CacheAbsence(absence_ttl)
            }
        };

        Ok(KeeperConfig {
            cache_expire_time,
            penetration_policy,
            namespace: self.namespace,
        })
    }
}
