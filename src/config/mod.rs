//! Unified configuration for the geotile server.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (geotile.toml)
//! ```toml
//! [server]
//! listen = "0.0.0.0:50070"
//! data_dir = "/var/lib/geotile"
//!
//! [index]
//! tile_precision = 5
//! activity_feed_capacity = 50
//!
//! [retention]
//! interval_secs = 3600
//! ```
//!
//! Environment variables use the `GEOTILE_` prefix and a double underscore
//! between section and key, e.g. `GEOTILE_INDEX__TILE_PRECISION=6`.

mod defaults;

pub use defaults::*;

use crate::geohash::{MAX_PRECISION, MIN_PRECISION};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeoTileConfig {
    pub server: ServerConfig,
    pub index: IndexConfig,
    pub proximity: ProximityConfig,
    pub retention: RetentionConfig,
    pub storage: StorageConfig,
}

impl GeoTileConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(GeoTileConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("GEOTILE_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let config: GeoTileConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let precision_ok = |p: usize| (MIN_PRECISION..=MAX_PRECISION).contains(&p);
        if !precision_ok(self.index.tile_precision) {
            return Err(ConfigError::invalid("index.tile_precision must be in 1..=12"));
        }
        if !precision_ok(self.index.covering_precision)
            || self.index.covering_precision > self.index.tile_precision
        {
            return Err(ConfigError::invalid(
                "index.covering_precision must be in 1..=tile_precision",
            ));
        }
        if !precision_ok(self.proximity.heartbeat_precision) {
            return Err(ConfigError::invalid(
                "proximity.heartbeat_precision must be in 1..=12",
            ));
        }
        if self.index.activity_feed_capacity == 0 || self.index.max_cas_attempts == 0 {
            return Err(ConfigError::invalid(
                "index.activity_feed_capacity and index.max_cas_attempts must be positive",
            ));
        }
        if self.retention.batch_limit == 0 {
            return Err(ConfigError::invalid("retention.batch_limit must be positive"));
        }
        if self.storage.tile_cache_entries == 0 {
            return Err(ConfigError::invalid("storage.tile_cache_entries must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: SocketAddr,
    /// RocksDB directory; the in-memory store is used when absent
    pub data_dir: Option<PathBuf>,
    /// Run repair on startup
    pub repair: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(DEFAULT_LISTEN_ADDR),
            data_dir: None,
            repair: false,
        }
    }
}

/// Tile index shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    pub tile_precision: usize,
    pub covering_precision: usize,
    pub activity_feed_capacity: usize,
    pub max_cas_attempts: usize,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            tile_precision: DEFAULT_TILE_PRECISION,
            covering_precision: DEFAULT_COVERING_PRECISION,
            activity_feed_capacity: DEFAULT_ACTIVITY_FEED_CAPACITY,
            max_cas_attempts: DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub heartbeat_precision: usize,
    pub freshness_secs: u64,
}

impl ProximityConfig {
    pub fn freshness(&self) -> Duration {
        Duration::from_secs(self.freshness_secs)
    }
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            heartbeat_precision: DEFAULT_HEARTBEAT_PRECISION,
            freshness_secs: DEFAULT_FRESHNESS_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub activity_max_age_secs: u64,
    pub heartbeat_max_age_secs: u64,
    pub batch_limit: usize,
    pub interval_secs: u64,
}

impl RetentionConfig {
    pub fn activity_max_age(&self) -> Duration {
        Duration::from_secs(self.activity_max_age_secs)
    }

    pub fn heartbeat_max_age(&self) -> Duration {
        Duration::from_secs(self.heartbeat_max_age_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            activity_max_age_secs: DEFAULT_ACTIVITY_MAX_AGE_SECS,
            heartbeat_max_age_secs: DEFAULT_HEARTBEAT_MAX_AGE_SECS,
            batch_limit: DEFAULT_RETENTION_BATCH_LIMIT,
            interval_secs: DEFAULT_RETENTION_INTERVAL_SECS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Deadline for one request's store work
    pub timeout_ms: u64,
    /// Decoded tiles cached in front of RocksDB
    pub tile_cache_entries: usize,
}

impl StorageConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
            tile_cache_entries: DEFAULT_TILE_CACHE_ENTRIES,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

/// Configuration error.
#[derive(Debug, Error)]
#[error("configuration error: {message}")]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn invalid(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
