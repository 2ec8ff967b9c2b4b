//! Node configuration: metadata cache and hinted-handoff sections.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_HH_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_HH_MAX_AGE_MS: u64 = 7 * 24 * 3_600_000;
pub const DEFAULT_HH_PURGE_INTERVAL_MS: u64 = 3_600_000;
pub const DEFAULT_HH_RETRY_INTERVAL_MS: u64 = 1_000;
pub const DEFAULT_HH_RETRY_MAX_INTERVAL_MS: u64 = 60_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NodeConfig {
    pub meta: MetaConfig,
    pub hinted_handoff: HintedHandoffConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    /// Directory holding the persisted metadata snapshot.
    pub dir: PathBuf,
    /// Whether `create_database` also creates a default retention policy.
    pub retention_auto_create: bool,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("meta"),
            retention_auto_create: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HintedHandoffConfig {
    pub enabled: bool,
    /// Root directory; each remote node gets a numbered subdirectory.
    pub dir: PathBuf,
    /// Hard cap on a single node queue, in bytes.
    pub max_size: u64,
    /// Frame time-to-live before the periodic purge reclaims it.
    pub max_age_ms: u64,
    pub purge_interval_ms: u64,
    /// Minimum interval between send attempts; backoff floor.
    pub retry_interval_ms: u64,
    /// Backoff ceiling.
    pub retry_max_interval_ms: u64,
    /// Bytes per second sent to a remote node; 0 disables rate limiting.
    pub retry_rate_limit: u64,
    /// Process-wide cap on concurrently sending processors; 0 disables.
    pub max_active_processors: i32,
}

impl Default for HintedHandoffConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: PathBuf::from("hh"),
            max_size: DEFAULT_HH_MAX_SIZE,
            max_age_ms: DEFAULT_HH_MAX_AGE_MS,
            purge_interval_ms: DEFAULT_HH_PURGE_INTERVAL_MS,
            retry_interval_ms: DEFAULT_HH_RETRY_INTERVAL_MS,
            retry_max_interval_ms: DEFAULT_HH_RETRY_MAX_INTERVAL_MS,
            retry_rate_limit: 0,
            max_active_processors: 0,
        }
    }
}

impl HintedHandoffConfig {
    pub fn max_age(&self) -> Duration {
        Duration::from_millis(self.max_age_ms)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_millis(self.purge_interval_ms)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    pub fn retry_max_interval(&self) -> Duration {
        Duration::from_millis(self.retry_max_interval_ms)
    }
}

pub fn load_config(path: &Path) -> Result<NodeConfig, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}
