//! Configuration system for Flame.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $FLAME_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/flame/config.toml
//!   3. ~/.config/flame/config.toml
//!   4. <temp dir>/flame/config.toml when neither XDG_CONFIG_HOME nor HOME is set

use serde::{Deserialize, Serialize};
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FlameConfig {
    pub engine: EngineSettings,
    pub directory: DirectorySettings,
    pub placement: PlacementSettings,
}

/// Transfer engine timing model. Read once at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Fixed per-request simulated latency.
    pub base_latency_ms: u64,
    /// Additional latency per started MiB of payload.
    pub per_mib_latency_ms: u64,
    /// Capacity of the transfer event broadcast channel.
    pub event_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DirectorySettings {
    /// Lease length granted to a freshly migrated fragment, in simulated epochs.
    pub lease_epochs: i64,
    /// Node that expired fragments are evicted back to.
    pub home_node: u32,
    /// An access keeps the lease alive for at least this many epochs.
    pub renew_epochs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PlacementSettings {
    pub reuse_weight: f64,
    pub importance_weight: f64,
    pub interference_weight: f64,
    /// Migration priority given to the best-ranked placement; later ones count up from here.
    pub base_priority: i32,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            base_latency_ms: 2,
            per_mib_latency_ms: 1,
            event_capacity: 1024,
        }
    }
}

impl Default for DirectorySettings {
    fn default() -> Self {
        Self {
            lease_epochs: 5,
            home_node: 0,
            renew_epochs: 2,
        }
    }
}

impl Default for PlacementSettings {
    fn default() -> Self {
        Self {
            reuse_weight: 1.0,
            importance_weight: 0.8,
            interference_weight: 0.5,
            base_priority: 1,
        }
    }
}

impl EngineSettings {
    pub fn base_latency(&self) -> Duration {
        Duration::from_millis(self.base_latency_ms)
    }

    pub fn per_mib_latency(&self) -> Duration {
        Duration::from_millis(self.per_mib_latency_ms)
    }
}

// ── Path helpers ──────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    config_dir_from(
        std::env::var_os("XDG_CONFIG_HOME"),
        std::env::var_os("HOME"),
    )
}

/// Empty variables count as unset. With neither set, the platform temp dir is used.
fn config_dir_from(xdg_config_home: Option<OsString>, home: Option<OsString>) -> PathBuf {
    let non_empty = |v: OsString| (!v.is_empty()).then(|| PathBuf::from(v));
    xdg_config_home
        .and_then(non_empty)
        .or_else(|| home.and_then(non_empty).map(|h| h.join(".config")))
        .unwrap_or_else(std::env::temp_dir)
        .join("flame")
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    ReadFailed(PathBuf, std::io::Error),
    #[error("failed to parse {0}: {1}")]
    ParseFailed(PathBuf, toml::de::Error),
    #[error("failed to write {0}: {1}")]
    WriteFailed(PathBuf, std::io::Error),
    #[error("failed to serialize: {0}")]
    SerializeFailed(toml::ser::Error),
}

// ── Loading ───────────────────────────────────────────────────────────────────

impl FlameConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            FlameConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("FLAME_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Write default config if none exists. Returns the path.
    pub fn write_default_if_missing() -> Result<PathBuf, ConfigError> {
        let path = Self::file_path();
        if !path.exists() {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
            }
            let text = toml::to_string_pretty(&FlameConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply FLAME_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse("FLAME_ENGINE__BASE_LATENCY_MS") {
            self.engine.base_latency_ms = v;
        }
        if let Some(v) = env_parse("FLAME_ENGINE__PER_MIB_LATENCY_MS") {
            self.engine.per_mib_latency_ms = v;
        }
        if let Some(v) = env_parse("FLAME_DIRECTORY__LEASE_EPOCHS") {
            self.directory.lease_epochs = v;
        }
        if let Some(v) = env_parse("FLAME_DIRECTORY__HOME_NODE") {
            self.directory.home_node = v;
        }
        if let Some(v) = env_parse("FLAME_DIRECTORY__RENEW_EPOCHS") {
            self.directory.renew_epochs = v;
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}
