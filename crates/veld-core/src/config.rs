//! Configuration for the veld runtime.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $VELD_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/veld/config.toml
//!   3. ~/.config/veld/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::wire;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RuntimeConfig {
    pub transport: TransportConfig,
    pub dispatcher: DispatcherConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Ceiling on queued outbound bytes per connection; sends past it
    /// return WouldBlock.
    pub high_water_mark: usize,
    /// Pipes per connection (1–4).
    pub pipes_per_connection: usize,
    /// Keepalive ping interval in seconds. 0 = disabled.
    pub ping_interval_secs: u64,
    /// Handshake timeout in seconds.
    pub handshake_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    /// Budget handed to each `process` call, in milliseconds.
    pub process_budget_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte budget of the in-memory tier.
    pub memory_budget_bytes: u64,
    /// Byte budget of the disk tier.
    pub disk_budget_bytes: u64,
    /// Root directory of the disk tier.
    pub disk_root: PathBuf,
    /// Per-tier request timeout in seconds; expiry propagates not-found.
    pub request_timeout_secs: u64,
    /// Eviction policy: "lru" or "lfu".
    pub policy: String,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            high_water_mark: wire::DEFAULT_HIGH_WATER,
            pipes_per_connection: 1,
            ping_interval_secs: wire::PING_INTERVAL_SECS,
            handshake_timeout_secs: wire::HANDSHAKE_TIMEOUT_SECS,
        }
    }
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            process_budget_ms: 10,
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 64 * 1024 * 1024,
            disk_budget_bytes: 1_073_741_824, // 1 GB
            disk_root: data_dir().join("blobs"),
            request_timeout_secs: 30,
            policy: "lru".to_string(),
        }
    }
}

// ── Path helpers ─────────────────────────────────────────────────────────────

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".config"))
        .join("veld")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| dirs_or_home().join(".local").join("share"))
        .join("veld")
}

fn dirs_or_home() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

// ── Errors ───────────────────────────────────────────────────────────────────

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

// ── Loading ──────────────────────────────────────────────────────────────────

impl RuntimeConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            RuntimeConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("VELD_CONFIG")
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
            let text = toml::to_string_pretty(&RuntimeConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply VELD_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("VELD_TRANSPORT__HIGH_WATER_MARK") {
            if let Ok(n) = v.parse() {
                self.transport.high_water_mark = n;
            }
        }
        if let Ok(v) = std::env::var("VELD_TRANSPORT__PIPES_PER_CONNECTION") {
            if let Ok(n) = v.parse() {
                self.transport.pipes_per_connection = n;
            }
        }
        if let Ok(v) = std::env::var("VELD_TRANSPORT__PING_INTERVAL_SECS") {
            if let Ok(n) = v.parse() {
                self.transport.ping_interval_secs = n;
            }
        }
        if let Ok(v) = std::env::var("VELD_CACHE__MEMORY_BUDGET_BYTES") {
            if let Ok(n) = v.parse() {
                self.cache.memory_budget_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("VELD_CACHE__DISK_ROOT") {
            self.cache.disk_root = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("VELD_CACHE__POLICY") {
            self.cache.policy = v;
        }
    }
}
