//! Configuration system for Hycast.
//!
//! Resolution order: environment variables → config file → defaults.
//!
//! Config file location:
//!   1. $HYCAST_CONFIG (explicit override)
//!   2. $XDG_CONFIG_HOME/hycast/config.toml
//!   3. ~/.config/hycast/config.toml

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::prod::DEFAULT_CANON_CHUNK_SIZE;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HycastConfig {
    pub protocol: ProtocolConfig,
    pub store: StoreConfig,
    pub mcast: McastConfig,
    pub p2p: P2pConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolConfig {
    /// Protocol version exchanged during the peer handshake.
    pub version: u32,
    /// Canonical chunk size, in bytes, used for products this node publishes.
    pub chunk_size: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Minimum seconds a completed product stays resident before eviction.
    pub residence_secs: u64,
    /// Snapshot file written at shutdown and restored at startup. None =
    /// no persistence.
    pub persistence_path: Option<PathBuf>,
    /// Byte budget for chunks that arrive before their product's info.
    pub early_chunk_cap_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct McastConfig {
    /// Multicast group, e.g. "232.1.1.1:38800".
    pub group_addr: String,
    /// Source address for source-specific multicast. None = any-source.
    pub source_addr: Option<String>,
    /// IP hop limit / TTL for sent datagrams.
    pub hop_limit: u8,
    /// Whether sent datagrams loop back to this host.
    pub loop_enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct P2pConfig {
    /// Address the peer server listens on.
    pub listen_addr: String,
    /// Remote peer servers a subscriber connects to for backfill.
    pub peer_addrs: Vec<String>,
}

// ── Defaults ──────────────────────────────────────────────────────────────────

impl Default for HycastConfig {
    fn default() -> Self {
        Self {
            protocol: ProtocolConfig::default(),
            store: StoreConfig::default(),
            mcast: McastConfig::default(),
            p2p: P2pConfig::default(),
        }
    }
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            version: 1,
            chunk_size: DEFAULT_CANON_CHUNK_SIZE,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            residence_secs: 3600,
            persistence_path: None,
            early_chunk_cap_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Default for McastConfig {
    fn default() -> Self {
        Self {
            group_addr: "232.1.1.1:38800".to_string(),
            source_addr: None,
            hop_limit: 1,
            loop_enabled: false,
        }
    }
}

impl Default for P2pConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:38801".to_string(),
            peer_addrs: Vec::new(),
        }
    }
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

impl HycastConfig {
    /// Load config: env vars → file → defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::file_path();
        let mut config = if path.exists() {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| ConfigError::ReadFailed(path.clone(), e))?;
            toml::from_str(&text).map_err(|e| ConfigError::ParseFailed(path.clone(), e))?
        } else {
            HycastConfig::default()
        };
        config.apply_env_overrides();
        Ok(config)
    }

    /// Config file path.
    pub fn file_path() -> PathBuf {
        std::env::var("HYCAST_CONFIG")
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
            let text = toml::to_string_pretty(&HycastConfig::default())
                .map_err(ConfigError::SerializeFailed)?;
            std::fs::write(&path, text).map_err(|e| ConfigError::WriteFailed(path.clone(), e))?;
        }
        Ok(path)
    }

    /// Apply HYCAST_* env var overrides.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("HYCAST_PROTOCOL__VERSION") {
            if let Ok(n) = v.parse() {
                self.protocol.version = n;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_PROTOCOL__CHUNK_SIZE") {
            if let Ok(n) = v.parse() {
                self.protocol.chunk_size = n;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_STORE__RESIDENCE_SECS") {
            if let Ok(n) = v.parse() {
                self.store.residence_secs = n;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_STORE__PERSISTENCE_PATH") {
            self.store.persistence_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__GROUP_ADDR") {
            self.mcast.group_addr = v;
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__SOURCE_ADDR") {
            self.mcast.source_addr = Some(v);
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__HOP_LIMIT") {
            if let Ok(n) = v.parse() {
                self.mcast.hop_limit = n;
            }
        }
        if let Ok(v) = std::env::var("HYCAST_MCAST__LOOP") {
            self.mcast.loop_enabled = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("HYCAST_P2P__LISTEN_ADDR") {
            self.p2p.listen_addr = v;
        }
    }
}

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_or_tmp().join(".config"))
        .join("hycast")
}

fn home_or_tmp() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}
