//! Configuration for a tilemesh peer.
//!
//! Resolution order: explicit path, then `$TILEMESH_CONFIG`, then
//! `$XDG_CONFIG_HOME/tilemesh/config.toml` (or `~/.config/tilemesh/config.toml`).
//! A missing file means defaults. `TILEMESH_*` environment variables are
//! applied last.

use crate::{
    Result, TileMeshError,
    net::{peer::PeerAddr, rendezvous::PunchConfig},
};

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub peer: PeerConfig,
    pub storage: StorageConfig,
    pub trackers: Vec<TrackerConfig>,
    /// Peers reached directly, as `host:port`.
    pub peers: Vec<String>,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub peer_id: String,
    /// UDP port of the responder. 0 = OS-assigned.
    pub listen_port: u16,
    /// TCP port of the stream responder. 0 = OS-assigned.
    pub stream_port: u16,
    /// Link speed reported to trackers, in Mbit/s.
    pub download_speed: Option<f64>,
    pub upload_speed: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackerConfig {
    /// Base URL of the tracker's HTTP API.
    pub url: String,
    /// UDP rendezvous endpoint. When unset, the endpoint the tracker hands
    /// out with each connection key is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rendezvous: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub request_timeout_ms: u64,
    pub request_attempts: usize,
    pub rendezvous_timeout_ms: u64,
    pub rendezvous_attempts: usize,
    pub probe_count: usize,
    pub announce_period_secs: u64,
    pub check_period_secs: u64,
    /// Pause between two descriptor announces.
    pub announce_delay_ms: u64,
    /// Pause between two tile downloads from one peer.
    pub tile_delay_ms: u64,
    pub connected_peer_ttl_secs: u64,
    /// Bound on one tracker HTTP call, connection included.
    pub http_timeout_ms: u64,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            peer_id: generate_peer_id(),
            listen_port: 0,
            stream_port: 0,
            download_speed: None,
            upload_speed: None,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: data_dir().join("data"),
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 2000,
            request_attempts: 3,
            rendezvous_timeout_ms: 2000,
            rendezvous_attempts: 5,
            probe_count: 5,
            announce_period_secs: 60,
            check_period_secs: 10,
            announce_delay_ms: 100,
            tile_delay_ms: 10,
            connected_peer_ttl_secs: 120,
            http_timeout_ms: 10_000,
        }
    }
}

impl TimingConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn announce_period(&self) -> Duration {
        Duration::from_secs(self.announce_period_secs)
    }

    pub fn check_period(&self) -> Duration {
        Duration::from_secs(self.check_period_secs)
    }

    pub fn announce_delay(&self) -> Duration {
        Duration::from_millis(self.announce_delay_ms)
    }

    pub fn tile_delay(&self) -> Duration {
        Duration::from_millis(self.tile_delay_ms)
    }

    pub fn connected_peer_ttl(&self) -> Duration {
        Duration::from_secs(self.connected_peer_ttl_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn punch_config(&self) -> PunchConfig {
        PunchConfig {
            reply_timeout: Duration::from_millis(self.rendezvous_timeout_ms),
            attempts: self.rendezvous_attempts,
            probes: self.probe_count,
            ..PunchConfig::default()
        }
    }
}

// Path helpers

fn config_dir() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
        .join("tilemesh")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local").join("share"))
        .join("tilemesh")
}

fn home_dir() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/tmp"))
}

/// 20 hex characters derived from the host name, process id and start time.
pub fn generate_peer_id() -> String {
    let host = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .unwrap_or_default();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();

    let mut hasher = Sha1::new();
    hasher.update(host.trim().as_bytes());
    hasher.update(std::process::id().to_be_bytes());
    hasher.update(nanos.to_be_bytes());
    let mut id = hex::encode(hasher.finalize());
    id.truncate(20);
    id
}

impl Config {
    /// Loads the config file (if any) and applies environment overrides.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let path = Self::file_path(explicit);
        let mut config = Self::load_from(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Reads `path`, or returns defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| TileMeshError::Config(format!("failed to read {}: {e}", path.display())))?;
        toml::from_str(&text)
            .map_err(|e| TileMeshError::Config(format!("failed to parse {}: {e}", path.display())))
    }

    pub fn file_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(path) = explicit {
            return path.to_path_buf();
        }
        std::env::var("TILEMESH_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| config_dir().join("config.toml"))
    }

    /// Writes a default config if none exists. Returns the path.
    pub fn write_default_if_missing(explicit: Option<&Path>) -> Result<PathBuf> {
        let path = Self::file_path(explicit);
        if path.exists() {
            return Ok(path);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| TileMeshError::Config(format!("failed to write {}: {e}", path.display())))?;
        }
        let text = toml::to_string_pretty(&Config::default())
            .map_err(|e| TileMeshError::Config(format!("failed to serialize: {e}")))?;
        std::fs::write(&path, text)
            .map_err(|e| TileMeshError::Config(format!("failed to write {}: {e}", path.display())))?;
        Ok(path)
    }

    /// Applies `TILEMESH_*` overrides read through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("TILEMESH_PEER_ID") {
            self.peer.peer_id = v;
        }
        if let Some(p) = lookup("TILEMESH_LISTEN_PORT").and_then(|v| v.parse().ok()) {
            self.peer.listen_port = p;
        }
        if let Some(p) = lookup("TILEMESH_STREAM_PORT").and_then(|v| v.parse().ok()) {
            self.peer.stream_port = p;
        }
        if let Some(v) = lookup("TILEMESH_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("TILEMESH_TRACKERS") {
            self.trackers = v
                .split(',')
                .map(str::trim)
                .filter(|url| !url.is_empty())
                .map(|url| TrackerConfig {
                    url: url.to_string(),
                    rendezvous: None,
                })
                .collect();
        }
        if let Some(v) = lookup("TILEMESH_PEERS") {
            self.peers = v
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(String::from)
                .collect();
        }
    }

    /// Configured direct peers, parsed.
    pub fn peer_addrs(&self) -> Result<Vec<PeerAddr>> {
        self.peers.iter().map(|p| p.parse()).collect()
    }
}
