//! Configuration management for the chainmesh daemon.
//!
//! A single TOML file with one table per subsystem. Every table has
//! defaults, so a partial file only needs the keys it overrides. On first
//! run, if no config exists, one is written with the defaults.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::network::message::{
    FEATURE_CHAIN_RANGE, FEATURE_CHECKPOINT, FEATURE_INV, MAX_RANGE_BLOCKS,
};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Get the platform-specific data directory for chainmesh
pub fn get_data_dir() -> PathBuf {
    if cfg!(windows) {
        // Windows: %APPDATA%\chainmesh
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chainmesh")
    } else {
        // Linux/Mac: ~/.chainmesh
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".chainmesh")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub name: String,
    /// Empty means the platform default from [`get_data_dir`].
    pub data_dir: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            name: "chainmesh".to_string(),
            data_dir: String::new(),
        }
    }
}

impl NodeConfig {
    pub fn data_path(&self) -> PathBuf {
        if self.data_dir.is_empty() {
            get_data_dir()
        } else {
            PathBuf::from(&self.data_dir)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub listen_address: String,
    pub http_listen_address: Option<String>,
    pub udp_listen_address: Option<String>,
    /// Address advertised to peers in the handshake; defaults to none.
    pub external_address: Option<String>,
    /// HTTP base URL advertised to peers for block fetching.
    pub api_endpoint: Option<String>,
    pub bootstrap_peers: Vec<String>,
    pub persistent_peers: Vec<String>,
    pub max_connections: usize,
    pub max_connections_per_ip: usize,
    pub max_outbound: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0:9333".to_string(),
            http_listen_address: Some("0.0.0.0:9380".to_string()),
            udp_listen_address: None,
            external_address: None,
            api_endpoint: None,
            bootstrap_peers: vec![],
            persistent_peers: vec![],
            max_connections: 125,
            max_connections_per_ip: 3,
            max_outbound: 25,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub handshake_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub io_timeout_secs: u64,
    pub ping_interval_secs: u64,
    pub handshake_interval_secs: u64,
    pub health_interval_secs: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: 10,
            idle_timeout_secs: 120,
            io_timeout_secs: 15,
            ping_interval_secs: 30,
            handshake_interval_secs: 120,
            health_interval_secs: 30,
        }
    }
}

impl TransportConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.io_timeout_secs)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub protocol_version: u32,
    pub min_protocol_version: u32,
    pub features: Vec<String>,
    pub required_features: Vec<String>,
    /// Hex node ids allowed to send envelopes. Empty allows any signer.
    pub allowed_senders: Vec<String>,
    pub replay_window_secs: u64,
    pub max_messages_per_second: u32,
    pub bandwidth_window_secs: u64,
    pub peer_inbound_bytes_per_window: u64,
    pub peer_outbound_bytes_per_window: u64,
    pub global_inbound_bytes_per_window: u64,
    pub global_outbound_bytes_per_window: u64,
    pub reset_storm_window_secs: u64,
    pub reset_storm_threshold: usize,
    pub ban_duration_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            protocol_version: 2,
            min_protocol_version: 1,
            features: vec![
                FEATURE_CHAIN_RANGE.to_string(),
                FEATURE_CHECKPOINT.to_string(),
                FEATURE_INV.to_string(),
            ],
            required_features: vec![],
            allowed_senders: vec![],
            replay_window_secs: 300, // 5 minutes
            max_messages_per_second: 200,
            bandwidth_window_secs: 10,
            peer_inbound_bytes_per_window: 16 * 1024 * 1024,
            peer_outbound_bytes_per_window: 16 * 1024 * 1024,
            global_inbound_bytes_per_window: 128 * 1024 * 1024,
            global_outbound_bytes_per_window: 128 * 1024 * 1024,
            reset_storm_window_secs: 60,
            reset_storm_threshold: 5,
            ban_duration_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    pub enabled: bool,
    pub require_client_cert: bool,
    /// PEM certificate chain; a self-signed one is generated when unset.
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
    /// Files listing trusted SHA-256 certificate fingerprints, one per line.
    pub trust_store_paths: Vec<String>,
    pub reload_interval_secs: u64,
}

impl Default for TlsSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            require_client_cert: false,
            cert_path: None,
            key_path: None,
            trust_store_paths: vec![],
            reload_interval_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub dedup_capacity: usize,
    pub dedup_ttl_secs: u64,
    pub fanout: usize,
    pub request_window_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            dedup_capacity: 100_000,
            dedup_ttl_secs: 600,
            fanout: 8,
            request_window_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub checkpoint_enabled: bool,
    pub checkpoint_min_gap: u64,
    pub parallel_enabled: bool,
    pub chunk_size: u64,
    pub parallel_gap_threshold: u64,
    pub parallel_peer_height_threshold: u64,
    pub retry_limit: u32,
    pub workers: usize,
    pub probe_timeout_secs: u64,
    pub chunk_timeout_secs: u64,
    pub gossip_window_secs: u64,
    pub max_consecutive_failures: u32,
    pub failure_cooldown_secs: u64,
    pub min_trigger_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            checkpoint_enabled: true,
            checkpoint_min_gap: 1000,
            parallel_enabled: true,
            chunk_size: 50,
            parallel_gap_threshold: 50,
            parallel_peer_height_threshold: 10_000,
            retry_limit: 3,
            workers: 4,
            probe_timeout_secs: 5,
            chunk_timeout_secs: 20,
            gossip_window_secs: 10,
            max_consecutive_failures: 3,
            failure_cooldown_secs: 300,
            min_trigger_interval_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub sweep_interval_secs: u64,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 15,
            base_backoff_secs: 1,
            max_backoff_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// "pretty" or "json"
    pub format: String,
    /// "stdout" or "file"
    pub output: String,
    pub file_path: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            output: "stdout".to_string(),
            file_path: "./logs/node.log".to_string(),
        }
    }
}

impl Config {
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or write the defaults there first if it does not exist.
    pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load_from_file(path);
        }

        let config = Config::default();
        config.save_to_file(path)?;
        tracing::info!("📝 Wrote default config to {}", path.display());
        Ok(config)
    }

    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.chunk_size == 0 {
            return Err(ConfigError::Invalid("sync.chunk_size must be > 0".into()));
        }
        if self.sync.chunk_size > MAX_RANGE_BLOCKS {
            return Err(ConfigError::Invalid(format!(
                "sync.chunk_size {} exceeds the {} blocks a peer serves per request",
                self.sync.chunk_size, MAX_RANGE_BLOCKS
            )));
        }
        if self.sync.workers == 0 {
            return Err(ConfigError::Invalid("sync.workers must be > 0".into()));
        }
        if self.security.min_protocol_version > self.security.protocol_version {
            return Err(ConfigError::Invalid(format!(
                "security.min_protocol_version {} exceeds protocol_version {}",
                self.security.min_protocol_version, self.security.protocol_version
            )));
        }
        if self.tls.require_client_cert && !self.tls.enabled {
            return Err(ConfigError::Invalid(
                "tls.require_client_cert needs tls.enabled".into(),
            ));
        }
        if self.reconnect.max_backoff_secs < self.reconnect.base_backoff_secs {
            return Err(ConfigError::Invalid(
                "reconnect.max_backoff_secs is below base_backoff_secs".into(),
            ));
        }
        if self.gossip.dedup_capacity == 0 {
            return Err(ConfigError::Invalid(
                "gossip.dedup_capacity must be > 0".into(),
            ));
        }
        Ok(())
    }

    pub fn node_key_path(&self) -> PathBuf {
        self.node.data_path().join("node_key")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[sync]\nchunk_size = 25\n\n[network]\npersistent_peers = [\"10.0.0.2:9333\"]\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.sync.chunk_size, 25);
        assert_eq!(config.sync.retry_limit, 3);
        assert_eq!(config.network.persistent_peers, vec!["10.0.0.2:9333"]);
        assert_eq!(config.network.listen_address, "0.0.0.0:9333");
        assert_eq!(config.security.replay_window_secs, 300);
    }

    #[test]
    fn test_load_or_create_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let created = Config::load_or_create(&path).unwrap();
        assert!(path.exists());
        let loaded = Config::load_or_create(&path).unwrap();
        assert_eq!(created.sync.chunk_size, loaded.sync.chunk_size);
        assert_eq!(created.security.features, loaded.security.features);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = Config::default();
        config.sync.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.sync.chunk_size = MAX_RANGE_BLOCKS + 1;
        assert!(config.validate().is_err());
        config.sync.chunk_size = MAX_RANGE_BLOCKS;
        assert!(config.validate().is_ok());

        let mut config = Config::default();
        config.tls.require_client_cert = true;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.security.min_protocol_version = 3;
        assert!(config.validate().is_err());
    }
}
