//! Driver configuration: the config file and the per-OS persisted state.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use weir_cluster::remote::ConnectionConfig;
use weir_cluster::RackKey;
use weir_core::breaker;
use weir_core::telem::TimeSpan;

pub const DEFAULT_CONFIG_PATH: &str = "./weir-driver-config.json";

#[derive(Debug, ThisError)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Retry tuning from the config file, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub name: String,
    pub base_interval: f64,
    pub max_retries: u32,
    pub scale: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { name: "driver".to_string(), base_interval: 1.0, max_retries: 50, scale: 1.2 }
    }
}

impl RetryConfig {
    pub fn breaker(&self) -> breaker::Config {
        breaker::Config {
            name: self.name.clone(),
            base_interval: TimeSpan::from_secs(self.base_interval),
            max_retries: self.max_retries,
            scale: self.scale,
        }
    }
}

/// The driver's configuration file. Every field has a default, so a missing
/// file is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub connection: ConnectionConfig,
    pub retry: RetryConfig,
    pub rack_key: RackKey,
    pub cluster_key: String,
    /// Enabled integrations; empty enables everything available.
    pub integrations: Vec<String>,
    pub debug: bool,
}

impl Config {
    /// Loads configuration from `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(err) => return Err(ConfigError::Io { path: path.to_path_buf(), source: err }),
        };
        serde_json::from_str(&raw)
            .map_err(|err| ConfigError::Parse { path: path.to_path_buf(), source: err })
    }

    pub fn integration_enabled(&self, name: &str) -> bool {
        self.integrations.is_empty() || self.integrations.iter().any(|i| i == name)
    }
}

/// State surviving driver restarts: the rack identity this host claimed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistedState {
    pub rack_key: RackKey,
    pub cluster_key: String,
}

/// The per-OS application-data path of the persisted state file.
pub fn persisted_state_path() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        let base = std::env::var("LOCALAPPDATA")
            .unwrap_or_else(|_| "C:\\ProgramData".to_string());
        return PathBuf::from(base).join("weir-driver").join("persisted-state.json");
    }
    #[cfg(target_os = "macos")]
    {
        let base = std::env::var("HOME").unwrap_or_else(|_| "/".to_string());
        return PathBuf::from(base)
            .join("Library/Application Support/weir-driver/persisted-state.json");
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        PathBuf::from("/var/lib/weir-driver/persisted-state.json")
    }
}

/// Loads persisted state from `path`; a missing or empty file is `{}`.
pub fn load_persisted_state(path: &Path) -> Result<PersistedState, ConfigError> {
    let raw = match fs::read_to_string(path) {
        Ok(raw) if raw.trim().is_empty() => "{}".to_string(),
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => "{}".to_string(),
        Err(err) => return Err(ConfigError::Io { path: path.to_path_buf(), source: err }),
    };
    serde_json::from_str(&raw)
        .map_err(|err| ConfigError::Parse { path: path.to_path_buf(), source: err })
}

/// Writes persisted state, creating parent directories as needed.
pub fn save_persisted_state(path: &Path, state: &PersistedState) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| ConfigError::Io { path: path.to_path_buf(), source: err })?;
    }
    let raw = serde_json::to_string_pretty(state)
        .map_err(|err| ConfigError::Parse { path: path.to_path_buf(), source: err })?;
    fs::write(path, raw).map_err(|err| ConfigError::Io { path: path.to_path_buf(), source: err })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = Config::load(&dir.path().join("nope.json")).unwrap();
        assert_eq!(cfg.connection.host, "localhost");
        assert_eq!(cfg.connection.port, 9090);
        assert_eq!(cfg.rack_key, 0);
        assert!(cfg.integration_enabled("ethercat"));
    }

    #[test]
    fn recognized_keys_parse() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weir-driver-config.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "connection": { "host": "weir.example.com", "port": 9095, "username": "driver" },
                "retry": { "base_interval": 0.5, "max_retries": 10, "scale": 1.5 },
                "rack_key": 4099,
                "cluster_key": "c-1",
                "integrations": ["opcua", "sequence"],
                "debug": true
            })
            .to_string(),
        )
        .unwrap();
        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.connection.host, "weir.example.com");
        assert_eq!(cfg.retry.max_retries, 10);
        assert_eq!(cfg.rack_key, 4099);
        assert!(cfg.integration_enabled("opcua"));
        assert!(!cfg.integration_enabled("ethercat"));
        assert!(cfg.debug);
        let breaker = cfg.retry.breaker();
        assert_eq!(breaker.base_interval, TimeSpan::from_secs(0.5));
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn persisted_state_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/persisted-state.json");
        assert_eq!(load_persisted_state(&path).unwrap().rack_key, 0);

        save_persisted_state(
            &path,
            &PersistedState { rack_key: 77, cluster_key: "c-2".to_string() },
        )
        .unwrap();
        let state = load_persisted_state(&path).unwrap();
        assert_eq!(state.rack_key, 77);
        assert_eq!(state.cluster_key, "c-2");
    }

    #[test]
    fn empty_persisted_state_file_is_empty_object() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persisted-state.json");
        std::fs::write(&path, "").unwrap();
        assert_eq!(load_persisted_state(&path).unwrap().rack_key, 0);
    }
}
