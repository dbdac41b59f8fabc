//! Daemon configuration loaded from TOML.
//!
//! The config file lives at `<data dir>/config.toml`; the data dir is
//! `$VESPER_DATA_DIR` when set, otherwise `$HOME/.vesper`. A missing file
//! yields the defaults. The UDP port is not configuration: it is the
//! daemon's one positional argument.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Routing and storage settings.
    #[serde(default)]
    pub node: NodeConfig,
    /// Advanced settings.
    #[serde(default)]
    pub advanced: AdvancedConfig,
}

/// Routing and storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Maximum live contacts per bucket.
    #[serde(default = "default_k")]
    pub k: usize,
    /// Seconds a probed contact has to answer before eviction completes.
    #[serde(default = "default_probe_ttl")]
    pub probe_ttl_secs: u64,
    /// Default record lifetime in seconds. 0 = records never expire.
    #[serde(default)]
    pub default_record_ttl_secs: u64,
    /// Seconds between maintenance passes (probe expiry, record sweep).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

/// Advanced configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvancedConfig {
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

// Default value functions

fn default_k() -> usize {
    vesper_dht::K
}

fn default_probe_ttl() -> u64 {
    vesper_dht::PROBE_TTL_SECS
}

fn default_maintenance_interval() -> u64 {
    60
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            probe_ttl_secs: default_probe_ttl(),
            default_record_ttl_secs: 0,
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if the file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// The probe deadline as a duration.
    pub fn probe_ttl(&self) -> Duration {
        Duration::from_secs(self.node.probe_ttl_secs)
    }

    /// The default record TTL; `None` means records never expire.
    pub fn default_record_ttl(&self) -> Option<Duration> {
        match self.node.default_record_ttl_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    /// The maintenance pass interval as a duration.
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.node.maintenance_interval_secs)
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        Self::data_dir().join("config.toml")
    }

    /// The data directory: `$VESPER_DATA_DIR`, or `$HOME/.vesper`.
    fn data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("VESPER_DATA_DIR") {
            return PathBuf::from(dir);
        }
        std::env::var("HOME")
            .map(|home| PathBuf::from(home).join(".vesper"))
            .unwrap_or_else(|_| PathBuf::from("/tmp/vesper"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.node.k, 20);
        assert_eq!(config.node.probe_ttl_secs, 10);
        assert_eq!(config.node.default_record_ttl_secs, 0);
        assert_eq!(config.default_record_ttl(), None);
        assert_eq!(config.advanced.log_level, "info");
    }

    #[test]
    fn test_config_serialization() {
        let config = DaemonConfig::default();
        let toml_str = toml::to_string(&config).expect("serialize");
        let parsed: DaemonConfig = toml::from_str(&toml_str).expect("parse");
        assert_eq!(parsed.node.k, config.node.k);
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: DaemonConfig = toml::from_str(
            "[node]\ndefault_record_ttl_secs = 7200\n",
        )
        .expect("parse");
        assert_eq!(parsed.node.k, 20);
        assert_eq!(
            parsed.default_record_ttl(),
            Some(Duration::from_secs(7200))
        );
    }
}
