//! Configuration file.
//!
//! Every setting is optional; anything missing falls back to the built-in
//! defaults, and command-line values take precedence over the file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::engine::{EngineBackend, SimulatedBackend, SimulatedChannel, UnsupportedBackend};
use crate::radio::{ControllerConfig, DeviceConfig};

/// File looked up in the working directory when no path is given.
pub const DEFAULT_CONFIG_FILE: &str = "dabcast.toml";
pub const DEFAULT_LOG_DIR: &str = "logs";
pub const DEFAULT_LOG_RETENTION_DAYS: u64 = 7;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

/// Which engine drives the receiver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// The native decoding library.
    #[default]
    Native,
    /// A virtual receiver fed from `[[simulation.channels]]`.
    Simulated,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub device: DeviceSection,
    #[serde(default)]
    pub controller: ControllerSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub simulation: SimulationSection,
}

#[derive(Debug, Default, Deserialize)]
pub struct DeviceSection {
    pub backend: Option<BackendKind>,
    pub name: Option<String>,
    pub gain: Option<i32>,
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ControllerSection {
    pub discovery_timeout_secs: Option<u64>,
    pub discovery_poll_interval_ms: Option<u64>,
    pub channel_reset_delay_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LoggingSection {
    pub log_dir: Option<String>,
    pub retention_days: Option<u64>,
    pub level: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SimulationSection {
    #[serde(default)]
    pub channels: Vec<SimulatedChannel>,
}

impl ConfigFile {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Explicit path, else `dabcast.toml` if present, else defaults.
    /// Returns the path actually loaded alongside the configuration.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>), ConfigError> {
        let path = match explicit {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default_path = PathBuf::from(DEFAULT_CONFIG_FILE);
                default_path.exists().then_some(default_path)
            }
        };
        match path {
            Some(path) => Ok((Self::load(&path)?, Some(path))),
            None => Ok((Self::default(), None)),
        }
    }

    /// Build the engine backend, `kind` overriding the file.
    pub fn backend(&self, kind: Option<BackendKind>) -> Arc<dyn EngineBackend> {
        match kind.or(self.device.backend).unwrap_or_default() {
            BackendKind::Native => Arc::new(UnsupportedBackend),
            BackendKind::Simulated => {
                let channels = if self.simulation.channels.is_empty() {
                    demo_channels()
                } else {
                    self.simulation.channels.clone()
                };
                Arc::new(SimulatedBackend::new(channels))
            }
        }
    }
}

impl DeviceSection {
    pub fn to_config(&self) -> DeviceConfig {
        let defaults = DeviceConfig::default();
        DeviceConfig {
            device_name: self.name.clone().unwrap_or(defaults.device_name),
            gain: self.gain.unwrap_or(defaults.gain),
            settle_delay: self
                .settle_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.settle_delay),
        }
    }
}

impl ControllerSection {
    pub fn to_config(&self) -> ControllerConfig {
        let defaults = ControllerConfig::default();
        ControllerConfig {
            discovery_timeout: self
                .discovery_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.discovery_timeout),
            discovery_poll_interval: self
                .discovery_poll_interval_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.discovery_poll_interval),
            channel_reset_delay: self
                .channel_reset_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.channel_reset_delay),
        }
    }
}

/// Ensembles used by the simulated backend when none are configured.
pub fn demo_channels() -> Vec<SimulatedChannel> {
    vec![
        SimulatedChannel::new("5C", "Demo Mux")
            .with_service(0xD210, "Radio One")
            .with_service(0xD211, "Jazz FM")
            .with_data_service(0xD2FF, "EPG"),
        SimulatedChannel::new("11D", "Regional")
            .with_service(0xE101, "Talk")
            .with_service(0xE102, "Classic"),
    ]
}
