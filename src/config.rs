//! Node configuration, read from a TOML file.
//!
//! ```toml
//! instance_name = "living-room"     # default: {hostname}-{main_component}
//! main_component = "core"
//!
//! [bus]
//! server_url = "tcp://localhost:1883"
//!
//! [logging]
//! level = "debug"
//!
//! [[components]]
//! id = "lamp"
//! plugin = "logic.value-binary"
//! config = { initialValue = false }
//!
//! [[bindings]]
//! sourceComponent = "switch"
//! sourceState = "value"
//! targetComponent = "lamp"
//! targetAction = "setValue"
//! ```
//!
//! Every key is optional. A missing file yields the defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use crate::bus::instance_info::hostname;
use crate::bus::{MqttConnector, TransportOptions};
use crate::manager::{BindingConfig, ComponentConfig};

const CONFIG_DIR: &str = ".config/homebus";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub server_url: String,
    pub keep_alive_secs: u64,
    pub reconnect_interval_secs: u64,
    pub cleanup_quiescence_ms: u64,
    pub presence_tracking: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            server_url: "tcp://localhost:1883".to_string(),
            keep_alive_secs: 30,
            reconnect_interval_secs: 5,
            cleanup_quiescence_ms: 1000,
            presence_tracking: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    pub timeout_ms: u64,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self { timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub publish_to_bus: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            publish_to_bus: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub instance_name: Option<String>,
    pub main_component: String,
    pub bus: BusConfig,
    pub rpc: RpcConfig,
    pub logging: LoggingConfig,
    pub components: Vec<ComponentConfig>,
    pub bindings: Vec<BindingConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            instance_name: None,
            main_component: "core".to_string(),
            bus: BusConfig::default(),
            rpc: RpcConfig::default(),
            logging: LoggingConfig::default(),
            components: Vec::new(),
            bindings: Vec::new(),
        }
    }
}

/// `~/.config/homebus/config.toml`
pub fn default_path() -> PathBuf {
    let mut path = dirs::home_dir().unwrap_or_else(|| {
        warn!("Could not determine home directory, using current directory");
        PathBuf::from(".")
    });
    path.push(CONFIG_DIR);
    path.push(CONFIG_FILE);
    path
}

impl NodeConfig {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Loads `path`, or the default path when `None`.
    pub async fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(default_path);

        match tokio::fs::read_to_string(&path).await {
            Ok(content) => {
                info!("Loading configuration from {}", path.display());
                Self::from_toml(&content)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Io { path, source }),
        }
    }

    pub fn instance_name(&self) -> String {
        self.instance_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", hostname(), self.main_component))
    }

    pub fn transport_options(&self) -> TransportOptions {
        TransportOptions {
            main_component: self.main_component.clone(),
            cleanup_quiescence: Duration::from_millis(self.bus.cleanup_quiescence_ms),
            rpc_timeout: Duration::from_millis(self.rpc.timeout_ms),
            presence_tracking: self.bus.presence_tracking,
            ..TransportOptions::new(&self.instance_name())
        }
    }

    pub fn connector(&self) -> MqttConnector {
        MqttConnector::new(
            &self.bus.server_url,
            Duration::from_secs(self.bus.keep_alive_secs),
            Duration::from_secs(self.bus.reconnect_interval_secs),
        )
    }
}
