//! Baguette server configuration

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::{duration_millis, duration_secs};
use crate::error::ConfigError;

/// Kind of the coordinator used when no listed coordinator accepts a topology
pub const DEFAULT_COORDINATOR: &str = "noop";

/// Configuration for the Baguette server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface the SSH server binds to
    pub bind_address: String,

    /// SSH listening port
    pub port: u16,

    /// Address agents should use to reach this server, if not the bind address
    pub public_address: Option<String>,

    /// Path to the host key file (generated when missing)
    pub key_file: PathBuf,

    /// Resolve unknown node hostnames in the background when listing
    pub resolve_hostname: bool,

    /// Send an application heartbeat to every active session
    pub heartbeat_enabled: bool,

    /// Heartbeat period in milliseconds
    #[serde(with = "duration_millis")]
    pub heartbeat_period: Duration,

    /// Honor `address=`/`port=` announced by agents in their greeting
    pub client_address_override_allowed: bool,

    /// Template for client ids, with `~{key}` placeholders filled from node info
    pub client_id_format: Option<String>,

    /// Placeholder marker used by `client_id_format`
    pub client_id_format_escape: String,

    /// How long a correlated read waits for the agent's reply, in seconds
    #[serde(with = "duration_secs")]
    pub read_timeout: Duration,

    /// Echo every received line back to the agent
    pub echo: bool,

    /// Default coordinator kind
    pub coordinator: String,

    /// Parameters for the default coordinator
    pub coordinator_parameters: HashMap<String, String>,

    /// Coordinator ids tried in order before the default
    pub coordinator_ids: Vec<String>,

    /// Coordinator id → kind and parameters
    pub coordinator_configs: HashMap<String, CoordinatorConfig>,

    /// Username → password accepted by the SSH server
    pub credentials: HashMap<String, String>,
}

/// A named coordinator instance
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Registered factory name, e.g. `two-level`
    pub kind: String,
    pub parameters: HashMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let config_dir = super::default_config_dir();

        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 2222,
            public_address: None,
            key_file: config_dir.join("hostkey.pem"),
            resolve_hostname: true,
            heartbeat_enabled: false,
            heartbeat_period: Duration::from_millis(60_000),
            client_address_override_allowed: false,
            client_id_format: None,
            client_id_format_escape: "~".to_string(),
            read_timeout: Duration::from_secs(60),
            echo: false,
            coordinator: DEFAULT_COORDINATOR.to_string(),
            coordinator_parameters: HashMap::new(),
            coordinator_ids: Vec::new(),
            coordinator_configs: HashMap::new(),
            credentials: HashMap::new(),
        }
    }
}

impl ServerConfig {
    /// Socket address the listener binds to
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    /// Check coordinator references before anything is started
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.coordinator.trim().is_empty() && self.coordinator_ids.is_empty() {
            return Err(ConfigError::MissingField("coordinator".into()));
        }
        for id in &self.coordinator_ids {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid(
                    "coordinator_ids contains a blank id".into(),
                ));
            }
            match self.coordinator_configs.get(id) {
                None => return Err(ConfigError::UnknownCoordinatorId(id.clone())),
                Some(cfg) if cfg.kind.trim().is_empty() => {
                    return Err(ConfigError::MissingField(format!(
                        "coordinator_configs.{}.kind",
                        id
                    )))
                }
                Some(_) => {}
            }
        }
        if self.heartbeat_enabled && self.heartbeat_period.is_zero() {
            return Err(ConfigError::Invalid(
                "heartbeat_period must be positive".into(),
            ));
        }
        if self.client_id_format_escape.is_empty() {
            return Err(ConfigError::Invalid(
                "client_id_format_escape must not be empty".into(),
            ));
        }
        Ok(())
    }
}
