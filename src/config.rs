//! Loopback configuration.
//!
//! Everything has a default, so a missing config file still yields a
//! working call over host candidates only.

use crate::error::{Error, Result};
use crate::media::MediaConstraints;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Environment variable naming a JSON config file
pub const CONFIG_ENV: &str = "RTC_LOOPBACK_CONFIG";

pub const DEFAULT_CHANNEL_LABEL: &str = "sendDataChannel";

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ServerKind {
    Stun,
    Turn,
}

/// ICE server entry
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ServerKind,
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LogConfig {
    pub enabled: bool,
    /// `EnvFilter` directive; `RUST_LOG` wins when set
    pub filter: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            filter: if cfg!(debug_assertions) {
                "debug".into()
            } else {
                "info".into()
            },
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct LoopbackConfig {
    pub ice_servers: Vec<ServerConfig>,
    pub data_channel_label: String,
    pub media: MediaConstraints,
    pub logging: LogConfig,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            data_channel_label: DEFAULT_CHANNEL_LABEL.into(),
            media: MediaConstraints::default(),
            logging: LogConfig::default(),
        }
    }
}

impl LoopbackConfig {
    /// Reads and validates a JSON config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        let config: LoopbackConfig = serde_json::from_str(&raw)
            .map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        debug!(path = %path.display(), servers = config.ice_servers.len(), "Loaded config");
        Ok(config)
    }

    /// Loads from `RTC_LOOPBACK_CONFIG` if set, defaults otherwise
    pub fn from_env() -> Result<Self> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.data_channel_label.is_empty() {
            return Err(Error::InvalidConfig(
                "data_channel_label cannot be empty".into(),
            ));
        }

        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(Error::InvalidConfig(format!(
                    "ICE server '{}': URL cannot be empty",
                    server.id
                )));
            }

            if server.kind == ServerKind::Turn
                && (server.username.is_none() || server.credential.is_none())
            {
                return Err(Error::InvalidConfig(format!(
                    "ICE server '{}': TURN servers require username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}
