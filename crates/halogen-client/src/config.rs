use std::path::PathBuf;

use halogen_protocol::{DEFAULT_HOST, DEFAULT_PORT};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Gateway address, e.g. 127.0.0.1:6240
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ClientSettings {
    /// Sender name stamped on outgoing events (default: hostname)
    pub name: Option<String>,
    /// Seconds to wait for a command result (default: 10)
    pub timeout_secs: Option<u64>,
}

impl ClientConfig {
    /// Load config from file and environment variables
    /// Environment variables take precedence over file config
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;

        if let Ok(address) = std::env::var("HALOGEN_ADDR") {
            config.server.address = Some(address);
        }
        if let Ok(name) = std::env::var("HALOGEN_CLIENT_NAME") {
            config.client.name = Some(name);
        }

        Ok(config)
    }

    fn load_from_file() -> anyhow::Result<Self> {
        let path = Self::config_path();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn config_path() -> PathBuf {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
        PathBuf::from(home).join(".config/halogen/client.toml")
    }

    /// Gateway address, with fallback to the default
    pub fn address(&self) -> String {
        self.server
            .address
            .clone()
            .unwrap_or_else(|| format!("{DEFAULT_HOST}:{DEFAULT_PORT}"))
    }

    /// Sender name, with fallback to hostname
    pub fn client_name(&self) -> String {
        self.client.name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "client".to_string())
        })
    }

    pub fn timeout_secs(&self) -> u64 {
        self.client.timeout_secs.unwrap_or(10)
    }
}
