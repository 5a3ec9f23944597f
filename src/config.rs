use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::{HubError, Result};

pub const DEFAULT_TIMEOUT_SECS: u64 = 15;
pub const DEFAULT_HEARTBEAT_DELAY_SECS: u64 = 120;
pub const DEFAULT_HEARTBEAT_OFFSET: f64 = 5.0;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 7979;
pub const DEFAULT_WS_PATH: &str = "/ws";

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct HeartbeatConfig {
    pub delay: Option<u64>,
    pub offset: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub token: Option<String>,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    pub timeout: Option<u64>,
    pub heartbeat: Option<HeartbeatConfig>,
    pub server: Option<ServerConfig>,
}

/// Resolved per-connection timing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ConnectionSettings {
    pub timeout: Duration,
    pub heartbeat_delay: Duration,
    /// Jitter applied to the heartbeat period, as a percentage of the delay.
    pub heartbeat_offset: f64,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            heartbeat_delay: Duration::from_secs(DEFAULT_HEARTBEAT_DELAY_SECS),
            heartbeat_offset: DEFAULT_HEARTBEAT_OFFSET,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| HubError::Config(e.to_string()))?;
        let config: Config =
            serde_json::from_str(&content).map_err(|e| HubError::Config(e.to_string()))?;
        config.connection_settings()?;
        Ok(config)
    }

    pub fn connection_settings(&self) -> Result<ConnectionSettings> {
        let timeout = self.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS);
        if timeout == 0 {
            return Err(HubError::Config("timeout must be positive".to_string()));
        }
        let heartbeat = self.heartbeat.clone().unwrap_or_default();
        let delay = heartbeat.delay.unwrap_or(DEFAULT_HEARTBEAT_DELAY_SECS);
        if delay == 0 {
            return Err(HubError::Config(
                "heartbeat delay must be positive".to_string(),
            ));
        }
        let offset = heartbeat.offset.unwrap_or(DEFAULT_HEARTBEAT_OFFSET);
        if !(0.0..100.0).contains(&offset) {
            return Err(HubError::Config(format!(
                "heartbeat offset must be in [0, 100), got {offset}"
            )));
        }
        Ok(ConnectionSettings {
            timeout: Duration::from_secs(timeout),
            heartbeat_delay: Duration::from_secs(delay),
            heartbeat_offset: offset,
        })
    }

    pub fn host(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.host.clone())
            .unwrap_or_else(|| DEFAULT_HOST.to_string())
    }

    pub fn port(&self) -> u16 {
        self.server
            .as_ref()
            .and_then(|server| server.port)
            .unwrap_or(DEFAULT_PORT)
    }

    pub fn token(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.token.clone())
            .unwrap_or_default()
    }

    pub fn ws_path(&self) -> String {
        self.server
            .as_ref()
            .and_then(|server| server.path.clone())
            .map(|path| path.trim().to_string())
            .filter(|path| path.starts_with('/') && path.len() > 1)
            .unwrap_or_else(|| DEFAULT_WS_PATH.to_string())
    }
}
