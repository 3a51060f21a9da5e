// src/config.rs
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const APP_DIR: &str = "tailscale-gui";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub tailscale_binary: String,
    pub socket: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub ping_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub command_timeout_secs: u64,
    pub show_details: bool,
    pub log_to_file: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tailscale_binary: "tailscale".to_string(),
            socket: None,
            poll_interval_secs: 5,
            ping_timeout_secs: 5,
            login_timeout_secs: 30,
            command_timeout_secs: 30,
            show_details: false,
            log_to_file: false,
        }
    }
}

/// Runtime knobs handed to the manager and the CLI client.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSettings {
    pub binary: String,
    pub socket: Option<PathBuf>,
    pub poll_interval: Duration,
    pub ping_timeout: Duration,
    pub login_timeout: Duration,
    /// Upper bound for any single `tailscale` invocation.
    pub command_timeout: Duration,
}

impl Default for ClientSettings {
    fn default() -> Self {
        AppConfig::default().client_settings()
    }
}

pub fn config_dir() -> anyhow::Result<PathBuf> {
    let dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Cannot find config directory"))?
        .join(APP_DIR);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        let config_file = config_dir()?.join("config.json");

        if config_file.exists() {
            let content = std::fs::read_to_string(config_file)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_file = config_dir()?.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(config_file, content)?;
        Ok(())
    }

    pub fn log_file() -> anyhow::Result<PathBuf> {
        Ok(config_dir()?.join("tailscale-gui.log"))
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            binary: self.tailscale_binary.clone(),
            socket: self.socket.clone(),
            poll_interval: Duration::from_secs(self.poll_interval_secs.max(1)),
            ping_timeout: Duration::from_secs(self.ping_timeout_secs.max(1)),
            login_timeout: Duration::from_secs(self.login_timeout_secs.max(1)),
            command_timeout: Duration::from_secs(self.command_timeout_secs.max(1)),
        }
    }
}
