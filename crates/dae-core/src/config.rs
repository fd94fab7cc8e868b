//! Configuration - daemon tuning and spawn-time settings
//!
//! - Tuning stored in ~/.dae/config.json (defaults when missing)
//! - Spawn configuration handed from the root daemon to its children

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::Result;

/// Marks a process as spawned by a root daemon
pub const ENV_DAE: &str = "DAE";
pub const ENV_DAE_PID: &str = "DAE_PID";
pub const ENV_DAE_PORT: &str = "DAE_PORT";
pub const ENV_DAE_SECRET: &str = "DAE_SECRET";

/// Daemon tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaeConfig {
    /// Address every listener binds to
    pub bind_host: String,
    pub port_range_start: u16,
    /// Random starting ports are drawn from `[start, start + span)`
    pub port_range_span: u16,
    pub scan_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    /// Preferred port for the root daemon
    pub root_port: Option<u16>,
}

impl Default for DaeConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port_range_start: 1024,
            port_range_span: 8192,
            scan_interval_ms: 15_000,
            probe_timeout_ms: 2_000,
            request_timeout_ms: 10_000,
            root_port: None,
        }
    }
}

impl DaeConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Get config file path (~/.dae/config.json)
pub fn get_config_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".dae")
        .join("config.json")
}

/// Load config from the default location
pub fn load_config() -> Result<DaeConfig> {
    load_config_from(&get_config_path())
}

pub fn load_config_from(path: &Path) -> Result<DaeConfig> {
    if !path.exists() {
        return Ok(DaeConfig::default());
    }

    let content = std::fs::read_to_string(path)?;
    let config: DaeConfig = serde_json::from_str(&content)?;
    Ok(config)
}

/// Save config to the default location
pub fn save_config(config: &DaeConfig) -> Result<()> {
    save_config_to(&get_config_path(), config)
}

pub fn save_config_to(path: &Path, config: &DaeConfig) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)?;
    std::fs::write(path, content)?;

    tracing::info!("Config saved to {:?}", path);
    Ok(())
}

/// What a root daemon hands to a child it spawns
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpawnConfig {
    pub parent_pid: u32,
    pub parent_port: u16,
    pub secret: String,
}

impl SpawnConfig {
    /// Environment variables carrying this configuration into a child process
    pub fn to_env(&self) -> HashMap<String, String> {
        HashMap::from([
            (ENV_DAE.to_string(), "1".to_string()),
            (ENV_DAE_PID.to_string(), self.parent_pid.to_string()),
            (ENV_DAE_PORT.to_string(), self.parent_port.to_string()),
            (ENV_DAE_SECRET.to_string(), self.secret.clone()),
        ])
    }

    /// Read the spawn configuration of the current process, if it has one
    pub fn from_env() -> Option<Self> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Parse from any variable lookup. Incomplete or unparsable sets yield `None`.
    pub fn from_vars(lookup: impl Fn(&str) -> Option<String>) -> Option<Self> {
        lookup(ENV_DAE)?;
        let parent_pid = lookup(ENV_DAE_PID)?.parse().ok()?;
        let parent_port = lookup(ENV_DAE_PORT)?.parse().ok()?;
        let secret = lookup(ENV_DAE_SECRET).filter(|s| !s.is_empty())?;

        Some(Self {
            parent_pid,
            parent_port,
            secret,
        })
    }
}
