use crate::coordinator::CoordinatorSettings;
use anyhow::{bail, Context, Result};
use directories::ProjectDirs;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use ticktrack_ipc::DEFAULT_SOCKET_PATH;

/// Overrides the config file location
pub const CONFIG_ENV_VAR: &str = "TICKTRACK_CONFIG";

#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct Config {
    pub socket_path: PathBuf,
    pub tick_interval_ms: u64,
    pub stop_resets_duration: bool,
    /// Used when `RUST_LOG` is unset
    pub log_filter: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from(DEFAULT_SOCKET_PATH),
            tick_interval_ms: 1000,
            stop_resets_duration: true,
            log_filter: "info".to_string(),
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.tick_interval_ms == 0 {
            bail!("tick_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            stop_resets_duration: self.stop_resets_duration,
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os(CONFIG_ENV_VAR) {
        return Some(PathBuf::from(path));
    }
    ProjectDirs::from("com", "pabloagn", "Ticktrack")
        .map(|proj_dirs| proj_dirs.config_dir().join("ticktrack.toml"))
}

pub fn load_config() -> Result<Config> {
    match default_config_path() {
        Some(path) => load_config_from(&path),
        None => Ok(Config::default()),
    }
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file at {:?}", path))?;
    Config::from_toml_str(&config_str)
        .with_context(|| format!("Failed to parse config file at {:?}", path))
}
