//! Forgeman Configuration Module
//! Handles loading and validating config.json
//!
//! The configuration is loaded once at startup into an immutable value and
//! threaded into each component's constructor.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Could not determine home directory")]
    NoHomeDir,
    #[error("Failed to read config: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("Invalid config format: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Platform key used in release asset names (`{app}_{platform}.zip`).
pub const fn platform_key() -> &'static str {
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos")))]
    {
        "linux"
    }
}

fn exe_name(base: &str) -> String {
    #[cfg(target_os = "windows")]
    {
        format!("{}.exe", base)
    }
    #[cfg(not(target_os = "windows"))]
    {
        base.to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub channel: ChannelConfig,
    #[serde(default)]
    pub layout: LayoutConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

/// Release channel coordinates (GitHub repositories).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default = "default_manager_repo")]
    pub manager_repo: String,
    #[serde(default = "default_worker_repo")]
    pub worker_repo: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

/// On-disk layout: both executables live in one install directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayoutConfig {
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,
    #[serde(default = "default_manager_exe")]
    pub manager_exe: String,
    #[serde(default = "default_worker_exe")]
    pub worker_exe: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Grace period before a worker terminate escalates to a forced kill.
    #[serde(default = "default_grace_secs")]
    pub terminate_grace_secs: u64,
    /// How long the handoff executor waits for the manager to exit.
    #[serde(default = "default_handoff_secs")]
    pub handoff_wait_secs: u64,
    /// Per-request HTTP timeout for the release channel.
    #[serde(default = "default_http_secs")]
    pub http_timeout_secs: u64,
    /// Bounded attempt count for release channel queries.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_owner() -> String {
    "forgeman-dev".to_string()
}

fn default_manager_repo() -> String {
    "forgeman".to_string()
}

fn default_worker_repo() -> String {
    "forgeworker".to_string()
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}

fn default_install_dir() -> PathBuf {
    // Per-user install location; the handoff executor writes here
    #[cfg(target_os = "windows")]
    {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("Forgeman")
            .join("bin")
    }
    #[cfg(not(target_os = "windows"))]
    {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".local")
            .join("share")
            .join("forgeman")
            .join("bin")
    }
}

fn default_manager_exe() -> String {
    exe_name("forgeman")
}

fn default_worker_exe() -> String {
    exe_name("forgeworker")
}

fn default_grace_secs() -> u64 {
    10
}

fn default_handoff_secs() -> u64 {
    30
}

fn default_http_secs() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            manager_repo: default_manager_repo(),
            worker_repo: default_worker_repo(),
            api_base: default_api_base(),
        }
    }
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            install_dir: default_install_dir(),
            manager_exe: default_manager_exe(),
            worker_exe: default_worker_exe(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            terminate_grace_secs: default_grace_secs(),
            handoff_wait_secs: default_handoff_secs(),
            http_timeout_secs: default_http_secs(),
            max_retries: default_max_retries(),
        }
    }
}

impl AppConfig {
    /// Platform config directory (`~/.config/forgeman` on Linux).
    pub fn config_dir() -> Result<PathBuf, ConfigError> {
        let base = dirs::config_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(base.join("forgeman"))
    }

    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let config_path = config_dir.join("config.json");
        if !config_path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&config_path)?;
        let config: AppConfig = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<(), ConfigError> {
        std::fs::create_dir_all(config_dir)?;
        let config_path = config_dir.join("config.json");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&config_path, content)?;
        Ok(())
    }

    pub fn manager_exe_path(&self) -> PathBuf {
        self.layout.install_dir.join(&self.layout.manager_exe)
    }

    pub fn worker_exe_path(&self) -> PathBuf {
        self.layout.install_dir.join(&self.layout.worker_exe)
    }

    /// Expected asset name for an application on this platform.
    pub fn asset_name(&self, app: &str) -> String {
        format!("{}_{}.zip", app.to_lowercase(), platform_key())
    }
}
