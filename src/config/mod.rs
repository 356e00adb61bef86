//! AUTO configuration management
//! Handles loading and saving the YAML config file

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// AUTO configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// General settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Provider settings
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// Alert settings
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageConfig,

    /// Metrics settings
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// HTTP inspection API settings
    #[serde(default)]
    pub api: ApiConfig,
}

/// General settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Forced-refresh cadence for the UI, in seconds
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval: u64,

    /// Log filter applied when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_refresh_interval() -> u64 {
    5
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            refresh_interval: default_refresh_interval(),
            log_level: default_log_level(),
        }
    }
}

/// Provider settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Storage-tree provider for opencode sessions
    #[serde(default)]
    pub opencode: OpencodeConfig,

    /// CLI-list provider for opencode sessions
    #[serde(default)]
    pub opencode_cli: OpencodeCliConfig,
}

/// Storage-tree provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpencodeConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Root of the opencode storage tree
    #[serde(default = "default_opencode_storage_path")]
    pub storage_path: String,

    /// Watch poll cadence, in seconds
    #[serde(default = "default_watch_interval")]
    pub watch_interval: u64,

    /// Sessions idle longer than this are ignored by discovery, in
    /// seconds (0 = keep all)
    #[serde(default)]
    pub max_age: u64,
}

impl Default for OpencodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            storage_path: default_opencode_storage_path(),
            watch_interval: default_watch_interval(),
            max_age: 0,
        }
    }
}

/// CLI-list provider settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpencodeCliConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Number of sessions requested from `opencode session list`
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,

    /// Poll cadence, in seconds
    #[serde(default = "default_watch_interval")]
    pub watch_interval: u64,

    /// Sessions idle longer than this are ignored, in seconds (0 = keep all)
    #[serde(default)]
    pub max_age: u64,

    /// Working directory for spawned sessions
    #[serde(default)]
    pub work_dir: String,
}

impl Default for OpencodeCliConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            list_limit: default_list_limit(),
            watch_interval: default_watch_interval(),
            max_age: 0,
            work_dir: String::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_watch_interval() -> u64 {
    1
}

fn default_list_limit() -> u32 {
    50
}

fn default_opencode_storage_path() -> String {
    dirs::home_dir()
        .map(|h| {
            h.join(".local")
                .join("share")
                .join("opencode")
                .join("storage")
                .to_string_lossy()
                .to_string()
        })
        .unwrap_or_else(|| "./storage".to_string())
}

/// Alert settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Context utilization percentage that triggers a warning
    #[serde(default = "default_context_limit_warning")]
    pub context_limit_warning: u8,

    /// Running span after which an agent is flagged, in seconds (0 = off)
    #[serde(default = "default_long_running_threshold")]
    pub long_running_threshold: u64,

    #[serde(default = "default_true")]
    pub desktop_notifications: bool,

    #[serde(default)]
    pub slack_enabled: bool,

    #[serde(default)]
    pub slack_webhook_url: String,

    #[serde(default)]
    pub slack_channel: String,

    #[serde(default)]
    pub discord_enabled: bool,

    #[serde(default)]
    pub discord_webhook_url: String,
}

fn default_context_limit_warning() -> u8 {
    90
}

fn default_long_running_threshold() -> u64 {
    1800
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            context_limit_warning: default_context_limit_warning(),
            long_running_threshold: default_long_running_threshold(),
            desktop_notifications: true,
            slack_enabled: false,
            slack_webhook_url: String::new(),
            slack_channel: String::new(),
            discord_enabled: false,
            discord_webhook_url: String::new(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Database path (~ is expanded)
    #[serde(default = "default_db_path")]
    pub database_path: String,

    /// Days of history retained by cleanup
    #[serde(default = "default_max_history")]
    pub max_history: u32,
}

fn default_db_path() -> String {
    "~/.local/share/auto/auto.db".to_string()
}

fn default_max_history() -> u32 {
    30
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            max_history: default_max_history(),
        }
    }
}

/// Metrics settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Cost per 1k input tokens
    #[serde(default = "default_token_cost_input")]
    pub token_cost_input: f64,

    /// Cost per 1k output tokens
    #[serde(default = "default_token_cost_output")]
    pub token_cost_output: f64,
}

fn default_token_cost_input() -> f64 {
    0.003
}

fn default_token_cost_output() -> f64 {
    0.015
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            token_cost_input: default_token_cost_input(),
            token_cost_output: default_token_cost_output(),
        }
    }
}

/// HTTP inspection API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
}

fn default_listen_addr() -> String {
    "127.0.0.1:9595".to_string()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            listen_addr: default_listen_addr(),
        }
    }
}

impl Config {
    /// Load config from the default location or specified path
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(path)?;

        if !config_path.exists() {
            info!("Config file not found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        let raw = std::fs::read_to_string(&config_path).context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&raw).context("Failed to parse config file")?;

        debug!("Loaded config from {:?}", config_path);
        Ok(config)
    }

    /// Save config to the default location
    pub fn save(&self, path: Option<&str>) -> Result<()> {
        let config_path = Self::config_path(path)?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(&self)?;
        std::fs::write(&config_path, content).context("Failed to write config file")?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Get the config file path
    fn config_path(path: Option<&str>) -> Result<PathBuf> {
        // Check env override first
        if let Ok(env_path) = std::env::var("AUTO_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        let home = dirs::home_dir().context("Cannot find home directory")?;
        Ok(home.join(".config").join("auto").join("config.yaml"))
    }

    /// Resolve database path (expand ~)
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        expand_home(&self.storage.database_path)
    }

    /// Resolve the opencode storage path (expand ~)
    pub fn resolve_storage_path(&self) -> Result<PathBuf> {
        expand_home(&self.providers.opencode.storage_path)
    }

    /// Watch cadence for the storage provider
    pub fn opencode_watch_interval(&self) -> Duration {
        Duration::from_secs(self.providers.opencode.watch_interval.max(1))
    }

    /// Discovery age cutoff for the storage provider (zero = keep all)
    pub fn opencode_max_age(&self) -> Duration {
        Duration::from_secs(self.providers.opencode.max_age)
    }
}

fn expand_home(path: &str) -> Result<PathBuf> {
    let home = dirs::home_dir().context("Cannot find home directory")?;
    Ok(PathBuf::from(
        path.replacen('~', &home.to_string_lossy(), 1),
    ))
}
