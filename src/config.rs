use crate::error::{GatewayError, Result};
use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable consulted when `upstream.api_key` is not configured.
pub const API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub upstream: UpstreamConfig,

    #[serde(default)]
    pub chunking: ChunkingConfig,

    #[serde(default)]
    pub chat: ChatConfig,

    #[serde(default)]
    pub usage: UsageConfig,

    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Retries per chunk for transient upstream failures. Zero disables retrying.
    #[serde(default)]
    pub max_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// Largest request payload, in bytes, the upstream accepts.
    #[serde(default = "default_ceiling")]
    pub ceiling_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatConfig {
    #[serde(default)]
    pub default_system_prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Cost per token, applied to input and output tokens alike.
    #[serde(default = "default_unit_cost")]
    pub unit_cost: f64,
    #[serde(default = "default_rollover_check")]
    pub rollover_check_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Fs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: StorageBackend,
    /// Root directory for the fs backend. Defaults to the platform data dir.
    pub data_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5001
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}

fn default_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_timeout() -> u64 {
    120
}

fn default_api_version() -> String {
    "2023-06-01".to_string()
}

fn default_ceiling() -> usize {
    100_000
}

fn default_unit_cost() -> f64 {
    0.000003
}

fn default_rollover_check() -> u64 {
    3600
}

fn default_backend() -> StorageBackend {
    StorageBackend::Fs
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: default_timeout(),
            api_version: default_api_version(),
            max_retries: 0,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: default_ceiling(),
        }
    }
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            unit_cost: default_unit_cost(),
            rollover_check_secs: default_rollover_check(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            data_dir: None,
        }
    }
}

impl GatewayConfig {
    /// Load configuration from `path` (or the default config file), layered
    /// under `CHATGATE_*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()?,
        };
        let mut config = Self::load_from(&path)?;

        if config.upstream.api_key.is_none() {
            config.upstream.api_key = std::env::var(API_KEY_ENV).ok().filter(|k| !k.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    fn load_from(path: &Path) -> Result<Self> {
        let s = Config::builder()
            .add_source(File::from(path.to_path_buf()).required(false))
            .add_source(
                Environment::with_prefix("CHATGATE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| GatewayError::Configuration(format!("Failed to build config: {}", e)))?;

        s.try_deserialize().map_err(|e| {
            GatewayError::Configuration(format!("Failed to deserialize config: {}", e))
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.ceiling_bytes == 0 {
            return Err(GatewayError::Configuration(
                "chunking.ceiling_bytes must be greater than zero".to_string(),
            ));
        }
        if !self.usage.unit_cost.is_finite() || self.usage.unit_cost < 0.0 {
            return Err(GatewayError::Configuration(
                "usage.unit_cost must be a non-negative number".to_string(),
            ));
        }
        if self.usage.rollover_check_secs == 0 {
            return Err(GatewayError::Configuration(
                "usage.rollover_check_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn require_api_key(&self) -> Result<&str> {
        self.upstream.api_key.as_deref().ok_or_else(|| {
            GatewayError::Configuration(format!(
                "No upstream API key: set upstream.api_key or {}",
                API_KEY_ENV
            ))
        })
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.storage.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(project_dirs()?.data_dir().to_path_buf()),
        }
    }

    /// TOML rendering with the API key masked.
    pub fn to_redacted_toml(&self) -> Result<String> {
        let mut shown = self.clone();
        if shown.upstream.api_key.is_some() {
            shown.upstream.api_key = Some("********".to_string());
        }
        toml::to_string_pretty(&shown)
            .map_err(|e| GatewayError::Configuration(format!("Failed to serialize config: {}", e)))
    }
}

fn project_dirs() -> Result<ProjectDirs> {
    ProjectDirs::from("com", "chatgate", "chatgate").ok_or_else(|| {
        GatewayError::Configuration("Could not determine config directory".to_string())
    })
}

pub fn default_config_path() -> Result<PathBuf> {
    let project_dirs = project_dirs()?;
    let config_dir = project_dirs.config_dir();
    fs::create_dir_all(config_dir)?;

    Ok(config_dir.join("config.toml"))
}
