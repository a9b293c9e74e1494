//! Configuration management for the AGS CLI
//!
//! Values are layered: built-in defaults, then `~/.ags/config.toml`, then
//! `AGS_*` environment variables. Command-line flags are applied last by the CLI.

use crate::types::{BackendKind, OutputFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Directory under the user's home holding config and caches
pub const CONFIG_DIR: &str = ".ags";
/// Config filename inside [`CONFIG_DIR`]
pub const CONFIG_FILE: &str = "config.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot determine home directory")]
    NoHomeDir,

    #[error("Failed to read config {path}: {message}")]
    Read { path: PathBuf, message: String },

    #[error("Failed to parse config {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("E2B API key is not configured. Set AGS_E2B_API_KEY, pass --e2b-api-key, or add api_key under [e2b] in the config file")]
    MissingApiKey,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Backend used for sandbox lifecycle and execution
    #[serde(default)]
    pub backend: BackendKind,
    /// Output rendering mode
    #[serde(default)]
    pub output: OutputFormat,
    #[serde(default)]
    pub e2b: E2bConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub log: LogConfig,
}

/// E2B control plane settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct E2bConfig {
    /// API key sent as `X-API-Key`
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "E2bConfig::default_domain")]
    pub domain: String,
    #[serde(default = "E2bConfig::default_region")]
    pub region: String,
    /// Full control plane URL, replacing `https://api.{region}.{domain}`
    #[serde(default)]
    pub api_url: Option<String>,
}

impl Default for E2bConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            domain: Self::default_domain(),
            region: Self::default_region(),
            api_url: None,
        }
    }
}

impl E2bConfig {
    fn default_domain() -> String {
        "tencentags.com".to_string()
    }

    fn default_region() -> String {
        "ap-guangzhou".to_string()
    }

    /// Control plane base URL
    pub fn api_endpoint(&self) -> String {
        match &self.api_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("https://api.{}.{}", self.region, self.domain),
        }
    }

    /// Domain that sandbox data plane hosts live under
    pub fn data_plane_domain(&self) -> String {
        format!("{}.{}", self.region, self.domain)
    }
}

/// Defaults for sandboxes created by this CLI
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Tool (template) used when no `--tool` is given
    #[serde(default = "SandboxConfig::default_tool")]
    pub default_tool: String,
    /// Sandbox lifetime requested at creation
    #[serde(default = "SandboxConfig::default_timeout", with = "humantime_serde")]
    pub timeout: Duration,
    /// Language used when no `--language` is given
    #[serde(default = "SandboxConfig::default_language")]
    pub language: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_tool: Self::default_tool(),
            timeout: Self::default_timeout(),
            language: Self::default_language(),
        }
    }
}

impl SandboxConfig {
    fn default_tool() -> String {
        "code-interpreter-v1".to_string()
    }

    fn default_timeout() -> Duration {
        Duration::from_secs(300)
    }

    fn default_language() -> String {
        "python".to_string()
    }
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "LogConfig::default_level")]
    pub level: String,
    /// Optional log file, written in addition to stderr
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
            file: None,
        }
    }
}

impl LogConfig {
    fn default_level() -> String {
        "warn".to_string()
    }
}

impl AppConfig {
    /// Load configuration from `path`, or from the default location when `None`.
    ///
    /// A missing file yields the defaults. Environment overrides are applied.
    pub fn load(path: Option<&Path>) -> ConfigResult<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::config_path()?,
        };

        let mut config = Self::load_file(&config_path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Read a config file without applying environment overrides
    pub fn load_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Default config file path (`~/.ags/config.toml`)
    pub fn config_path() -> ConfigResult<PathBuf> {
        let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
        Ok(home.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Apply `AGS_*` overrides using the given variable lookup
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(value) = non_empty("AGS_BACKEND") {
            match value.parse() {
                Ok(backend) => self.backend = backend,
                Err(e) => tracing::warn!("Ignoring AGS_BACKEND: {}", e),
            }
        }
        if let Some(value) = non_empty("AGS_OUTPUT") {
            match value.parse() {
                Ok(output) => self.output = output,
                Err(e) => tracing::warn!("Ignoring AGS_OUTPUT: {}", e),
            }
        }
        if let Some(key) = non_empty("AGS_E2B_API_KEY").or_else(|| non_empty("E2B_API_KEY")) {
            self.e2b.api_key = Some(key);
        }
        if let Some(domain) = non_empty("AGS_E2B_DOMAIN") {
            self.e2b.domain = domain;
        }
        if let Some(region) = non_empty("AGS_E2B_REGION") {
            self.e2b.region = region;
        }
    }

    /// Check that the selected backend has what it needs
    pub fn validate(&self) -> ConfigResult<()> {
        match self.backend {
            BackendKind::E2b => {
                let has_key = self
                    .e2b
                    .api_key
                    .as_deref()
                    .map(|k| !k.trim().is_empty())
                    .unwrap_or(false);
                if !has_key {
                    return Err(ConfigError::MissingApiKey);
                }
                if self.e2b.api_url.is_none()
                    && (self.e2b.domain.is_empty() || self.e2b.region.is_empty())
                {
                    return Err(ConfigError::Invalid(
                        "e2b.domain and e2b.region must not be empty".to_string(),
                    ));
                }
                Ok(())
            }
            BackendKind::Local => Ok(()),
        }
    }
}
