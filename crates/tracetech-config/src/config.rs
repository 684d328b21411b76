//! Application configuration.
//!
//! Resolution order: explicit path, then `TRACETECH_CONFIG`, then
//! `<platform config dir>/config.toml`. A missing file yields defaults.
//! Selected values can be overridden from the environment afterwards.

use anyhow::{Context, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const CONFIG_ENV: &str = "TRACETECH_CONFIG";
const MODE_ENV: &str = "TRACETECH_MODE";
const STORAGE_DIR_ENV: &str = "TRACETECH_STORAGE_DIR";
const SUMMARIZER_ENDPOINT_ENV: &str = "TRACETECH_SUMMARIZER_ENDPOINT";

/// Where canonical data comes from at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RemoteMode {
    /// Live subscriptions against the remote document store.
    #[default]
    Cloud,
    /// Static fallback dataset; writes are discarded.
    Local,
}

impl std::str::FromStr for RemoteMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "cloud" | "remote" => Ok(RemoteMode::Cloud),
            "local" | "fallback" | "offline" => Ok(RemoteMode::Local),
            other => Err(anyhow::anyhow!("Unknown remote mode '{}'", other)),
        }
    }
}

/// Remote store subscription settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub mode: RemoteMode,
    pub records_order_field: String,
    pub users_order_field: String,
    pub settings_order_field: String,
    /// Switch to the fallback dataset when a core channel fails before its
    /// first snapshot.
    pub fallback_on_startup_error: bool,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            mode: RemoteMode::Cloud,
            records_order_field: "date".to_string(),
            users_order_field: "username".to_string(),
            settings_order_field: "name".to_string(),
            fallback_on_startup_error: true,
        }
    }
}

/// Session behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Minimum time a login attempt takes, in milliseconds.
    pub login_delay_ms: u64,
    /// Directory for persisted session and snapshot blobs.
    pub storage_dir: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            login_delay_ms: 1000,
            storage_dir: None,
        }
    }
}

/// Text summarization endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub enabled: bool,
    pub endpoint: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/api/generate".to_string(),
            model: "llama3".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub remote: RemoteConfig,
    pub session: SessionConfig,
    pub summarizer: SummarizerConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// Load configuration, applying environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let chosen = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| project_dirs().map(|dirs| dirs.config_dir().join("config.toml")));

        let mut config = match chosen {
            Some(path) if path.exists() => Self::from_file(&path)?,
            Some(path) => {
                tracing::debug!(path = %path.display(), "config file not found, using defaults");
                Self::default()
            }
            None => Self::default(),
        };

        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(content)?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(mode) = std::env::var(MODE_ENV) {
            self.remote.mode = mode
                .parse()
                .with_context(|| format!("Invalid {}", MODE_ENV))?;
        }
        if let Ok(dir) = std::env::var(STORAGE_DIR_ENV) {
            self.session.storage_dir = Some(PathBuf::from(dir));
        }
        if let Ok(endpoint) = std::env::var(SUMMARIZER_ENDPOINT_ENV) {
            self.summarizer.endpoint = endpoint;
            self.summarizer.enabled = true;
        }
        Ok(())
    }

    /// Directory for persisted blobs: configured, else the platform data dir.
    pub fn storage_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.session.storage_dir {
            return Ok(dir.clone());
        }
        project_dirs()
            .map(|dirs| dirs.data_dir().to_path_buf())
            .context("Could not determine a data directory for this platform")
    }

    pub fn login_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.session.login_delay_ms)
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("io", "tracetech", "tracetech")
}
