//! Configuration management for CareBridge.
//!
//! Loads configuration from ${CAREBRIDGE_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::session::StreamEndPolicy;

/// Environment variable overriding `api_base`.
pub const API_BASE_ENV: &str = "CAREBRIDGE_API_BASE";
/// Environment variable providing the bearer token.
pub const TOKEN_ENV: &str = "CAREBRIDGE_TOKEN";

/// Returns the default config template with comments.
fn default_config_template() -> &'static str {
    include_str!("../default_config.toml")
}

pub mod paths {
    //! CAREBRIDGE_HOME resolution order:
    //! 1. CAREBRIDGE_HOME environment variable (if set)
    //! 2. ~/.config/carebridge (default)

    use std::path::PathBuf;

    /// Returns the CareBridge home directory.
    pub fn carebridge_home() -> PathBuf {
        if let Ok(home) = std::env::var("CAREBRIDGE_HOME") {
            return PathBuf::from(home);
        }

        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("carebridge")
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        carebridge_home().join("config.toml")
    }

    /// Returns the directory for log files.
    pub fn logs_dir() -> PathBuf {
        carebridge_home().join("logs")
    }
}

/// Main configuration structure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Backend base URL (without the `/api` suffix)
    pub api_base: String,

    /// Bearer token forwarded with every chat request
    pub token: Option<String>,

    /// Resolution of a stream that closes without a terminal frame
    pub stream_end: StreamEndPolicy,

    /// Connection timeout in seconds (0 disables)
    pub connect_timeout_secs: u64,

    /// Maximum silence between chunks in seconds (0 disables)
    pub stream_idle_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: Self::DEFAULT_API_BASE.to_string(),
            token: None,
            stream_end: StreamEndPolicy::default(),
            connect_timeout_secs: Self::DEFAULT_CONNECT_TIMEOUT_SECS,
            stream_idle_timeout_secs: 0,
        }
    }
}

impl Config {
    const DEFAULT_API_BASE: &str = "http://localhost:8080";
    const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Writes the commented default config to `path`.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be written.
    pub fn init(path: &Path) -> Result<()> {
        if path.exists() {
            anyhow::bail!("Config file already exists at {}", path.display());
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }

        let tmp_path = path.with_extension("toml.tmp");
        fs::write(&tmp_path, default_config_template())
            .with_context(|| format!("Failed to write config to {}", tmp_path.display()))?;
        fs::rename(&tmp_path, path).with_context(|| {
            format!(
                "Failed to rename {} to {}",
                tmp_path.display(),
                path.display()
            )
        })?;

        Ok(())
    }

    /// Resolves the backend base URL with precedence: env > config > default.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is not a valid URL.
    pub fn api_base(&self) -> Result<String> {
        self.api_base_with(None)
    }

    /// Like [`Config::api_base`], with an explicit override (e.g. a CLI flag)
    /// taking precedence over everything else.
    ///
    /// # Errors
    /// Returns an error if the chosen URL is not a valid URL.
    pub fn api_base_with(&self, override_url: Option<&str>) -> Result<String> {
        let env_url = std::env::var(API_BASE_ENV).ok();
        resolve_base_url(
            &[override_url, env_url.as_deref(), Some(&self.api_base)],
            Self::DEFAULT_API_BASE,
        )
    }

    /// Returns the API root that endpoint paths hang off (`<base>/api`).
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn api_root(&self) -> Result<String> {
        self.api_root_with(None)
    }

    /// Returns the API root for an overridden base URL.
    ///
    /// # Errors
    /// Returns an error if the base URL is invalid.
    pub fn api_root_with(&self, override_url: Option<&str>) -> Result<String> {
        Ok(format!("{}/api", self.api_base_with(override_url)?))
    }

    /// Resolves the bearer token with precedence: config > env.
    ///
    /// # Errors
    /// Returns an error if no token is configured anywhere.
    pub fn token(&self) -> Result<String> {
        if let Some(token) = self.token.as_deref() {
            let trimmed = token.trim();
            if !trimmed.is_empty() {
                return Ok(trimmed.to_string());
            }
        }

        std::env::var(TOKEN_ENV)
            .ok()
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
            .with_context(|| format!("No token available. Set {TOKEN_ENV} or token in config.toml."))
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        (self.connect_timeout_secs > 0).then(|| Duration::from_secs(self.connect_timeout_secs))
    }

    pub fn stream_idle_timeout(&self) -> Option<Duration> {
        (self.stream_idle_timeout_secs > 0)
            .then(|| Duration::from_secs(self.stream_idle_timeout_secs))
    }
}

/// Picks the first non-empty candidate, validates it and strips trailing
/// slashes.
fn resolve_base_url(candidates: &[Option<&str>], default_url: &str) -> Result<String> {
    let chosen = candidates
        .iter()
        .copied()
        .flatten()
        .map(str::trim)
        .find(|url| !url.is_empty())
        .unwrap_or(default_url);

    url::Url::parse(chosen).with_context(|| format!("Invalid CareBridge API base URL: {chosen}"))?;
    Ok(chosen.trim_end_matches('/').to_string())
}
