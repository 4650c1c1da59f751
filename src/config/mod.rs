//! Configuration management for duck-cache
//!
//! Settings come from a TOML file, then environment overrides. Both are read
//! once at process start.

pub mod schema;

pub use schema::Config;

use crate::error::{DuckError, DuckResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info};

/// Environment variables that override file settings
pub mod env {
    pub const MEMORY_TIMEOUT_SECS: &str = "DUCK_MEMORY_TIMEOUT_SECS";
    pub const DISK_TIMEOUT_SECS: &str = "DUCK_DISK_TIMEOUT_SECS";
    pub const PROCESS_TIMEOUT_MS: &str = "DUCK_PROCESS_TIMEOUT_MS";
    pub const STORAGE: &str = "DUCK_STORAGE";
    pub const COMPILER: &str = "DUCK_COMPILER";
}

fn parse_var<T: FromStr>(var: &str, value: &str) -> DuckResult<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| DuckError::EnvInvalid {
        var: var.to_string(),
        reason: e.to_string(),
    })
}

impl Config {
    /// Apply environment-style overrides from a lookup function
    pub fn apply_overrides<F>(&mut self, lookup: F) -> DuckResult<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(env::MEMORY_TIMEOUT_SECS) {
            self.cache.memory_timeout_secs = parse_var(env::MEMORY_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(env::DISK_TIMEOUT_SECS) {
            self.cache.disk_timeout_secs = parse_var(env::DISK_TIMEOUT_SECS, &v)?;
        }
        if let Some(v) = lookup(env::PROCESS_TIMEOUT_MS) {
            self.tools.process_timeout_ms = parse_var(env::PROCESS_TIMEOUT_MS, &v)?;
        }
        if let Some(v) = lookup(env::STORAGE) {
            self.storage.root = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup(env::COMPILER) {
            self.tools.compiler = v;
        }
        Ok(())
    }

    /// Apply overrides from the process environment
    pub fn apply_env(&mut self) -> DuckResult<()> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Directory holding persisted sources
    pub fn storage_root(&self) -> PathBuf {
        self.storage
            .root
            .clone()
            .unwrap_or_else(|| ConfigManager::data_dir().join("storage"))
    }

    /// Directory holding rendered artifacts
    pub fn render_dir(&self) -> PathBuf {
        self.storage
            .render_dir
            .clone()
            .unwrap_or_else(|| self.storage_root().join("renders"))
    }

    /// Directory for scratch executables
    pub fn scratch_dir(&self) -> PathBuf {
        self.storage
            .scratch_dir
            .clone()
            .unwrap_or_else(std::env::temp_dir)
    }
}

/// Configuration manager
pub struct ConfigManager {
    config_path: PathBuf,
}

impl ConfigManager {
    /// Create a new config manager with default path
    pub fn new() -> Self {
        Self {
            config_path: Self::default_config_path(),
        }
    }

    /// Create a config manager with a custom path
    pub fn with_path(path: PathBuf) -> Self {
        Self { config_path: path }
    }

    /// Get the default config file path
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duck-cache")
            .join("config.toml")
    }

    /// Get the data directory path
    pub fn data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("duck-cache")
    }

    /// Load configuration from file (defaults if missing), then the environment
    pub async fn load(&self) -> DuckResult<Config> {
        let mut config = if self.config_path.exists() {
            self.load_from_file(&self.config_path).await?
        } else {
            debug!("Config file not found, using defaults");
            Config::default()
        };

        config.apply_env()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub async fn load_from_file(&self, path: &Path) -> DuckResult<Config> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            DuckError::disk(format!("reading config from {}", path.display()), e)
        })?;

        toml::from_str(&content).map_err(|e| DuckError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })
    }

    /// Save configuration to file
    pub async fn save(&self, config: &Config) -> DuckResult<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent).await.map_err(|e| {
                DuckError::disk(format!("creating config directory {}", parent.display()), e)
            })?;
        }

        let content = toml::to_string_pretty(config)?;
        fs::write(&self.config_path, content).await.map_err(|e| {
            DuckError::disk(
                format!("writing config to {}", self.config_path.display()),
                e,
            )
        })?;

        info!("Configuration saved to {}", self.config_path.display());
        Ok(())
    }

    /// Get the config file path
    pub fn path(&self) -> &Path {
        &self.config_path
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}
