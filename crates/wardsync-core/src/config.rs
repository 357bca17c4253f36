//! Application configuration management.
//!
//! Configuration is stored at `~/.config/wardsync/config.json`. Any field can
//! be overridden from the environment (`WARDSYNC_SERVER_URL`,
//! `WARDSYNC_USERNAME`, `WARDSYNC_PASSWORD`, `WARDSYNC_LOCALE`,
//! `WARDSYNC_DATA_DIR`), which is also where a `.env` file lands.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Application name used for config/cache directory paths
const APP_NAME: &str = "wardsync";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Local store file name inside the data directory
const DATABASE_FILE: &str = "wardsync.db";

const DEFAULT_LOCALE: &str = "en";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub locale: String,
    /// Where the store and the location snapshot live. Defaults to the
    /// platform cache directory.
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: None,
            username: None,
            password: None,
            locale: DEFAULT_LOCALE.to_string(),
            data_dir: None,
        }
    }
}

impl Config {
    /// Load the config file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from `path`; a missing file yields the defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Overwrite fields with the values `lookup` finds for their variables.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = var("WARDSYNC_SERVER_URL") {
            self.server_url = Some(url);
        }
        if let Some(username) = var("WARDSYNC_USERNAME") {
            self.username = Some(username);
        }
        if let Some(password) = var("WARDSYNC_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(locale) = var("WARDSYNC_LOCALE") {
            self.locale = locale;
        }
        if let Some(dir) = var("WARDSYNC_DATA_DIR") {
            self.data_dir = Some(PathBuf::from(dir));
        }
    }

    pub fn data_dir(&self) -> Result<PathBuf> {
        if let Some(ref dir) = self.data_dir {
            return Ok(dir.clone());
        }
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    pub fn database_path(&self) -> Result<PathBuf> {
        Ok(self.data_dir()?.join(DATABASE_FILE))
    }

    /// Server URL and credentials, or an error naming what is missing.
    pub fn server(&self) -> Result<(&str, &str, &str)> {
        let url = self
            .server_url
            .as_deref()
            .context("No server URL configured (set WARDSYNC_SERVER_URL)")?;
        let username = self
            .username
            .as_deref()
            .context("No username configured (set WARDSYNC_USERNAME)")?;
        let password = self
            .password
            .as_deref()
            .context("No password configured (set WARDSYNC_PASSWORD)")?;
        Ok((url, username, password))
    }
}
