//! Application configuration management.
//!
//! This module handles loading and saving the client configuration: the API
//! base URL, which credential storage backend to use, request timeout, log
//! directory and the last email used to sign in.
//!
//! Configuration is stored at `~/.config/quill/config.json`. The
//! `QUILL_API_URL` environment variable overrides the configured base URL.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::api::{ApiClient, DEFAULT_REQUEST_TIMEOUT_SECS};
use crate::auth::{CredentialStorage, FileStorage, KeyringStorage, MemoryStorage, SessionManager};

/// Application name used for config/data directory paths
const APP_NAME: &str = "quill";

/// Config file name
const CONFIG_FILE: &str = "config.json";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8000/api";

/// Environment variable overriding `api_base_url`
pub const API_URL_ENV: &str = "QUILL_API_URL";

/// Where the session's tokens are persisted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// JSON file in the data directory
    #[default]
    File,
    /// OS keychain
    Keyring,
    /// Nothing survives the process
    Memory,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_base_url: String,
    pub storage: StorageBackend,
    pub request_timeout_secs: u64,
    pub log_dir: Option<PathBuf>,
    pub last_email: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            storage: StorageBackend::default(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            log_dir: None,
            last_email: None,
        }
    }
}

impl Config {
    /// Load from the default location, then apply environment overrides
    pub fn load() -> Result<Self> {
        let config = Self::load_from(&Self::config_path()?)?;
        Ok(config.with_api_url_override(std::env::var(API_URL_ENV).ok()))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Directory holding the session file
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find data directory"))?;
        Ok(data_dir.join(APP_NAME))
    }

    /// Replace the base URL when an override is set and non-empty
    pub fn with_api_url_override(mut self, url: Option<String>) -> Self {
        if let Some(url) = url.filter(|u| !u.trim().is_empty()) {
            debug!(url = %url, "API base URL overridden from environment");
            self.api_base_url = url.trim().to_string();
        }
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs.max(1))
    }

    pub fn open_storage(&self) -> Result<Arc<dyn CredentialStorage>> {
        Ok(match self.storage {
            StorageBackend::File => Arc::new(FileStorage::in_dir(&self.data_dir()?)),
            StorageBackend::Keyring => Arc::new(KeyringStorage::new(APP_NAME)),
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
        })
    }

    /// Build a session manager wired to the configured API and storage
    pub fn build_session(&self) -> Result<SessionManager> {
        let api = ApiClient::new(&self.api_base_url, self.request_timeout())
            .context("Failed to create HTTP client")?;
        Ok(SessionManager::new(api, self.open_storage()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let config = Config {
            api_base_url: "https://blog.example.com/api".into(),
            storage: StorageBackend::Keyring,
            last_email: Some("a@b.com".into()),
            ..Default::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load_from(&path).unwrap(), config);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"storage":"memory"}"#).unwrap();
        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.storage, StorageBackend::Memory);
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_api_url_override() {
        let config = Config::default().with_api_url_override(Some(" https://x.test/api ".into()));
        assert_eq!(config.api_base_url, "https://x.test/api");

        let config = Config::default().with_api_url_override(Some("  ".into()));
        assert_eq!(config.api_base_url, DEFAULT_API_BASE_URL);
    }

    #[test]
    fn test_build_session_with_memory_storage() {
        let config = Config {
            storage: StorageBackend::Memory,
            ..Default::default()
        };
        let session = config.build_session().unwrap();
        assert!(!session.is_authenticated());
        assert_eq!(session.api().base_url(), DEFAULT_API_BASE_URL);
    }
}
