// Configuration Storage Service
// Handles config file read/write and version backup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::models::{ChunkingOptions, OrchestrationOptions};

use super::analysis::errors::{ConfigurationError, MAX_CONCURRENCY};
use super::analysis::segmenter::validate_chunking;

const MAX_BACKUPS: usize = 10;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config I/O failed at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    pub default_provider: Option<String>,
    pub proxy: Option<String>,
    #[serde(default)]
    pub chunking: ChunkingOptions,
    #[serde(default)]
    pub orchestration: OrchestrationOptions,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub enabled: bool,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

/// Validated, explicit settings for one orchestration run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub structure_hints_enabled: bool,
    pub concurrency: usize,
    pub max_retries_per_chunk: usize,
    pub per_chunk_timeout: Duration,
    pub retry_backoff: Duration,
    pub max_recursion_depth: usize,
    pub compose_answer: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_options(&ChunkingOptions::default(), &OrchestrationOptions::default())
    }
}

impl RunConfig {
    pub fn from_options(chunking: &ChunkingOptions, orchestration: &OrchestrationOptions) -> Self {
        Self {
            chunk_size: chunking.chunk_size,
            overlap_size: chunking.overlap_size,
            structure_hints_enabled: chunking.structure_hints_enabled,
            concurrency: orchestration.concurrency,
            max_retries_per_chunk: orchestration.max_retries_per_chunk,
            per_chunk_timeout: Duration::from_secs(orchestration.per_chunk_timeout_secs),
            retry_backoff: Duration::from_millis(orchestration.retry_backoff_ms),
            max_recursion_depth: orchestration.max_recursion_depth,
            compose_answer: orchestration.compose_answer,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        validate_chunking(self.chunk_size, self.overlap_size)?;
        if self.concurrency == 0 {
            return Err(ConfigurationError::ZeroConcurrency);
        }
        if self.concurrency > MAX_CONCURRENCY {
            return Err(ConfigurationError::ConcurrencyTooHigh(self.concurrency));
        }
        if self.per_chunk_timeout.is_zero() {
            return Err(ConfigurationError::ZeroTimeout);
        }
        Ok(())
    }
}

impl AppConfig {
    pub fn run_config(&self) -> RunConfig {
        RunConfig::from_options(&self.chunking, &self.orchestration)
    }
}

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rlm-reader"))
    }

    pub fn config_file(&self) -> &Path {
        &self.config_file
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), ConfigError> {
        fs::create_dir_all(&self.config_dir).map_err(|e| io_error(&self.config_dir, e))
    }

    /// Load configuration from file; a missing file yields defaults
    pub fn load(&self) -> Result<AppConfig, ConfigError> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content =
            fs::read_to_string(&self.config_file).map_err(|e| io_error(&self.config_file, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.ensure_dir()?;

        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)?;
        fs::write(&self.config_file, content).map_err(|e| io_error(&self.config_file, e))
    }

    /// Create a backup of current config
    fn create_backup(&self) -> Result<(), ConfigError> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir).map_err(|e| io_error(&backup_dir, e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file).map_err(|e| io_error(&backup_file, e))?;

        self.cleanup_old_backups(&backup_dir, MAX_BACKUPS)
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), ConfigError> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| io_error(backup_dir, e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Names embed the timestamp, so lexical order is age order.
        entries.sort_by_key(|e| e.file_name());

        let remove_count = entries.len() - keep;
        for entry in entries.iter().take(remove_count) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let config = self.load()?;
        Ok(config.api_keys.get(provider).cloned())
    }

    /// Store provider API key in config file
    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }

    /// Delete provider API key from config file
    pub fn delete_api_key(&self, provider: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        config.api_keys.remove(provider);
        self.save(&config)
    }

    /// Get provider base URL from config file
    pub fn get_provider_url(&self, provider: &str) -> Result<Option<String>, ConfigError> {
        let config = self.load()?;
        Ok(config.providers.get(provider).and_then(|p| p.base_url.clone()))
    }

    /// Set provider base URL in config file
    pub fn set_provider_url(&self, provider: &str, url: &str) -> Result<(), ConfigError> {
        let mut config = self.load()?;
        let provider_config = config.providers.entry(provider.to_string()).or_default();
        provider_config.base_url = Some(url.to_string());
        self.save(&config)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> ConfigError {
    ConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}
