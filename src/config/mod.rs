//! Runtime configuration
//!
//! [`SyncConfig`] is read once from TOML, overlaid with `ROSTERSYNC_*`
//! environment variables and then handed to each component by value.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::api::ApiConfig;
use crate::enricher::EnricherConfig;
use crate::error::{SyncError, SyncResult};
use crate::lister::ListerConfig;
use crate::merger::MergerConfig;
use crate::storage::{BackendType, StorageConfig};

/// Looked up in the working directory when no `--config` is given
pub const DEFAULT_CONFIG_FILE: &str = "rostersync.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub api: ApiConfig,
    pub lister: ListerConfig,
    pub enricher: EnricherConfig,
    pub merger: MergerConfig,
    pub storage: StorageConfig,
    /// Bearer token; usually supplied through `ROSTERSYNC_TOKEN`
    pub token: Option<String>,
    pub log_level: Option<String>,
}

impl SyncConfig {
    /// Load from `path`, or from [`DEFAULT_CONFIG_FILE`] when present
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let path: Option<PathBuf> = match path {
            Some(path) => Some(path.to_path_buf()),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                default.exists().then_some(default)
            }
        };

        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(&path).map_err(|e| {
                    SyncError::config(format!("cannot read {}: {}", path.display(), e))
                })?;
                debug!(path = %path.display(), "Loaded configuration file");
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        config.merge_env_vars();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> SyncResult<Self> {
        toml::from_str(content).map_err(|e| SyncError::config(format!("invalid configuration: {}", e)))
    }

    pub fn merge_env_vars(&mut self) {
        self.merge_env_with(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable source
    pub fn merge_env_with<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(token) = var("ROSTERSYNC_TOKEN") {
            self.token = Some(token);
        }

        if let Some(dir) = var("ROSTERSYNC_DATA_DIR") {
            self.storage.data_dir = PathBuf::from(dir);
        }

        if let Some(url) = var("ROSTERSYNC_DATABASE_URL") {
            self.storage.database_url = Some(url);
            self.storage.backend = BackendType::Postgres;
        }

        if let Some(workers) = var("ROSTERSYNC_WORKERS") {
            match workers.parse::<usize>() {
                Ok(value) => self.enricher.workers = value,
                Err(_) => debug!(value = %workers, "Ignoring non-numeric ROSTERSYNC_WORKERS"),
            }
        }

        if let Some(level) = var("ROSTERSYNC_LOG_LEVEL") {
            self.log_level = Some(level);
        }
    }

    pub fn validate(&self) -> SyncResult<()> {
        if self.enricher.workers == 0 {
            return Err(SyncError::config("enricher.workers must be at least 1"));
        }
        if self.enricher.rate_limit.requests == 0 || self.enricher.rate_limit.window.is_zero() {
            return Err(SyncError::config(
                "enricher.rate_limit needs a positive request count and window",
            ));
        }
        for (name, retry) in [
            ("lister.retry", &self.lister.retry),
            ("enricher.retry", &self.enricher.retry),
        ] {
            retry
                .validate()
                .map_err(|e| SyncError::config(format!("{}: {}", name, e)))?;
        }
        if self.lister.page_size == 0 {
            return Err(SyncError::config("lister.page_size must be at least 1"));
        }
        if self.lister.max_pages == 0 {
            return Err(SyncError::config("lister.max_pages must be at least 1"));
        }
        for (name, value) in [
            ("api.graphql_url", &self.api.graphql_url),
            ("api.event_id", &self.api.event_id),
            ("api.view_id", &self.api.view_id),
            ("api.list_query_hash", &self.api.list_query_hash),
        ] {
            if value.trim().is_empty() {
                return Err(SyncError::config(format!("{} must not be empty", name)));
            }
        }
        if self.storage.backend == BackendType::Postgres {
            if self.storage.database_url.is_none() {
                return Err(SyncError::config(
                    "storage.database_url is required for the postgres backend",
                ));
            }
            if self.storage.pool_size < 2 {
                return Err(SyncError::config(
                    "storage.pool_size must be at least 2 for the postgres backend",
                ));
            }
        }
        Ok(())
    }
}
