//! Storage configuration types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Storage backend type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendType {
    /// Single JSON document under the data directory (default)
    #[default]
    File,
    /// Process-local, for tests and dry runs
    Memory,
    /// PostgreSQL (requires the `postgres` feature)
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendType,

    /// Root for the store file, run directories and the writer lock
    pub data_dir: PathBuf,

    pub database_url: Option<String>,

    pub schema: String,

    pub pool_size: u32,

    #[serde(with = "humantime_serde")]
    pub connection_timeout: Duration,

    /// Age after which a writer lock is considered abandoned
    #[serde(with = "humantime_serde")]
    pub lock_ttl: Duration,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendType::File,
            data_dir: PathBuf::from("data"),
            database_url: None,
            schema: "public".to_string(),
            pool_size: 5,
            connection_timeout: Duration::from_secs(30),
            lock_ttl: Duration::from_secs(6 * 60 * 60),
        }
    }
}

impl StorageConfig {
    pub fn store_file(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }

    pub fn lock_file(&self) -> PathBuf {
        self.data_dir.join("store.lock")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.data_dir.join("runs")
    }
}
