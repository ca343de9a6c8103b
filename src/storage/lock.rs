//! Exclusive writer lock for the attendee store
//!
//! At most one run may write to a store at a time. The lock is a file created
//! with `create_new`, holding a JSON [`StoreLock`] record. While a guard is
//! alive a background task renews the record every third of its TTL. A record
//! that has not been renewed within its TTL is considered abandoned (crashed
//! run) and is broken on the next acquire.
//!
//! Breaking a stale lock renames it aside first, so of several contenders only
//! one can take it over. Releasing only removes the file while it still
//! carries the guard's token.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use super::error::{StorageError, StorageResult};

/// Store lock information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreLock {
    /// Lock holder identifier (run name)
    pub holder: String,
    /// Process that took the lock
    pub pid: u32,
    /// When the lock was acquired
    pub acquired_at: DateTime<Utc>,
    /// Last heartbeat of the holder
    #[serde(default)]
    pub renewed_at: Option<DateTime<Utc>>,
    /// Time to live for the lock
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Lock token for verification
    pub token: String,
}

impl StoreLock {
    /// Create a new store lock
    pub fn new(holder: String, ttl: Duration) -> Self {
        Self {
            holder,
            pid: std::process::id(),
            acquired_at: Utc::now(),
            renewed_at: None,
            ttl,
            token: Uuid::new_v4().to_string(),
        }
    }

    /// Check if the lock has expired
    pub fn is_expired(&self) -> bool {
        let since = self.renewed_at.unwrap_or(self.acquired_at);
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => Utc::now() > since + ttl,
            Err(_) => false,
        }
    }
}

/// Guard proving exclusive write access; releases the lock file when dropped
#[derive(Debug)]
pub struct StoreLockGuard {
    lock: StoreLock,
    lock_file: PathBuf,
    heartbeat: Option<JoinHandle<()>>,
}

impl StoreLockGuard {
    /// Acquire the lock file at `lock_file`, breaking it if it has expired
    pub async fn acquire(lock_file: &Path, holder: &str, ttl: Duration) -> StorageResult<Self> {
        if let Some(parent) = lock_file.parent() {
            fs::create_dir_all(parent).await?;
        }

        let lock = match try_create(lock_file, holder, ttl).await {
            Err(e) if e.is_conflict() => {
                let existing = read_existing(lock_file).await;
                match existing {
                    Some(lock) if !lock.is_expired() => {
                        return Err(StorageError::lock(format!(
                            "store is locked by {} (pid {}) since {}",
                            lock.holder, lock.pid, lock.acquired_at
                        )))
                    }
                    stale => {
                        warn!(
                            holder = stale.as_ref().map(|l| l.holder.as_str()).unwrap_or("unknown"),
                            "Breaking stale store lock at {}",
                            lock_file.display()
                        );
                        break_stale(lock_file, stale.as_ref()).await?;
                        try_create(lock_file, holder, ttl).await.map_err(|e| {
                            if e.is_conflict() {
                                StorageError::lock("store lock was taken by another run")
                            } else {
                                e
                            }
                        })?
                    }
                }
            }
            other => other?,
        };

        let interval = ttl / 3;
        let heartbeat = (!interval.is_zero()).then(|| {
            tokio::spawn(heartbeat(lock_file.to_path_buf(), lock.clone(), interval))
        });
        Ok(Self {
            lock,
            lock_file: lock_file.to_path_buf(),
            heartbeat,
        })
    }

    /// Get the lock information
    pub fn lock_info(&self) -> &StoreLock {
        &self.lock
    }

    /// Check that the lock file still carries our token and has not expired
    pub async fn is_valid(&self) -> bool {
        matches!(
            read_existing(&self.lock_file).await,
            Some(lock) if lock.token == self.lock.token && !lock.is_expired()
        )
    }

    /// Explicitly release the lock
    ///
    /// Fails without touching the file when another run has taken it over.
    pub async fn release(mut self) -> StorageResult<()> {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        match read_existing(&self.lock_file).await {
            Some(lock) if lock.token == self.lock.token => {
                fs::remove_file(&self.lock_file)
                    .await
                    .map_err(|e| StorageError::lock(format!("Failed to release lock: {}", e)))?;
                Ok(())
            }
            Some(lock) => Err(StorageError::lock(format!(
                "lock was taken over by {} before release",
                lock.holder
            ))),
            None => Ok(()),
        }
    }
}

impl Drop for StoreLockGuard {
    fn drop(&mut self) {
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        let ours = std::fs::read(&self.lock_file)
            .ok()
            .and_then(|content| serde_json::from_slice::<StoreLock>(&content).ok())
            .is_some_and(|lock| lock.token == self.lock.token);
        if ours {
            let _ = std::fs::remove_file(&self.lock_file);
        }
    }
}

async fn try_create(lock_file: &Path, holder: &str, ttl: Duration) -> StorageResult<StoreLock> {
    match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_file)
        .await
    {
        Ok(mut file) => {
            let lock = StoreLock::new(holder.to_string(), ttl);
            file.write_all(&serde_json::to_vec(&lock)?).await?;
            file.sync_all().await?;
            debug!(holder, "Acquired store lock");
            Ok(lock)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Err(StorageError::conflict(
            format!("Lock already held: {}", lock_file.display()),
        )),
        Err(e) => Err(StorageError::Io(e)),
    }
}

async fn read_existing(lock_file: &Path) -> Option<StoreLock> {
    let content = fs::read(lock_file).await.ok()?;
    serde_json::from_slice(&content).ok()
}

fn sibling(lock_file: &Path, suffix: &str) -> PathBuf {
    let mut name = lock_file.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Move a stale lock out of the way, unless it changed since it was judged stale
async fn break_stale(lock_file: &Path, stale: Option<&StoreLock>) -> StorageResult<()> {
    let aside = sibling(lock_file, &format!(".stale-{}", Uuid::new_v4()));
    match fs::rename(lock_file, &aside).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }

    let moved = read_existing(&aside).await;
    let unchanged = match (stale, &moved) {
        (Some(stale), Some(moved)) => stale.token == moved.token && moved.is_expired(),
        (None, None) => true,
        _ => false,
    };
    if unchanged {
        fs::remove_file(&aside).await?;
        return Ok(());
    }

    // A live lock replaced the stale one before the rename; put it back
    let restored = fs::hard_link(&aside, lock_file).await;
    let _ = fs::remove_file(&aside).await;
    restored?;
    Err(StorageError::lock("store lock was taken by another run"))
}

/// Rewrite the lock record with a fresh heartbeat; false once it is no longer ours
async fn renew(lock_file: &Path, lock: &StoreLock) -> StorageResult<bool> {
    match read_existing(lock_file).await {
        Some(current) if current.token == lock.token => {}
        _ => return Ok(false),
    }

    let mut renewed = lock.clone();
    renewed.renewed_at = Some(Utc::now());
    let temp = sibling(lock_file, &format!(".{}.tmp", lock.token));
    let mut file = fs::File::create(&temp).await?;
    file.write_all(&serde_json::to_vec(&renewed)?).await?;
    file.sync_all().await?;
    fs::rename(&temp, lock_file).await?;
    Ok(true)
}

async fn heartbeat(lock_file: PathBuf, lock: StoreLock, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        match renew(&lock_file, &lock).await {
            Ok(true) => debug!(holder = %lock.holder, "Renewed store lock"),
            Ok(false) => {
                warn!(holder = %lock.holder, "Store lock was taken over; stopping renewal");
                return;
            }
            Err(e) => warn!(holder = %lock.holder, "Could not renew store lock: {}", e),
        }
    }
}
