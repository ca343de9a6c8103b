//! Storage backend implementations

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::FileStore;
pub use memory::MemoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresStore;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::error::StorageResult;

/// Read a JSON document
pub(crate) async fn read_json<T: DeserializeOwned>(path: &Path) -> StorageResult<T> {
    let content = fs::read_to_string(path).await?;
    Ok(serde_json::from_str(&content)?)
}

/// Write a pretty JSON document via temp file + rename
pub(crate) async fn write_json_atomic<T: Serialize>(path: &Path, data: &T) -> StorageResult<()> {
    let content = serde_json::to_vec_pretty(data)?;
    write_atomic(path, &content).await
}

/// Replace `path` with `content` so that a crash leaves either the old or the
/// new file, never an empty one
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> StorageResult<()> {
    let parent = path.parent().filter(|p| !p.as_os_str().is_empty());
    if let Some(parent) = parent {
        fs::create_dir_all(parent).await?;
    }
    let mut temp = path.as_os_str().to_owned();
    temp.push(".tmp");

    let mut file = fs::File::create(&temp).await?;
    file.write_all(content).await?;
    file.sync_all().await?;
    drop(file);
    fs::rename(&temp, path).await?;

    // Persist the rename itself
    #[cfg(unix)]
    {
        if let Some(parent) = parent {
            fs::File::open(parent).await?.sync_all().await?;
        }
    }
    Ok(())
}

/// Shallow-merge `extra` into a run's metadata object
pub(crate) fn merge_metadata(target: &mut Value, extra: &Value) {
    match (target.as_object_mut(), extra.as_object()) {
        (Some(into), Some(from)) => {
            for (key, value) in from {
                into.insert(key.clone(), value.clone());
            }
        }
        _ if !extra.is_null() => *target = extra.clone(),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_atomic_write_replaces_document() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("doc.json");

        write_json_atomic(&path, &json!({"version": 1})).await.unwrap();
        write_json_atomic(&path, &json!({"version": 2})).await.unwrap();

        let doc: Value = read_json(&path).await.unwrap();
        assert_eq!(doc["version"], 2);
        assert!(!temp.path().join("nested").join("doc.json.tmp").exists());
    }
}
