//! Local filesystem backend.

use std::path::{Path, PathBuf};

use serde_json::Value;
use tokio::fs;

use super::{Backend, FileSize, SizeInfo};
use crate::codec::{self, PLAIN_EXT};
use crate::error::{Result, StorageError};

/// Stores each record as `<root>/<key>.json`.
///
/// Writes overwrite the file directly. I/O failures are surfaced immediately;
/// local disk errors are not assumed to be transient.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create the backend, creating `root` if it doesn't exist.
    pub async fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root).await?;
        tracing::info!("Local storage initialized at: {}", root.display());
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_to_path(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}{PLAIN_EXT}"))
    }

    /// Record files in the root, as `(file name, size)` pairs.
    async fn record_files(&self) -> Result<Vec<(String, u64)>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !name.ends_with(PLAIN_EXT) || codec::key_from_name(&name).is_none() {
                continue;
            }
            let metadata = entry.metadata().await?;
            if metadata.is_file() {
                files.push((name, metadata.len()));
            }
        }

        Ok(files)
    }
}

#[async_trait::async_trait]
impl Backend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn set(&self, key: &str, value: &Value) -> Result<()> {
        let data = codec::encode_pretty(value)?;
        fs::write(self.key_to_path(key), data).await?;
        tracing::info!("Saved to local: {}", key);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Value>> {
        let data = match fs::read(self.key_to_path(key)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let value = codec::decode_plain(&data)?;
        tracing::info!("Loaded from local: {}", key);
        Ok(Some(value))
    }

    async fn remove(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.key_to_path(key)).await {
            Ok(()) => {
                tracing::info!("Removed from local: {}", key);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    async fn list(&self) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .record_files()
            .await?
            .iter()
            .filter_map(|(name, _)| codec::key_from_name(name).map(str::to_string))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn size(&self) -> Result<SizeInfo> {
        let entries = self
            .record_files()
            .await?
            .into_iter()
            .map(|(name, bytes)| FileSize { name, bytes })
            .collect();
        Ok(SizeInfo::from_entries(entries))
    }
}
