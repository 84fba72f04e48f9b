//! Local file storage.
//!
//! Backs both the media root (where locally hosted assets live) and the
//! scratch directory used for short-lived downloads.

use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use crate::{AppError, AppResult, IdGenerator};

/// Stored file metadata.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Storage key (path relative to the storage root).
    pub key: String,
    /// Absolute path on disk.
    pub path: PathBuf,
    /// File size in bytes.
    pub size: u64,
}

/// File storage trait.
#[async_trait::async_trait]
pub trait FileStore: Send + Sync {
    /// Write a file, replacing any existing content.
    async fn write(&self, key: &str, data: &[u8]) -> AppResult<StoredFile>;

    /// Read a file.
    async fn read(&self, key: &str) -> AppResult<Vec<u8>>;

    /// Delete a file. Deleting a missing file is not an error.
    async fn delete(&self, key: &str) -> AppResult<()>;

    /// Check if a file exists.
    async fn exists(&self, key: &str) -> AppResult<bool>;
}

/// Local filesystem storage backend.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
}

impl LocalStorage {
    /// Create a new local storage backend.
    #[must_use]
    pub const fn new(base_path: PathBuf) -> Self {
        Self { base_path }
    }

    /// Root directory of this storage.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve(&self, key: &str) -> AppResult<PathBuf> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)));
        if key.is_empty() || escapes {
            return Err(AppError::Validation(format!("Invalid storage key: {key}")));
        }
        Ok(self.base_path.join(relative))
    }

    /// Delete top-level files whose modification time is older than `max_age`.
    ///
    /// Returns the number of removed files.
    pub async fn sweep_older_than(&self, max_age: Duration) -> AppResult<u64> {
        let mut entries = match tokio::fs::read_dir(&self.base_path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };

        let now = SystemTime::now();
        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            let age = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .unwrap_or_default();
            if age >= max_age {
                tokio::fs::remove_file(entry.path()).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[async_trait::async_trait]
impl FileStore for LocalStorage {
    async fn write(&self, key: &str, data: &[u8]) -> AppResult<StoredFile> {
        let path = self.resolve(key)?;

        // Create parent directories if needed
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| AppError::Storage(format!("Failed to create directory: {e}")))?;
        }

        tokio::fs::write(&path, data)
            .await
            .map_err(|e| AppError::Storage(format!("Failed to write file: {e}")))?;

        Ok(StoredFile {
            key: key.to_string(),
            path,
            size: data.len() as u64,
        })
    }

    async fn read(&self, key: &str) -> AppResult<Vec<u8>> {
        let path = self.resolve(key)?;
        tokio::fs::read(&path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                AppError::NotFound(format!("File {key} not found"))
            } else {
                AppError::Storage(format!("Failed to read file: {e}"))
            }
        })
    }

    async fn delete(&self, key: &str) -> AppResult<()> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AppError::Storage(format!("Failed to delete file: {e}"))),
        }
    }

    async fn exists(&self, key: &str) -> AppResult<bool> {
        let path = self.resolve(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }
}

/// Generate a unique flat key for a scratch file.
#[must_use]
pub fn scratch_key(extension: &str) -> String {
    let extension = Some(extension)
        .filter(|ext| !ext.is_empty() && ext.len() <= 10)
        .filter(|ext| ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("bin");

    format!("{}.{}", IdGenerator::new().generate(), extension)
}
