//! File operations

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use crate::errors::ServiceError;

/// A file wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct File {
    path: PathBuf,
}

impl File {
    /// Create a new file reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the file exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path).await.is_ok()
    }

    /// Read file contents as string
    pub async fn read_string(&self) -> Result<String, ServiceError> {
        Ok(fs::read_to_string(&self.path).await?)
    }

    /// Read file as JSON
    pub async fn read_json<T: DeserializeOwned>(&self) -> Result<T, ServiceError> {
        let contents = self.read_string().await?;
        let value = serde_json::from_str(&contents)?;
        Ok(value)
    }

    /// Write string to file
    pub async fn write_string(&self, contents: &str) -> Result<(), ServiceError> {
        self.ensure_parent().await?;

        let mut file = fs::File::create(&self.path).await?;
        file.write_all(contents.as_bytes()).await?;
        file.sync_all().await?;
        Ok(())
    }

    /// Atomic write using a temporary file
    pub async fn write_atomic(&self, contents: &[u8]) -> Result<(), ServiceError> {
        self.ensure_parent().await?;
        let temp_path = self.path.with_extension("tmp");

        // Write to temp file
        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(contents).await?;
        file.sync_all().await?;
        drop(file);

        // Rename to target
        fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    /// Atomically write JSON to file
    pub async fn write_json_atomic<T: Serialize>(&self, value: &T) -> Result<(), ServiceError> {
        let contents = serde_json::to_vec_pretty(value)?;
        self.write_atomic(&contents).await
    }

    /// Delete the file
    pub async fn delete(&self) -> Result<(), ServiceError> {
        if self.exists().await {
            fs::remove_file(&self.path).await?;
        }
        Ok(())
    }

    async fn ensure_parent(&self) -> Result<(), ServiceError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(())
    }
}
