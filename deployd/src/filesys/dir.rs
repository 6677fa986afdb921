//! Directory operations

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::errors::ServiceError;
use crate::filesys::file::File;

/// A directory wrapper with path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dir {
    path: PathBuf,
}

impl Dir {
    /// Create a new directory reference
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the directory path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Check if the directory exists
    pub async fn exists(&self) -> bool {
        fs::metadata(&self.path)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }

    /// Create the directory (and parents)
    pub async fn create(&self) -> Result<(), ServiceError> {
        fs::create_dir_all(&self.path).await?;
        Ok(())
    }

    /// Delete the directory and all contents
    pub async fn delete(&self) -> Result<(), ServiceError> {
        if self.exists().await {
            fs::remove_dir_all(&self.path).await?;
        }
        Ok(())
    }

    /// List files in the directory
    pub async fn list_files(&self) -> Result<Vec<PathBuf>, ServiceError> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                files.push(entry.path());
            }
        }

        Ok(files)
    }

    /// List subdirectories
    pub async fn list_dirs(&self) -> Result<Vec<PathBuf>, ServiceError> {
        let mut dirs = Vec::new();
        let mut entries = fs::read_dir(&self.path).await?;

        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                dirs.push(entry.path());
            }
        }

        Ok(dirs)
    }

    /// Get a file within this directory
    pub fn file(&self, name: &str) -> File {
        File::new(self.path.join(name))
    }

    /// Get a subdirectory
    pub fn subdir(&self, name: &str) -> Dir {
        Dir::new(self.path.join(name))
    }

    /// Recursively copy the contents of this directory into `dest`.
    ///
    /// `dest` is created if missing. Symlinks are followed.
    pub async fn copy_into(&self, dest: &Path) -> Result<u64, ServiceError> {
        let mut copied = 0;
        let mut pending = vec![(self.path.clone(), dest.to_path_buf())];

        while let Some((from, to)) = pending.pop() {
            fs::create_dir_all(&to).await?;
            let mut entries = fs::read_dir(&from).await?;

            while let Some(entry) = entries.next_entry().await? {
                let source = entry.path();
                let target = to.join(entry.file_name());
                if fs::metadata(&source).await?.is_dir() {
                    pending.push((source, target));
                } else {
                    fs::copy(&source, &target).await?;
                    copied += 1;
                }
            }
        }

        Ok(copied)
    }
}
