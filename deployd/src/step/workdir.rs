//! Scoped working directory

use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::filesys::dir::Dir;

/// Working directory produced by a source fetch.
///
/// An owned directory is deleted by [`WorkingDirectory::release`], or on drop
/// when release never ran.
#[derive(Debug)]
pub struct WorkingDirectory {
    dir: Dir,
    owned: bool,
}

impl WorkingDirectory {
    /// Directory removed once released
    pub fn owned(path: impl Into<PathBuf>) -> Self {
        Self {
            dir: Dir::new(path),
            owned: true,
        }
    }

    /// Directory left in place on release
    pub fn borrowed(path: impl Into<PathBuf>) -> Self {
        Self {
            dir: Dir::new(path),
            owned: false,
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Delete the directory if owned
    pub async fn release(mut self) -> Result<(), ServiceError> {
        if !self.owned {
            return Ok(());
        }
        self.owned = false;
        debug!("Releasing working directory {}", self.dir.path().display());
        self.dir.delete().await
    }
}

impl Drop for WorkingDirectory {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        warn!(
            "Working directory {} dropped without release, removing",
            self.dir.path().display()
        );
        if let Err(e) = std::fs::remove_dir_all(self.dir.path()) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove {}: {}", self.dir.path().display(), e);
            }
        }
    }
}
