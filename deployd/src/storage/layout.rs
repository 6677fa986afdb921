//! Storage layout configuration

use std::path::PathBuf;

use crate::errors::ServiceError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::storage::settings::StorageSettings;

/// On-disk layout of the service
#[derive(Debug, Clone)]
pub struct StorageLayout {
    /// Base directory for all storage
    pub base_dir: PathBuf,

    publish_root: Option<PathBuf>,
    workspace_dir: Option<PathBuf>,
}

impl StorageLayout {
    /// Create a new storage layout
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            publish_root: None,
            workspace_dir: None,
        }
    }

    /// Apply path overrides from the settings file
    pub fn with_settings(settings: &StorageSettings) -> Self {
        let mut layout = match &settings.data_dir {
            Some(dir) => Self::new(dir),
            None => Self::default(),
        };
        layout.publish_root = settings.publish_root.clone();
        layout.workspace_dir = settings.workspace_dir.clone();
        layout
    }

    /// Get the settings file path
    pub fn settings_file(&self) -> File {
        File::new(self.base_dir.join("settings.json"))
    }

    /// One JSON record per deploy
    pub fn deploys_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("deploys"))
    }

    /// Fetched sources being built
    pub fn workspace_dir(&self) -> Dir {
        match &self.workspace_dir {
            Some(dir) => Dir::new(dir),
            None => Dir::new(self.base_dir.join("workspace")),
        }
    }

    /// Published sites
    pub fn publish_root(&self) -> Dir {
        match &self.publish_root {
            Some(dir) => Dir::new(dir),
            None => Dir::new(self.base_dir.join("sites")),
        }
    }

    /// Get the logs directory
    pub fn logs_dir(&self) -> Dir {
        Dir::new(self.base_dir.join("logs"))
    }

    /// Setup the storage layout (create directories)
    pub async fn setup(&self) -> Result<(), ServiceError> {
        self.deploys_dir().create().await?;
        self.workspace_dir().create().await?;
        self.publish_root().create().await?;
        self.logs_dir().create().await?;
        Ok(())
    }
}

impl Default for StorageLayout {
    fn default() -> Self {
        #[cfg(target_os = "linux")]
        let base_dir = PathBuf::from("/var/lib/deployd");

        #[cfg(not(target_os = "linux"))]
        let base_dir = PathBuf::from(".deployd");

        Self::new(base_dir)
    }
}
