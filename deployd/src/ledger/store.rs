//! Deploy persistence

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::errors::ServiceError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::models::deploy::{Deploy, DeployId};

/// Storage for deploy aggregates
#[async_trait]
pub trait DeployStore: Send + Sync {
    /// Insert or replace a deploy
    async fn save(&self, deploy: &Deploy) -> Result<(), ServiceError>;

    /// Load every stored deploy
    async fn load_all(&self) -> Result<Vec<Deploy>, ServiceError>;
}

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    deploys: RwLock<HashMap<DeployId, Deploy>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.deploys.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl DeployStore for MemoryStore {
    async fn save(&self, deploy: &Deploy) -> Result<(), ServiceError> {
        let mut deploys = self.deploys.write().unwrap_or_else(|e| e.into_inner());
        deploys.insert(deploy.id, deploy.clone());
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Deploy>, ServiceError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        Ok(deploys.values().cloned().collect())
    }
}

/// One JSON document per deploy under a directory
pub struct JsonFileStore {
    dir: Dir,
}

impl JsonFileStore {
    /// Open the store, creating its directory
    pub async fn open(dir: Dir) -> Result<Self, ServiceError> {
        dir.create().await?;
        Ok(Self { dir })
    }

    fn file(&self, id: &DeployId) -> File {
        self.dir.file(&format!("{}.json", id))
    }
}

#[async_trait]
impl DeployStore for JsonFileStore {
    async fn save(&self, deploy: &Deploy) -> Result<(), ServiceError> {
        self.file(&deploy.id)
            .write_json_atomic(deploy)
            .await
            .map_err(|e| ServiceError::StorageError(format!("saving deploy {}: {}", deploy.id, e)))
    }

    async fn load_all(&self) -> Result<Vec<Deploy>, ServiceError> {
        let mut deploys = Vec::new();

        for path in self.dir.list_files().await? {
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match File::new(&path).read_json::<Deploy>().await {
                Ok(deploy) => deploys.push(deploy),
                Err(e) => warn!("Skipping unreadable deploy record {}: {}", path.display(), e),
            }
        }

        debug!("Loaded {} deploy records from {}", deploys.len(), self.dir.path().display());
        Ok(deploys)
    }
}
