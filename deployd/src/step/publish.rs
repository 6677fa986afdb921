//! Directory publisher
//!
//! Copies build output next to the hosting target and swaps it in, so a
//! failed copy never leaves a half-written site behind.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::filesys::dir::Dir;
use crate::step::{PublishReason, StepError};

/// Marker file that blocks publishing into a target
pub const LOCK_FILE: &str = ".deploy.lock";

/// Publishes a build output directory to a target path
#[derive(Debug, Clone, Default)]
pub struct DirectoryPublisher;

impl DirectoryPublisher {
    pub fn new() -> Self {
        Self
    }

    pub async fn publish(&self, source: &Path, target: &Path) -> Result<(), StepError> {
        info!("Publishing {} to {}", source.display(), target.display());

        match fs::metadata(source).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(StepError::publish(
                    PublishReason::MissingOutput,
                    format!("build output is not a directory: {}", source.display()),
                ))
            }
            Err(_) => {
                return Err(StepError::publish(
                    PublishReason::MissingOutput,
                    format!("build output not found: {}", source.display()),
                ))
            }
        }

        let target_exists = match fs::metadata(target).await {
            Ok(meta) if meta.is_dir() => true,
            Ok(_) => {
                return Err(StepError::publish(
                    PublishReason::PathConflict,
                    format!("target exists and is not a directory: {}", target.display()),
                ))
            }
            Err(_) => false,
        };

        if fs::metadata(target.join(LOCK_FILE)).await.is_ok() {
            return Err(StepError::publish(
                PublishReason::Locked,
                format!("{} holds {}", target.display(), LOCK_FILE),
            ));
        }

        let (parent, name) = split_target(target)?;
        fs::create_dir_all(&parent)
            .await
            .map_err(|e| io_failure(e, &parent))?;

        let staging = parent.join(format!(".{}.staging-{}", name, Uuid::new_v4()));
        let result = self.swap_in(source, &staging, target, target_exists, &parent, &name).await;
        if result.is_err() {
            if let Err(e) = Dir::new(&staging).delete().await {
                warn!("Failed to remove staging dir {}: {}", staging.display(), e);
            }
        }
        result
    }

    async fn swap_in(
        &self,
        source: &Path,
        staging: &Path,
        target: &Path,
        target_exists: bool,
        parent: &Path,
        name: &str,
    ) -> Result<(), StepError> {
        let copied = Dir::new(source)
            .copy_into(staging)
            .await
            .map_err(|e| service_failure(e, staging))?;
        debug!("Staged {} files in {}", copied, staging.display());

        if !target_exists {
            return fs::rename(staging, target)
                .await
                .map_err(|e| io_failure(e, target));
        }

        let previous = parent.join(format!(".{}.previous-{}", name, Uuid::new_v4()));
        fs::rename(target, &previous)
            .await
            .map_err(|e| io_failure(e, target))?;

        if let Err(e) = fs::rename(staging, target).await {
            // Put the previous release back
            if let Err(restore) = fs::rename(&previous, target).await {
                warn!("Failed to restore {}: {}", target.display(), restore);
            }
            return Err(io_failure(e, target));
        }

        if let Err(e) = fs::remove_dir_all(&previous).await {
            warn!("Failed to remove previous release {}: {}", previous.display(), e);
        }
        Ok(())
    }
}

fn split_target(target: &Path) -> Result<(PathBuf, String), StepError> {
    match (target.parent(), target.file_name()) {
        (Some(parent), Some(name)) => Ok((parent.to_path_buf(), name.to_string_lossy().into_owned())),
        _ => Err(StepError::publish(
            PublishReason::PathConflict,
            format!("invalid target path: {}", target.display()),
        )),
    }
}

fn io_failure(err: std::io::Error, path: &Path) -> StepError {
    let reason = match err.kind() {
        ErrorKind::PermissionDenied => PublishReason::PermissionDenied,
        ErrorKind::AlreadyExists | ErrorKind::NotADirectory | ErrorKind::DirectoryNotEmpty => {
            PublishReason::PathConflict
        }
        _ => PublishReason::Other,
    };
    StepError::publish(reason, format!("{}: {}", path.display(), err))
}

fn service_failure(err: ServiceError, path: &Path) -> StepError {
    match err {
        ServiceError::IoError(e) => io_failure(e, path),
        other => StepError::publish(PublishReason::Other, format!("{}: {}", path.display(), other)),
    }
}
