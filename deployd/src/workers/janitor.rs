//! Workspace janitor for stale working directories

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::fs;
use tracing::{debug, error, info, warn};

use crate::deploy::Orchestrator;
use crate::errors::ServiceError;
use crate::filesys::dir::Dir;

/// Janitor worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Sweep interval
    pub interval: Duration,

    /// Age after which an unowned working directory is removed
    pub max_age: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(600),
            max_age: Duration::from_secs(6 * 3600),
        }
    }
}

/// Run the janitor worker
pub async fn run<S, F>(
    options: &Options,
    workspace: &Dir,
    orchestrator: Arc<Orchestrator>,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Janitor worker starting...");

    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Janitor worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }

        let active = orchestrator.active_workdirs();
        match sweep_stale(workspace, options.max_age, &active).await {
            Ok(0) => debug!("No stale working directories"),
            Ok(removed) => info!("Removed {} stale working directories", removed),
            Err(e) => error!("Workspace sweep failed: {}", e),
        }
    }
}

/// Remove directories under `workspace` older than `max_age`, skipping `active` ones
pub async fn sweep_stale(
    workspace: &Dir,
    max_age: Duration,
    active: &[PathBuf],
) -> Result<usize, ServiceError> {
    if !workspace.exists().await {
        return Ok(0);
    }

    let now = SystemTime::now();
    let mut removed = 0;

    for path in workspace.list_dirs().await? {
        if active.contains(&path) {
            continue;
        }

        let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                warn!("Cannot read age of {}: {}", path.display(), e);
                continue;
            }
        };
        // Clock skew reads as zero age
        let age = now.duration_since(modified).unwrap_or_default();
        if age < max_age {
            continue;
        }

        match Dir::new(&path).delete().await {
            Ok(()) => {
                debug!("Removed stale working directory {}", path.display());
                removed += 1;
            }
            Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
        }
    }

    Ok(removed)
}
