//! Deploy service facade
//!
//! The entry point the HTTP layer talks to. Submitting a deploy records it in
//! the ledger and spawns one task that runs it through the orchestrator;
//! reads go straight to the ledger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info};

use crate::deploy::orchestrator::Orchestrator;
use crate::errors::ServiceError;
use crate::ledger::Ledger;
use crate::models::deploy::{
    Deploy, DeployFilter, DeployHistoryEntry, DeployId, DeploySpec, DeploySummary, RequestContext,
};

type Runs = Arc<Mutex<HashMap<DeployId, RunHandle>>>;

struct RunHandle {
    cancel_tx: watch::Sender<bool>,
    finished_rx: watch::Receiver<bool>,
}

/// Removes the run handle and signals waiters when the run task ends, panics included
struct RunGuard {
    id: DeployId,
    runs: Runs,
    finished_tx: watch::Sender<bool>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        runs.remove(&self.id);
        self.finished_tx.send_replace(true);
    }
}

pub struct DeployService {
    orchestrator: Arc<Orchestrator>,
    runs: Runs,
    permits: Option<Arc<Semaphore>>,
    accepting: AtomicBool,
}

impl DeployService {
    /// Create the facade; `max_concurrent` of `None` or zero runs every deploy at once
    pub fn new(orchestrator: Arc<Orchestrator>, max_concurrent: Option<usize>) -> Self {
        Self {
            orchestrator,
            runs: Arc::new(Mutex::new(HashMap::new())),
            permits: max_concurrent
                .filter(|n| *n > 0)
                .map(|n| Arc::new(Semaphore::new(n))),
            accepting: AtomicBool::new(true),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        self.orchestrator.ledger()
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Record a deploy and start running it in the background
    pub async fn submit(
        &self,
        spec: DeploySpec,
        context: &RequestContext,
    ) -> Result<DeployId, ServiceError> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ServiceError::ShutdownError(
                "service is shutting down".to_string(),
            ));
        }

        let deploy = self.ledger().create_deploy(spec, context).await?;
        let id = deploy.id;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (finished_tx, finished_rx) = watch::channel(false);
        {
            let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.insert(id, RunHandle { cancel_tx, finished_rx });
        }
        let guard = RunGuard {
            id,
            runs: self.runs.clone(),
            finished_tx,
        };

        let orchestrator = self.orchestrator.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let _guard = guard;
            let mut cancel_rx = cancel_rx;

            let _permit = match permits {
                Some(permits) => acquire(permits, &mut cancel_rx).await,
                None => None,
            };

            match orchestrator.run(id, cancel_rx).await {
                Ok(status) => debug!(deploy_id = %id, "Run finished as {}", status),
                Err(e) => error!(deploy_id = %id, "Run aborted: {}", e),
            }
        });

        Ok(id)
    }

    /// Summary with per-command status
    pub async fn get_status(&self, id: DeployId) -> Result<DeploySummary, ServiceError> {
        let deploy = self.ledger().get_deploy(id).await?;
        Ok(DeploySummary::from(&deploy))
    }

    /// Full deploy including history
    pub async fn get_deploy(&self, id: DeployId) -> Result<Deploy, ServiceError> {
        self.ledger().get_deploy(id).await
    }

    /// Audit trail in the order it was written
    pub async fn get_history(&self, id: DeployId) -> Result<Vec<DeployHistoryEntry>, ServiceError> {
        let deploy = self.ledger().get_deploy(id).await?;
        Ok(deploy.history)
    }

    /// Summaries matching `filter`, newest first
    pub async fn list(&self, filter: &DeployFilter) -> Vec<DeploySummary> {
        self.ledger()
            .list_deploys(filter)
            .await
            .iter()
            .map(DeploySummary::from)
            .collect()
    }

    /// Ask a pending or running deploy to stop
    pub async fn cancel(&self, id: DeployId) -> Result<(), ServiceError> {
        let deploy = self.ledger().get_deploy(id).await?;
        if deploy.is_terminal() {
            return Err(ServiceError::Conflict(format!(
                "deploy {} already {}",
                id, deploy.status
            )));
        }

        {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(handle) = runs.get(&id) {
                handle.cancel_tx.send_replace(true);
                info!(deploy_id = %id, "Cancel requested");
                return Ok(());
            }
        }

        // No task will finish this deploy, so close it here
        let message = "deploy cancelled: no active run".to_string();
        if self.ledger().abort_run(id, message).await? {
            info!(deploy_id = %id, "Cancelled deploy without a run");
            return Ok(());
        }
        let deploy = self.ledger().get_deploy(id).await?;
        Err(ServiceError::Conflict(format!(
            "deploy {} already {}",
            id, deploy.status
        )))
    }

    /// Wait until the deploy's run task has ended, then return its summary
    pub async fn wait(&self, id: DeployId) -> Result<DeploySummary, ServiceError> {
        let finished = {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.get(&id).map(|h| h.finished_rx.clone())
        };
        if let Some(mut finished) = finished {
            let _ = finished.wait_for(|done| *done).await;
        }
        self.get_status(id).await
    }

    /// Number of deploys with a live run task
    pub fn running_count(&self) -> usize {
        self.runs.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Stop accepting deploys, cancel every run and wait for them to end
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);

        let finished: Vec<watch::Receiver<bool>> = {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            runs.values()
                .map(|handle| {
                    handle.cancel_tx.send_replace(true);
                    handle.finished_rx.clone()
                })
                .collect()
        };

        info!("Cancelling {} running deploys", finished.len());
        join_all(finished.into_iter().map(|mut rx| async move {
            let _ = rx.wait_for(|done| *done).await;
        }))
        .await;
    }
}

/// Wait for a concurrency permit, giving up if the deploy is cancelled first
async fn acquire(
    permits: Arc<Semaphore>,
    cancel: &mut watch::Receiver<bool>,
) -> Option<OwnedSemaphorePermit> {
    let cancelled = async {
        let closed = cancel.wait_for(|c| *c).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        permit = permits.acquire_owned() => permit.ok(),
        _ = cancelled => None,
    }
}
