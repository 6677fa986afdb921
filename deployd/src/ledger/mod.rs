//! Command ledger
//!
//! Holds every deploy with its ordered commands and audit history. Each deploy
//! sits behind its own async mutex; the id map is only locked long enough to
//! look an entry up or insert one, so deploys never contend with each other.
//! Every mutation is applied to a copy, stamped, flushed to the store, and
//! only then made visible.

pub mod store;

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::deploy::fsm::Status;
use crate::errors::ServiceError;
use crate::ledger::store::{DeployStore, MemoryStore};
use crate::models::deploy::{
    Deploy, DeployFilter, DeployHistoryEntry, DeployId, DeploySpec, RequestContext,
};

/// Message recorded on deploys found mid-run at startup
pub const INTERRUPTED_MESSAGE: &str = "interrupted by service restart";

/// Message recorded on deploys found at startup that never started
pub const NOT_STARTED_MESSAGE: &str = "not started before service restart";

/// Deploy ledger
pub struct Ledger {
    deploys: RwLock<HashMap<DeployId, Arc<Mutex<Deploy>>>>,
    store: Arc<dyn DeployStore>,
}

impl Ledger {
    /// Create an empty ledger writing through to `store`
    pub fn new(store: Arc<dyn DeployStore>) -> Self {
        Self {
            deploys: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Create an empty ledger without durable storage
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    /// Load every stored deploy, closing the ones a previous run left unfinished
    pub async fn restore(store: Arc<dyn DeployStore>) -> Result<Self, ServiceError> {
        let ledger = Self::new(store.clone());
        let mut restored = 0;

        for mut deploy in store.load_all().await? {
            if !deploy.is_terminal() {
                warn!(deploy_id = %deploy.id, status = %deploy.status, "Closing interrupted deploy");
                close_interrupted(&mut deploy)?;
                store.save(&deploy).await?;
            }
            ledger.insert(deploy);
            restored += 1;
        }

        info!("Restored {} deploys", restored);
        Ok(ledger)
    }

    /// Validate and store a new pending deploy
    pub async fn create_deploy(
        &self,
        spec: DeploySpec,
        context: &RequestContext,
    ) -> Result<Deploy, ServiceError> {
        let deploy = Deploy::new(spec, context)?;
        self.store.save(&deploy).await?;
        self.insert(deploy.clone());

        info!(
            deploy_id = %deploy.id,
            site = %deploy.site_name,
            commands = deploy.commands.len(),
            "Deploy created"
        );
        Ok(deploy)
    }

    /// Snapshot of one deploy
    pub async fn get_deploy(&self, id: DeployId) -> Result<Deploy, ServiceError> {
        let entry = self.entry(id)?;
        let deploy = entry.lock().await;
        Ok(deploy.clone())
    }

    /// Snapshots matching `filter`, newest first
    pub async fn list_deploys(&self, filter: &DeployFilter) -> Vec<Deploy> {
        let entries: Vec<Arc<Mutex<Deploy>>> = {
            let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
            deploys.values().cloned().collect()
        };

        let mut matching = Vec::new();
        for entry in entries {
            let deploy = entry.lock().await;
            if filter.matches(&deploy) {
                matching.push(deploy.clone());
            }
        }
        matching.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matching
    }

    /// Move one command along the state machine
    pub async fn update_command_status(
        &self,
        id: DeployId,
        order: u32,
        status: Status,
        message: Option<String>,
        executed_at: Option<DateTime<Utc>>,
    ) -> Result<(), ServiceError> {
        self.mutate(id, |deploy| {
            let command = deploy.command_mut(order).ok_or_else(|| {
                ServiceError::NotFound(format!("deploy {} has no command with order {}", id, order))
            })?;

            command.status = command.status.transition(status).map_err(|e| {
                invalid_transition(format!("command {} of deploy {}: {}", order, id, e))
            })?;
            if message.is_some() {
                command.message = message;
            }
            if executed_at.is_some() {
                command.executed_at = executed_at;
            }
            Ok(())
        })
        .await
    }

    /// Append an audit entry
    pub async fn append_history(
        &self,
        id: DeployId,
        status: Status,
        message: Option<String>,
    ) -> Result<(), ServiceError> {
        self.mutate(id, |deploy| {
            deploy.history.push(DeployHistoryEntry {
                occurred_at: Utc::now(),
                status,
                message,
            });
            Ok(())
        })
        .await
    }

    /// Change the aggregate status and record it in the history, atomically
    pub(crate) async fn set_deploy_status(
        &self,
        id: DeployId,
        status: Status,
        message: Option<String>,
    ) -> Result<(), ServiceError> {
        self.mutate(id, |deploy| {
            let next = deploy
                .status
                .transition(status)
                .map_err(|e| invalid_transition(format!("deploy {}: {}", id, e)))?;

            if next == Status::Succeeded
                && deploy.commands.iter().any(|c| c.status != Status::Succeeded)
            {
                return Err(invalid_transition(format!(
                    "deploy {} cannot succeed with unfinished commands",
                    id
                )));
            }
            if next == Status::Failed && message.as_deref().is_none_or(|m| m.trim().is_empty()) {
                return Err(invalid_transition(format!(
                    "deploy {} cannot fail without a message",
                    id
                )));
            }

            deploy.status = next;
            deploy.message = message.clone();
            deploy.history.push(DeployHistoryEntry {
                occurred_at: Utc::now(),
                status: next,
                message,
            });
            Ok(())
        })
        .await
    }

    /// Fail a deploy that no run will finish, along with its running command.
    ///
    /// Returns `false` without writing when the deploy is already terminal.
    pub(crate) async fn abort_run(
        &self,
        id: DeployId,
        message: String,
    ) -> Result<bool, ServiceError> {
        if self.get_deploy(id).await?.is_terminal() {
            return Ok(false);
        }
        self.mutate(id, |deploy| {
            if deploy.is_terminal() {
                return Ok(false);
            }
            fail_unfinished(deploy, &message)?;
            Ok(true)
        })
        .await
    }

    fn insert(&self, deploy: Deploy) {
        let mut deploys = self.deploys.write().unwrap_or_else(|e| e.into_inner());
        deploys.insert(deploy.id, Arc::new(Mutex::new(deploy)));
    }

    fn entry(&self, id: DeployId) -> Result<Arc<Mutex<Deploy>>, ServiceError> {
        let deploys = self.deploys.read().unwrap_or_else(|e| e.into_inner());
        deploys
            .get(&id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(format!("deploy {}", id)))
    }

    async fn mutate<R, F>(&self, id: DeployId, apply: F) -> Result<R, ServiceError>
    where
        F: FnOnce(&mut Deploy) -> Result<R, ServiceError>,
    {
        let entry = self.entry(id)?;
        let mut deploy = entry.lock().await;

        let mut updated = deploy.clone();
        let result = apply(&mut updated)?;
        updated.touch();
        self.store.save(&updated).await?;

        *deploy = updated;
        Ok(result)
    }
}

fn invalid_transition(message: String) -> ServiceError {
    error!("Invalid transition: {}", message);
    ServiceError::InvalidTransition(message)
}

fn close_interrupted(deploy: &mut Deploy) -> Result<(), ServiceError> {
    let started = deploy.status != Status::Pending
        || deploy.commands.iter().any(|c| c.status != Status::Pending);
    let message = if started {
        INTERRUPTED_MESSAGE
    } else {
        NOT_STARTED_MESSAGE
    };
    fail_unfinished(deploy, message)?;
    deploy.touch();
    Ok(())
}

/// Walk an unfinished deploy to `Failed` through the state machine, failing
/// its running command on the way. Commands that never ran stay `Pending`.
fn fail_unfinished(deploy: &mut Deploy, message: &str) -> Result<(), ServiceError> {
    let id = deploy.id;
    for command in deploy
        .commands
        .iter_mut()
        .filter(|c| c.status == Status::Running)
    {
        command.status = command.status.transition(Status::Failed).map_err(|e| {
            invalid_transition(format!("command {} of deploy {}: {}", command.order, id, e))
        })?;
        command.message = Some(message.to_string());
    }

    let mut steps = vec![Status::Failed];
    if deploy.status == Status::Pending {
        steps.insert(0, Status::Running);
    }
    for next in steps {
        deploy.status = deploy
            .status
            .transition(next)
            .map_err(|e| invalid_transition(format!("deploy {}: {}", id, e)))?;
        deploy.history.push(DeployHistoryEntry {
            occurred_at: Utc::now(),
            status: next,
            message: Some(message.to_string()),
        });
    }
    deploy.message = Some(message.to_string());
    Ok(())
}
