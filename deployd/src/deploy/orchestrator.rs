//! Deploy orchestrator
//!
//! Drives one deploy through fetch, its commands in ascending order, and
//! publish, writing every status change back to the ledger. The first failing
//! phase stops the run; commands that never started stay `Pending`.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::deploy::fsm::Status;
use crate::errors::ServiceError;
use crate::ledger::Ledger;
use crate::models::deploy::{Deploy, DeployCommand, DeployId};
use crate::step::{StepExecutor, WorkingDirectory};
use crate::utils::tail_lines;

/// Message recorded on a command interrupted by a cancel request
pub const CANCELLED_MESSAGE: &str = "cancelled";

/// Attempts at failing a deploy whose run stopped on a ledger error
const ABORT_ATTEMPTS: u32 = 3;

/// Pipeline tuning
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Limit for a single command, counted as a failed step when exceeded
    pub command_timeout: Option<Duration>,

    /// Limit for fetch plus all commands
    pub deploy_timeout: Option<Duration>,

    /// Output lines kept in command messages
    pub output_tail_lines: usize,

    /// Directory sites are published under
    pub publish_root: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            command_timeout: None,
            deploy_timeout: None,
            output_tail_lines: 20,
            publish_root: PathBuf::from("sites"),
        }
    }
}

/// Why a guarded step stopped before finishing
#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Cancelled,
    CommandTimeout(Duration),
    DeployDeadline,
}

pub struct Orchestrator {
    ledger: Arc<Ledger>,
    executor: Arc<dyn StepExecutor>,
    settings: PipelineSettings,
    active_workdirs: Mutex<HashSet<PathBuf>>,
}

impl Orchestrator {
    pub fn new(
        ledger: Arc<Ledger>,
        executor: Arc<dyn StepExecutor>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            ledger,
            executor,
            settings,
            active_workdirs: Mutex::new(HashSet::new()),
        }
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.ledger
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }

    /// Working directories held by runs in progress
    pub fn active_workdirs(&self) -> Vec<PathBuf> {
        let active = self.active_workdirs.lock().unwrap_or_else(|e| e.into_inner());
        active.iter().cloned().collect()
    }

    /// Run a pending deploy to a terminal status.
    ///
    /// Pipeline failures are recorded on the ledger and reported as
    /// `Ok(Status::Failed)`; `Err` means the ledger itself could not be updated.
    /// A run stopped that way still tries to leave the deploy `Failed`.
    pub async fn run(
        &self,
        id: DeployId,
        cancel: watch::Receiver<bool>,
    ) -> Result<Status, ServiceError> {
        match self.drive(id, cancel).await {
            Ok(status) => Ok(status),
            Err(e) => {
                self.abort(id, &e).await;
                Err(e)
            }
        }
    }

    /// Fail a deploy left unfinished by a ledger error, retrying the write
    async fn abort(&self, id: DeployId, cause: &ServiceError) {
        let message = format!("ledger: {}", cause);
        for attempt in 1..=ABORT_ATTEMPTS {
            match self.ledger.abort_run(id, message.clone()).await {
                Ok(aborted) => {
                    if aborted {
                        warn!(deploy_id = %id, "Deploy failed on ledger error: {}", cause);
                    }
                    return;
                }
                Err(ServiceError::NotFound(_)) => return,
                Err(e) => {
                    warn!(deploy_id = %id, attempt, "Failed to record aborted deploy: {}", e);
                    tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                }
            }
        }
        error!(deploy_id = %id, "Deploy left unfinished after ledger error: {}", cause);
    }

    async fn drive(
        &self,
        id: DeployId,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<Status, ServiceError> {
        let deadline = self.settings.deploy_timeout.map(|d| Instant::now() + d);
        let deploy = self.ledger.get_deploy(id).await?;

        self.ledger
            .set_deploy_status(id, Status::Running, Some("deploy started".to_string()))
            .await?;
        info!(deploy_id = %id, site = %deploy.site_name, "Deploy started");

        if *cancel.borrow() {
            return self.fail(id, "deploy cancelled before start").await;
        }

        let fetched = guarded(
            &mut cancel,
            deadline,
            None,
            self.executor.fetch_source(&deploy.repo_url, &deploy.branch),
        )
        .await;
        let workdir = match fetched {
            Ok(Ok(workdir)) => workdir,
            Ok(Err(e)) => return self.fail(id, format!("fetch: {}", e)).await,
            Err(Interrupt::DeployDeadline) => {
                return self.fail(id, "deploy timed out during fetch").await
            }
            Err(_) => return self.fail(id, "deploy cancelled during fetch").await,
        };
        debug!(deploy_id = %id, workdir = %workdir.path().display(), "Source fetched");

        self.track(&workdir, true);
        let outcome = self.run_steps(&deploy, &workdir, &mut cancel, deadline).await;
        self.track(&workdir, false);

        if let Err(e) = workdir.release().await {
            warn!(deploy_id = %id, "Failed to release working directory: {}", e);
        }
        outcome
    }

    async fn run_steps(
        &self,
        deploy: &Deploy,
        workdir: &WorkingDirectory,
        cancel: &mut watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<Status, ServiceError> {
        let id = deploy.id;

        for command in &deploy.commands {
            if *cancel.borrow() {
                return self
                    .fail(id, format!("deploy cancelled before step {}", command.order))
                    .await;
            }
            if let Some(failure) = self.run_command(id, command, workdir, cancel, deadline).await? {
                return self.fail(id, failure).await;
            }
        }

        // Publishing swaps the live site in place, so it is never interrupted
        if *cancel.borrow() {
            return self.fail(id, "deploy cancelled before publish").await;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return self.fail(id, "deploy timed out before publish").await;
        }

        let source = workdir.path().join(&deploy.build_output_path);
        let target = deploy.target_path(&self.settings.publish_root);
        if let Err(e) = self.executor.publish_output(&source, &target).await {
            return self.fail(id, format!("publish: {}", e)).await;
        }

        self.ledger
            .set_deploy_status(id, Status::Succeeded, Some("deploy succeeded".to_string()))
            .await?;
        info!(deploy_id = %id, target = %target.display(), "Deploy succeeded");
        Ok(Status::Succeeded)
    }

    /// Run one command, returning the deploy failure message if it did not succeed
    async fn run_command(
        &self,
        id: DeployId,
        command: &DeployCommand,
        workdir: &WorkingDirectory,
        cancel: &mut watch::Receiver<bool>,
        deadline: Option<Instant>,
    ) -> Result<Option<String>, ServiceError> {
        let order = command.order;
        self.ledger
            .update_command_status(id, order, Status::Running, None, Some(Utc::now()))
            .await?;
        debug!(deploy_id = %id, order, cmd = %command.command_text, "Running step");

        let result = guarded(
            cancel,
            deadline,
            self.settings.command_timeout,
            self.executor.execute_command(
                &command.command_text,
                workdir,
                command.terminal_id.as_deref(),
            ),
        )
        .await;

        let (status, message, failure) = match result {
            Ok(Ok(step)) if step.succeeded() => {
                debug!(deploy_id = %id, order, duration_ms = step.duration_ms, "Step succeeded");
                let tail = tail_lines(&step.stdout, self.settings.output_tail_lines);
                (Status::Succeeded, non_empty(tail), None)
            }
            Ok(Ok(step)) => {
                let tail = tail_lines(&step.stderr, self.settings.output_tail_lines);
                let exited = format!("exited with code {}", step.exit_code);
                let message = non_empty(tail).unwrap_or_else(|| exited.clone());
                (
                    Status::Failed,
                    Some(message),
                    Some(format!("step {} failed: {}", order, exited)),
                )
            }
            Ok(Err(e)) => (
                Status::Failed,
                Some(e.to_string()),
                Some(format!("step {} failed: {}", order, e)),
            ),
            Err(Interrupt::CommandTimeout(limit)) => {
                let timed_out = format!("timed out after {:?}", limit);
                (
                    Status::Failed,
                    Some(timed_out.clone()),
                    Some(format!("step {} failed: {}", order, timed_out)),
                )
            }
            Err(Interrupt::DeployDeadline) => (
                Status::Failed,
                Some("deploy deadline exceeded".to_string()),
                Some(format!("deploy timed out during step {}", order)),
            ),
            Err(Interrupt::Cancelled) => (
                Status::Failed,
                Some(CANCELLED_MESSAGE.to_string()),
                Some(format!("deploy cancelled during step {}", order)),
            ),
        };

        self.ledger
            .update_command_status(id, order, status, message, None)
            .await?;
        Ok(failure)
    }

    async fn fail(&self, id: DeployId, message: impl Into<String>) -> Result<Status, ServiceError> {
        let message = message.into();
        warn!(deploy_id = %id, "Deploy failed: {}", message);
        self.ledger
            .set_deploy_status(id, Status::Failed, Some(message))
            .await?;
        Ok(Status::Failed)
    }

    fn track(&self, workdir: &WorkingDirectory, active: bool) {
        let mut workdirs = self.active_workdirs.lock().unwrap_or_else(|e| e.into_inner());
        if active {
            workdirs.insert(workdir.path().to_path_buf());
        } else {
            workdirs.remove(workdir.path());
        }
    }
}

/// Await `step` unless a cancel request, the command timeout, or the deploy
/// deadline comes first. Dropping `step` kills any child process it spawned.
async fn guarded<F: Future>(
    cancel: &mut watch::Receiver<bool>,
    deadline: Option<Instant>,
    timeout: Option<Duration>,
    step: F,
) -> Result<F::Output, Interrupt> {
    let mut limit = deadline.map(|at| (at, Interrupt::DeployDeadline));
    if let Some(timeout) = timeout {
        let at = Instant::now() + timeout;
        if limit.is_none_or(|(current, _)| at < current) {
            limit = Some((at, Interrupt::CommandTimeout(timeout)));
        }
    }

    let expired = async move {
        match limit {
            Some((at, interrupt)) => {
                tokio::time::sleep_until(at).await;
                interrupt
            }
            None => std::future::pending().await,
        }
    };
    let cancelled = async {
        let closed = cancel.wait_for(|c| *c).await.is_err();
        if closed {
            // No sender left, nobody can cancel
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        biased;
        output = step => Ok(output),
        _ = cancelled => Err(Interrupt::Cancelled),
        interrupt = expired => Err(interrupt),
    }
}

fn non_empty(text: String) -> Option<String> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}
