//! Step executor adapter
//!
//! Uniform contract over the three collaborators a deploy needs: fetching
//! source, running a command, and publishing build output. A non-zero exit
//! code is a normal [`StepResult`]; [`StepError`] is reserved for a
//! collaborator that could not do its job at all.

pub mod git;
pub mod local;
pub mod process;
pub mod publish;
pub mod shell;
pub mod workdir;

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use local::{LocalExecutorOptions, LocalStepExecutor};
pub use workdir::WorkingDirectory;

/// Outcome of running one command to completion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl StepResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Why a source fetch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchReason {
    Auth,
    NotFound,
    Network,
    Other,
}

impl fmt::Display for FetchReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            FetchReason::Auth => "authentication",
            FetchReason::NotFound => "not found",
            FetchReason::Network => "network",
            FetchReason::Other => "error",
        })
    }
}

/// Why a publish failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishReason {
    Locked,
    PermissionDenied,
    PathConflict,
    MissingOutput,
    Other,
}

impl fmt::Display for PublishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            PublishReason::Locked => "target locked",
            PublishReason::PermissionDenied => "permission denied",
            PublishReason::PathConflict => "path conflict",
            PublishReason::MissingOutput => "missing build output",
            PublishReason::Other => "error",
        })
    }
}

/// Collaborator failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StepError {
    #[error("could not fetch source ({reason}): {message}")]
    Fetch { reason: FetchReason, message: String },

    /// The process could not be started at all
    #[error("could not start command: {0}")]
    Execution(String),

    #[error("could not publish output ({reason}): {message}")]
    Publish {
        reason: PublishReason,
        message: String,
    },
}

impl StepError {
    pub fn fetch(reason: FetchReason, message: impl Into<String>) -> Self {
        StepError::Fetch {
            reason,
            message: message.into(),
        }
    }

    pub fn publish(reason: PublishReason, message: impl Into<String>) -> Self {
        StepError::Publish {
            reason,
            message: message.into(),
        }
    }
}

/// Boundary to the fetch / run / publish collaborators
#[async_trait]
pub trait StepExecutor: Send + Sync {
    /// Check out `branch` of `repo_url` into a fresh working directory
    async fn fetch_source(&self, repo_url: &str, branch: &str)
        -> Result<WorkingDirectory, StepError>;

    /// Run `command_text` inside `working_dir`
    async fn execute_command(
        &self,
        command_text: &str,
        working_dir: &WorkingDirectory,
        terminal_id: Option<&str>,
    ) -> Result<StepResult, StepError>;

    /// Publish the directory at `build_output_path` to `target_path`
    async fn publish_output(
        &self,
        build_output_path: &Path,
        target_path: &Path,
    ) -> Result<(), StepError>;
}
