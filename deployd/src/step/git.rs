//! Git source fetcher

use std::process::Stdio;

use secrecy::{ExposeSecret, SecretString};
use tokio::process::Command;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::filesys::dir::Dir;
use crate::step::process::{self, GroupGuard};
use crate::step::{FetchReason, StepError, WorkingDirectory};
use crate::utils::tail_lines;

/// Git fetch options
#[derive(Debug, Clone)]
pub struct GitOptions {
    /// Git executable
    pub binary: String,

    /// Token used for HTTPS remotes
    pub token: Option<SecretString>,
}

impl Default for GitOptions {
    fn default() -> Self {
        Self {
            binary: "git".to_string(),
            token: None,
        }
    }
}

/// Clones repositories into fresh directories under a workspace
#[derive(Debug, Clone)]
pub struct GitFetcher {
    workspace: Dir,
    options: GitOptions,
}

impl GitFetcher {
    pub fn new(workspace: Dir, options: GitOptions) -> Self {
        Self { workspace, options }
    }

    /// Shallow-clone `branch` of `repo_url`
    pub async fn fetch(&self, repo_url: &str, branch: &str) -> Result<WorkingDirectory, StepError> {
        info!("Fetching Git repository: {} (branch: {})", repo_url, branch);

        self.workspace.create().await.map_err(|e| {
            StepError::fetch(FetchReason::Other, format!("cannot create workspace: {e}"))
        })?;
        let target = self.workspace.subdir(&format!("deploy-{}", Uuid::new_v4()));
        let remote = self.remote_url(repo_url);
        // Removes the partial clone if this future is dropped mid-clone
        let workdir = WorkingDirectory::owned(target.path());

        debug!("Cloning repository to {}...", target.path().display());
        let mut cmd = Command::new(&self.options.binary);
        process::isolate(&mut cmd)
            .args(["clone", "--depth", "1", "--single-branch", "--branch", branch, "--"])
            .arg(&remote)
            .arg(target.path())
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let spawn_error = |e: std::io::Error| {
            StepError::fetch(
                FetchReason::Other,
                format!("failed to run {}: {}", self.options.binary, e),
            )
        };
        let child = cmd.spawn().map_err(spawn_error)?;
        // Dropped before `workdir`, so git is dead before its directory goes
        let group = GroupGuard::new(&child);
        let output = child.wait_with_output().await.map_err(spawn_error)?;
        group.disarm();

        if !output.status.success() {
            if let Err(e) = workdir.release().await {
                warn!("Failed to clean up partial clone {}: {}", target.path().display(), e);
            }
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = self.redact(&tail_lines(&stderr, 5));
            return Err(StepError::fetch(classify_fetch_failure(&stderr), message));
        }

        info!("Successfully fetched Git repository");
        Ok(workdir)
    }

    /// Embed the token into HTTPS remotes
    fn remote_url(&self, repo_url: &str) -> String {
        let Some(token) = &self.options.token else {
            return repo_url.to_string();
        };

        match url::Url::parse(repo_url) {
            Ok(mut url) if url.scheme() == "https" && url.username().is_empty() => {
                let with_auth = url.set_username("x-access-token").is_ok()
                    && url.set_password(Some(token.expose_secret())).is_ok();
                if with_auth {
                    url.to_string()
                } else {
                    repo_url.to_string()
                }
            }
            _ => repo_url.to_string(),
        }
    }

    fn redact(&self, message: &str) -> String {
        match &self.options.token {
            Some(token) if !token.expose_secret().is_empty() => {
                message.replace(token.expose_secret(), "***")
            }
            _ => message.to_string(),
        }
    }
}

/// Map git's stderr onto a fetch failure reason
pub fn classify_fetch_failure(stderr: &str) -> FetchReason {
    let stderr = stderr.to_lowercase();
    let any = |needles: &[&str]| needles.iter().any(|n| stderr.contains(n));

    if any(&[
        "authentication failed",
        "could not read username",
        "could not read password",
        "permission denied (publickey",
        "invalid username or password",
        "returned error: 401",
        "returned error: 403",
    ]) {
        FetchReason::Auth
    } else if any(&[
        "repository not found",
        "not found in upstream",
        "does not appear to be a git repository",
        "does not exist",
        "returned error: 404",
    ]) {
        FetchReason::NotFound
    } else if any(&[
        "could not resolve host",
        "connection refused",
        "connection timed out",
        "network is unreachable",
        "operation timed out",
        "unable to access",
        "early eof",
    ]) {
        FetchReason::Network
    } else {
        FetchReason::Other
    }
}
