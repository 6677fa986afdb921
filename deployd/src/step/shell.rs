//! Shell command runner

use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::process::Command;
use tracing::debug;

use crate::step::process::{self, GroupGuard};
use crate::step::{StepError, StepResult};

/// Environment variable carrying the command's terminal id
pub const TERMINAL_ID_ENV: &str = "DEPLOY_TERMINAL_ID";

/// Shell used to interpret command text
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShellOptions {
    /// Shell program
    pub program: String,

    /// Flag passing the command string to the shell
    pub command_flag: String,
}

impl Default for ShellOptions {
    fn default() -> Self {
        if cfg!(windows) {
            Self {
                program: "cmd".to_string(),
                command_flag: "/C".to_string(),
            }
        } else {
            Self {
                program: "sh".to_string(),
                command_flag: "-c".to_string(),
            }
        }
    }
}

/// Runs command text through a shell and captures its output
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    options: ShellOptions,
}

impl ShellRunner {
    pub fn new(options: ShellOptions) -> Self {
        Self { options }
    }

    /// Run `command_text` in `cwd` until it exits.
    ///
    /// The shell and everything it started are killed if the returned future
    /// is dropped.
    pub async fn run(
        &self,
        command_text: &str,
        cwd: &Path,
        terminal_id: Option<&str>,
    ) -> Result<StepResult, StepError> {
        let is_dir = fs::metadata(cwd).await.map(|m| m.is_dir()).unwrap_or(false);
        if !is_dir {
            return Err(StepError::Execution(format!(
                "working directory missing: {}",
                cwd.display()
            )));
        }

        let mut cmd = Command::new(&self.options.program);
        process::isolate(&mut cmd)
            .arg(&self.options.command_flag)
            .arg(command_text)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(terminal_id) = terminal_id {
            cmd.env(TERMINAL_ID_ENV, terminal_id);
        }

        debug!(cmd = %command_text, cwd = %cwd.display(), "spawning command");
        let started = Instant::now();
        let child = cmd.spawn().map_err(|e| {
            StepError::Execution(format!("failed to spawn {}: {}", self.options.program, e))
        })?;
        let group = GroupGuard::new(&child);
        let output = child.wait_with_output().await.map_err(|e| {
            StepError::Execution(format!("failed waiting for {}: {}", self.options.program, e))
        })?;
        group.disarm();

        let result = StepResult {
            // Killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        debug!(exit_code = result.exit_code, duration_ms = result.duration_ms, "command exited");
        Ok(result)
    }
}
