//! Step executor backed by the local machine

use std::path::Path;

use async_trait::async_trait;

use crate::filesys::dir::Dir;
use crate::step::git::{GitFetcher, GitOptions};
use crate::step::publish::DirectoryPublisher;
use crate::step::shell::{ShellOptions, ShellRunner};
use crate::step::{StepError, StepExecutor, StepResult, WorkingDirectory};

/// Local executor options
#[derive(Debug, Clone, Default)]
pub struct LocalExecutorOptions {
    pub git: GitOptions,
    pub shell: ShellOptions,
}

/// Git CLI fetch, shell execution and directory publishing
#[derive(Debug, Clone)]
pub struct LocalStepExecutor {
    git: GitFetcher,
    shell: ShellRunner,
    publisher: DirectoryPublisher,
}

impl LocalStepExecutor {
    /// Create an executor cloning into `workspace`
    pub fn new(workspace: Dir, options: LocalExecutorOptions) -> Self {
        Self {
            git: GitFetcher::new(workspace, options.git),
            shell: ShellRunner::new(options.shell),
            publisher: DirectoryPublisher::new(),
        }
    }
}

#[async_trait]
impl StepExecutor for LocalStepExecutor {
    async fn fetch_source(
        &self,
        repo_url: &str,
        branch: &str,
    ) -> Result<WorkingDirectory, StepError> {
        self.git.fetch(repo_url, branch).await
    }

    async fn execute_command(
        &self,
        command_text: &str,
        working_dir: &WorkingDirectory,
        terminal_id: Option<&str>,
    ) -> Result<StepResult, StepError> {
        self.shell
            .run(command_text, working_dir.path(), terminal_id)
            .await
    }

    async fn publish_output(
        &self,
        build_output_path: &Path,
        target_path: &Path,
    ) -> Result<(), StepError> {
        self.publisher.publish(build_output_path, target_path).await
    }
}
