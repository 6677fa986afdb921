//! Local step executor tests: shell, publisher and git fetcher

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::Command;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio_test::{assert_err, assert_ok};

use deployd::deploy::fsm::Status;
use deployd::deploy::{Orchestrator, PipelineSettings};
use deployd::filesys::dir::Dir;
use deployd::ledger::Ledger;
use deployd::models::deploy::{DeploySpec, RequestContext};
use deployd::step::git::{GitFetcher, GitOptions};
use deployd::step::publish::{DirectoryPublisher, LOCK_FILE};
use deployd::step::shell::{ShellRunner, TERMINAL_ID_ENV};
use deployd::step::{
    FetchReason, LocalExecutorOptions, LocalStepExecutor, PublishReason, StepError,
};

fn write(path: &Path, contents: &str) {
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, contents).unwrap();
}

fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(["-c", "user.name=deployd", "-c", "user.email=deployd@example.com"])
        .args(args)
        .current_dir(dir)
        .output()
        .unwrap()
        .status;
    assert!(status.success(), "git {:?} failed", args);
}

/// Local repository with one commit on `main`
fn init_repo(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    write(&dir.join("index.html"), "<h1>hello</h1>\n");
    git(dir, &["add", "."]);
    git(dir, &["commit", "-q", "-m", "initial"]);
}

fn file_url(path: &Path) -> String {
    format!("file://{}", path.display())
}

// ================================ SHELL ==================================== //

#[tokio::test]
async fn test_shell_captures_output_and_exit_code() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = ShellRunner::default();

    let result = assert_ok!(shell.run("echo built; echo warn >&2", tmp.path(), None).await);
    assert!(result.succeeded());
    assert_eq!(result.stdout, "built\n");
    assert_eq!(result.stderr, "warn\n");

    let result = assert_ok!(shell.run("exit 3", tmp.path(), None).await);
    assert_eq!(result.exit_code, 3);
    assert!(!result.succeeded());
}

#[tokio::test]
async fn test_shell_runs_in_working_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = ShellRunner::default();

    assert_ok!(shell.run("mkdir dist && echo ok > dist/index.html", tmp.path(), None).await);
    assert!(tmp.path().join("dist/index.html").exists());
}

#[tokio::test]
async fn test_shell_exports_terminal_id() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = ShellRunner::default();
    let command = format!("echo ${}", TERMINAL_ID_ENV);

    let result = assert_ok!(shell.run(&command, tmp.path(), Some("term-7")).await);
    assert_eq!(result.stdout.trim(), "term-7");
}

#[tokio::test]
async fn test_shell_missing_working_directory() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = ShellRunner::default();

    let err = assert_err!(shell.run("true", &tmp.path().join("gone"), None).await);
    assert!(matches!(err, StepError::Execution(_)));
}

#[tokio::test]
async fn test_shell_timeout_kills_forked_processes() {
    let tmp = tempfile::tempdir().unwrap();
    let shell = ShellRunner::default();

    // The subshell outlives the shell unless its whole group is killed
    let run = shell.run("(sleep 1; touch marker) & wait", tmp.path(), None);
    let timed_out = tokio::time::timeout(Duration::from_millis(200), run).await;
    assert!(timed_out.is_err());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert!(!tmp.path().join("marker").exists());
}

// ================================ PUBLISH ==================================== //

#[tokio::test]
async fn test_publish_creates_and_replaces_target() {
    let tmp = tempfile::tempdir().unwrap();
    let target = tmp.path().join("sites/docs");
    let publisher = DirectoryPublisher::new();

    let first = tmp.path().join("build-1");
    write(&first.join("index.html"), "v1");
    write(&first.join("old.css"), "body {}");
    assert_ok!(publisher.publish(&first, &target).await);
    assert_eq!(std::fs::read_to_string(target.join("index.html")).unwrap(), "v1");

    let second = tmp.path().join("build-2");
    write(&second.join("index.html"), "v2");
    write(&second.join("assets/app.js"), "run()");
    assert_ok!(publisher.publish(&second, &target).await);

    assert_eq!(std::fs::read_to_string(target.join("index.html")).unwrap(), "v2");
    assert!(target.join("assets/app.js").exists());
    assert!(!target.join("old.css").exists());

    // Only the published site is left next to the target
    let siblings: Vec<_> = std::fs::read_dir(tmp.path().join("sites"))
        .unwrap()
        .map(|e| e.unwrap().file_name())
        .collect();
    assert_eq!(siblings, vec![std::ffi::OsString::from("docs")]);
}

#[tokio::test]
async fn test_publish_missing_output() {
    let tmp = tempfile::tempdir().unwrap();
    let publisher = DirectoryPublisher::new();

    let err = assert_err!(
        publisher
            .publish(&tmp.path().join("dist"), &tmp.path().join("sites/docs"))
            .await
    );
    assert!(matches!(
        err,
        StepError::Publish {
            reason: PublishReason::MissingOutput,
            ..
        }
    ));
    assert!(!tmp.path().join("sites/docs").exists());
}

#[tokio::test]
async fn test_publish_respects_lock_file() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("dist");
    let target = tmp.path().join("sites/docs");
    write(&source.join("index.html"), "new");
    write(&target.join("index.html"), "live");
    write(&target.join(LOCK_FILE), "");

    let err = assert_err!(DirectoryPublisher::new().publish(&source, &target).await);
    assert!(matches!(
        err,
        StepError::Publish {
            reason: PublishReason::Locked,
            ..
        }
    ));
    assert_eq!(std::fs::read_to_string(target.join("index.html")).unwrap(), "live");
}

#[tokio::test]
async fn test_publish_target_is_a_file() {
    let tmp = tempfile::tempdir().unwrap();
    let source = tmp.path().join("dist");
    let target = tmp.path().join("sites/docs");
    write(&source.join("index.html"), "new");
    write(&target, "not a directory");

    let err = assert_err!(DirectoryPublisher::new().publish(&source, &target).await);
    assert!(matches!(
        err,
        StepError::Publish {
            reason: PublishReason::PathConflict,
            ..
        }
    ));
}

// ================================ GIT ==================================== //

#[tokio::test]
async fn test_git_fetch_from_local_repository() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("origin");
    init_repo(&repo);
    let fetcher = GitFetcher::new(Dir::new(tmp.path().join("workspace")), GitOptions::default());

    let workdir = assert_ok!(fetcher.fetch(&file_url(&repo), "main").await);
    assert!(workdir.is_owned());
    assert!(workdir.path().starts_with(tmp.path().join("workspace")));
    assert!(workdir.path().join("index.html").exists());

    let path = workdir.path().to_path_buf();
    assert_ok!(workdir.release().await);
    assert!(!path.exists());
}

#[tokio::test]
async fn test_git_fetch_unknown_branch() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("origin");
    init_repo(&repo);
    let workspace = tmp.path().join("workspace");
    let fetcher = GitFetcher::new(Dir::new(&workspace), GitOptions::default());

    let err = assert_err!(fetcher.fetch(&file_url(&repo), "does-not-exist").await);
    assert!(matches!(
        err,
        StepError::Fetch {
            reason: FetchReason::NotFound,
            ..
        }
    ));
    // The partial clone is cleaned up
    assert_eq!(std::fs::read_dir(&workspace).unwrap().count(), 0);
}

#[tokio::test]
async fn test_git_fetch_dropped_mid_clone_removes_partial_checkout() {
    let tmp = tempfile::tempdir().unwrap();
    let started = tmp.path().join("started");
    let slow_git = tmp.path().join("slow-git");
    // Stands in for a clone that hangs after writing part of the checkout
    write(
        &slow_git,
        &format!(
            "#!/bin/sh\nfor a; do t=\"$a\"; done\nmkdir -p \"$t\"\ntouch \"$t/partial\" {}\nsleep 5\n",
            started.display()
        ),
    );
    std::fs::set_permissions(&slow_git, std::fs::Permissions::from_mode(0o755)).unwrap();

    let workspace = tmp.path().join("workspace");
    let fetcher = GitFetcher::new(
        Dir::new(&workspace),
        GitOptions {
            binary: slow_git.display().to_string(),
            ..Default::default()
        },
    );

    let fetch = fetcher.fetch("https://git.example.com/docs.git", "main");
    let timed_out = tokio::time::timeout(Duration::from_millis(500), fetch).await;
    assert!(timed_out.is_err());
    assert!(started.exists());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(std::fs::read_dir(&workspace).unwrap().count(), 0);
}

// ================================ PIPELINE ==================================== //

#[tokio::test]
async fn test_local_pipeline_end_to_end() {
    if !git_available() {
        return;
    }
    let tmp = tempfile::tempdir().unwrap();
    let repo = tmp.path().join("origin");
    init_repo(&repo);
    let publish_root = tmp.path().join("sites");

    let ledger = Arc::new(Ledger::in_memory());
    let executor = Arc::new(LocalStepExecutor::new(
        Dir::new(tmp.path().join("workspace")),
        LocalExecutorOptions::default(),
    ));
    let orchestrator = Orchestrator::new(
        ledger.clone(),
        executor,
        PipelineSettings {
            publish_root: publish_root.clone(),
            ..Default::default()
        },
    );

    let spec = DeploySpec {
        site_name: "docs".to_string(),
        repo_url: file_url(&repo),
        branch: "main".to_string(),
        build_output_path: "dist".to_string(),
        commands: vec![
            deployd::models::deploy::CommandSpec::new("mkdir -p dist"),
            deployd::models::deploy::CommandSpec::new("cp index.html dist/ && echo copied"),
        ],
        ..Default::default()
    };
    let deploy = assert_ok!(ledger.create_deploy(spec, &RequestContext::default()).await);

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let status = assert_ok!(orchestrator.run(deploy.id, cancel_rx).await);
    assert_eq!(status, Status::Succeeded);

    let deploy = assert_ok!(ledger.get_deploy(deploy.id).await);
    assert_eq!(deploy.commands[1].message.as_deref(), Some("copied"));
    assert_eq!(
        std::fs::read_to_string(publish_root.join("docs/index.html")).unwrap(),
        "<h1>hello</h1>\n"
    );
    // The checkout is gone
    assert_eq!(std::fs::read_dir(tmp.path().join("workspace")).unwrap().count(), 0);
}
