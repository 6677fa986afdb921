//! Deploy service unit tests

mod common;

use std::collections::HashSet;
use std::time::Duration;

use tokio_test::{assert_err, assert_ok};

use deployd::deploy::fsm::Status;
use deployd::errors::ServiceError;
use deployd::ledger::store::DeployStore;
use deployd::models::deploy::{DeployFilter, DeployId, RequestContext};

use common::{eventually, settings, spec, FakeStepExecutor, Harness, Script};

fn sleeper(delay: Duration) -> FakeStepExecutor {
    FakeStepExecutor::new().script("sleep", Script::Sleep(delay, 0))
}

#[tokio::test]
async fn test_submit_and_wait() {
    let harness = Harness::new(FakeStepExecutor::new());
    let context = RequestContext {
        requested_by: Some("ci".to_string()),
    };

    let id = assert_ok!(harness.service.submit(spec("docs", &["npm ci", "npm run build"]), &context).await);
    let summary = assert_ok!(harness.service.wait(id).await);

    assert_eq!(summary.id, id);
    assert_eq!(summary.status, Status::Succeeded);
    assert_eq!(summary.requested_by.as_deref(), Some("ci"));
    assert!(summary.commands.iter().all(|c| c.status == Status::Succeeded));
    assert_eq!(harness.service.running_count(), 0);

    let history = assert_ok!(harness.service.get_history(id).await);
    let statuses: Vec<Status> = history.iter().map(|h| h.status).collect();
    assert_eq!(statuses, vec![Status::Running, Status::Succeeded]);
}

#[tokio::test]
async fn test_validation_error_is_returned_verbatim() {
    let harness = Harness::new(FakeStepExecutor::new());

    let err = assert_err!(harness.service.submit(spec("docs", &[]), &RequestContext::default()).await);
    match err {
        ServiceError::ValidationError(message) => {
            assert_eq!(message, "buildCommands must contain at least one command")
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(harness.service.list(&DeployFilter::default()).await.is_empty());
    assert_eq!(harness.executor.fetch_count(), 0);
}

#[tokio::test]
async fn test_concurrent_deploys_are_isolated() {
    let harness = Harness::new(FakeStepExecutor::new());
    let context = RequestContext::default();

    let mut ids = Vec::new();
    for site in ["docs", "blog", "shop"] {
        ids.push(assert_ok!(harness.service.submit(spec(site, &["a", "b", "c"]), &context).await));
    }
    for id in &ids {
        let summary = assert_ok!(harness.service.wait(*id).await);
        assert_eq!(summary.status, Status::Succeeded);
    }

    assert_eq!(harness.executor.fetch_count(), 3);
    assert_eq!(harness.executor.max_in_flight_per_dir(), 1);
    let workdirs: HashSet<_> = harness.executor.workdirs().into_iter().collect();
    assert_eq!(workdirs.len(), 3);

    let targets: HashSet<_> = harness
        .executor
        .publish_calls()
        .into_iter()
        .map(|(_, target)| target)
        .collect();
    assert_eq!(targets.len(), 3);
}

#[tokio::test]
async fn test_max_concurrent_deploys() {
    let harness = Harness::with_settings(sleeper(Duration::from_millis(20)), settings(), Some(1));
    let context = RequestContext::default();

    let mut ids = Vec::new();
    for site in ["docs", "blog", "shop"] {
        ids.push(assert_ok!(harness.service.submit(spec(site, &["sleep"]), &context).await));
    }
    for id in &ids {
        assert_eq!(assert_ok!(harness.service.wait(*id).await).status, Status::Succeeded);
    }

    assert_eq!(harness.executor.max_running(), 1);
}

#[tokio::test]
async fn test_cancel_running_deploy() {
    let harness = Harness::new(sleeper(Duration::from_secs(30)));

    let id = assert_ok!(
        harness
            .service
            .submit(spec("docs", &["sleep", "make"]), &RequestContext::default())
            .await
    );
    let executor = harness.executor.clone();
    eventually(|| executor.executed().len() == 1).await;

    assert_ok!(harness.service.cancel(id).await);
    let summary = assert_ok!(harness.service.wait(id).await);

    assert_eq!(summary.status, Status::Failed);
    assert_eq!(summary.message.as_deref(), Some("deploy cancelled during step 0"));
    assert_eq!(summary.commands[0].status, Status::Failed);
    assert_eq!(summary.commands[1].status, Status::Pending);

    // A finished deploy cannot be cancelled again
    let err = assert_err!(harness.service.cancel(id).await);
    assert!(matches!(err, ServiceError::Conflict(_)));
}

#[tokio::test]
async fn test_cancel_queued_deploy() {
    let harness = Harness::with_settings(sleeper(Duration::from_secs(30)), settings(), Some(1));
    let context = RequestContext::default();

    let first = assert_ok!(harness.service.submit(spec("docs", &["sleep"]), &context).await);
    let executor = harness.executor.clone();
    eventually(|| executor.executed().len() == 1).await;

    // Waits for a permit behind the first deploy
    let queued = assert_ok!(harness.service.submit(spec("blog", &["make"]), &context).await);
    assert_eq!(assert_ok!(harness.service.get_status(queued).await).status, Status::Pending);

    assert_ok!(harness.service.cancel(queued).await);
    let summary = assert_ok!(harness.service.wait(queued).await);
    assert_eq!(summary.status, Status::Failed);
    assert_eq!(summary.message.as_deref(), Some("deploy cancelled before start"));
    assert_eq!(harness.executor.fetch_count(), 1);

    assert_ok!(harness.service.cancel(first).await);
    assert_eq!(assert_ok!(harness.service.wait(first).await).status, Status::Failed);
}

#[tokio::test]
async fn test_cancel_unknown_deploy() {
    let harness = Harness::new(FakeStepExecutor::new());
    let err = assert_err!(harness.service.cancel(DeployId::new()).await);
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_reads_do_not_change_state() {
    let harness = Harness::new(FakeStepExecutor::new().script("make", Script::Exit(1)));

    let id = assert_ok!(
        harness
            .service
            .submit(spec("docs", &["make"]), &RequestContext::default())
            .await
    );
    assert_ok!(harness.service.wait(id).await);

    let first = assert_ok!(harness.service.get_status(id).await);
    let second = assert_ok!(harness.service.get_status(id).await);
    assert_eq!(first, second);
    assert_eq!(first.status, Status::Failed);

    let history = assert_ok!(harness.service.get_history(id).await);
    assert_eq!(assert_ok!(harness.service.get_history(id).await), history);

    let deploy = assert_ok!(harness.service.get_deploy(id).await);
    assert_eq!(deploy.history, history);

    let err = assert_err!(harness.service.get_status(DeployId::new()).await);
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_list_filters_by_site() {
    let harness = Harness::new(FakeStepExecutor::new());
    let context = RequestContext::default();

    let docs = assert_ok!(harness.service.submit(spec("docs", &["make"]), &context).await);
    let blog = assert_ok!(harness.service.submit(spec("blog", &["make"]), &context).await);
    assert_ok!(harness.service.wait(docs).await);
    assert_ok!(harness.service.wait(blog).await);

    assert_eq!(harness.service.list(&DeployFilter::default()).await.len(), 2);
    let only_blog = harness
        .service
        .list(&DeployFilter {
            site_name: Some("blog".to_string()),
        })
        .await;
    assert_eq!(only_blog.len(), 1);
    assert_eq!(only_blog[0].id, blog);
}

#[tokio::test]
async fn test_shutdown_cancels_runs_and_rejects_submits() {
    let harness = Harness::new(sleeper(Duration::from_secs(30)));
    let context = RequestContext::default();

    let id = assert_ok!(harness.service.submit(spec("docs", &["sleep"]), &context).await);
    let executor = harness.executor.clone();
    eventually(|| executor.executed().len() == 1).await;

    harness.service.shutdown().await;

    assert_eq!(harness.service.running_count(), 0);
    let summary = assert_ok!(harness.service.get_status(id).await);
    assert_eq!(summary.status, Status::Failed);
    assert!(harness.orchestrator.active_workdirs().is_empty());

    let err = assert_err!(harness.service.submit(spec("docs", &["make"]), &context).await);
    assert!(matches!(err, ServiceError::ShutdownError(_)));
}

#[tokio::test]
async fn test_ledger_error_mid_run_fails_the_deploy() {
    // Third save is the first command going Running
    let harness = Harness::with_flaky_store(FakeStepExecutor::new(), 3..=3);

    let id = assert_ok!(
        harness
            .service
            .submit(spec("docs", &["npm ci", "npm run build"]), &RequestContext::default())
            .await
    );
    let summary = assert_ok!(harness.service.wait(id).await);

    assert_eq!(summary.status, Status::Failed);
    let message = summary.message.unwrap();
    assert!(message.starts_with("ledger: "), "{}", message);
    assert!(message.contains("disk full"), "{}", message);
    assert!(summary.commands.iter().all(|c| c.status == Status::Pending));
    assert!(harness.executor.executed().is_empty());
    assert!(harness.orchestrator.active_workdirs().is_empty());

    // The stored copy agrees with what cancel reports
    let stored = harness.store.load_all().await.unwrap();
    assert_eq!(stored[0].status, Status::Failed);
    match assert_err!(harness.service.cancel(id).await) {
        ServiceError::Conflict(message) => assert!(message.contains("already Failed"), "{}", message),
        other => panic!("expected conflict, got {:?}", other),
    }
}

#[tokio::test]
async fn test_cancel_closes_deploy_left_without_a_run() {
    // Every write after creation fails until the run task has given up
    let harness = Harness::with_flaky_store(FakeStepExecutor::new(), 2..=5);

    let id = assert_ok!(
        harness
            .service
            .submit(spec("docs", &["make"]), &RequestContext::default())
            .await
    );
    let summary = assert_ok!(harness.service.wait(id).await);
    assert_eq!(summary.status, Status::Pending);
    assert_eq!(harness.service.running_count(), 0);
    assert_eq!(harness.executor.fetch_count(), 0);

    assert_ok!(harness.service.cancel(id).await);
    let summary = assert_ok!(harness.service.get_status(id).await);
    assert_eq!(summary.status, Status::Failed);
    assert_eq!(summary.message.as_deref(), Some("deploy cancelled: no active run"));

    let history = assert_ok!(harness.service.get_history(id).await);
    let statuses: Vec<Status> = history.iter().map(|h| h.status).collect();
    assert_eq!(statuses, vec![Status::Running, Status::Failed]);

    let err = assert_err!(harness.service.cancel(id).await);
    assert!(matches!(err, ServiceError::Conflict(_)));
}
