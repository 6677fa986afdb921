//! Ledger unit tests

mod common;

use std::sync::Arc;

use chrono::Utc;
use tokio_test::{assert_err, assert_ok};

use deployd::deploy::fsm::Status;
use deployd::errors::ServiceError;
use deployd::filesys::dir::Dir;
use deployd::ledger::store::{DeployStore, JsonFileStore, MemoryStore};
use deployd::ledger::{Ledger, INTERRUPTED_MESSAGE, NOT_STARTED_MESSAGE};
use deployd::models::deploy::{CommandSpec, DeployFilter, DeployId, RequestContext};

use common::spec;

fn ledger() -> (Arc<MemoryStore>, Ledger) {
    let store = Arc::new(MemoryStore::new());
    let ledger = Ledger::new(store.clone());
    (store, ledger)
}

#[tokio::test]
async fn test_create_assigns_orders_from_index() {
    let (store, ledger) = ledger();
    let context = RequestContext {
        requested_by: Some("ana".to_string()),
    };

    let deploy = assert_ok!(
        ledger
            .create_deploy(spec("docs", &["npm ci", "npm run build", "npm test"]), &context)
            .await
    );

    let orders: Vec<u32> = deploy.commands.iter().map(|c| c.order).collect();
    assert_eq!(orders, vec![0, 1, 2]);
    assert!(deploy.commands.iter().all(|c| c.status == Status::Pending));
    assert_eq!(deploy.status, Status::Pending);
    assert!(deploy.history.is_empty());
    assert_eq!(deploy.requested_by.as_deref(), Some("ana"));
    assert_eq!(store.len(), 1);
}

#[tokio::test]
async fn test_create_sorts_explicit_orders() {
    let (_, ledger) = ledger();
    let mut spec = spec("docs", &[]);
    spec.commands = vec![
        CommandSpec {
            order: Some(20),
            command_text: "deploy".to_string(),
            terminal_id: None,
        },
        CommandSpec {
            order: Some(10),
            command_text: "build".to_string(),
            terminal_id: Some("t1".to_string()),
        },
    ];

    let deploy = assert_ok!(ledger.create_deploy(spec, &RequestContext::default()).await);

    let commands: Vec<(u32, &str)> = deploy
        .commands
        .iter()
        .map(|c| (c.order, c.command_text.as_str()))
        .collect();
    assert_eq!(commands, vec![(10, "build"), (20, "deploy")]);
    assert_eq!(deploy.commands[0].terminal_id.as_deref(), Some("t1"));
}

#[tokio::test]
async fn test_invalid_submissions_store_nothing() {
    let (store, ledger) = ledger();

    let mut duplicate = spec("docs", &[]);
    duplicate.commands = vec![
        CommandSpec {
            order: Some(1),
            command_text: "a".to_string(),
            terminal_id: None,
        },
        CommandSpec {
            order: Some(1),
            command_text: "b".to_string(),
            terminal_id: None,
        },
    ];
    let mut no_repo = spec("docs", &["make"]);
    no_repo.repo_url = String::new();
    let mut no_branch = spec("docs", &["make"]);
    no_branch.branch = "  ".to_string();
    let mut no_output = spec("docs", &["make"]);
    no_output.build_output_path = String::new();
    let mut no_site = spec("docs", &["make"]);
    no_site.site_name = String::new();
    let mut escaping_output = spec("docs", &["make"]);
    escaping_output.build_output_path = "../etc".to_string();

    let cases = vec![
        spec("docs", &[]),
        duplicate,
        no_repo,
        no_branch,
        no_output,
        no_site,
        escaping_output,
    ];
    for case in cases {
        let err = assert_err!(ledger.create_deploy(case, &RequestContext::default()).await);
        assert!(matches!(err, ServiceError::ValidationError(_)), "got {:?}", err);
    }

    assert!(store.is_empty());
    assert!(ledger.list_deploys(&DeployFilter::default()).await.is_empty());
}

#[tokio::test]
async fn test_get_unknown_deploy() {
    let (_, ledger) = ledger();
    let err = assert_err!(ledger.get_deploy(DeployId::new()).await);
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_update_command_status() {
    let (store, ledger) = ledger();
    let deploy = assert_ok!(
        ledger
            .create_deploy(spec("docs", &["make"]), &RequestContext::default())
            .await
    );

    let started = Utc::now();
    assert_ok!(
        ledger
            .update_command_status(deploy.id, 0, Status::Running, None, Some(started))
            .await
    );
    assert_ok!(
        ledger
            .update_command_status(deploy.id, 0, Status::Succeeded, Some("built".to_string()), None)
            .await
    );

    let deploy = assert_ok!(ledger.get_deploy(deploy.id).await);
    let command = deploy.command(0).unwrap();
    assert_eq!(command.status, Status::Succeeded);
    assert_eq!(command.message.as_deref(), Some("built"));
    assert_eq!(command.executed_at, Some(started));
    assert!(deploy.updated_at.is_some());

    // Every mutation reaches the store
    let stored = store.load_all().await.unwrap();
    assert_eq!(stored[0], deploy);
}

#[tokio::test]
async fn test_update_command_status_rejections() {
    let (_, ledger) = ledger();
    let deploy = assert_ok!(
        ledger
            .create_deploy(spec("docs", &["make"]), &RequestContext::default())
            .await
    );

    let err = assert_err!(
        ledger
            .update_command_status(deploy.id, 7, Status::Running, None, None)
            .await
    );
    assert!(matches!(err, ServiceError::NotFound(_)));

    let err = assert_err!(
        ledger
            .update_command_status(DeployId::new(), 0, Status::Running, None, None)
            .await
    );
    assert!(matches!(err, ServiceError::NotFound(_)));

    // Pending cannot skip Running
    let err = assert_err!(
        ledger
            .update_command_status(deploy.id, 0, Status::Succeeded, None, None)
            .await
    );
    assert!(matches!(err, ServiceError::InvalidTransition(_)));

    let deploy = assert_ok!(ledger.get_deploy(deploy.id).await);
    assert_eq!(deploy.command(0).unwrap().status, Status::Pending);
    assert!(deploy.updated_at.is_none());
}

#[tokio::test]
async fn test_append_history_is_pure_append() {
    let (_, ledger) = ledger();
    let deploy = assert_ok!(
        ledger
            .create_deploy(spec("docs", &["make"]), &RequestContext::default())
            .await
    );

    assert_ok!(
        ledger
            .append_history(deploy.id, Status::Pending, Some("queued".to_string()))
            .await
    );
    assert_ok!(ledger.append_history(deploy.id, Status::Pending, None).await);

    let deploy = assert_ok!(ledger.get_deploy(deploy.id).await);
    assert_eq!(deploy.status, Status::Pending);
    assert_eq!(deploy.history.len(), 2);
    assert_eq!(deploy.history[0].message.as_deref(), Some("queued"));
    assert!(deploy.history[0].occurred_at <= deploy.history[1].occurred_at);

    let err = assert_err!(ledger.append_history(DeployId::new(), Status::Pending, None).await);
    assert!(matches!(err, ServiceError::NotFound(_)));
}

#[tokio::test]
async fn test_list_newest_first_with_site_filter() {
    let (_, ledger) = ledger();
    let context = RequestContext::default();

    let first = assert_ok!(ledger.create_deploy(spec("docs", &["make"]), &context).await);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = assert_ok!(ledger.create_deploy(spec("blog", &["make"]), &context).await);
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let third = assert_ok!(ledger.create_deploy(spec("docs", &["make"]), &context).await);

    let all: Vec<DeployId> = ledger
        .list_deploys(&DeployFilter::default())
        .await
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(all, vec![third.id, second.id, first.id]);

    let docs: Vec<DeployId> = ledger
        .list_deploys(&DeployFilter {
            site_name: Some("docs".to_string()),
        })
        .await
        .iter()
        .map(|d| d.id)
        .collect();
    assert_eq!(docs, vec![third.id, first.id]);
}

#[tokio::test]
async fn test_json_store_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let store = Arc::new(assert_ok!(JsonFileStore::open(Dir::new(tmp.path().join("deploys"))).await));

    let ledger = Ledger::new(store.clone());
    let deploy = assert_ok!(
        ledger
            .create_deploy(spec("docs", &["make", "make install"]), &RequestContext::default())
            .await
    );
    assert_ok!(
        ledger
            .update_command_status(deploy.id, 0, Status::Running, None, Some(Utc::now()))
            .await
    );
    let expected = assert_ok!(ledger.get_deploy(deploy.id).await);

    let stored = assert_ok!(store.load_all().await);
    assert_eq!(stored, vec![expected]);
}

#[tokio::test]
async fn test_restore_closes_interrupted_deploys() {
    let tmp = tempfile::tempdir().unwrap();
    let dir = Dir::new(tmp.path().join("deploys"));
    let store = Arc::new(assert_ok!(JsonFileStore::open(dir.clone()).await));

    let ledger = Ledger::new(store.clone());
    let context = RequestContext::default();
    let running = assert_ok!(ledger.create_deploy(spec("docs", &["a", "b", "c"]), &context).await);
    assert_ok!(ledger.append_history(running.id, Status::Running, None).await);
    assert_ok!(
        ledger
            .update_command_status(running.id, 0, Status::Running, None, Some(Utc::now()))
            .await
    );
    assert_ok!(
        ledger
            .update_command_status(running.id, 0, Status::Succeeded, None, None)
            .await
    );
    assert_ok!(
        ledger
            .update_command_status(running.id, 1, Status::Running, None, Some(Utc::now()))
            .await
    );

    let queued = assert_ok!(ledger.create_deploy(spec("blog", &["make"]), &context).await);

    // Unreadable records are skipped
    assert_ok!(dir.file("garbage.json").write_string("{").await);

    let restored = assert_ok!(Ledger::restore(store.clone()).await);
    let deploy = assert_ok!(restored.get_deploy(running.id).await);

    assert_eq!(deploy.status, Status::Failed);
    assert_eq!(deploy.message.as_deref(), Some(INTERRUPTED_MESSAGE));
    let statuses: Vec<Status> = deploy.commands.iter().map(|c| c.status).collect();
    assert_eq!(statuses, vec![Status::Succeeded, Status::Failed, Status::Pending]);
    assert_eq!(deploy.commands[1].message.as_deref(), Some(INTERRUPTED_MESSAGE));

    let last = deploy.history.last().unwrap();
    assert_eq!(last.status, Status::Failed);
    assert_eq!(last.message.as_deref(), Some(INTERRUPTED_MESSAGE));

    // Never started, but still closed through Running
    let queued = assert_ok!(restored.get_deploy(queued.id).await);
    assert_eq!(queued.status, Status::Failed);
    assert_eq!(queued.message.as_deref(), Some(NOT_STARTED_MESSAGE));
    assert_eq!(queued.commands[0].status, Status::Pending);
    let statuses: Vec<Status> = queued.history.iter().map(|h| h.status).collect();
    assert_eq!(statuses, vec![Status::Running, Status::Failed]);

    // The closed state was written back
    let stored = assert_ok!(store.load_all().await);
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|d| d.status == Status::Failed));
}
