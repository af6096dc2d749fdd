mod common;

use cloud_backup::{BackupError, TaskSpec, TaskStatus};
use common::{Failure, Harness, StubProvider};
use std::time::Duration;

fn spec(source: &std::path::Path) -> TaskSpec {
    TaskSpec {
        source_path: source.to_string_lossy().into_owned(),
        provider: "gdrive".into(),
        destination_path: "/backups".into(),
        ..TaskSpec::default()
    }
}

#[tokio::test]
async fn test_create_then_list_returns_pending_task() {
    let harness = Harness::new();
    let manager = harness.manager();

    let created = manager
        .create_task(TaskSpec {
            source_path: "/data/photos".into(),
            provider: "gdrive".into(),
            destination_path: "/backups".into(),
            schedule: Some("0 3 * * *".into()),
            recurring: true,
            compress: true,
            ..TaskSpec::default()
        })
        .await
        .unwrap();

    let tasks = manager.list_tasks().await.unwrap();
    assert_eq!(tasks.len(), 1);
    let listed = &tasks[0];
    assert_eq!(listed.id, created.id);
    assert_eq!(listed.source_path, "/data/photos");
    assert_eq!(listed.provider, "gdrive");
    assert_eq!(listed.destination_path, "/backups");
    assert_eq!(listed.schedule.as_deref(), Some("0 3 * * *"));
    assert!(listed.recurring && listed.compress && !listed.encrypt);
    assert_eq!(listed.status, TaskStatus::Pending);
    assert!(listed.error_message.is_none());
}

#[tokio::test]
async fn test_create_rejects_missing_fields() {
    let harness = Harness::new();
    let manager = harness.manager();

    let no_source = manager
        .create_task(TaskSpec {
            provider: "gdrive".into(),
            ..TaskSpec::default()
        })
        .await;
    assert!(matches!(no_source, Err(BackupError::Validation(_))));

    let no_provider = manager
        .create_task(TaskSpec {
            source_path: "/tmp/a.txt".into(),
            ..TaskSpec::default()
        })
        .await;
    assert!(matches!(no_provider, Err(BackupError::Validation(_))));

    let bad_schedule = manager
        .create_task(TaskSpec {
            schedule: Some("every tuesday".into()),
            ..spec(std::path::Path::new("/tmp/a.txt"))
        })
        .await;
    assert!(matches!(bad_schedule, Err(BackupError::Schedule(_))));

    assert!(manager.list_tasks().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_immediate_execution_completes() {
    let stub = StubProvider::succeeding();
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager.create_task(spec(&source)).await.unwrap();
    manager.execute_task(&task).await.unwrap();

    let stored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Completed);
    assert!(stored.error_message.is_none());
    assert_eq!(stub.calls(), 1);
    assert_eq!(*stub.uploads.lock(), vec!["/backups/a.txt".to_string()]);
}

#[tokio::test]
async fn test_non_retryable_failure_makes_one_attempt() {
    let stub = StubProvider::failing(u32::MAX, Failure::Fatal);
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager.create_task(spec(&source)).await.unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::Validation(_)));
    assert_eq!(stub.calls(), 1);
    let stored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("destination rejected"));
}

#[tokio::test]
async fn test_transient_failures_then_success() {
    for k in 1..4u32 {
        let stub = StubProvider::failing(k, Failure::Retryable);
        let harness = Harness::new().with_stub(stub.clone());
        let manager = harness.manager();
        let source = harness.write_source("a.txt", b"hello");

        let task = manager.create_task(spec(&source)).await.unwrap();
        manager.execute_task(&task).await.unwrap();

        assert_eq!(stub.calls(), k + 1);
        let stored = manager.get_task(&task.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert!(stored.error_message.is_none());
    }
}

#[tokio::test]
async fn test_missing_credentials_fail_fast() {
    let stub = StubProvider::succeeding();
    let harness = Harness::new().with_stub(stub.clone());
    harness.vault.delete_credential("gdrive").unwrap();
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager.create_task(spec(&source)).await.unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::CredentialNotFound(_)));
    assert_eq!(stub.calls(), 0);
    assert_eq!(manager.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_unsupported_provider_is_not_retried() {
    let harness = Harness::new();
    harness
        .vault
        .store_credential(cloud_backup::Credential {
            provider: "ftp".into(),
            key: "user".into(),
            secret: "pass".into(),
            redirect_url: String::new(),
        })
        .unwrap();
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager
        .create_task(TaskSpec {
            provider: "ftp".into(),
            ..spec(&source)
        })
        .await
        .unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();
    assert!(matches!(err, BackupError::UnsupportedProvider(_)));
}

#[tokio::test]
async fn test_panic_becomes_failed_status() {
    let stub = StubProvider::failing(u32::MAX, Failure::Panic);
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager.create_task(spec(&source)).await.unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::Panic(ref msg) if msg.contains("provider exploded")));
    assert_eq!(stub.calls(), 1);
    let stored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().starts_with("task panic"));
}

#[tokio::test]
async fn test_missing_source_is_validation_error() {
    let stub = StubProvider::succeeding();
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();

    let task = manager
        .create_task(spec(&harness.dir.path().join("absent.txt")))
        .await
        .unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();
    assert!(matches!(err, BackupError::Validation(_)));
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn test_upload_timeout_marks_failed() {
    let stub = StubProvider::failing(u32::MAX, Failure::Hang);
    let mut harness = Harness::new().with_stub(stub.clone());
    harness.config.upload_timeout = Duration::from_millis(50);
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager.create_task(spec(&source)).await.unwrap();
    let err = manager.execute_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::Timeout { .. }));
    assert_eq!(stub.calls(), 1);
    assert_eq!(manager.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_one_shot_schedule_reports_aggregate_error() {
    let stub = StubProvider::failing(u32::MAX, Failure::Retryable);
    let mut harness = Harness::new().with_stub(stub.clone());
    harness.config.retry = harness.config.retry.clone().with_max_attempts(3);
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager
        .create_task(TaskSpec {
            schedule: Some("* * * * * *".into()),
            ..spec(&source)
        })
        .await
        .unwrap();
    let err = manager.schedule_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::RetriesExhausted { attempts: 3, .. }));
    assert!(err.to_string().contains("3 attempts"));
    assert_eq!(stub.calls(), 3);
    let stored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("503"));
}

#[tokio::test]
async fn test_one_shot_ceiling_marks_failed() {
    let stub = StubProvider::failing(u32::MAX, Failure::Hang);
    let mut harness = Harness::new().with_stub(stub.clone());
    harness.config.one_shot_timeout = Duration::from_millis(100);
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager
        .create_task(TaskSpec {
            schedule: Some("* * * * * *".into()),
            ..spec(&source)
        })
        .await
        .unwrap();
    let err = manager.schedule_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::Timeout { .. }));
    let stored = manager.get_task(&task.id).await.unwrap();
    assert_eq!(stored.status, TaskStatus::Failed);
    assert!(stored.error_message.unwrap().contains("timed out"));
}

#[tokio::test]
async fn test_recurring_schedule_stops_on_first_error() {
    let stub = StubProvider::failing(u32::MAX, Failure::Fatal);
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager
        .create_task(TaskSpec {
            schedule: Some("* * * * * *".into()),
            recurring: true,
            ..spec(&source)
        })
        .await
        .unwrap();
    let err = manager.schedule_task(&task).await.unwrap_err();

    assert!(matches!(err, BackupError::Validation(_)));
    assert_eq!(stub.calls(), 1);
}

#[tokio::test]
async fn test_recurring_schedule_runs_until_cancelled() {
    let stub = StubProvider::succeeding();
    let harness = Harness::new().with_stub(stub.clone());
    let manager = harness.manager();
    let source = harness.write_source("a.txt", b"hello");

    let task = manager
        .create_task(TaskSpec {
            schedule: Some("* * * * * *".into()),
            recurring: true,
            ..spec(&source)
        })
        .await
        .unwrap();

    let handle = {
        let manager = manager.clone();
        let task = task.clone();
        tokio::spawn(async move { manager.schedule_task(&task).await })
    };

    assert!(common::eventually(|| stub.calls() >= 2).await);
    assert!(manager.cancel_schedule(&task.id));

    let result = handle.await.unwrap();
    assert!(matches!(result, Err(BackupError::Cancelled(_))));
    assert_eq!(manager.get_task(&task.id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn test_delete_task() {
    let harness = Harness::new();
    let manager = harness.manager();

    let keep = manager.create_task(spec(std::path::Path::new("/tmp/a.txt"))).await.unwrap();
    let removed = manager.create_task(spec(std::path::Path::new("/tmp/b.txt"))).await.unwrap();

    manager.delete_task(&removed.id).await.unwrap();
    let remaining: Vec<_> = manager.list_tasks().await.unwrap().into_iter().map(|t| t.id).collect();
    assert_eq!(remaining, vec![keep.id]);

    assert!(matches!(
        manager.delete_task(&removed.id).await,
        Err(BackupError::TaskNotFound(_))
    ));
}
