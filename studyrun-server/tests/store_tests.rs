//! Progress Store behaviour against an in-memory database

use std::cell::Cell;

use serde_json::json;
use studyrun_common::db::init_memory_database;
use studyrun_common::models::{ExperimentStatus, TaskStatus, TaskType, Variant};
use studyrun_common::results::TaskResult;
use studyrun_server::store::ProgressStore;

async fn setup_store() -> ProgressStore {
    let pool = init_memory_database().await.unwrap();
    let store = ProgressStore::new(pool, 1000);
    store
        .create_participant(Some("p1".to_string()))
        .await
        .unwrap();
    store
}

fn votes() -> TaskResult {
    TaskResult::parse(
        TaskType::HelpfulVotes,
        json!({"votes": [{"reviewId": "r1", "voteType": "not-helpful"}]}),
    )
    .unwrap()
}

#[tokio::test]
async fn test_order_generator_runs_once() {
    let store = setup_store().await;
    let calls = Cell::new(0);
    let generate = || {
        calls.set(calls.get() + 1);
        vec!["b".to_string(), "a".to_string(), "q".to_string()]
    };

    let first = store
        .get_or_create_order_assignment("p1", "exp1a", generate)
        .await
        .unwrap();
    let second = store
        .get_or_create_order_assignment("p1", "exp1a", || {
            calls.set(calls.get() + 1);
            vec!["a".to_string(), "b".to_string(), "q".to_string()]
        })
        .await
        .unwrap();

    assert_eq!(first, vec!["b", "a", "q"]);
    assert_eq!(second, first);
    assert_eq!(calls.get(), 1);
}

#[tokio::test]
async fn test_completion_is_write_once_until_reset() {
    let store = setup_store().await;

    assert!(store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::Completed, Some(&votes()))
        .await
        .unwrap());
    let first = store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();

    assert!(!store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::Completed, None)
        .await
        .unwrap());
    let second = store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(second, first);
    assert_eq!(second.result, Some(votes()));

    assert!(store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::Pending, None)
        .await
        .unwrap());
    let reset = store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(reset.status, TaskStatus::Pending);
    assert_eq!(reset.completed_at, None);
    assert_eq!(reset.result, None);
    assert!(reset.is_consistent());
}

#[tokio::test]
async fn test_reset_keeps_started_at() {
    let store = setup_store().await;
    store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::InProgress, None)
        .await
        .unwrap();
    let started = store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap()
        .started_at;
    assert!(started.is_some());

    store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::Completed, None)
        .await
        .unwrap();
    store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::Pending, None)
        .await
        .unwrap();

    let record = store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(record.started_at, started);
}

#[tokio::test]
async fn test_result_requires_completed_status() {
    let store = setup_store().await;
    let err = store
        .set_task_status("p1", "exp1a", "task-numeric", TaskStatus::InProgress, Some(&votes()))
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_experiment_status_timestamps() {
    let store = setup_store().await;
    store
        .set_experiment_status("p1", "exp1a", ExperimentStatus::InProgress)
        .await
        .unwrap();
    store
        .set_experiment_status("p1", "exp1a", ExperimentStatus::Completed)
        .await
        .unwrap();
    let completed = store.get_experiment_progress("p1", "exp1a").await.unwrap();
    assert!(completed.started_at.is_some());
    assert!(completed.completed_at.is_some());

    store
        .set_experiment_status("p1", "exp1a", ExperimentStatus::InProgress)
        .await
        .unwrap();
    let reopened = store.get_experiment_progress("p1", "exp1a").await.unwrap();
    assert_eq!(reopened.started_at, completed.started_at);
    assert_eq!(reopened.completed_at, None);
}

#[tokio::test]
async fn test_variant_is_write_once() {
    let store = setup_store().await;
    let first = store
        .get_or_create_variant("p1", "effectiveness", || Some(Variant::Treatment))
        .await
        .unwrap();
    let second = store
        .get_or_create_variant("p1", "effectiveness", || Some(Variant::Control))
        .await
        .unwrap();
    assert_eq!(first, Some(Variant::Treatment));
    assert_eq!(second, Some(Variant::Treatment));
}

#[tokio::test]
async fn test_legacy_rows_normalized_on_read() {
    let store = setup_store().await;
    // Rows written by an older build after the schema migration ran
    store
        .set_task_status("p1", "exp-effectiveness-control", "task-review-viewing", TaskStatus::InProgress, None)
        .await
        .unwrap();
    store
        .set_experiment_status("p1", "exp-effectiveness-control", ExperimentStatus::InProgress)
        .await
        .unwrap();

    let progress = store.get_progress("p1").await.unwrap();
    assert!(!progress.contains_key("exp-effectiveness-control"));
    let effectiveness = &progress["effectiveness"];
    assert_eq!(effectiveness.variant, Some(Variant::Control));
    assert!(effectiveness.tasks.contains_key("task-review-viewing"));

    // The rows themselves were rewritten
    let record = store
        .get_task_progress("p1", "effectiveness", "task-review-viewing")
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::InProgress);
    assert_eq!(
        store.get_variant("p1", "effectiveness").await.unwrap(),
        Some(Variant::Control)
    );
}

#[tokio::test]
async fn test_unknown_participant() {
    let store = setup_store().await;
    assert!(store.get_participant("nobody").await.unwrap().is_none());
    let err = store.load_participant("nobody").await.unwrap_err();
    assert!(matches!(err, studyrun_common::Error::NotFound(_)));
}

#[tokio::test]
async fn test_create_participant_is_idempotent() {
    let store = setup_store().await;
    let again = store
        .create_participant(Some("p1".to_string()))
        .await
        .unwrap();
    assert_eq!(again.participant_id, "p1");

    let generated = store.create_participant(None).await.unwrap();
    assert!(generated.participant_id.starts_with("participant-"));
}
