//! Completion Coordinator scenarios against an in-memory database

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use studyrun_common::db::init_memory_database;
use studyrun_common::models::{Consent, EventType, ExperimentStatus, LogEvent, TaskStatus};
use studyrun_common::paths::TaskQuery;
use studyrun_common::randomizer::Randomizer;
use studyrun_common::results::TaskResult;
use studyrun_common::{time, Catalog, Error, Result};
use studyrun_server::logger::EventSink;
use studyrun_server::AppState;

struct FailingSink;

#[async_trait]
impl EventSink for FailingSink {
    async fn append_batch(&self, _events: &[LogEvent]) -> Result<()> {
        Err(Error::Storage("event log unavailable".to_string()))
    }

    async fn events_for(&self, _participant_id: &str) -> Result<Vec<LogEvent>> {
        Ok(Vec::new())
    }
}

async fn setup_state() -> AppState {
    let pool = init_memory_database().await.unwrap();
    AppState::new(
        pool,
        Arc::new(Catalog::builtin()),
        Arc::new(Randomizer::seeded(7)),
        1000,
    )
}

async fn consenting_participant(state: &AppState, participant_id: &str) {
    state
        .store
        .create_participant(Some(participant_id.to_string()))
        .await
        .unwrap();
    state
        .store
        .record_consent(
            participant_id,
            &Consent {
                name: "Test Participant".to_string(),
                date: time::now(),
                signed: true,
            },
        )
        .await
        .unwrap();
}

fn votes(review_id: &str) -> Value {
    json!({"votes": [{"reviewId": review_id, "voteType": "helpful"}]})
}

fn annotations() -> Value {
    json!({"annotations": [{"reviewId": "r1", "sentenceId": "s1", "annotationType": "pro"}]})
}

fn questionnaire() -> Value {
    json!({"responses": [{"questionId": "q1", "value": 4}]})
}

fn comprehension() -> Value {
    json!({"answers": [1, 0, 2]})
}

/// A valid payload for every task of the experiment, in stored order
async fn complete_experiment(state: &AppState, participant_id: &str, experiment_id: &str) {
    let experiment = state.catalog.get_experiment(experiment_id).unwrap().clone();
    let order = state
        .coordinator
        .order_for(participant_id, &experiment)
        .await
        .unwrap();
    for task_id in order {
        let task = experiment.task(&task_id).unwrap();
        let payload = match task.task_type {
            studyrun_common::models::TaskType::HelpfulVotes => votes("r1"),
            studyrun_common::models::TaskType::SentenceAnnotations => annotations(),
            studyrun_common::models::TaskType::TextFeedback => {
                json!({"feedback": [{"reviewId": "r1", "content": "Too long"}]})
            }
            studyrun_common::models::TaskType::Questionnaire => questionnaire(),
            studyrun_common::models::TaskType::ComprehensionTest => comprehension(),
        };
        state
            .coordinator
            .complete_task(participant_id, experiment_id, &task_id, Some(payload))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn test_order_assignment_is_idempotent() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;
    let experiment = state.catalog.get_experiment("exp1a").unwrap().clone();

    let first = state.coordinator.order_for("p1", &experiment).await.unwrap();
    let second = state.coordinator.order_for("p1", &experiment).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_closing_questionnaire_always_last() {
    let state = setup_state().await;
    let experiment = state.catalog.get_experiment("exp1a").unwrap().clone();

    for n in 0..20 {
        let participant_id = format!("p{}", n);
        consenting_participant(&state, &participant_id).await;
        let order = state
            .coordinator
            .order_for(&participant_id, &experiment)
            .await
            .unwrap();
        assert_eq!(order.len(), 3);
        assert_eq!(order[2], "q-comp-1a");
    }
}

#[tokio::test]
async fn test_double_completion_keeps_first_timestamp_and_result() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let first = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(votes("r1")))
        .await
        .unwrap();
    assert!(first.applied);

    let second = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(votes("r2")))
        .await
        .unwrap();
    assert!(!second.applied);
    assert_eq!(second.progress.completed_at, first.progress.completed_at);

    let stored = state
        .store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(stored.completed_at, first.progress.completed_at);
    assert_eq!(
        stored.result,
        Some(TaskResult::parse(studyrun_common::models::TaskType::HelpfulVotes, votes("r1")).unwrap())
    );
}

#[tokio::test]
async fn test_reset_clears_completion() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    state
        .coordinator
        .complete_task("p1", "exp1a", "task-proposed-1", Some(annotations()))
        .await
        .unwrap();
    let outcome = state
        .coordinator
        .reset_task("p1", "exp1a", "task-proposed-1")
        .await
        .unwrap();

    assert!(outcome.applied);
    assert_eq!(outcome.progress.status, TaskStatus::Pending);
    assert_eq!(outcome.progress.completed_at, None);
    assert_eq!(outcome.progress.result, None);
    assert_eq!(outcome.current_task.task_id, "task-proposed-1");
    assert_ne!(outcome.experiment_status, ExperimentStatus::Completed);

    // Complete again after the reset: a new completion is recorded
    let again = state
        .coordinator
        .complete_task("p1", "exp1a", "task-proposed-1", Some(annotations()))
        .await
        .unwrap();
    assert!(again.applied);
}

#[tokio::test]
async fn test_reset_rules() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let pending = state
        .coordinator
        .reset_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert!(!pending.applied);

    state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    let err = state
        .coordinator
        .reset_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
}

#[tokio::test]
async fn test_experiment_completes_only_with_every_task() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;
    let experiment = state.catalog.get_experiment("exp1a").unwrap().clone();
    let order = state.coordinator.order_for("p1", &experiment).await.unwrap();

    let payloads = |task_id: &str| match task_id {
        "task-numeric" => votes("r1"),
        "task-proposed-1" => annotations(),
        _ => questionnaire(),
    };

    for task_id in &order[..2] {
        let outcome = state
            .coordinator
            .complete_task("p1", "exp1a", task_id, Some(payloads(task_id)))
            .await
            .unwrap();
        assert_eq!(outcome.experiment_status, ExperimentStatus::InProgress);
        assert!(outcome.next_task.is_some());
    }

    let last = state
        .coordinator
        .complete_task("p1", "exp1a", &order[2], Some(payloads(&order[2])))
        .await
        .unwrap();
    assert_eq!(last.experiment_status, ExperimentStatus::Completed);
    assert!(last.next_task.is_none(), "last task has no successor");

    let progress = state.store.get_progress("p1").await.unwrap();
    assert_eq!(progress["exp1a"].status, ExperimentStatus::Completed);
    assert!(progress["exp1a"].completed_at.is_some());
}

#[tokio::test]
async fn test_next_task_follows_assigned_order() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;
    let experiment = state.catalog.get_experiment("exp1a").unwrap().clone();
    let order = state.coordinator.order_for("p1", &experiment).await.unwrap();

    let first_payload = if order[0] == "task-numeric" {
        votes("r1")
    } else {
        annotations()
    };
    let outcome = state
        .coordinator
        .complete_task("p1", "exp1a", &order[0], Some(first_payload))
        .await
        .unwrap();
    let next = outcome.next_task.unwrap();
    assert_eq!(next.task_id, order[1]);
    assert!(next.path.starts_with(&format!("/experiments/exp1a/task/{}?type=", order[1])));
}

#[tokio::test]
async fn test_next_task_uses_catalog_order_without_assignment() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let outcome = state
        .coordinator
        .complete_task("p1", "exp1b", "task-text", Some(json!({"feedback": []})))
        .await
        .unwrap();
    assert_eq!(outcome.next_task.unwrap().task_id, "task-proposed-2");
}

#[tokio::test]
async fn test_invalid_requests_write_nothing() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let err = state
        .coordinator
        .complete_task("p1", "exp1a", "no-such-task", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    let err = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(json!({"answers": [1]})))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let record = state
        .store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Pending);

    // A rejected payload must not leave a variant assignment behind
    let err = state
        .coordinator
        .complete_task(
            "p1",
            "effectiveness",
            "task-comprehension-test",
            Some(json!({"bogus": 1})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    let err = state
        .coordinator
        .task_view(
            "p1",
            "effectiveness",
            "task-comprehension-test",
            &TaskQuery {
                task_type: None,
                product: Some("wireless-earbuds-pro".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    assert_eq!(
        state.store.get_variant("p1", "effectiveness").await.unwrap(),
        None
    );
    let progress = state
        .store
        .get_experiment_progress("p1", "effectiveness")
        .await
        .unwrap();
    assert!(progress.tasks.is_empty());
    assert!(state.logger.events_for("p1").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_task_view_checks_product() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let view = state
        .coordinator
        .task_view(
            "p1",
            "effectiveness",
            "task-comprehension-test",
            &TaskQuery {
                task_type: None,
                product: Some("mechanical-keyboard-rgb".to_string()),
            },
        )
        .await
        .unwrap();
    assert_eq!(view.product_slug.as_deref(), Some("mechanical-keyboard-rgb"));
    assert!(view.variant.is_some());

    // A task without a product does not accept one
    let err = state
        .coordinator
        .task_view(
            "p1",
            "exp1a",
            "q-comp-1a",
            &TaskQuery {
                task_type: None,
                product: Some("mechanical-keyboard-rgb".to_string()),
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}

async fn event_types(state: &AppState, participant_id: &str) -> Vec<EventType> {
    state
        .logger
        .events_for(participant_id)
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect()
}

async fn exec(state: &AppState, sql: &str) {
    sqlx::query(sql).execute(&state.db).await.unwrap();
}

#[tokio::test]
async fn test_failed_aggregate_write_commits_nothing() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    exec(
        &state,
        r#"
        CREATE TRIGGER refuse_aggregate BEFORE INSERT ON experiment_progress
        BEGIN SELECT RAISE(ABORT, 'aggregate write refused'); END
        "#,
    )
    .await;

    let err = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(votes("r1")))
        .await
        .unwrap_err();
    assert!(err.is_persistence());

    let record = state
        .store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Pending);
    assert!(record.completed_at.is_none());
    assert!(event_types(&state, "p1").await.is_empty());

    exec(&state, "DROP TRIGGER refuse_aggregate").await;

    let outcome = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(votes("r1")))
        .await
        .unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.experiment_status, ExperimentStatus::InProgress);
    assert_eq!(event_types(&state, "p1").await, vec![EventType::TaskComplete]);
}

#[tokio::test]
async fn test_failed_reset_commits_nothing() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;
    complete_experiment(&state, "p1", "exp1a").await;
    let completions = event_types(&state, "p1").await.len();

    // The participant row is the last write of a reset
    exec(
        &state,
        r#"
        CREATE TRIGGER refuse_participant BEFORE UPDATE ON participants
        BEGIN SELECT RAISE(ABORT, 'participant write refused'); END
        "#,
    )
    .await;

    let err = state
        .coordinator
        .reset_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap_err();
    assert!(err.is_persistence());

    let record = state
        .store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);
    assert!(record.result.is_some());
    let progress = state
        .store
        .get_experiment_progress("p1", "exp1a")
        .await
        .unwrap();
    assert_eq!(progress.status, ExperimentStatus::Completed);
    assert_eq!(event_types(&state, "p1").await.len(), completions);

    exec(&state, "DROP TRIGGER refuse_participant").await;

    let outcome = state
        .coordinator
        .reset_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert!(outcome.applied);
    assert_eq!(outcome.experiment_status, ExperimentStatus::InProgress);
    let types = event_types(&state, "p1").await;
    assert_eq!(types.len(), completions + 1);
    assert_eq!(types.last(), Some(&EventType::TaskUncomplete));
}

#[tokio::test]
async fn test_task_actions_require_consent() {
    let state = setup_state().await;
    state
        .store
        .create_participant(Some("p1".to_string()))
        .await
        .unwrap();

    let err = state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn test_lifecycle_events_are_logged_once() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    for _ in 0..2 {
        state
            .coordinator
            .complete_task("p1", "exp1a", "task-numeric", Some(votes("r1")))
            .await
            .unwrap();
    }
    state
        .coordinator
        .reset_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();

    let types: Vec<EventType> = state
        .logger
        .events_for("p1")
        .await
        .unwrap()
        .iter()
        .map(|e| e.event_type)
        .collect();
    assert_eq!(
        types,
        vec![
            EventType::TaskStart,
            EventType::TaskComplete,
            EventType::TaskUncomplete
        ]
    );
}

#[tokio::test]
async fn test_start_keeps_first_started_at() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let first = state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(first.progress.status, TaskStatus::InProgress);
    assert_eq!(first.experiment_status, ExperimentStatus::InProgress);

    let second = state
        .coordinator
        .start_task("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(second.progress.started_at, first.progress.started_at);
}

#[tokio::test]
async fn test_logging_failure_does_not_fail_completion() {
    let pool = init_memory_database().await.unwrap();
    let state = AppState::with_event_sink(
        pool,
        Arc::new(Catalog::builtin()),
        Arc::new(Randomizer::seeded(1)),
        1000,
        Arc::new(FailingSink),
    );
    consenting_participant(&state, "p1").await;

    let outcome = state
        .coordinator
        .complete_task("p1", "exp1a", "task-numeric", Some(votes("r1")))
        .await
        .unwrap();
    assert!(outcome.applied);

    let record = state
        .store
        .get_task_progress("p1", "exp1a", "task-numeric")
        .await
        .unwrap();
    assert_eq!(record.status, TaskStatus::Completed);

    let telemetry = state.logger.telemetry();
    assert_eq!(telemetry.failures, 1);
    assert!(telemetry.last_error.is_some());
}

#[tokio::test]
async fn test_participant_completion_cascade() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    for experiment_id in ["exp1a", "exp1b", "exp1c"] {
        complete_experiment(&state, "p1", experiment_id).await;
    }
    let participant = state.store.require_participant("p1").await.unwrap();
    assert!(participant.completed_at.is_none());

    complete_experiment(&state, "p1", "exp2").await;
    let participant = state.store.require_participant("p1").await.unwrap();
    assert!(participant.completed_at.is_some());

    state
        .coordinator
        .reset_task("p1", "exp2", "task2-3")
        .await
        .unwrap();
    let participant = state.store.require_participant("p1").await.unwrap();
    assert!(participant.completed_at.is_none());
}

#[tokio::test]
async fn test_variant_decides_result_schema() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;
    let experiment = state.catalog.get_experiment("effectiveness").unwrap().clone();

    let variant = state
        .coordinator
        .variant_for("p1", &experiment)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        state.coordinator.variant_for("p1", &experiment).await.unwrap(),
        Some(variant)
    );

    let task = experiment.task("task-review-viewing").unwrap();
    let payload = match task.type_for(Some(variant)) {
        studyrun_common::models::TaskType::HelpfulVotes => votes("r1"),
        _ => annotations(),
    };
    let outcome = state
        .coordinator
        .complete_task("p1", "effectiveness", "task-review-viewing", Some(payload))
        .await
        .unwrap();
    assert!(outcome.applied);
}

#[tokio::test]
async fn test_legacy_experiment_id_resolves() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let view = state
        .coordinator
        .task_view("p1", "exp-text-vs-selection", "task-text-1", &TaskQuery::default())
        .await
        .unwrap();
    assert_eq!(view.experiment_id, "text-vs-selection");
    assert_eq!(view.order.last().map(String::as_str), Some("task-questionnaire-1"));
}

#[tokio::test]
async fn test_mismatched_task_type_rejected() {
    let state = setup_state().await;
    consenting_participant(&state, "p1").await;

    let err = state
        .coordinator
        .task_view(
            "p1",
            "exp1a",
            "task-numeric",
            &TaskQuery {
                task_type: Some(studyrun_common::models::TaskType::Questionnaire),
                product: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));
}
