//! Completion Coordinator
//!
//! Validates task actions against the catalog and the task state machine,
//! then writes the task record and the experiment and participant
//! aggregates in one transaction. The audit event is recorded only after
//! that transaction commits, so a failed write leaves neither a partial
//! state nor an event behind, and a retry applies and logs the transition.
//!
//! Task state machine: `pending -> in_progress -> completed`, a task may be
//! completed straight from `pending`, and the only backward move is the
//! explicit reset `completed -> pending`. Experiment status is never set
//! directly; it is always derived from the task records.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{Sqlite, Transaction};
use studyrun_common::catalog::{Experiment, TaskConfig, TaskDef};
use studyrun_common::models::{
    EventType, ExperimentStatus, LogEvent, ProgressRecord, TaskStatus, TaskType, Variant,
};
use studyrun_common::normalize::canonical_id;
use studyrun_common::paths::{task_path, TaskQuery};
use studyrun_common::randomizer::Randomizer;
use studyrun_common::results::TaskResult;
use studyrun_common::{Catalog, Error, Result};
use tracing::info;

use crate::logger::EventLogger;
use crate::store::{ParticipantRow, ProgressStore};
use crate::utils::retry_on_lock;

/// Pointer to the task a participant should do next
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTask {
    pub task_id: String,
    pub path: String,
}

/// A catalog task as seen by one participant
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskView {
    pub experiment_id: String,
    pub task_id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_slug: Option<String>,
    pub config: TaskConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    pub progress: ProgressRecord,
    pub experiment_status: ExperimentStatus,
    pub order: Vec<String>,
    pub position: usize,
    pub path: String,
    pub next_task: Option<NextTask>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionOutcome {
    pub experiment_id: String,
    pub task_id: String,
    /// False when the task was already completed and nothing changed
    pub applied: bool,
    pub progress: ProgressRecord,
    pub experiment_status: ExperimentStatus,
    pub participant_completed: bool,
    /// Empty when the completed task was the last one: the experiment is finished
    pub next_task: Option<NextTask>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetOutcome {
    pub experiment_id: String,
    pub task_id: String,
    /// False when the task was already pending
    pub applied: bool,
    pub progress: ProgressRecord,
    pub experiment_status: ExperimentStatus,
    /// The reset task becomes the participant's current task again
    pub current_task: NextTask,
}

/// What one committed transition changed
struct Transition {
    applied: bool,
    variant: Option<Variant>,
    previous_status: ExperimentStatus,
    experiment_status: ExperimentStatus,
    participant_completed: bool,
}

pub struct CompletionCoordinator {
    catalog: Arc<Catalog>,
    store: ProgressStore,
    logger: Arc<EventLogger>,
    randomizer: Arc<Randomizer>,
}

impl CompletionCoordinator {
    pub fn new(
        catalog: Arc<Catalog>,
        store: ProgressStore,
        logger: Arc<EventLogger>,
        randomizer: Arc<Randomizer>,
    ) -> Self {
        Self {
            catalog,
            store,
            logger,
            randomizer,
        }
    }

    /// Look up an experiment/task pair, accepting legacy experiment ids
    fn resolve(&self, experiment_id: &str, task_id: &str) -> Result<(&Experiment, &TaskDef)> {
        let experiment = self.catalog.get_experiment(canonical_id(experiment_id))?;
        let task = experiment.task(task_id).ok_or_else(|| {
            Error::NotFound(format!(
                "task '{}' in experiment '{}'",
                task_id, experiment.id
            ))
        })?;
        Ok((experiment, task))
    }

    /// Task actions need a known participant who has signed the consent form
    async fn require_consent(&self, participant_id: &str) -> Result<ParticipantRow> {
        let participant = self.store.require_participant(participant_id).await?;
        if !participant.has_consented() {
            return Err(Error::Validation(format!(
                "participant '{}' has not given consent",
                participant_id
            )));
        }
        Ok(participant)
    }

    /// Participant's task order, assigned on first access
    pub async fn order_for(&self, participant_id: &str, experiment: &Experiment) -> Result<Vec<String>> {
        self.store
            .get_or_create_order_assignment(participant_id, &experiment.id, || {
                self.randomizer.order_for(experiment)
            })
            .await
    }

    /// Participant's variant, assigned on first access for experiments that declare variants
    pub async fn variant_for(
        &self,
        participant_id: &str,
        experiment: &Experiment,
    ) -> Result<Option<Variant>> {
        if experiment.variants.is_empty() {
            return Ok(None);
        }
        self.store
            .get_or_create_variant(participant_id, &experiment.id, || {
                self.randomizer.variant_for(experiment)
            })
            .await
    }

    /// Stored variant, or a freshly drawn one that is not written yet.
    /// The flag is true when the variant still has to be stored.
    async fn tentative_variant(
        &self,
        participant_id: &str,
        experiment: &Experiment,
    ) -> Result<(Option<Variant>, bool)> {
        if experiment.variants.is_empty() {
            return Ok((None, false));
        }
        match self.store.get_variant(participant_id, &experiment.id).await? {
            Some(stored) => Ok((Some(stored), false)),
            None => Ok((self.randomizer.variant_for(experiment), true)),
        }
    }

    /// Participant's experiment sequence, assigned on first access
    pub async fn sequence_for(&self, participant_id: &str) -> Result<Vec<String>> {
        self.store.require_participant(participant_id).await?;
        self.store
            .get_or_create_sequence(participant_id, || self.randomizer.sequence_for(&self.catalog))
            .await
    }

    /// Task after `task_id` in the stored order, or in catalog order when
    /// no order was assigned (or the stored one does not list the task).
    async fn next_task(
        &self,
        participant_id: &str,
        experiment: &Experiment,
        task_id: &str,
        variant: Option<Variant>,
    ) -> Result<Option<NextTask>> {
        let stored = self
            .store
            .get_order_assignment(participant_id, &experiment.id)
            .await?;
        let order: Vec<String> = match stored {
            Some(order) if order.iter().any(|id| id == task_id) => order,
            _ => experiment.task_ids().map(str::to_string).collect(),
        };
        Ok(next_in_order(&order, experiment, task_id, variant))
    }

    /// A task as the participant should see it. The address's `type` and
    /// `product` must match the task; both are checked before the variant
    /// and order are assigned.
    pub async fn task_view(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        query: &TaskQuery,
    ) -> Result<TaskView> {
        let (experiment, task) = self.resolve(experiment_id, task_id)?;
        self.require_consent(participant_id).await?;

        if let Some(requested) = query.product.as_deref().filter(|p| !p.is_empty()) {
            if task.product_slug.as_deref() != Some(requested) {
                return Err(Error::Validation(format!(
                    "task '{}' is not about product '{}'",
                    task.id, requested
                )));
            }
        }

        let (tentative, _) = self.tentative_variant(participant_id, experiment).await?;
        let task_type = task.type_for(tentative);
        if let Some(requested) = query.task_type {
            if requested != task_type {
                return Err(Error::Validation(format!(
                    "task '{}' is of type {}, not {}",
                    task.id, task_type, requested
                )));
            }
        }

        let variant = if experiment.variants.is_empty() {
            None
        } else {
            self.store
                .get_or_create_variant(participant_id, &experiment.id, || tentative)
                .await?
        };
        let task_type = task.type_for(variant);

        let order = self.order_for(participant_id, experiment).await?;
        let progress = self
            .store
            .get_task_progress(participant_id, &experiment.id, &task.id)
            .await?;
        let experiment_status = self
            .store
            .get_experiment_progress(participant_id, &experiment.id)
            .await?
            .status;
        let position = order.iter().position(|id| *id == task.id).unwrap_or(0);
        let next_task = next_in_order(&order, experiment, &task.id, variant);

        Ok(TaskView {
            experiment_id: experiment.id.clone(),
            task_id: task.id.clone(),
            title: task.title.clone(),
            task_type,
            product_slug: task.product_slug.clone(),
            config: task.config.clone(),
            variant,
            progress,
            experiment_status,
            order,
            position,
            path: task_path(&experiment.id, task, variant),
            next_task,
        })
    }

    /// Move a pending task to `in_progress`. Starting a task that is
    /// already in progress or completed changes nothing and logs nothing.
    pub async fn start_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<TaskView> {
        let (experiment, task) = self.resolve(experiment_id, task_id)?;
        self.require_consent(participant_id).await?;
        let variant = self.variant_for(participant_id, experiment).await?;
        self.order_for(participant_id, experiment).await?;

        let current = self
            .store
            .get_task_progress(participant_id, &experiment.id, &task.id)
            .await?;
        if current.status == TaskStatus::Pending {
            let transition = retry_on_lock("start task", self.store.max_lock_wait_ms(), || async {
                let mut tx = self.store.begin().await?;
                let applied = ProgressStore::write_task_status(
                    &mut tx,
                    participant_id,
                    &experiment.id,
                    &task.id,
                    TaskStatus::InProgress,
                    None,
                )
                .await?;
                let (previous_status, experiment_status) =
                    recompute_experiment(&mut tx, participant_id, experiment).await?;
                tx.commit().await?;
                Ok(Transition {
                    applied,
                    variant,
                    previous_status,
                    experiment_status,
                    participant_completed: false,
                })
            })
            .await?;

            log_status_change(participant_id, &experiment.id, &transition);
            if transition.applied {
                self.logger
                    .record(LogEvent::new(
                        participant_id,
                        &experiment.id,
                        &task.id,
                        EventType::TaskStart,
                        json!({ "taskType": task.type_for(variant) }),
                    ))
                    .await;
                info!(participant_id, experiment_id = %experiment.id, task_id = %task.id, "Task started");
            }
        }

        self.task_view(participant_id, &experiment.id, &task.id, &TaskQuery::default())
            .await
    }

    /// Complete a task.
    ///
    /// The result payload is validated against the task's type before any
    /// write; for an experiment with variants the participant's variant is
    /// only stored together with the completion. Completing an
    /// already-completed task is a no-op: the first completion's timestamp
    /// and result are kept, and no second event is logged.
    pub async fn complete_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<CompletionOutcome> {
        let (experiment, task) = self.resolve(experiment_id, task_id)?;
        self.require_consent(participant_id).await?;
        let (variant, unstored) = self.tentative_variant(participant_id, experiment).await?;
        let task_type = task.type_for(variant);

        let result = match result {
            None | Some(Value::Null) => None,
            Some(raw) => Some(TaskResult::parse(task_type, raw)?),
        };

        let transition = retry_on_lock("complete task", self.store.max_lock_wait_ms(), || async {
            let mut tx = self.store.begin().await?;

            let variant = match variant {
                Some(chosen) if unstored => {
                    let stored =
                        ProgressStore::write_variant(&mut tx, participant_id, &experiment.id, chosen)
                            .await?;
                    if task.type_for(Some(stored)) != task_type {
                        return Err(Error::Validation(format!(
                            "task '{}' became {} for variant {} assigned concurrently",
                            task.id,
                            task.type_for(Some(stored)),
                            stored.as_str()
                        )));
                    }
                    Some(stored)
                }
                other => other,
            };

            let applied = ProgressStore::write_task_status(
                &mut tx,
                participant_id,
                &experiment.id,
                &task.id,
                TaskStatus::Completed,
                result.as_ref(),
            )
            .await?;
            let (previous_status, experiment_status) =
                recompute_experiment(&mut tx, participant_id, experiment).await?;
            let participant_completed = self.recompute_participant(&mut tx, participant_id).await?;
            tx.commit().await?;

            Ok(Transition {
                applied,
                variant,
                previous_status,
                experiment_status,
                participant_completed,
            })
        })
        .await?;

        log_status_change(participant_id, &experiment.id, &transition);
        if transition.applied {
            self.logger
                .record(LogEvent::new(
                    participant_id,
                    &experiment.id,
                    &task.id,
                    EventType::TaskComplete,
                    json!({ "taskType": task_type, "result": result }),
                ))
                .await;
            info!(
                participant_id,
                experiment_id = %experiment.id,
                task_id = %task.id,
                experiment_status = %transition.experiment_status,
                "Task completed"
            );
            if transition.participant_completed {
                info!(participant_id, "Participant completed the study");
            }
        } else {
            info!(
                participant_id,
                experiment_id = %experiment.id,
                task_id = %task.id,
                "Task already completed, completion ignored"
            );
        }

        let progress = self
            .store
            .get_task_progress(participant_id, &experiment.id, &task.id)
            .await?;
        let next_task = self
            .next_task(participant_id, experiment, &task.id, transition.variant)
            .await?;

        Ok(CompletionOutcome {
            experiment_id: experiment.id.clone(),
            task_id: task.id.clone(),
            applied: transition.applied,
            progress,
            experiment_status: transition.experiment_status,
            participant_completed: transition.participant_completed,
            next_task,
        })
    }

    /// Reset a completed task to `pending`, clearing its result and
    /// completion timestamp. Resetting a pending task is a no-op; resetting
    /// a task in progress is an invalid transition.
    ///
    /// The task record, the experiment status and the participant's
    /// completion are rewritten in one transaction.
    pub async fn reset_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<ResetOutcome> {
        let (experiment, task) = self.resolve(experiment_id, task_id)?;
        self.require_consent(participant_id).await?;

        let current = self
            .store
            .get_task_progress(participant_id, &experiment.id, &task.id)
            .await?;
        if !current.status.can_transition(TaskStatus::Pending) {
            return Err(Error::InvalidTransition(format!(
                "task '{}' is {}; only completed tasks can be reset",
                task.id, current.status
            )));
        }
        let variant = self.variant_for(participant_id, experiment).await?;

        let (applied, experiment_status) = if current.status == TaskStatus::Completed {
            let transition = retry_on_lock("reset task", self.store.max_lock_wait_ms(), || async {
                let mut tx = self.store.begin().await?;
                let applied = ProgressStore::write_task_status(
                    &mut tx,
                    participant_id,
                    &experiment.id,
                    &task.id,
                    TaskStatus::Pending,
                    None,
                )
                .await?;
                let (previous_status, experiment_status) =
                    recompute_experiment(&mut tx, participant_id, experiment).await?;
                if applied {
                    ProgressStore::write_participant_completed(&mut tx, participant_id, false)
                        .await?;
                }
                tx.commit().await?;
                Ok(Transition {
                    applied,
                    variant,
                    previous_status,
                    experiment_status,
                    participant_completed: false,
                })
            })
            .await?;

            log_status_change(participant_id, &experiment.id, &transition);
            if transition.applied {
                self.logger
                    .record(LogEvent::new(
                        participant_id,
                        &experiment.id,
                        &task.id,
                        EventType::TaskUncomplete,
                        json!({ "previousCompletedAt": current.completed_at }),
                    ))
                    .await;
                info!(participant_id, experiment_id = %experiment.id, task_id = %task.id, "Task reset");
            }
            (transition.applied, transition.experiment_status)
        } else {
            let status = self
                .store
                .get_experiment_progress(participant_id, &experiment.id)
                .await?
                .status;
            (false, status)
        };

        let progress = self
            .store
            .get_task_progress(participant_id, &experiment.id, &task.id)
            .await?;

        Ok(ResetOutcome {
            experiment_id: experiment.id.clone(),
            task_id: task.id.clone(),
            applied,
            progress,
            experiment_status,
            current_task: NextTask {
                task_id: task.id.clone(),
                path: task_path(&experiment.id, task, variant),
            },
        })
    }

    /// Mark the participant completed once every study experiment is.
    async fn recompute_participant(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        participant_id: &str,
    ) -> Result<bool> {
        let statuses = ProgressStore::experiment_statuses_on(&mut **tx, participant_id).await?;
        let all_completed = self
            .catalog
            .study_experiment_ids()
            .iter()
            .all(|id| statuses.get(*id) == Some(&ExperimentStatus::Completed));

        if all_completed {
            ProgressStore::write_participant_completed(tx, participant_id, true).await?;
        }
        Ok(all_completed)
    }
}

/// Derive the experiment status from its task records inside `tx` and
/// store it if it changed. A started experiment never falls back to
/// `not_started`. Returns the previous and the derived status.
async fn recompute_experiment(
    tx: &mut Transaction<'_, Sqlite>,
    participant_id: &str,
    experiment: &Experiment,
) -> Result<(ExperimentStatus, ExperimentStatus)> {
    let progress =
        ProgressStore::experiment_progress_on(&mut **tx, participant_id, &experiment.id).await?;

    let mut derived = ExperimentStatus::derive(experiment.task_ids(), &progress.tasks);
    if derived == ExperimentStatus::NotStarted && progress.started_at.is_some() {
        derived = ExperimentStatus::InProgress;
    }

    if derived != progress.status {
        ProgressStore::write_experiment_status(tx, participant_id, &experiment.id, derived).await?;
    }
    Ok((progress.status, derived))
}

fn log_status_change(participant_id: &str, experiment_id: &str, transition: &Transition) {
    if transition.previous_status != transition.experiment_status {
        info!(
            participant_id,
            experiment_id,
            from = %transition.previous_status,
            to = %transition.experiment_status,
            "Experiment status changed"
        );
    }
}

fn next_in_order(
    order: &[String],
    experiment: &Experiment,
    task_id: &str,
    variant: Option<Variant>,
) -> Option<NextTask> {
    let index = order.iter().position(|id| id == task_id)?;
    let next_id = order.get(index + 1)?;
    let next = experiment.task(next_id)?;
    Some(NextTask {
        task_id: next.id.clone(),
        path: task_path(&experiment.id, next, variant),
    })
}
