//! Local mirror of the participant's study state
//!
//! The cache holds two documents in its [`LocalStore`]: the participant
//! record (consent, orders, progress) and the experiment currently being
//! worked through with its task pointer. Both are passed through the
//! legacy-id normalizer on restore and written back once if that changed
//! anything.
//!
//! Two open tabs for the same participant overwrite each other here (last
//! write wins); the server-of-record is the authority.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use studyrun_common::models::{
    EventType, ExperimentProgress, ExperimentStatus, LogEvent, ParticipantRecord, TaskStatus,
    Variant,
};
use studyrun_common::normalize::{self, canonical_id, normalize_participant, ExperimentKeyed};
use studyrun_common::time;
use tracing::{debug, info, warn};

use crate::remote::TaskOutcome;
use crate::storage::{LocalStore, CURRENT_EXPERIMENT_KEY, PARTICIPANT_KEY};
use crate::{ClientError, Result};

/// Experiment in progress and the participant's position in it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CurrentExperiment {
    pub experiment_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    pub task_order: Vec<String>,
    #[serde(default)]
    pub current_task_index: usize,
}

impl CurrentExperiment {
    /// Task at the pointer; `None` once the pointer is past the last task
    pub fn current_task(&self) -> Option<&str> {
        self.task_order
            .get(self.current_task_index)
            .map(String::as_str)
    }

    pub fn is_finished(&self) -> bool {
        self.current_task_index >= self.task_order.len()
    }

    fn position(&self, task_id: &str) -> Option<usize> {
        self.task_order.iter().position(|id| id == task_id)
    }
}

impl ExperimentKeyed for CurrentExperiment {
    fn experiment_id(&self) -> &str {
        &self.experiment_id
    }

    fn set_identity(&mut self, experiment_id: String, variant: Option<Variant>) {
        self.experiment_id = experiment_id;
        if variant.is_some() {
            self.variant = variant;
        }
    }
}

/// Server confirmation state of the last local change to a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    Pending,
    Synced,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionKind {
    Complete { result: Option<Value> },
    Reset,
}

impl ActionKind {
    pub fn target_status(&self) -> TaskStatus {
        match self {
            ActionKind::Complete { .. } => TaskStatus::Completed,
            ActionKind::Reset => TaskStatus::Pending,
        }
    }
}

/// Task action the server has not recorded yet
#[derive(Debug, Clone, PartialEq)]
pub struct UnsyncedAction {
    pub experiment_id: String,
    pub task_id: String,
    pub kind: ActionKind,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Undo record for one optimistic update
#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticChange {
    pub experiment_id: String,
    pub task_id: String,
    pub status: TaskStatus,
    previous_progress: Option<ExperimentProgress>,
    previous_index: usize,
    previous_completed_at: Option<DateTime<Utc>>,
}

pub struct ClientCache<S: LocalStore> {
    store: S,
    participant: Option<ParticipantRecord>,
    current: Option<CurrentExperiment>,
    sync: BTreeMap<(String, String), SyncState>,
    pub(crate) unsynced: Vec<UnsyncedAction>,
    pub(crate) events: Vec<LogEvent>,
}

impl<S: LocalStore> ClientCache<S> {
    /// Empty cache over `store`; call [`ClientCache::restore`] to load it.
    pub fn new(store: S) -> Self {
        Self {
            store,
            participant: None,
            current: None,
            sync: BTreeMap::new(),
            unsynced: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Load the cached participant, normalizing legacy experiment ids.
    ///
    /// Returns `Ok(None)` when nothing is cached and `ClientError::Restore`
    /// when a cached document cannot be parsed. A normalized snapshot is
    /// persisted again so the rewrite happens once.
    pub fn restore(&mut self) -> Result<Option<&ParticipantRecord>> {
        let Some(raw) = self.store.get(PARTICIPANT_KEY)? else {
            self.participant = None;
            self.current = None;
            return Ok(None);
        };

        let record: ParticipantRecord = serde_json::from_str(&raw)
            .map_err(|e| ClientError::Restore(format!("participant snapshot: {}", e)))?;
        let (record, participant_changed) = normalize_participant(record);

        let (current, current_changed) = match self.store.get(CURRENT_EXPERIMENT_KEY)? {
            Some(raw) => {
                let current: CurrentExperiment = serde_json::from_str(&raw)
                    .map_err(|e| ClientError::Restore(format!("current experiment: {}", e)))?;
                let (mut current, changed) = normalize::normalize(current);
                current.current_task_index = current.current_task_index.min(current.task_order.len());
                (Some(current), changed)
            }
            None => (None, false),
        };

        self.participant = Some(record);
        self.current = current;

        if participant_changed || current_changed {
            info!("Cached state used legacy experiment ids, writing normalized copy");
            self.persist()?;
        }

        Ok(self.participant.as_ref())
    }

    /// Replace the cached participant with a record from the server.
    ///
    /// Loading a different participant drops everything held for the
    /// previous one.
    pub fn load_participant(&mut self, record: ParticipantRecord) -> Result<()> {
        let (record, _) = normalize_participant(record);
        let same = self
            .participant
            .as_ref()
            .map(|p| p.participant_id == record.participant_id)
            .unwrap_or(false);
        if !same {
            self.current = None;
            self.sync.clear();
            self.unsynced.clear();
            self.events.clear();
        }
        debug!(participant_id = %record.participant_id, "Participant loaded into cache");
        self.participant = Some(record);
        self.persist()
    }

    pub fn participant(&self) -> Option<&ParticipantRecord> {
        self.participant.as_ref()
    }

    pub(crate) fn participant_id(&self) -> Result<&str> {
        self.participant
            .as_ref()
            .map(|p| p.participant_id.as_str())
            .ok_or(ClientError::NoParticipant)
    }

    pub fn current_experiment(&self) -> Option<&CurrentExperiment> {
        self.current.as_ref()
    }

    pub(crate) fn is_current(&self, experiment_id: &str) -> bool {
        self.current
            .as_ref()
            .map(|c| c.experiment_id == experiment_id)
            .unwrap_or(false)
    }

    /// Make `experiment_id` the experiment in progress with the server's
    /// task order. The pointer resumes at the first task not yet completed.
    pub fn enter_experiment(
        &mut self,
        experiment_id: &str,
        variant: Option<Variant>,
        task_order: Vec<String>,
    ) -> Result<&CurrentExperiment> {
        let participant = self.participant.as_mut().ok_or(ClientError::NoParticipant)?;
        let experiment_id = canonical_id(experiment_id).to_string();

        let tasks = participant
            .experiment_progress
            .get(&experiment_id)
            .map(|p| &p.tasks);
        let current_task_index = task_order
            .iter()
            .position(|id| {
                tasks
                    .and_then(|t| t.get(id))
                    .map(|r| r.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .unwrap_or(task_order.len());

        participant
            .experiment_order
            .insert(experiment_id.clone(), task_order.clone());
        if let Some(variant) = variant {
            participant
                .experiment_progress
                .entry(experiment_id.clone())
                .or_default()
                .variant = Some(variant);
        }

        info!(experiment_id = %experiment_id, current_task_index, "Entered experiment");
        self.current = Some(CurrentExperiment {
            experiment_id,
            variant,
            task_order,
            current_task_index,
        });
        self.persist()?;
        self.current.as_ref().ok_or(ClientError::NoActiveExperiment)
    }

    /// Task at the pointer of the experiment in progress
    pub fn current_task(&self) -> Option<&str> {
        self.current.as_ref().and_then(CurrentExperiment::current_task)
    }

    /// Completed share of the experiment's tasks, in `0.0..=1.0`
    pub fn progress(&self, experiment_id: &str) -> f64 {
        let experiment_id = canonical_id(experiment_id);
        let Some(participant) = self.participant.as_ref() else {
            return 0.0;
        };

        let order = match self.current.as_ref() {
            Some(current) if current.experiment_id == experiment_id => Some(&current.task_order),
            _ => participant.experiment_order.get(experiment_id),
        };
        let Some(order) = order.filter(|o| !o.is_empty()) else {
            return 0.0;
        };

        let completed = participant
            .experiment_progress
            .get(experiment_id)
            .map(|p| {
                order
                    .iter()
                    .filter(|id| {
                        p.tasks
                            .get(*id)
                            .map(|r| r.status == TaskStatus::Completed)
                            .unwrap_or(false)
                    })
                    .count()
            })
            .unwrap_or(0);

        completed as f64 / order.len() as f64
    }

    pub fn sync_state(&self, experiment_id: &str, task_id: &str) -> Option<SyncState> {
        self.sync
            .get(&(experiment_id.to_string(), task_id.to_string()))
            .copied()
    }

    pub fn unsynced(&self) -> &[UnsyncedAction] {
        &self.unsynced
    }

    /// Apply a status change to the mirror before the server confirms it.
    ///
    /// Completion moves the pointer to `min(position + 1, task count)`; a
    /// reset moves it back to the reset task. The returned change undoes
    /// the update through [`ClientCache::rollback`].
    pub fn apply_optimistic(&mut self, task_id: &str, status: TaskStatus) -> Result<OptimisticChange> {
        let participant = self.participant.as_mut().ok_or(ClientError::NoParticipant)?;
        let current = self.current.as_mut().ok_or(ClientError::NoActiveExperiment)?;
        let position = current
            .position(task_id)
            .ok_or_else(|| ClientError::UnknownTask(task_id.to_string()))?;

        let previous_completed_at = participant.completed_at;
        let previous_index = current.current_task_index;
        let previous_progress = participant
            .experiment_progress
            .get(&current.experiment_id)
            .cloned();

        let from = previous_progress
            .as_ref()
            .and_then(|p| p.tasks.get(task_id))
            .map(|r| r.status)
            .unwrap_or_default();
        // Starting a task that is past pending is a no-op, not an error
        if status != TaskStatus::InProgress && !from.can_transition(status) {
            return Err(ClientError::InvalidTransition {
                task_id: task_id.to_string(),
                from,
                to: status,
            });
        }

        let now = time::now();
        let experiment = participant
            .experiment_progress
            .entry(current.experiment_id.clone())
            .or_default();
        {
            let record = experiment.tasks.entry(task_id.to_string()).or_default();
            match status {
                TaskStatus::Completed => {
                    if record.status != TaskStatus::Completed {
                        record.status = TaskStatus::Completed;
                        record.completed_at = Some(now);
                    }
                    current.current_task_index = (position + 1).min(current.task_order.len());
                }
                TaskStatus::Pending => {
                    if record.status == TaskStatus::Completed {
                        record.status = TaskStatus::Pending;
                        record.completed_at = None;
                        record.result = None;
                        current.current_task_index = position;
                        participant.completed_at = None;
                    }
                }
                TaskStatus::InProgress => {
                    if record.status == TaskStatus::Pending {
                        record.status = TaskStatus::InProgress;
                        record.started_at.get_or_insert(now);
                    }
                }
            }
        }

        if status != TaskStatus::Pending {
            experiment.started_at.get_or_insert(now);
        }
        let mut derived = ExperimentStatus::derive(
            current.task_order.iter().map(String::as_str),
            &experiment.tasks,
        );
        if derived == ExperimentStatus::NotStarted && experiment.started_at.is_some() {
            derived = ExperimentStatus::InProgress;
        }
        experiment.status = derived;
        if derived == ExperimentStatus::Completed {
            experiment.completed_at.get_or_insert(now);
        } else {
            experiment.completed_at = None;
        }

        let change = OptimisticChange {
            experiment_id: current.experiment_id.clone(),
            task_id: task_id.to_string(),
            status,
            previous_progress,
            previous_index,
            previous_completed_at,
        };
        self.sync.insert(
            (change.experiment_id.clone(), change.task_id.clone()),
            SyncState::Pending,
        );
        self.persist()?;
        Ok(change)
    }

    /// Adopt the server's record for a task the server has accepted.
    pub fn confirm(&mut self, experiment_id: &str, task_id: &str, outcome: &TaskOutcome) -> Result<()> {
        let participant = self.participant.as_mut().ok_or(ClientError::NoParticipant)?;
        let experiment = participant
            .experiment_progress
            .entry(experiment_id.to_string())
            .or_default();
        experiment
            .tasks
            .insert(task_id.to_string(), outcome.progress.clone());
        experiment.status = outcome.experiment_status;
        if outcome.experiment_status != ExperimentStatus::Completed {
            experiment.completed_at = None;
        }

        self.sync.insert(
            (experiment_id.to_string(), task_id.to_string()),
            SyncState::Synced,
        );
        self.persist()
    }

    /// Undo an optimistic update the server did not record.
    pub fn rollback(&mut self, change: OptimisticChange) -> Result<()> {
        let participant = self.participant.as_mut().ok_or(ClientError::NoParticipant)?;
        match change.previous_progress {
            Some(progress) => {
                participant
                    .experiment_progress
                    .insert(change.experiment_id.clone(), progress);
            }
            None => {
                participant.experiment_progress.remove(&change.experiment_id);
            }
        }
        participant.completed_at = change.previous_completed_at;

        if let Some(current) = self
            .current
            .as_mut()
            .filter(|c| c.experiment_id == change.experiment_id)
        {
            current.current_task_index = change.previous_index;
        }

        warn!(
            experiment_id = %change.experiment_id,
            task_id = %change.task_id,
            status = %change.status,
            "Rolled back unconfirmed task change"
        );
        self.sync
            .insert((change.experiment_id, change.task_id), SyncState::Failed);
        self.persist()
    }

    /// Buffer an interaction event for the next flush
    pub fn log_event(
        &mut self,
        experiment_id: &str,
        task_id: &str,
        event_type: EventType,
        data: Value,
    ) -> Result<()> {
        let participant_id = self.participant_id()?.to_string();
        self.events.push(LogEvent::new(
            participant_id,
            canonical_id(experiment_id),
            task_id,
            event_type,
            data,
        ));
        Ok(())
    }

    pub fn pending_events(&self) -> &[LogEvent] {
        &self.events
    }

    /// Forget the participant entirely, locally.
    pub fn withdraw_consent(&mut self) -> Result<()> {
        if let Some(participant) = &self.participant {
            info!(participant_id = %participant.participant_id, "Consent withdrawn, clearing cache");
        }
        self.participant = None;
        self.current = None;
        self.sync.clear();
        self.unsynced.clear();
        self.events.clear();
        self.store.remove(PARTICIPANT_KEY)?;
        self.store.remove(CURRENT_EXPERIMENT_KEY)?;
        Ok(())
    }

    /// Drop the local copy without touching in-memory queues
    pub(crate) fn discard_local(&mut self) -> Result<()> {
        self.participant = None;
        self.current = None;
        self.store.remove(PARTICIPANT_KEY)?;
        self.store.remove(CURRENT_EXPERIMENT_KEY)?;
        Ok(())
    }

    fn persist(&self) -> Result<()> {
        match &self.participant {
            Some(participant) => self
                .store
                .set(PARTICIPANT_KEY, &serde_json::to_string(participant)?)?,
            None => self.store.remove(PARTICIPANT_KEY)?,
        }
        match &self.current {
            Some(current) => self
                .store
                .set(CURRENT_EXPERIMENT_KEY, &serde_json::to_string(current)?)?,
            None => self.store.remove(CURRENT_EXPERIMENT_KEY)?,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;

    fn cache_in_exp1a() -> ClientCache<MemoryStore> {
        let mut cache = ClientCache::new(MemoryStore::new());
        cache
            .load_participant(ParticipantRecord::new("p1", time::now()))
            .unwrap();
        cache
            .enter_experiment(
                "exp1a",
                None,
                vec![
                    "task-proposed-1".to_string(),
                    "task-numeric".to_string(),
                    "q-comp-1a".to_string(),
                ],
            )
            .unwrap();
        cache
    }

    #[test]
    fn test_completion_advances_pointer() {
        let mut cache = cache_in_exp1a();
        assert_eq!(cache.current_task(), Some("task-proposed-1"));

        cache
            .apply_optimistic("task-proposed-1", TaskStatus::Completed)
            .unwrap();
        assert_eq!(cache.current_task(), Some("task-numeric"));
        assert!((cache.progress("exp1a") - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(
            cache.sync_state("exp1a", "task-proposed-1"),
            Some(SyncState::Pending)
        );
    }

    #[test]
    fn test_pointer_follows_just_completed_task() {
        let mut cache = cache_in_exp1a();
        cache.apply_optimistic("q-comp-1a", TaskStatus::Completed).unwrap();
        assert_eq!(cache.current_task(), None);
        assert!(cache.current_experiment().unwrap().is_finished());

        // Completing an earlier task moves the pointer to its successor
        cache
            .apply_optimistic("task-proposed-1", TaskStatus::Completed)
            .unwrap();
        assert_eq!(cache.current_task(), Some("task-numeric"));
    }

    #[test]
    fn test_reset_moves_pointer_back() {
        let mut cache = cache_in_exp1a();
        for id in ["task-proposed-1", "task-numeric", "q-comp-1a"] {
            cache.apply_optimistic(id, TaskStatus::Completed).unwrap();
        }
        let progress = &cache.participant().unwrap().experiment_progress["exp1a"];
        assert_eq!(progress.status, ExperimentStatus::Completed);

        cache.apply_optimistic("task-numeric", TaskStatus::Pending).unwrap();
        assert_eq!(cache.current_task(), Some("task-numeric"));
        let progress = &cache.participant().unwrap().experiment_progress["exp1a"];
        assert_eq!(progress.status, ExperimentStatus::InProgress);
        assert!(progress.tasks["task-numeric"].completed_at.is_none());
    }

    #[test]
    fn test_rollback_restores_previous_state() {
        let mut cache = cache_in_exp1a();
        let before = cache.participant().unwrap().clone();

        let change = cache
            .apply_optimistic("task-proposed-1", TaskStatus::Completed)
            .unwrap();
        cache.rollback(change).unwrap();

        assert_eq!(cache.participant().unwrap(), &before);
        assert_eq!(cache.current_task(), Some("task-proposed-1"));
        assert_eq!(
            cache.sync_state("exp1a", "task-proposed-1"),
            Some(SyncState::Failed)
        );
    }

    #[test]
    fn test_reset_of_started_task_rejected() {
        let mut cache = cache_in_exp1a();
        cache
            .apply_optimistic("task-numeric", TaskStatus::InProgress)
            .unwrap();
        let err = cache
            .apply_optimistic("task-numeric", TaskStatus::Pending)
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidTransition { .. }));
    }

    #[test]
    fn test_unknown_task_and_missing_experiment() {
        let mut cache = cache_in_exp1a();
        assert!(matches!(
            cache.apply_optimistic("task-other", TaskStatus::Completed),
            Err(ClientError::UnknownTask(_))
        ));

        let mut empty = ClientCache::new(MemoryStore::new());
        empty
            .load_participant(ParticipantRecord::new("p1", time::now()))
            .unwrap();
        assert!(matches!(
            empty.apply_optimistic("task-numeric", TaskStatus::Completed),
            Err(ClientError::NoActiveExperiment)
        ));
    }

    #[test]
    fn test_enter_experiment_resumes_after_completed_tasks() {
        let mut cache = cache_in_exp1a();
        cache
            .apply_optimistic("task-proposed-1", TaskStatus::Completed)
            .unwrap();
        let order = cache.current_experiment().unwrap().task_order.clone();

        let current = cache.enter_experiment("exp1a", None, order).unwrap();
        assert_eq!(current.current_task(), Some("task-numeric"));
    }

    #[test]
    fn test_log_event_requires_participant() {
        let mut cache = ClientCache::new(MemoryStore::new());
        assert!(matches!(
            cache.log_event("exp1a", "task-numeric", EventType::Vote, json!({})),
            Err(ClientError::NoParticipant)
        ));
    }
}
