//! Server round trips for the client cache
//!
//! Every task action is applied to the mirror first, then sent to the
//! server-of-record. A confirmed action adopts the server's record; a
//! failed one is rolled back so the pointer never moves past a completion
//! the server has not recorded. Retryable failures are queued in order.

use serde_json::Value;
use studyrun_common::models::ParticipantRecord;
use tracing::{info, warn};

use crate::cache::{ActionKind, ClientCache, UnsyncedAction};
use crate::remote::{ServerOfRecord, TaskOutcome};
use crate::storage::LocalStore;
use crate::{ClientError, Result};

impl<S: LocalStore> ClientCache<S> {
    /// Restore the local copy, falling back to the server when nothing
    /// usable (or a different participant) is cached.
    pub async fn restore_or_fetch<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        participant_id: &str,
    ) -> Result<&ParticipantRecord> {
        let cached = match self.restore() {
            Ok(Some(record)) => record.participant_id == participant_id,
            Ok(None) => false,
            Err(ClientError::Restore(reason)) => {
                warn!(%reason, "Discarding unreadable local copy");
                self.discard_local()?;
                false
            }
            Err(e) => return Err(e),
        };

        if !cached {
            info!(participant_id, "Fetching participant from server");
            let record = remote.fetch_participant(participant_id).await?;
            self.load_participant(record)?;
        }

        self.participant().ok_or(ClientError::NoParticipant)
    }

    /// Enter an experiment using the order the server assigned.
    pub async fn open_experiment<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        experiment_id: &str,
        first_task_id: &str,
    ) -> Result<()> {
        let participant_id = self.participant_id()?.to_string();
        let view = remote
            .fetch_task_view(&participant_id, experiment_id, first_task_id)
            .await?;
        self.enter_experiment(&view.experiment_id, view.variant, view.order)?;
        Ok(())
    }

    pub async fn complete_task<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<TaskOutcome> {
        self.act_on_current(remote, task_id, ActionKind::Complete { result })
            .await
    }

    pub async fn reset_task<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        task_id: &str,
    ) -> Result<TaskOutcome> {
        self.act_on_current(remote, task_id, ActionKind::Reset).await
    }

    /// Resubmit queued actions in order. Stops at the first retryable
    /// failure; actions the server rejects outright are dropped.
    pub async fn retry_unsynced<R: ServerOfRecord + ?Sized>(&mut self, remote: &R) -> Result<usize> {
        let mut synced = 0;
        while let Some(action) = self.unsynced.first().cloned() {
            match self
                .submit(remote, &action.experiment_id, &action.task_id, &action.kind)
                .await
            {
                Ok(_) => {
                    self.unsynced.remove(0);
                    synced += 1;
                }
                Err(e) if e.is_retryable() => {
                    if let Some(front) = self.unsynced.first_mut() {
                        front.error = e.to_string();
                        front.failed_at = studyrun_common::time::now();
                    }
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        experiment_id = %action.experiment_id,
                        task_id = %action.task_id,
                        error = %e,
                        "Dropping queued action the server rejected"
                    );
                    self.unsynced.remove(0);
                }
            }
        }
        if synced > 0 {
            info!(synced, "Unsynced actions recorded by server");
        }
        Ok(synced)
    }

    /// Submit buffered events as one ordered batch. On failure the buffer
    /// is kept for the next flush.
    pub async fn flush_events<R: ServerOfRecord + ?Sized>(&mut self, remote: &R) -> Result<usize> {
        if self.events.is_empty() {
            return Ok(0);
        }
        let participant_id = self.participant_id()?.to_string();

        match remote.submit_events(&participant_id, &self.events).await {
            Ok(accepted) => {
                self.events.clear();
                Ok(accepted)
            }
            Err(e) => {
                warn!(pending = self.events.len(), error = %e, "Event flush failed, keeping buffer");
                Err(e)
            }
        }
    }

    async fn act_on_current<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        task_id: &str,
        kind: ActionKind,
    ) -> Result<TaskOutcome> {
        let experiment_id = self
            .current_experiment()
            .ok_or(ClientError::NoActiveExperiment)?
            .experiment_id
            .clone();

        match self.submit(remote, &experiment_id, task_id, &kind).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                if e.is_retryable() {
                    self.unsynced.push(UnsyncedAction {
                        experiment_id,
                        task_id: task_id.to_string(),
                        kind,
                        error: e.to_string(),
                        failed_at: studyrun_common::time::now(),
                    });
                }
                Err(e)
            }
        }
    }

    async fn submit<R: ServerOfRecord + ?Sized>(
        &mut self,
        remote: &R,
        experiment_id: &str,
        task_id: &str,
        kind: &ActionKind,
    ) -> Result<TaskOutcome> {
        let participant_id = self.participant_id()?.to_string();
        let change = if self.is_current(experiment_id) {
            Some(self.apply_optimistic(task_id, kind.target_status())?)
        } else {
            None
        };

        let response = match kind {
            ActionKind::Complete { result } => {
                remote
                    .complete_task(&participant_id, experiment_id, task_id, result.clone())
                    .await
            }
            ActionKind::Reset => {
                remote
                    .reset_task(&participant_id, experiment_id, task_id)
                    .await
            }
        };

        match response {
            Ok(outcome) => {
                self.confirm(experiment_id, task_id, &outcome)?;
                Ok(outcome)
            }
            Err(e) => {
                if let Some(change) = change {
                    self.rollback(change)?;
                }
                Err(e)
            }
        }
    }
}
