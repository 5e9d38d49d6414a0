//! Task and experiment progress records

use std::collections::BTreeMap;

use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, Transaction};
use studyrun_common::models::{
    ExperimentProgress, ExperimentStatus, ProgressMap, ProgressRecord, TaskStatus, Variant,
};
use studyrun_common::normalize::{canonical_id, normalize_keys};
use studyrun_common::results::TaskResult;
use studyrun_common::{time, Error, Result};
use tracing::debug;

use super::ProgressStore;
use crate::utils::retry_on_lock;

fn task_record(row: &SqliteRow) -> Result<ProgressRecord> {
    let result: Option<String> = row.get("result");
    let result = result
        .map(|json| serde_json::from_str::<TaskResult>(&json))
        .transpose()?;

    Ok(ProgressRecord {
        status: row.get::<String, _>("status").parse()?,
        started_at: time::from_storage_opt(row.get("started_at"))?,
        completed_at: time::from_storage_opt(row.get("completed_at"))?,
        result,
    })
}

fn experiment_record(row: &SqliteRow) -> Result<ExperimentProgress> {
    let variant: Option<String> = row.get("variant");
    Ok(ExperimentProgress {
        status: row.get::<String, _>("status").parse()?,
        variant: variant.map(|v| v.parse::<Variant>()).transpose()?,
        started_at: time::from_storage_opt(row.get("started_at"))?,
        completed_at: time::from_storage_opt(row.get("completed_at"))?,
        tasks: BTreeMap::new(),
    })
}

impl ProgressStore {
    /// Snapshot of every experiment and task record of a participant,
    /// keyed by canonical experiment id.
    pub async fn get_progress(&self, participant_id: &str) -> Result<ProgressMap> {
        let progress = self.read_progress(participant_id).await?;
        let (progress, changed) = normalize_keys(progress, |experiment, variant| {
            experiment.variant = Some(variant);
        });
        if changed {
            self.write_back_normalized(participant_id).await?;
        }
        Ok(progress)
    }

    /// Raw snapshot, keyed exactly as stored
    pub(super) async fn read_progress(&self, participant_id: &str) -> Result<ProgressMap> {
        let mut progress = ProgressMap::new();

        let experiment_rows = sqlx::query(
            r#"
            SELECT experiment_id, status, variant, started_at, completed_at
            FROM experiment_progress
            WHERE participant_id = ?
            "#,
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &experiment_rows {
            progress.insert(row.get("experiment_id"), experiment_record(row)?);
        }

        let task_rows = sqlx::query(
            r#"
            SELECT experiment_id, task_id, status, started_at, completed_at, result
            FROM task_progress
            WHERE participant_id = ?
            "#,
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;
        for row in &task_rows {
            let experiment_id: String = row.get("experiment_id");
            progress
                .entry(experiment_id)
                .or_default()
                .tasks
                .insert(row.get("task_id"), task_record(row)?);
        }

        Ok(progress)
    }

    /// Progress of one experiment; an untouched experiment reads as default.
    pub async fn get_experiment_progress(
        &self,
        participant_id: &str,
        experiment_id: &str,
    ) -> Result<ExperimentProgress> {
        let mut conn = self.pool.acquire().await?;
        Self::experiment_progress_on(&mut conn, participant_id, experiment_id).await
    }

    /// [`get_experiment_progress`](Self::get_experiment_progress) on a
    /// connection the caller holds, typically an open transaction.
    pub async fn experiment_progress_on(
        conn: &mut SqliteConnection,
        participant_id: &str,
        experiment_id: &str,
    ) -> Result<ExperimentProgress> {
        let row = sqlx::query(
            r#"
            SELECT status, variant, started_at, completed_at
            FROM experiment_progress
            WHERE participant_id = ? AND experiment_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(experiment_id)
        .fetch_optional(&mut *conn)
        .await?;

        let mut progress = match row {
            Some(row) => experiment_record(&row)?,
            None => ExperimentProgress::default(),
        };

        let task_rows = sqlx::query(
            r#"
            SELECT task_id, status, started_at, completed_at, result
            FROM task_progress
            WHERE participant_id = ? AND experiment_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(experiment_id)
        .fetch_all(&mut *conn)
        .await?;
        for row in &task_rows {
            progress.tasks.insert(row.get("task_id"), task_record(row)?);
        }

        Ok(progress)
    }

    /// Stored status of every experiment of a participant, keyed by
    /// canonical id. A canonical row wins over a legacy row for the same
    /// experiment.
    pub async fn experiment_statuses_on(
        conn: &mut SqliteConnection,
        participant_id: &str,
    ) -> Result<BTreeMap<String, ExperimentStatus>> {
        let rows = sqlx::query(
            "SELECT experiment_id, status FROM experiment_progress WHERE participant_id = ?",
        )
        .bind(participant_id)
        .fetch_all(&mut *conn)
        .await?;

        let mut statuses = BTreeMap::new();
        for row in &rows {
            let stored: String = row.get("experiment_id");
            let status: ExperimentStatus = row.get::<String, _>("status").parse()?;
            let canonical = canonical_id(&stored);
            if canonical == stored || !statuses.contains_key(canonical) {
                statuses.insert(canonical.to_string(), status);
            }
        }
        Ok(statuses)
    }

    /// One task record; a task never touched reads as `pending`.
    pub async fn get_task_progress(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<ProgressRecord> {
        let row = sqlx::query(
            r#"
            SELECT status, started_at, completed_at, result
            FROM task_progress
            WHERE participant_id = ? AND experiment_id = ? AND task_id = ?
            "#,
        )
        .bind(participant_id)
        .bind(experiment_id)
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => task_record(&row),
            None => Ok(ProgressRecord::default()),
        }
    }

    /// Apply a task status in its own transaction. Returns whether the
    /// stored record changed. See [`write_task_status`](Self::write_task_status).
    pub async fn set_task_status(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
    ) -> Result<bool> {
        retry_on_lock("set task status", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let applied =
                Self::write_task_status(&mut tx, participant_id, experiment_id, task_id, status, result)
                    .await?;
            tx.commit().await?;
            Ok(applied)
        })
        .await
    }

    /// Apply a task status inside `tx`. Returns whether the stored record changed.
    ///
    /// - `completed` sets `completedAt` to now and stores `result`. On an
    ///   already-completed task it is a no-op: neither the timestamp nor the
    ///   result move until an explicit reset.
    /// - `pending` clears `completedAt` and `result` unconditionally.
    ///   `startedAt` is kept.
    /// - `in_progress` only moves a pending task and records `startedAt`
    ///   the first time.
    ///
    /// Each case is a single upsert on the one task row.
    pub async fn write_task_status(
        tx: &mut Transaction<'_, Sqlite>,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        status: TaskStatus,
        result: Option<&TaskResult>,
    ) -> Result<bool> {
        if status != TaskStatus::Completed && result.is_some() {
            return Err(Error::Validation(format!(
                "a result can only be stored with status completed, not {}",
                status
            )));
        }

        let now = time::to_storage(&time::now());
        let result_json = result.map(serde_json::to_string).transpose()?;

        let sql = match status {
            TaskStatus::Completed => {
                r#"
                INSERT INTO task_progress
                    (participant_id, experiment_id, task_id, status, completed_at, result, updated_at)
                VALUES (?1, ?2, ?3, 'completed', ?4, ?5, ?4)
                ON CONFLICT (participant_id, experiment_id, task_id) DO UPDATE SET
                    status = 'completed',
                    completed_at = excluded.completed_at,
                    result = excluded.result,
                    updated_at = excluded.updated_at
                WHERE task_progress.status != 'completed'
                "#
            }
            TaskStatus::Pending => {
                r#"
                INSERT INTO task_progress
                    (participant_id, experiment_id, task_id, status, updated_at)
                VALUES (?1, ?2, ?3, 'pending', ?4)
                ON CONFLICT (participant_id, experiment_id, task_id) DO UPDATE SET
                    status = 'pending',
                    completed_at = NULL,
                    result = NULL,
                    updated_at = excluded.updated_at
                WHERE task_progress.status != 'pending'
                "#
            }
            TaskStatus::InProgress => {
                r#"
                INSERT INTO task_progress
                    (participant_id, experiment_id, task_id, status, started_at, updated_at)
                VALUES (?1, ?2, ?3, 'in_progress', ?4, ?4)
                ON CONFLICT (participant_id, experiment_id, task_id) DO UPDATE SET
                    status = 'in_progress',
                    started_at = COALESCE(task_progress.started_at, excluded.started_at),
                    updated_at = excluded.updated_at
                WHERE task_progress.status = 'pending'
                "#
            }
        };

        let mut query = sqlx::query(sql)
            .bind(participant_id)
            .bind(experiment_id)
            .bind(task_id)
            .bind(&now);
        if status == TaskStatus::Completed {
            query = query.bind(result_json.as_deref());
        }
        let applied = query.execute(&mut **tx).await?.rows_affected() > 0;

        debug!(
            participant_id,
            experiment_id,
            task_id,
            status = %status,
            applied,
            "Task status write"
        );
        Ok(applied)
    }

    /// Write the aggregate experiment status in its own transaction.
    pub async fn set_experiment_status(
        &self,
        participant_id: &str,
        experiment_id: &str,
        status: ExperimentStatus,
    ) -> Result<()> {
        retry_on_lock("set experiment status", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            Self::write_experiment_status(&mut tx, participant_id, experiment_id, status).await?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    /// Write the aggregate experiment status inside `tx`.
    ///
    /// `startedAt` is recorded the first time the experiment leaves
    /// `not_started`; `completedAt` is set on the move into `completed`
    /// and cleared whenever the status is anything else.
    pub async fn write_experiment_status(
        tx: &mut Transaction<'_, Sqlite>,
        participant_id: &str,
        experiment_id: &str,
        status: ExperimentStatus,
    ) -> Result<()> {
        let now = time::to_storage(&time::now());
        let started_at = (status != ExperimentStatus::NotStarted).then(|| now.clone());
        let completed_at = (status == ExperimentStatus::Completed).then(|| now.clone());

        sqlx::query(
            r#"
            INSERT INTO experiment_progress
                (participant_id, experiment_id, status, started_at, completed_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (participant_id, experiment_id) DO UPDATE SET
                status = excluded.status,
                started_at = COALESCE(experiment_progress.started_at, excluded.started_at),
                completed_at = CASE
                    WHEN excluded.status != 'completed' THEN NULL
                    WHEN experiment_progress.status = 'completed' THEN experiment_progress.completed_at
                    ELSE excluded.completed_at
                END,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(participant_id)
        .bind(experiment_id)
        .bind(status.as_str())
        .bind(started_at.as_deref())
        .bind(completed_at.as_deref())
        .bind(&now)
        .execute(&mut **tx)
        .await?;

        debug!(participant_id, experiment_id, status = %status, "Experiment status write");
        Ok(())
    }
}
