//! Participants, consent and the persisted participant document

use chrono::{DateTime, Utc};
use sqlx::{Row, Sqlite, Transaction};
use studyrun_common::models::{new_participant_id, Consent, ParticipantRecord};
use studyrun_common::normalize::normalize_participant;
use studyrun_common::{time, Error, Result};
use tracing::info;

use super::ProgressStore;
use crate::utils::retry_on_lock;

/// One row of the participants table
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantRow {
    pub participant_id: String,
    pub consent: Option<Consent>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ParticipantRow {
    pub fn has_consented(&self) -> bool {
        self.consent.as_ref().map(|c| c.signed).unwrap_or(false)
    }
}

impl ProgressStore {
    /// Create a participant, or return the existing one with the same id.
    ///
    /// A missing id is generated as `participant-<uuid>`.
    pub async fn create_participant(&self, participant_id: Option<String>) -> Result<ParticipantRow> {
        let participant_id = match participant_id {
            Some(id) if id.trim().is_empty() => {
                return Err(Error::Validation("participant id must not be empty".to_string()))
            }
            Some(id) => id,
            None => new_participant_id(),
        };
        let created_at = time::to_storage(&time::now());

        let inserted = retry_on_lock("create participant", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                "INSERT OR IGNORE INTO participants (participant_id, created_at) VALUES (?, ?)",
            )
            .bind(&participant_id)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            info!(participant_id = %participant_id, "Created participant");
        }

        self.require_participant(&participant_id).await
    }

    pub async fn get_participant(&self, participant_id: &str) -> Result<Option<ParticipantRow>> {
        let row = sqlx::query(
            r#"
            SELECT participant_id, consent_name, consent_date, consent_signed, created_at, completed_at
            FROM participants
            WHERE participant_id = ?
            "#,
        )
        .bind(participant_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let consent_name: Option<String> = row.get("consent_name");
        let consent_date = time::from_storage_opt(row.get("consent_date"))?;
        let consent = match (consent_name, consent_date) {
            (Some(name), Some(date)) => Some(Consent {
                name,
                date,
                signed: row.get::<i64, _>("consent_signed") != 0,
            }),
            _ => None,
        };

        Ok(Some(ParticipantRow {
            participant_id: row.get("participant_id"),
            consent,
            created_at: time::from_storage(&row.get::<String, _>("created_at"))?,
            completed_at: time::from_storage_opt(row.get("completed_at"))?,
        }))
    }

    /// Like [`get_participant`](Self::get_participant) but unknown ids are `NotFound`
    pub async fn require_participant(&self, participant_id: &str) -> Result<ParticipantRow> {
        self.get_participant(participant_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("participant '{}'", participant_id)))
    }

    pub async fn record_consent(&self, participant_id: &str, consent: &Consent) -> Result<()> {
        let date = time::to_storage(&consent.date);
        let updated = retry_on_lock("record consent", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                UPDATE participants
                SET consent_name = ?, consent_date = ?, consent_signed = ?
                WHERE participant_id = ?
                "#,
            )
            .bind(&consent.name)
            .bind(&date)
            .bind(consent.signed as i64)
            .bind(participant_id)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected())
        })
        .await?;

        if updated == 0 {
            return Err(Error::NotFound(format!("participant '{}'", participant_id)));
        }
        info!(participant_id = %participant_id, "Recorded consent");
        Ok(())
    }

    /// Set (once) or clear the participant's study completion timestamp inside `tx`.
    pub async fn write_participant_completed(
        tx: &mut Transaction<'_, Sqlite>,
        participant_id: &str,
        completed: bool,
    ) -> Result<()> {
        let query = if completed {
            sqlx::query(
                "UPDATE participants SET completed_at = COALESCE(completed_at, ?) WHERE participant_id = ?",
            )
            .bind(time::to_storage(&time::now()))
        } else {
            sqlx::query("UPDATE participants SET completed_at = NULL WHERE participant_id = ?")
        };
        query.bind(participant_id).execute(&mut **tx).await?;
        Ok(())
    }

    /// Assemble the persisted participant document.
    ///
    /// The document passes through the identifier normalizer; if it still
    /// carried legacy experiment ids the stored rows are rewritten once.
    pub async fn load_participant(&self, participant_id: &str) -> Result<ParticipantRecord> {
        let row = self.require_participant(participant_id).await?;

        let mut record = ParticipantRecord::new(row.participant_id, row.created_at);
        record.consent = row.consent;
        record.completed_at = row.completed_at;
        record.experiment_order = self.order_assignments(participant_id).await?;
        record.experiment_sequence = self.get_sequence(participant_id).await?;
        record.experiment_progress = self.read_progress(participant_id).await?;

        let (record, changed) = normalize_participant(record);
        if changed {
            self.write_back_normalized(participant_id).await?;
        }
        Ok(record)
    }

    pub(super) async fn write_back_normalized(&self, participant_id: &str) -> Result<()> {
        let rewritten = retry_on_lock("normalize legacy ids", self.max_lock_wait_ms, || async {
            studyrun_common::db::rewrite_legacy_experiment_ids(&self.pool).await
        })
        .await?;
        info!(
            participant_id = %participant_id,
            rewritten,
            "Rewrote legacy experiment ids"
        );
        Ok(())
    }
}
