//! Write-once assignments: task orders, experiment sequences and variants
//!
//! All three follow the same discipline: read; if absent, generate and
//! `INSERT OR IGNORE`; then read back. When two requests race, both see
//! the row that won the insert, and a stored assignment is never replaced.

use std::collections::BTreeMap;

use sqlx::{Row, Sqlite, Transaction};
use studyrun_common::models::Variant;
use studyrun_common::{time, Error, Result};
use tracing::info;

use super::ProgressStore;
use crate::utils::retry_on_lock;

fn decode_ids(json: &str) -> Result<Vec<String>> {
    Ok(serde_json::from_str(json)?)
}

impl ProgressStore {
    /// Stored task order, if one was assigned
    pub async fn get_order_assignment(
        &self,
        participant_id: &str,
        experiment_id: &str,
    ) -> Result<Option<Vec<String>>> {
        let order: Option<String> = sqlx::query_scalar(
            "SELECT task_order FROM order_assignments WHERE participant_id = ? AND experiment_id = ?",
        )
        .bind(participant_id)
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?;

        order.as_deref().map(decode_ids).transpose()
    }

    /// Every stored task order of a participant, keyed as stored
    pub(super) async fn order_assignments(
        &self,
        participant_id: &str,
    ) -> Result<BTreeMap<String, Vec<String>>> {
        let rows = sqlx::query(
            "SELECT experiment_id, task_order FROM order_assignments WHERE participant_id = ?",
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let experiment_id: String = row.get("experiment_id");
                let order: String = row.get("task_order");
                Ok::<_, Error>((experiment_id, decode_ids(&order)?))
            })
            .collect()
    }

    /// Return the participant's task order for an experiment, creating it
    /// with `generator` when none exists. `generator` is never invoked if
    /// an assignment is already stored.
    pub async fn get_or_create_order_assignment<F>(
        &self,
        participant_id: &str,
        experiment_id: &str,
        generator: F,
    ) -> Result<Vec<String>>
    where
        F: FnOnce() -> Vec<String>,
    {
        if let Some(order) = self.get_order_assignment(participant_id, experiment_id).await? {
            return Ok(order);
        }

        let order_json = serde_json::to_string(&generator())?;
        let created_at = time::to_storage(&time::now());

        let inserted = retry_on_lock("assign task order", self.max_lock_wait_ms, || async {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO order_assignments
                    (participant_id, experiment_id, task_order, created_at)
                VALUES (?, ?, ?, ?)
                "#,
            )
            .bind(participant_id)
            .bind(experiment_id)
            .bind(&order_json)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(result.rows_affected() > 0)
        })
        .await?;

        if inserted {
            info!(participant_id, experiment_id, order = %order_json, "Assigned task order");
        }

        self.get_order_assignment(participant_id, experiment_id)
            .await?
            .ok_or_else(|| {
                Error::Storage(format!(
                    "order assignment for '{}'/'{}' missing after insert",
                    participant_id, experiment_id
                ))
            })
    }

    /// Stored experiment sequence, if one was assigned
    pub async fn get_sequence(&self, participant_id: &str) -> Result<Option<Vec<String>>> {
        let sequence: Option<String> =
            sqlx::query_scalar("SELECT sequence FROM experiment_sequences WHERE participant_id = ?")
                .bind(participant_id)
                .fetch_optional(&self.pool)
                .await?;

        sequence.as_deref().map(decode_ids).transpose()
    }

    /// Write-once experiment sequence, same discipline as task orders
    pub async fn get_or_create_sequence<F>(
        &self,
        participant_id: &str,
        generator: F,
    ) -> Result<Vec<String>>
    where
        F: FnOnce() -> Vec<String>,
    {
        if let Some(sequence) = self.get_sequence(participant_id).await? {
            return Ok(sequence);
        }

        let sequence_json = serde_json::to_string(&generator())?;
        let created_at = time::to_storage(&time::now());

        retry_on_lock("assign experiment sequence", self.max_lock_wait_ms, || async {
            sqlx::query(
                r#"
                INSERT OR IGNORE INTO experiment_sequences (participant_id, sequence, created_at)
                VALUES (?, ?, ?)
                "#,
            )
            .bind(participant_id)
            .bind(&sequence_json)
            .bind(&created_at)
            .execute(&self.pool)
            .await?;
            Ok(())
        })
        .await?;

        self.get_sequence(participant_id).await?.ok_or_else(|| {
            Error::Storage(format!(
                "experiment sequence for '{}' missing after insert",
                participant_id
            ))
        })
    }

    /// Stored variant of an experiment, if one was assigned
    pub async fn get_variant(
        &self,
        participant_id: &str,
        experiment_id: &str,
    ) -> Result<Option<Variant>> {
        let variant: Option<Option<String>> = sqlx::query_scalar(
            "SELECT variant FROM experiment_progress WHERE participant_id = ? AND experiment_id = ?",
        )
        .bind(participant_id)
        .bind(experiment_id)
        .fetch_optional(&self.pool)
        .await?;

        variant
            .flatten()
            .map(|v| v.parse::<Variant>())
            .transpose()
    }

    /// Write-once variant, stored on the experiment progress row
    pub async fn get_or_create_variant<F>(
        &self,
        participant_id: &str,
        experiment_id: &str,
        generator: F,
    ) -> Result<Option<Variant>>
    where
        F: FnOnce() -> Option<Variant>,
    {
        if let Some(variant) = self.get_variant(participant_id, experiment_id).await? {
            return Ok(Some(variant));
        }

        let Some(variant) = generator() else {
            return Ok(None);
        };

        let stored = retry_on_lock("assign variant", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            let stored = Self::write_variant(&mut tx, participant_id, experiment_id, variant).await?;
            tx.commit().await?;
            Ok(stored)
        })
        .await?;

        info!(participant_id, experiment_id, variant = stored.as_str(), "Assigned variant");
        Ok(Some(stored))
    }

    /// Store `variant` unless one is already assigned, inside `tx`.
    /// Returns the variant that is stored afterwards.
    pub async fn write_variant(
        tx: &mut Transaction<'_, Sqlite>,
        participant_id: &str,
        experiment_id: &str,
        variant: Variant,
    ) -> Result<Variant> {
        let stored: Option<String> = sqlx::query_scalar(
            r#"
            INSERT INTO experiment_progress (participant_id, experiment_id, variant, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT (participant_id, experiment_id) DO UPDATE SET
                variant = COALESCE(experiment_progress.variant, excluded.variant)
            RETURNING variant
            "#,
        )
        .bind(participant_id)
        .bind(experiment_id)
        .bind(variant.as_str())
        .bind(time::to_storage(&time::now()))
        .fetch_one(&mut **tx)
        .await?;

        match stored {
            Some(stored) => stored.parse(),
            None => Ok(variant),
        }
    }
}
