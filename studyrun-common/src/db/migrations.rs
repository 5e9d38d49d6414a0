//! Database schema migrations
//!
//! Versioned migrations tracked in the `schema_version` table. Each
//! migration is idempotent and must never be edited once released; schema
//! changes always go into a new migration.

use crate::normalize::{self, CanonicalId};
use crate::Result;
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{info, warn};

/// Current schema version
///
/// Increment this when adding new migrations
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

/// Get current schema version from database
///
/// Returns 0 if schema_version table doesn't exist or has no rows
pub async fn get_schema_version(pool: &SqlitePool) -> Result<i32> {
    let table_exists: bool = sqlx::query_scalar(
        r#"
        SELECT EXISTS(
            SELECT 1 FROM sqlite_master
            WHERE type='table' AND name='schema_version'
        )
        "#,
    )
    .fetch_one(pool)
    .await?;

    if !table_exists {
        return Ok(0);
    }

    let version: Option<i32> =
        sqlx::query_scalar("SELECT version FROM schema_version ORDER BY version DESC LIMIT 1")
            .fetch_optional(pool)
            .await?;

    Ok(version.unwrap_or(0))
}

async fn set_schema_version(pool: &SqlitePool, version: i32) -> Result<()> {
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(version)
        .execute(pool)
        .await?;

    Ok(())
}

/// Run all pending migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    let current_version = get_schema_version(pool).await?;

    if current_version == CURRENT_SCHEMA_VERSION {
        info!("Database schema is up to date (v{})", current_version);
        return Ok(());
    }

    if current_version > CURRENT_SCHEMA_VERSION {
        warn!(
            "Database schema version ({}) is newer than code version ({})",
            current_version, CURRENT_SCHEMA_VERSION
        );
        return Ok(());
    }

    info!(
        "Running database migrations: v{} -> v{}",
        current_version, CURRENT_SCHEMA_VERSION
    );

    if current_version < 1 {
        migrate_v1(pool).await?;
        set_schema_version(pool, 1).await?;
        info!("Migration v1 completed");
    }

    Ok(())
}

/// Migration v1: rewrite rows keyed by legacy experiment ids
async fn migrate_v1(pool: &SqlitePool) -> Result<()> {
    let rewritten = rewrite_legacy_experiment_ids(pool).await?;
    info!("Migration v1: rewrote {} legacy experiment rows", rewritten);
    Ok(())
}

/// Rewrite every stored legacy experiment id to its canonical form.
///
/// Runs in one transaction. When a participant already has a row under the
/// canonical id, the canonical row is kept and the legacy row is dropped.
/// The event log is immutable and is not rewritten. Returns the number of
/// rows moved or dropped.
pub async fn rewrite_legacy_experiment_ids(pool: &SqlitePool) -> Result<u64> {
    let mut legacy: Vec<(&'static str, CanonicalId)> = normalize::legacy_ids().collect();
    // Deterministic winner when two legacy ids share a canonical id
    legacy.sort_by_key(|(id, _)| *id);

    let mut tx = pool.begin().await?;
    let mut touched = 0u64;

    for (legacy_id, canonical) in &legacy {
        touched += rekey_table(&mut tx, "order_assignments", legacy_id, canonical.id).await?;
        touched += rekey_table(&mut tx, "task_progress", legacy_id, canonical.id).await?;

        let moved = sqlx::query(
            r#"
            UPDATE OR IGNORE experiment_progress
            SET experiment_id = ?, variant = COALESCE(?, variant)
            WHERE experiment_id = ?
            "#,
        )
        .bind(canonical.id)
        .bind(canonical.variant.map(|v| v.as_str()))
        .bind(legacy_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let dropped = drop_shadowed(&mut tx, "experiment_progress", legacy_id).await?;
        touched += moved + dropped;
    }

    touched += rewrite_sequences(&mut tx).await?;

    tx.commit().await?;
    Ok(touched)
}

async fn rekey_table(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    legacy_id: &str,
    canonical_id: &str,
) -> Result<u64> {
    let sql = format!(
        "UPDATE OR IGNORE {} SET experiment_id = ? WHERE experiment_id = ?",
        table
    );
    let moved = sqlx::query(&sql)
        .bind(canonical_id)
        .bind(legacy_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    let dropped = drop_shadowed(tx, table, legacy_id).await?;
    Ok(moved + dropped)
}

/// Delete legacy rows left behind because a canonical row already existed
async fn drop_shadowed(
    tx: &mut Transaction<'_, Sqlite>,
    table: &str,
    legacy_id: &str,
) -> Result<u64> {
    let sql = format!("DELETE FROM {} WHERE experiment_id = ?", table);
    let dropped = sqlx::query(&sql)
        .bind(legacy_id)
        .execute(&mut **tx)
        .await?
        .rows_affected();

    if dropped > 0 {
        warn!(
            table,
            legacy_id, dropped, "Dropped legacy rows shadowed by canonical rows"
        );
    }
    Ok(dropped)
}

async fn rewrite_sequences(tx: &mut Transaction<'_, Sqlite>) -> Result<u64> {
    let rows: Vec<(String, String)> =
        sqlx::query_as("SELECT participant_id, sequence FROM experiment_sequences")
            .fetch_all(&mut **tx)
            .await?;

    let mut rewritten = 0;
    for (participant_id, sequence) in rows {
        let ids: Vec<String> = serde_json::from_str(&sequence)?;
        let canonical: Vec<String> = ids
            .iter()
            .map(|id| normalize::canonical_id(id).to_string())
            .collect();
        if canonical == ids {
            continue;
        }

        sqlx::query("UPDATE experiment_sequences SET sequence = ? WHERE participant_id = ?")
            .bind(serde_json::to_string(&canonical)?)
            .bind(&participant_id)
            .execute(&mut **tx)
            .await?;
        rewritten += 1;
    }

    Ok(rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init::create_schema;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup_test_db() -> SqlitePool {
        SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap()
    }

    async fn insert_participant(pool: &SqlitePool, id: &str) {
        sqlx::query("INSERT INTO participants (participant_id, created_at) VALUES (?, ?)")
            .bind(id)
            .bind("2025-01-01T00:00:00Z")
            .execute(pool)
            .await
            .unwrap();
    }

    async fn insert_order(pool: &SqlitePool, participant: &str, experiment: &str, order: &str) {
        sqlx::query(
            "INSERT INTO order_assignments (participant_id, experiment_id, task_order, created_at)
             VALUES (?, ?, ?, '2025-01-01T00:00:00Z')",
        )
        .bind(participant)
        .bind(experiment)
        .bind(order)
        .execute(pool)
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_get_schema_version_no_table() {
        let pool = setup_test_db().await;
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, 0);
    }

    #[tokio::test]
    async fn test_set_and_get_schema_version() {
        let pool = setup_test_db().await;

        sqlx::query(
            "CREATE TABLE schema_version (version INTEGER PRIMARY KEY, applied_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP)"
        )
        .execute(&pool)
        .await
        .unwrap();

        set_schema_version(&pool, 1).await.unwrap();
        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn test_create_schema_sets_current_version() {
        let pool = setup_test_db().await;
        create_schema(&pool).await.unwrap();
        create_schema(&pool).await.unwrap();

        let version = get_schema_version(&pool).await.unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_rewrite_moves_legacy_rows() {
        let pool = setup_test_db().await;
        create_schema(&pool).await.unwrap();
        insert_participant(&pool, "p1").await;
        insert_order(&pool, "p1", "exp-text-vs-selection", r#"["task-text-1"]"#).await;
        sqlx::query(
            "INSERT INTO experiment_progress (participant_id, experiment_id, status, updated_at)
             VALUES ('p1', 'exp-effectiveness-treatment', 'in_progress', '2025-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();
        sqlx::query(
            "INSERT INTO experiment_sequences (participant_id, sequence, created_at)
             VALUES ('p1', '[\"exp-numeric-evaluation\",\"exp1a\"]', '2025-01-01T00:00:00Z')",
        )
        .execute(&pool)
        .await
        .unwrap();

        let touched = rewrite_legacy_experiment_ids(&pool).await.unwrap();
        assert_eq!(touched, 3);

        let order_experiment: String =
            sqlx::query_scalar("SELECT experiment_id FROM order_assignments WHERE participant_id = 'p1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(order_experiment, "text-vs-selection");

        let (experiment, variant): (String, Option<String>) = sqlx::query_as(
            "SELECT experiment_id, variant FROM experiment_progress WHERE participant_id = 'p1'",
        )
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(experiment, "effectiveness");
        assert_eq!(variant.as_deref(), Some("treatment"));

        let sequence: String =
            sqlx::query_scalar("SELECT sequence FROM experiment_sequences WHERE participant_id = 'p1'")
                .fetch_one(&pool)
                .await
                .unwrap();
        assert_eq!(sequence, r#"["numeric-evaluation","exp1a"]"#);

        // Second pass finds nothing to do
        assert_eq!(rewrite_legacy_experiment_ids(&pool).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rewrite_keeps_canonical_row_on_conflict() {
        let pool = setup_test_db().await;
        create_schema(&pool).await.unwrap();
        insert_participant(&pool, "p1").await;
        insert_order(&pool, "p1", "text-vs-selection", r#"["canonical"]"#).await;
        insert_order(&pool, "p1", "exp-text-vs-selection", r#"["legacy"]"#).await;

        rewrite_legacy_experiment_ids(&pool).await.unwrap();

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT experiment_id, task_order FROM order_assignments WHERE participant_id = 'p1'",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        assert_eq!(
            rows,
            vec![("text-vs-selection".to_string(), r#"["canonical"]"#.to_string())]
        );
    }
}
