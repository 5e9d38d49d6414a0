//! Database initialization
//!
//! Creates the database file on first run and brings the schema up to date.
//! Every statement is idempotent, so opening an existing database is safe.

use crate::Result;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

/// SQLite busy timeout applied per connection.
///
/// Kept short: callers retry lock errors with backoff up to their own
/// configured maximum wait.
pub const BUSY_TIMEOUT_MS: u64 = 250;

/// Open (creating if needed) the database at `db_path` and initialize the schema
///
/// Connection pragmas (foreign keys, WAL, busy timeout) are set through the
/// connect options so every pooled connection carries them.
pub async fn init_database(db_path: &Path) -> Result<SqlitePool> {
    let newly_created = !db_path.exists();

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .create_if_missing(true)
        .foreign_keys(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_millis(BUSY_TIMEOUT_MS));

    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .min_connections(1)
        .connect_with(options)
        .await?;

    if newly_created {
        info!("Initialized new database: {}", db_path.display());
    } else {
        info!("Opened existing database: {}", db_path.display());
    }
    info!("Database busy timeout set to {} ms", BUSY_TIMEOUT_MS);

    create_schema(&pool).await?;

    Ok(pool)
}

/// Single-connection in-memory database with the full schema
///
/// Each connection to `sqlite::memory:` is its own database, so the pool is
/// capped at one connection.
pub async fn init_memory_database() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    create_schema(&pool).await?;
    Ok(pool)
}

/// Create all tables and run pending migrations
pub async fn create_schema(pool: &SqlitePool) -> Result<()> {
    create_schema_version_table(pool).await?;
    create_participants_table(pool).await?;
    create_order_assignments_table(pool).await?;
    create_experiment_sequences_table(pool).await?;
    create_experiment_progress_table(pool).await?;
    create_task_progress_table(pool).await?;
    create_event_log_table(pool).await?;

    crate::db::migrations::run_migrations(pool).await?;

    Ok(())
}

async fn create_schema_version_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TIMESTAMP NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Participants and their consent
pub async fn create_participants_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS participants (
            participant_id TEXT PRIMARY KEY,
            consent_name TEXT,
            consent_date TEXT,
            consent_signed INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            completed_at TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Write-once task order per participant and experiment
///
/// `task_order` is a JSON array of task ids.
pub async fn create_order_assignments_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS order_assignments (
            participant_id TEXT NOT NULL
                REFERENCES participants(participant_id) ON DELETE CASCADE,
            experiment_id TEXT NOT NULL,
            task_order TEXT NOT NULL,
            created_at TEXT NOT NULL,
            PRIMARY KEY (participant_id, experiment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Write-once experiment sequence per participant (JSON array of ids)
pub async fn create_experiment_sequences_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS experiment_sequences (
            participant_id TEXT PRIMARY KEY
                REFERENCES participants(participant_id) ON DELETE CASCADE,
            sequence TEXT NOT NULL,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn create_experiment_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS experiment_progress (
            participant_id TEXT NOT NULL
                REFERENCES participants(participant_id) ON DELETE CASCADE,
            experiment_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'not_started'
                CHECK (status IN ('not_started', 'in_progress', 'completed')),
            variant TEXT CHECK (variant IS NULL OR variant IN ('control', 'treatment')),
            started_at TEXT,
            completed_at TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (participant_id, experiment_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Per-task progress
///
/// `result` holds the typed payload as JSON and is only non-NULL on
/// completed rows.
pub async fn create_task_progress_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS task_progress (
            participant_id TEXT NOT NULL
                REFERENCES participants(participant_id) ON DELETE CASCADE,
            experiment_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'in_progress', 'completed')),
            started_at TEXT,
            completed_at TEXT,
            result TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (participant_id, experiment_id, task_id),
            CHECK ((status = 'completed') = (completed_at IS NOT NULL)),
            CHECK (status = 'completed' OR result IS NULL)
        )
        "#,
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Append-only audit log
///
/// No foreign key: events are accepted for any participant id, and rows are
/// never updated or deleted.
pub async fn create_event_log_table(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS event_log (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            participant_id TEXT NOT NULL,
            experiment_id TEXT NOT NULL,
            task_id TEXT NOT NULL,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            received_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_event_log_participant ON event_log(participant_id, id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
