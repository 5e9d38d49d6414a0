//! Event Logger: append-only audit trail
//!
//! Events are written through an [`EventSink`]. The logger counts failures
//! and keeps the last failure message for `/health`; callers recording a
//! state transition use [`EventLogger::record`], which never fails.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::{Row, SqlitePool};
use studyrun_common::models::LogEvent;
use studyrun_common::{time, Error, Result};
use tracing::{debug, error};

use crate::utils::retry_on_lock;

/// Destination of audit events
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Append events in the given order. A batch is written as a whole or
    /// not at all.
    async fn append_batch(&self, events: &[LogEvent]) -> Result<()>;

    /// Events of one participant in arrival order
    async fn events_for(&self, participant_id: &str) -> Result<Vec<LogEvent>>;
}

/// `event_log` table sink
pub struct SqliteEventLog {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl SqliteEventLog {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }
}

#[async_trait]
impl EventSink for SqliteEventLog {
    async fn append_batch(&self, events: &[LogEvent]) -> Result<()> {
        let received_at = time::to_storage(&time::now());
        let rows = events
            .iter()
            .map(|event| {
                Ok::<_, Error>((
                    event,
                    serde_json::to_string(&event.data)?,
                    time::to_storage(&event.timestamp),
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        retry_on_lock("append events", self.max_lock_wait_ms, || async {
            let mut tx = self.pool.begin().await?;
            for (event, data, timestamp) in &rows {
                sqlx::query(
                    r#"
                    INSERT INTO event_log
                        (participant_id, experiment_id, task_id, event_type, data, timestamp, received_at)
                    VALUES (?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&event.participant_id)
                .bind(&event.experiment_id)
                .bind(&event.task_id)
                .bind(event.event_type.as_str())
                .bind(data)
                .bind(timestamp)
                .bind(&received_at)
                .execute(&mut *tx)
                .await?;
            }
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    async fn events_for(&self, participant_id: &str) -> Result<Vec<LogEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT participant_id, experiment_id, task_id, event_type, data, timestamp
            FROM event_log
            WHERE participant_id = ?
            ORDER BY id
            "#,
        )
        .bind(participant_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let data: String = row.get("data");
                Ok::<_, Error>(LogEvent {
                    participant_id: row.get("participant_id"),
                    experiment_id: row.get("experiment_id"),
                    task_id: row.get("task_id"),
                    event_type: row.get::<String, _>("event_type").parse()?,
                    data: serde_json::from_str(&data)?,
                    timestamp: time::from_storage(&row.get::<String, _>("timestamp"))?,
                })
            })
            .collect()
    }
}

/// Logging health reported by `/health`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingTelemetry {
    pub failures: u64,
    pub last_error: Option<String>,
}

pub struct EventLogger {
    sink: Arc<dyn EventSink>,
    failures: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl EventLogger {
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self {
            sink,
            failures: AtomicU64::new(0),
            last_error: Mutex::new(None),
        }
    }

    /// Append one event
    pub async fn append(&self, event: LogEvent) -> Result<()> {
        self.append_batch(std::slice::from_ref(&event)).await
    }

    /// Append an ordered batch. Failures are counted and returned as
    /// `Error::Logging`.
    pub async fn append_batch(&self, events: &[LogEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }

        match self.sink.append_batch(events).await {
            Ok(()) => {
                debug!(count = events.len(), "Appended log events");
                Ok(())
            }
            Err(err) => {
                let message = err.to_string();
                self.failures.fetch_add(1, Ordering::Relaxed);
                if let Ok(mut last) = self.last_error.lock() {
                    *last = Some(message.clone());
                }
                error!(count = events.len(), error = %message, "Failed to append log events");
                Err(Error::Logging(message))
            }
        }
    }

    /// Best-effort append for events describing a state transition that has
    /// already been committed. The failure is reported and counted only.
    pub async fn record(&self, event: LogEvent) {
        let _ = self.append(event).await;
    }

    pub async fn events_for(&self, participant_id: &str) -> Result<Vec<LogEvent>> {
        self.sink.events_for(participant_id).await
    }

    pub fn telemetry(&self) -> LoggingTelemetry {
        LoggingTelemetry {
            failures: self.failures.load(Ordering::Relaxed),
            last_error: self
                .last_error
                .lock()
                .map(|last| last.clone())
                .unwrap_or_default(),
        }
    }
}
