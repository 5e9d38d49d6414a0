//! studyrun-server library - server-of-record for study progress
//!
//! Owns the Progress Store, Event Logger and Completion Coordinator and
//! exposes them over HTTP.

use std::sync::Arc;

use axum::Router;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use studyrun_common::randomizer::Randomizer;
use studyrun_common::Catalog;
use tower_http::trace::TraceLayer;

pub mod api;
pub mod coordinator;
pub mod error;
pub mod logger;
pub mod store;
pub mod utils;

use coordinator::CompletionCoordinator;
use logger::{EventLogger, EventSink, SqliteEventLog};
use store::ProgressStore;

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Database connection pool
    pub db: SqlitePool,
    pub catalog: Arc<Catalog>,
    pub store: ProgressStore,
    pub logger: Arc<EventLogger>,
    pub coordinator: Arc<CompletionCoordinator>,
    pub startup_time: DateTime<Utc>,
}

impl AppState {
    /// State backed by `db` for both progress and the audit log
    pub fn new(
        db: SqlitePool,
        catalog: Arc<Catalog>,
        randomizer: Arc<Randomizer>,
        max_lock_wait_ms: u64,
    ) -> Self {
        let sink = Arc::new(SqliteEventLog::new(db.clone(), max_lock_wait_ms));
        Self::with_event_sink(db, catalog, randomizer, max_lock_wait_ms, sink)
    }

    /// State with a caller-supplied audit log sink
    pub fn with_event_sink(
        db: SqlitePool,
        catalog: Arc<Catalog>,
        randomizer: Arc<Randomizer>,
        max_lock_wait_ms: u64,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        let store = ProgressStore::new(db.clone(), max_lock_wait_ms);
        let logger = Arc::new(EventLogger::new(sink));
        let coordinator = Arc::new(CompletionCoordinator::new(
            catalog.clone(),
            store.clone(),
            logger.clone(),
            randomizer,
        ));

        Self {
            db,
            catalog,
            store,
            logger,
            coordinator,
            startup_time: studyrun_common::time::now(),
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(api::health_routes())
        .merge(api::experiment_routes())
        .merge(api::participant_routes())
        .merge(api::task_routes())
        .merge(api::log_routes())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
