//! Progress Store: the server-of-record
//!
//! Maps participant -> experiment -> task -> progress record, together with
//! the write-once order assignments, experiment sequences and variants.
//! Every mutation is a single SQL statement scoped to the rows it changes,
//! so concurrent requests for the same participant never lose each other's
//! updates. The `write_*` functions take an open transaction so a caller
//! can commit a task transition and its aggregates together. Lock errors are retried through
//! [`retry_on_lock`]; every other failure is surfaced to the caller.
//!
//! [`retry_on_lock`]: crate::utils::retry_on_lock

mod assignments;
mod participants;
mod progress;

use sqlx::{Sqlite, SqlitePool, Transaction};
use studyrun_common::Result;

pub use participants::ParticipantRow;

/// Handle to the server-of-record; cheap to clone
#[derive(Clone)]
pub struct ProgressStore {
    pool: SqlitePool,
    max_lock_wait_ms: u64,
}

impl ProgressStore {
    pub fn new(pool: SqlitePool, max_lock_wait_ms: u64) -> Self {
        Self {
            pool,
            max_lock_wait_ms,
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn max_lock_wait_ms(&self) -> u64 {
        self.max_lock_wait_ms
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }
}
