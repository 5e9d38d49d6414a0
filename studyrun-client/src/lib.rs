//! studyrun-client: participant-side mirror of study progress
//!
//! The [`ClientCache`] keeps the participant's record and the experiment in
//! progress in a [`LocalStore`] so a reload resumes where the participant
//! left off. Task actions are applied optimistically and then confirmed
//! against the server-of-record through a [`ServerOfRecord`]; a rejected
//! write is rolled back and queued for retry.

pub mod cache;
pub mod error;
pub mod remote;
pub mod storage;
mod sync;

pub use cache::{ActionKind, ClientCache, CurrentExperiment, OptimisticChange, SyncState, UnsyncedAction};
pub use error::{ClientError, Result};
pub use remote::{HttpRemote, ServerOfRecord, TaskOutcome};
pub use storage::{FileStore, LocalStore, MemoryStore};
