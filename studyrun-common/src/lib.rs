//! # studyrun Common Library
//!
//! Shared code for the studyrun server-of-record and client mirror:
//! - Experiment catalog and task addressing
//! - Participant, progress and audit-log data model
//! - Legacy experiment id normalization
//! - Counterbalanced order assignment
//! - Configuration loading
//! - SQLite schema and migrations (feature `sqlx`)

pub mod catalog;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod models;
pub mod normalize;
pub mod paths;
pub mod randomizer;
pub mod results;
pub mod time;

pub use catalog::Catalog;
pub use error::{Error, Result};
