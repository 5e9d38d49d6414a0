//! Study data model
//!
//! Status enums, per-task progress records, the persisted participant
//! document and audit log events. Everything here serializes with the
//! camelCase field names the participant UI exchanges with the server.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::results::TaskResult;
use crate::Error;

/// Kind of work a task asks of the participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    HelpfulVotes,
    SentenceAnnotations,
    TextFeedback,
    Questionnaire,
    ComprehensionTest,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::HelpfulVotes => "helpful-votes",
            TaskType::SentenceAnnotations => "sentence-annotations",
            TaskType::TextFeedback => "text-feedback",
            TaskType::Questionnaire => "questionnaire",
            TaskType::ComprehensionTest => "comprehension-test",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "helpful-votes" => Ok(TaskType::HelpfulVotes),
            "sentence-annotations" => Ok(TaskType::SentenceAnnotations),
            "text-feedback" => Ok(TaskType::TextFeedback),
            "questionnaire" => Ok(TaskType::Questionnaire),
            "comprehension-test" => Ok(TaskType::ComprehensionTest),
            other => Err(Error::Validation(format!("unknown task type '{}'", other))),
        }
    }
}

/// Between-subjects condition of an experiment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    Control,
    Treatment,
}

impl Variant {
    pub fn as_str(&self) -> &'static str {
        match self {
            Variant::Control => "control",
            Variant::Treatment => "treatment",
        }
    }
}

impl FromStr for Variant {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "control" => Ok(Variant::Control),
            "treatment" => Ok(Variant::Treatment),
            other => Err(Error::Validation(format!("unknown variant '{}'", other))),
        }
    }
}

/// Per-task status
///
/// Forward path is `pending -> in_progress -> completed` (a task may also be
/// completed straight from `pending`). The only backward move is the explicit
/// reset `completed -> pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
        }
    }

    /// Whether moving from `self` to `next` is a legal state-machine edge.
    ///
    /// Self-loops are legal; they are the idempotent re-application of a
    /// status and the store turns them into no-ops.
    pub fn can_transition(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        match (self, next) {
            (a, b) if a == b => true,
            (Pending, InProgress) | (Pending, Completed) | (InProgress, Completed) => true,
            (Completed, Pending) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(TaskStatus::Pending),
            "in_progress" => Ok(TaskStatus::InProgress),
            "completed" => Ok(TaskStatus::Completed),
            other => Err(Error::Validation(format!("unknown task status '{}'", other))),
        }
    }
}

/// Aggregate experiment status, derived from its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    #[default]
    NotStarted,
    InProgress,
    Completed,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExperimentStatus::NotStarted => "not_started",
            ExperimentStatus::InProgress => "in_progress",
            ExperimentStatus::Completed => "completed",
        }
    }

    /// Derive the aggregate from the experiment's declared task ids.
    ///
    /// `completed` iff every declared task is completed; `in_progress` if
    /// any task has been touched (non-pending, or started at some point);
    /// otherwise `not_started`. Records for undeclared task ids are ignored.
    pub fn derive<'a, I>(task_ids: I, tasks: &BTreeMap<String, ProgressRecord>) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut all_completed = true;
        let mut touched = false;
        let mut any = false;

        for id in task_ids {
            any = true;
            match tasks.get(id) {
                Some(record) => {
                    if record.status != TaskStatus::Completed {
                        all_completed = false;
                    }
                    if record.status != TaskStatus::Pending || record.started_at.is_some() {
                        touched = true;
                    }
                }
                None => all_completed = false,
            }
        }

        if any && all_completed {
            ExperimentStatus::Completed
        } else if touched {
            ExperimentStatus::InProgress
        } else {
            ExperimentStatus::NotStarted
        }
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExperimentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "not_started" => Ok(ExperimentStatus::NotStarted),
            "in_progress" => Ok(ExperimentStatus::InProgress),
            "completed" => Ok(ExperimentStatus::Completed),
            other => Err(Error::Validation(format!(
                "unknown experiment status '{}'",
                other
            ))),
        }
    }
}

/// Status, timestamps and result of one task for one participant
///
/// `completed_at` is set iff `status == Completed`; `result` is only ever
/// present on a completed task.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<TaskResult>,
}

impl ProgressRecord {
    /// Check the completed_at/result invariants.
    pub fn is_consistent(&self) -> bool {
        let completed = self.status == TaskStatus::Completed;
        completed == self.completed_at.is_some() && (completed || self.result.is_none())
    }
}

/// Progress of one experiment for one participant
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExperimentProgress {
    pub status: ExperimentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tasks: BTreeMap<String, ProgressRecord>,
}

/// experimentId -> progress
pub type ProgressMap = BTreeMap<String, ExperimentProgress>;

/// Signed informed-consent record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Consent {
    pub name: String,
    pub date: DateTime<Utc>,
    pub signed: bool,
}

/// Persisted participant document as exchanged with the participant UI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParticipantRecord {
    pub participant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consent: Option<Consent>,
    #[serde(default)]
    pub experiment_order: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub experiment_sequence: Option<Vec<String>>,
    #[serde(default)]
    pub experiment_progress: ProgressMap,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Generate a fresh participant id (`participant-<uuid v4>`)
pub fn new_participant_id() -> String {
    format!("participant-{}", uuid::Uuid::new_v4())
}

impl ParticipantRecord {
    pub fn new(participant_id: impl Into<String>, created_at: DateTime<Utc>) -> Self {
        Self {
            participant_id: participant_id.into(),
            consent: None,
            experiment_order: BTreeMap::new(),
            experiment_sequence: None,
            experiment_progress: BTreeMap::new(),
            created_at,
            completed_at: None,
        }
    }

    pub fn has_consented(&self) -> bool {
        self.consent.as_ref().map(|c| c.signed).unwrap_or(false)
    }
}

/// Audit log event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    TaskStart,
    TaskComplete,
    TaskUncomplete,
    Annotation,
    Vote,
    Feedback,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::TaskStart => "task-start",
            EventType::TaskComplete => "task-complete",
            EventType::TaskUncomplete => "task-uncomplete",
            EventType::Annotation => "annotation",
            EventType::Vote => "vote",
            EventType::Feedback => "feedback",
        }
    }
}

impl FromStr for EventType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task-start" => Ok(EventType::TaskStart),
            "task-complete" => Ok(EventType::TaskComplete),
            "task-uncomplete" => Ok(EventType::TaskUncomplete),
            "annotation" => Ok(EventType::Annotation),
            "vote" => Ok(EventType::Vote),
            "feedback" => Ok(EventType::Feedback),
            other => Err(Error::Validation(format!("unknown event type '{}'", other))),
        }
    }
}

/// Immutable audit log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEvent {
    pub participant_id: String,
    pub experiment_id: String,
    pub task_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl LogEvent {
    pub fn new(
        participant_id: impl Into<String>,
        experiment_id: impl Into<String>,
        task_id: impl Into<String>,
        event_type: EventType,
        data: Value,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            experiment_id: experiment_id.into(),
            task_id: task_id.into(),
            event_type,
            data,
            timestamp: crate::time::now(),
        }
    }
}
