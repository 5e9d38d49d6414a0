//! Audit log submission
//!
//! `POST /api/log` accepts a single event or an ordered batch. The
//! `X-Participant-Id` header, when present, overrides each event's
//! `participantId`. Batches are appended in arrival order without dedup.

use axum::{extract::State, routing::post, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use studyrun_common::models::{EventType, LogEvent};
use studyrun_common::normalize::canonical_id;
use studyrun_common::{time, Error};

use super::ParticipantId;
use crate::error::ApiResult;
use crate::AppState;

/// Event as submitted by the participant UI
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSubmission {
    #[serde(default)]
    pub participant_id: Option<String>,
    pub experiment_id: String,
    pub task_id: String,
    pub event_type: EventType,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LogSubmission {
    Batch(Vec<EventSubmission>),
    Single(EventSubmission),
}

impl LogSubmission {
    fn into_events(self) -> Vec<EventSubmission> {
        match self {
            LogSubmission::Batch(events) => events,
            LogSubmission::Single(event) => vec![event],
        }
    }
}

#[derive(Debug, Serialize)]
pub struct LogResponse {
    pub accepted: usize,
}

fn to_log_event(submission: EventSubmission, header: Option<&str>) -> Result<LogEvent, Error> {
    let participant_id = header
        .map(str::to_string)
        .or(submission.participant_id)
        .filter(|id| !id.trim().is_empty())
        .ok_or_else(|| Error::Validation("log event without participant id".to_string()))?;

    Ok(LogEvent {
        participant_id,
        experiment_id: canonical_id(&submission.experiment_id).to_string(),
        task_id: submission.task_id,
        event_type: submission.event_type,
        data: submission.data,
        timestamp: submission.timestamp.unwrap_or_else(time::now),
    })
}

/// POST /api/log
pub async fn submit_log(
    State(state): State<AppState>,
    participant: Option<ParticipantId>,
    Json(submission): Json<LogSubmission>,
) -> ApiResult<Json<LogResponse>> {
    let header = participant.as_ref().map(|ParticipantId(id)| id.as_str());
    let events = submission
        .into_events()
        .into_iter()
        .map(|event| to_log_event(event, header))
        .collect::<Result<Vec<_>, _>>()?;

    state.logger.append_batch(&events).await?;
    Ok(Json(LogResponse {
        accepted: events.len(),
    }))
}

pub fn log_routes() -> Router<AppState> {
    Router::new().route("/api/log", post(submit_log))
}
