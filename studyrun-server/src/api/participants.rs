//! Participant endpoints: creation, consent, sequence, progress and export

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use studyrun_common::models::{Consent, LogEvent, ParticipantRecord, ProgressMap};
use studyrun_common::{time, Error};
use tracing::info;

use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateParticipantRequest {
    pub participant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequest {
    pub name: String,
    #[serde(default)]
    pub agreed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceResponse {
    pub participant_id: String,
    pub sequence: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportResponse {
    pub participant: ParticipantRecord,
    pub logs: Vec<LogEvent>,
    pub exported_at: DateTime<Utc>,
}

/// POST /api/participants
pub async fn create_participant(
    State(state): State<AppState>,
    body: Option<Json<CreateParticipantRequest>>,
) -> ApiResult<(StatusCode, Json<ParticipantRecord>)> {
    let request = body.map(|Json(b)| b).unwrap_or_default();
    let row = state.store.create_participant(request.participant_id).await?;
    let record = state.store.load_participant(&row.participant_id).await?;
    Ok((StatusCode::CREATED, Json(record)))
}

/// GET /api/participants/:participant_id
pub async fn get_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> ApiResult<Json<ParticipantRecord>> {
    Ok(Json(state.store.load_participant(&participant_id).await?))
}

/// POST /api/participants/:participant_id/consent
pub async fn record_consent(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
    Json(request): Json<ConsentRequest>,
) -> ApiResult<Json<ParticipantRecord>> {
    let name = request.name.trim();
    if name.is_empty() {
        return Err(Error::Validation("consent requires a name".to_string()).into());
    }
    if !request.agreed {
        return Err(Error::Validation("consent requires agreement".to_string()).into());
    }

    let consent = Consent {
        name: name.to_string(),
        date: time::now(),
        signed: true,
    };
    state.store.record_consent(&participant_id, &consent).await?;
    info!(participant_id = %participant_id, "Consent signed");

    Ok(Json(state.store.load_participant(&participant_id).await?))
}

/// GET /api/participants/:participant_id/sequence
pub async fn get_sequence(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> ApiResult<Json<SequenceResponse>> {
    let sequence = state.coordinator.sequence_for(&participant_id).await?;
    Ok(Json(SequenceResponse {
        participant_id,
        sequence,
    }))
}

/// GET /api/participants/:participant_id/progress
pub async fn get_progress(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> ApiResult<Json<ProgressMap>> {
    state.store.require_participant(&participant_id).await?;
    Ok(Json(state.store.get_progress(&participant_id).await?))
}

/// GET /api/participants/:participant_id/logs
pub async fn get_logs(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> ApiResult<Json<Vec<LogEvent>>> {
    Ok(Json(state.logger.events_for(&participant_id).await?))
}

/// GET /api/participants/:participant_id/export
pub async fn export_participant(
    State(state): State<AppState>,
    Path(participant_id): Path<String>,
) -> ApiResult<Json<ExportResponse>> {
    let participant = state.store.load_participant(&participant_id).await?;
    let logs = state.logger.events_for(&participant_id).await?;
    Ok(Json(ExportResponse {
        participant,
        logs,
        exported_at: time::now(),
    }))
}

pub fn participant_routes() -> Router<AppState> {
    Router::new()
        .route("/api/participants", post(create_participant))
        .route("/api/participants/:participant_id", get(get_participant))
        .route("/api/participants/:participant_id/consent", post(record_consent))
        .route("/api/participants/:participant_id/sequence", get(get_sequence))
        .route("/api/participants/:participant_id/progress", get(get_progress))
        .route("/api/participants/:participant_id/logs", get(get_logs))
        .route("/api/participants/:participant_id/export", get(export_participant))
}
