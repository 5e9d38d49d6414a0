//! Task endpoints
//!
//! `GET  /experiments/:experiment_id/task/:task_id?type=..&product=..` returns
//! the task view (assigning the order lazily); `POST` on the same path
//! applies an action: `start`, `complete` or `reset`.

use axum::{
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use studyrun_common::paths::TaskQuery;

use super::ParticipantId;
use crate::error::ApiResult;
use crate::AppState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Start,
    Complete,
    Reset,
}

#[derive(Debug, Deserialize)]
pub struct TaskActionRequest {
    pub action: TaskAction,
    #[serde(default)]
    pub result: Option<Value>,
}

/// GET /experiments/:experiment_id/task/:task_id
pub async fn get_task(
    State(state): State<AppState>,
    ParticipantId(participant_id): ParticipantId,
    Path((experiment_id, task_id)): Path<(String, String)>,
    Query(query): Query<TaskQuery>,
) -> ApiResult<Response> {
    let view = state
        .coordinator
        .task_view(&participant_id, &experiment_id, &task_id, &query)
        .await?;
    Ok(Json(view).into_response())
}

/// POST /experiments/:experiment_id/task/:task_id
pub async fn post_task_action(
    State(state): State<AppState>,
    ParticipantId(participant_id): ParticipantId,
    Path((experiment_id, task_id)): Path<(String, String)>,
    Json(request): Json<TaskActionRequest>,
) -> ApiResult<Response> {
    let coordinator = &state.coordinator;
    let response = match request.action {
        TaskAction::Start => Json(
            coordinator
                .start_task(&participant_id, &experiment_id, &task_id)
                .await?,
        )
        .into_response(),
        TaskAction::Complete => Json(
            coordinator
                .complete_task(&participant_id, &experiment_id, &task_id, request.result)
                .await?,
        )
        .into_response(),
        TaskAction::Reset => Json(
            coordinator
                .reset_task(&participant_id, &experiment_id, &task_id)
                .await?,
        )
        .into_response(),
    };
    Ok(response)
}

pub fn task_routes() -> Router<AppState> {
    Router::new().route(
        "/experiments/:experiment_id/task/:task_id",
        get(get_task).post(post_task_action),
    )
}
