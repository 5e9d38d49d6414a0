//! Catalog endpoints

use axum::{
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use studyrun_common::catalog::Experiment;
use studyrun_common::normalize::canonical_id;

use crate::error::ApiResult;
use crate::AppState;

/// GET /api/experiments
pub async fn list_experiments(State(state): State<AppState>) -> Json<Vec<Experiment>> {
    Json(state.catalog.list_experiments().to_vec())
}

/// GET /api/experiments/:experiment_id
pub async fn get_experiment(
    State(state): State<AppState>,
    Path(experiment_id): Path<String>,
) -> ApiResult<Json<Experiment>> {
    let experiment = state.catalog.get_experiment(canonical_id(&experiment_id))?;
    Ok(Json(experiment.clone()))
}

pub fn experiment_routes() -> Router<AppState> {
    Router::new()
        .route("/api/experiments", get(list_experiments))
        .route("/api/experiments/:experiment_id", get(get_experiment))
}
