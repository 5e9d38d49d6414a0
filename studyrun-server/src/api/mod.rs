//! HTTP API handlers for studyrun-server

pub mod experiments;
pub mod health;
pub mod logs;
pub mod participants;
pub mod tasks;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use studyrun_common::Error;

use crate::error::ApiError;

pub use experiments::experiment_routes;
pub use health::health_routes;
pub use logs::log_routes;
pub use participants::participant_routes;
pub use tasks::task_routes;

/// Header carrying the participant identity on task and log routes
pub const PARTICIPANT_HEADER: &str = "x-participant-id";

/// Participant id taken from the `X-Participant-Id` header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantId(pub String);

#[async_trait]
impl<S> FromRequestParts<S> for ParticipantId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let value = parts
            .headers
            .get(PARTICIPANT_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .ok_or_else(|| {
                ApiError::from(Error::Validation(
                    "missing X-Participant-Id header".to_string(),
                ))
            })?;
        Ok(ParticipantId(value.to_string()))
    }
}
