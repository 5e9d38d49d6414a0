//! Server-of-record access
//!
//! The cache talks to the server through [`ServerOfRecord`] so tests can
//! substitute an in-process fake. [`HttpRemote`] is the production
//! implementation over the studyrun-server HTTP API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use studyrun_common::models::{
    ExperimentStatus, LogEvent, ParticipantRecord, ProgressRecord, Variant,
};

use crate::{ClientError, Result};

const USER_AGENT: &str = concat!("studyrun-client/", env!("CARGO_PKG_VERSION"));
const PARTICIPANT_HEADER: &str = "X-Participant-Id";
const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Pointer to the task after the one just acted on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NextTaskRef {
    pub task_id: String,
    pub path: String,
}

/// Server answer to a complete or reset action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutcome {
    #[serde(default)]
    pub applied: bool,
    pub progress: ProgressRecord,
    pub experiment_status: ExperimentStatus,
    #[serde(default)]
    pub next_task: Option<NextTaskRef>,
}

/// The parts of the server's task view the cache needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskViewSummary {
    pub experiment_id: String,
    pub task_id: String,
    #[serde(default)]
    pub variant: Option<Variant>,
    pub order: Vec<String>,
    pub progress: ProgressRecord,
    pub experiment_status: ExperimentStatus,
}

#[async_trait]
pub trait ServerOfRecord: Send + Sync {
    async fn fetch_participant(&self, participant_id: &str) -> Result<ParticipantRecord>;

    async fn fetch_task_view(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<TaskViewSummary>;

    async fn complete_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<TaskOutcome>;

    async fn reset_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<TaskOutcome>;

    /// Submit an ordered batch; returns the number of events accepted.
    async fn submit_events(&self, participant_id: &str, events: &[LogEvent]) -> Result<usize>;
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

#[derive(Debug, Deserialize)]
struct LogAccepted {
    accepted: usize,
}

/// HTTP client for studyrun-server
#[derive(Debug, Clone)]
pub struct HttpRemote {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str, participant_id: Option<&str>) -> RequestBuilder {
        let builder = self
            .http_client
            .request(method, format!("{}{}", self.base_url, path));
        match participant_id {
            Some(pid) => builder.header(PARTICIPANT_HEADER, pid),
            None => builder,
        }
    }

    async fn send<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T> {
        let response = builder.send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }

    async fn task_action(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        body: Value,
    ) -> Result<TaskOutcome> {
        let path = format!("/experiments/{}/task/{}", experiment_id, task_id);
        tracing::debug!(participant_id, experiment_id, task_id, "Submitting task action");
        self.send(
            self.request(Method::POST, &path, Some(participant_id))
                .json(&body),
        )
        .await
    }
}

/// Turn a non-success response into `ClientError::Rejected`
async fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let text = response.text().await.unwrap_or_default();
    let (code, message) = match serde_json::from_str::<ErrorBody>(&text) {
        Ok(body) => (body.error.code, body.error.message),
        Err(_) => ("HTTP_ERROR".to_string(), text),
    };
    Err(ClientError::Rejected {
        status: status.as_u16(),
        code,
        message,
    })
}

#[async_trait]
impl ServerOfRecord for HttpRemote {
    async fn fetch_participant(&self, participant_id: &str) -> Result<ParticipantRecord> {
        let path = format!("/api/participants/{}", participant_id);
        self.send(self.request(Method::GET, &path, None)).await
    }

    async fn fetch_task_view(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<TaskViewSummary> {
        let path = format!("/experiments/{}/task/{}", experiment_id, task_id);
        self.send(self.request(Method::GET, &path, Some(participant_id)))
            .await
    }

    async fn complete_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
        result: Option<Value>,
    ) -> Result<TaskOutcome> {
        self.task_action(
            participant_id,
            experiment_id,
            task_id,
            json!({ "action": "complete", "result": result }),
        )
        .await
    }

    async fn reset_task(
        &self,
        participant_id: &str,
        experiment_id: &str,
        task_id: &str,
    ) -> Result<TaskOutcome> {
        self.task_action(
            participant_id,
            experiment_id,
            task_id,
            json!({ "action": "reset" }),
        )
        .await
    }

    async fn submit_events(&self, participant_id: &str, events: &[LogEvent]) -> Result<usize> {
        let accepted: LogAccepted = self
            .send(
                self.request(Method::POST, "/api/log", Some(participant_id))
                    .json(events),
            )
            .await?;
        Ok(accepted.accepted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let remote = HttpRemote::new("http://127.0.0.1:5780/").unwrap();
        assert_eq!(remote.base_url(), "http://127.0.0.1:5780");
    }

    #[test]
    fn test_reset_outcome_without_next_task_parses() {
        let outcome: TaskOutcome = serde_json::from_value(json!({
            "experimentId": "exp1a",
            "taskId": "task-numeric",
            "applied": true,
            "progress": {"status": "pending"},
            "experimentStatus": "in_progress",
            "currentTask": {"taskId": "task-numeric", "path": "/experiments/exp1a/task/task-numeric?type=helpful-votes"}
        }))
        .unwrap();
        assert!(outcome.applied);
        assert_eq!(outcome.next_task, None);
    }

    #[test]
    fn test_error_body_shape() {
        let body: ErrorBody = serde_json::from_str(
            r#"{"error":{"code":"VALIDATION_ERROR","message":"bad payload"}}"#,
        )
        .unwrap();
        assert_eq!(body.error.code, "VALIDATION_ERROR");
    }
}
