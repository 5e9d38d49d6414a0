//! Typed task result payloads
//!
//! The participant UI submits a task's result as an untyped JSON blob. The
//! blob is parsed against the schema of the task's type before anything is
//! written, so only well-formed results ever reach the store. Stored results
//! carry their type tag: `{"type": "<task-type>", "data": {...}}`.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::TaskType;
use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VoteType {
    Helpful,
    NotHelpful,
}

/// Whether an interaction added or withdrew a mark
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Add,
    Remove,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VoteRecord {
    pub review_id: String,
    pub vote_type: VoteType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RecordAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AnnotationRecord {
    pub review_id: String,
    pub sentence_id: String,
    pub annotation_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<RecordAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FeedbackRecord {
    pub review_id: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// Likert answers are numbers, free-text answers are strings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponseValue {
    Number(f64),
    Text(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QuestionnaireResponse {
    pub question_id: String,
    pub value: ResponseValue,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct HelpfulVotesResult {
    pub votes: Vec<VoteRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SentenceAnnotationsResult {
    pub annotations: Vec<AnnotationRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TextFeedbackResult {
    pub feedback: Vec<FeedbackRecord>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct QuestionnaireResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub form_id: Option<String>,
    pub responses: Vec<QuestionnaireResponse>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ComprehensionTestResult {
    /// Selected option index per question
    pub answers: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

/// Result payload, one variant per task type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum TaskResult {
    HelpfulVotes(HelpfulVotesResult),
    SentenceAnnotations(SentenceAnnotationsResult),
    TextFeedback(TextFeedbackResult),
    Questionnaire(QuestionnaireResult),
    ComprehensionTest(ComprehensionTestResult),
}

impl TaskResult {
    /// Parse an untyped submission against the schema of `task_type`.
    ///
    /// Unknown fields, wrong shapes and semantically empty entries are all
    /// rejected with `Error::Validation`.
    pub fn parse(task_type: TaskType, raw: Value) -> Result<Self> {
        let result = match task_type {
            TaskType::HelpfulVotes => TaskResult::HelpfulVotes(decode(task_type, raw)?),
            TaskType::SentenceAnnotations => {
                TaskResult::SentenceAnnotations(decode(task_type, raw)?)
            }
            TaskType::TextFeedback => TaskResult::TextFeedback(decode(task_type, raw)?),
            TaskType::Questionnaire => TaskResult::Questionnaire(decode(task_type, raw)?),
            TaskType::ComprehensionTest => {
                TaskResult::ComprehensionTest(decode(task_type, raw)?)
            }
        };
        result.validate()?;
        Ok(result)
    }

    pub fn task_type(&self) -> TaskType {
        match self {
            TaskResult::HelpfulVotes(_) => TaskType::HelpfulVotes,
            TaskResult::SentenceAnnotations(_) => TaskType::SentenceAnnotations,
            TaskResult::TextFeedback(_) => TaskType::TextFeedback,
            TaskResult::Questionnaire(_) => TaskType::Questionnaire,
            TaskResult::ComprehensionTest(_) => TaskType::ComprehensionTest,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            TaskResult::HelpfulVotes(r) => {
                for vote in &r.votes {
                    require_id("reviewId", &vote.review_id)?;
                }
            }
            TaskResult::SentenceAnnotations(r) => {
                for a in &r.annotations {
                    require_id("reviewId", &a.review_id)?;
                    require_id("sentenceId", &a.sentence_id)?;
                    require_id("annotationType", &a.annotation_type)?;
                }
            }
            TaskResult::TextFeedback(r) => {
                for f in &r.feedback {
                    require_id("reviewId", &f.review_id)?;
                    if f.content.trim().is_empty() {
                        return Err(Error::Validation(format!(
                            "empty feedback for review '{}'",
                            f.review_id
                        )));
                    }
                }
            }
            TaskResult::Questionnaire(r) => {
                let mut seen = HashSet::new();
                for response in &r.responses {
                    require_id("questionId", &response.question_id)?;
                    if !seen.insert(response.question_id.as_str()) {
                        return Err(Error::Validation(format!(
                            "duplicate response for question '{}'",
                            response.question_id
                        )));
                    }
                    if let ResponseValue::Number(n) = response.value {
                        if !n.is_finite() {
                            return Err(Error::Validation(format!(
                                "non-finite answer for question '{}'",
                                response.question_id
                            )));
                        }
                    }
                }
            }
            TaskResult::ComprehensionTest(r) => {
                if let Some(score) = r.score {
                    if !score.is_finite() || score < 0.0 {
                        return Err(Error::Validation(format!(
                            "invalid comprehension score {}",
                            score
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

fn decode<T: serde::de::DeserializeOwned>(task_type: TaskType, raw: Value) -> Result<T> {
    serde_json::from_value(raw)
        .map_err(|e| Error::Validation(format!("malformed {} result: {}", task_type, e)))
}

fn require_id(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} must not be empty", field)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_helpful_votes() {
        let raw = json!({"votes": [{"reviewId": "r1", "voteType": "helpful"}]});
        let parsed = TaskResult::parse(TaskType::HelpfulVotes, raw).unwrap();
        assert_eq!(parsed.task_type(), TaskType::HelpfulVotes);
    }

    #[test]
    fn test_parse_rejects_payload_of_other_type() {
        let raw = json!({"votes": [{"reviewId": "r1", "voteType": "helpful"}]});
        let err = TaskResult::parse(TaskType::Questionnaire, raw).unwrap_err();
        assert!(err.is_validation());
    }

    #[test]
    fn test_parse_rejects_unknown_fields() {
        let raw = json!({"answers": [1, 2], "cheat": true});
        assert!(TaskResult::parse(TaskType::ComprehensionTest, raw).is_err());
    }

    #[test]
    fn test_questionnaire_duplicate_question_rejected() {
        let raw = json!({"responses": [
            {"questionId": "q1-1", "value": 4},
            {"questionId": "q1-1", "value": 5}
        ]});
        let err = TaskResult::parse(TaskType::Questionnaire, raw).unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn test_questionnaire_mixed_values() {
        let raw = json!({"formId": "q_comparison_1a", "responses": [
            {"questionId": "q1-1", "value": 4},
            {"questionId": "q1-3", "value": "too few options"}
        ]});
        let parsed = TaskResult::parse(TaskType::Questionnaire, raw).unwrap();
        match parsed {
            TaskResult::Questionnaire(q) => {
                assert_eq!(q.responses[0].value, ResponseValue::Number(4.0));
                assert_eq!(
                    q.responses[1].value,
                    ResponseValue::Text("too few options".to_string())
                );
            }
            other => panic!("unexpected result {:?}", other),
        }
    }

    #[test]
    fn test_empty_feedback_rejected() {
        let raw = json!({"feedback": [{"reviewId": "r1", "content": "   "}]});
        assert!(TaskResult::parse(TaskType::TextFeedback, raw).is_err());
    }

    #[test]
    fn test_stored_form_is_tagged() {
        let result = TaskResult::parse(
            TaskType::ComprehensionTest,
            json!({"answers": [0, 2, 1], "score": 0.66}),
        )
        .unwrap();
        let stored = serde_json::to_value(&result).unwrap();
        assert_eq!(stored["type"], "comprehension-test");
        assert_eq!(stored["data"]["answers"], json!([0, 2, 1]));

        let back: TaskResult = serde_json::from_value(stored).unwrap();
        assert_eq!(back, result);
    }
}
