//! Task addressing
//!
//! Tasks are addressed as
//! `/experiments/{experimentId}/task/{taskId}?type={taskType}&product={slug}`.
//! Catalog ids and slugs are URL-safe kebab-case, so no escaping is applied.

use serde::{Deserialize, Serialize};

use crate::catalog::TaskDef;
use crate::models::{TaskType, Variant};

/// Query string of a task address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskQuery {
    #[serde(rename = "type")]
    pub task_type: Option<TaskType>,
    pub product: Option<String>,
}

/// Address of `task` for a participant assigned to `variant`.
pub fn task_path(experiment_id: &str, task: &TaskDef, variant: Option<Variant>) -> String {
    let mut path = format!(
        "/experiments/{}/task/{}?type={}",
        experiment_id,
        task.id,
        task.type_for(variant)
    );
    if let Some(slug) = task.product_slug.as_deref().filter(|s| !s.is_empty()) {
        path.push_str("&product=");
        path.push_str(slug);
    }
    path
}
