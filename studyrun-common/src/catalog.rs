//! Experiment catalog
//!
//! Static, immutable registry of experiments and their tasks. A catalog is
//! built once by the host process (normally [`Catalog::builtin`]) and shared
//! read-only; nothing here mutates after construction.

use std::collections::HashSet;

use serde::Serialize;

use crate::models::{TaskType, Variant};
use crate::{Error, Result};

/// Type-specific task configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum TaskConfig {
    /// Review-based tasks (votes, annotations, free-text feedback)
    Reviews {
        #[serde(rename = "reviewLimit")]
        review_limit: u32,
    },
    Questionnaire {
        #[serde(rename = "formId")]
        form_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        method: Option<String>,
    },
    ComprehensionTest {
        condition: String,
        product: String,
    },
}

/// Maximum number of reviews shown by review-based tasks
const REVIEW_LIMIT: u32 = 12;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDef {
    pub id: String,
    pub title: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub product_slug: Option<String>,
    /// Anchored tasks keep their declared position when the order is shuffled
    pub anchored: bool,
    pub config: TaskConfig,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variant_types: Vec<(Variant, TaskType)>,
}

impl TaskDef {
    pub fn new(id: &str, title: &str, task_type: TaskType) -> Self {
        let config = match task_type {
            TaskType::Questionnaire => TaskConfig::Questionnaire {
                form_id: id.to_string(),
                method: None,
            },
            TaskType::ComprehensionTest => TaskConfig::ComprehensionTest {
                condition: "control".to_string(),
                product: String::new(),
            },
            _ => TaskConfig::Reviews {
                review_limit: REVIEW_LIMIT,
            },
        };
        Self {
            id: id.to_string(),
            title: title.to_string(),
            task_type,
            product_slug: None,
            anchored: false,
            config,
            variant_types: Vec::new(),
        }
    }

    pub fn anchored(mut self) -> Self {
        self.anchored = true;
        self
    }

    pub fn product(mut self, slug: &str) -> Self {
        self.product_slug = Some(slug.to_string());
        self
    }

    pub fn config(mut self, config: TaskConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_variant_type(mut self, variant: Variant, task_type: TaskType) -> Self {
        self.variant_types.push((variant, task_type));
        self
    }

    /// Task type as seen by a participant assigned to `variant`.
    pub fn type_for(&self, variant: Option<Variant>) -> TaskType {
        variant
            .and_then(|v| {
                self.variant_types
                    .iter()
                    .find(|(candidate, _)| *candidate == v)
                    .map(|(_, t)| *t)
            })
            .unwrap_or(self.task_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Experiment {
    pub id: String,
    pub title: String,
    pub description: String,
    pub tasks: Vec<TaskDef>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<Variant>,
}

impl Experiment {
    pub fn new(id: &str, title: &str, description: &str, tasks: Vec<TaskDef>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            description: description.to_string(),
            tasks,
            variants: Vec::new(),
        }
    }

    pub fn with_variants(mut self, variants: &[Variant]) -> Self {
        self.variants = variants.to_vec();
        self
    }

    pub fn task(&self, task_id: &str) -> Option<&TaskDef> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn position(&self, task_id: &str) -> Option<usize> {
        self.tasks.iter().position(|t| t.id == task_id)
    }

    /// Declared task ids, in catalog order
    pub fn task_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.tasks.iter().map(|t| t.id.as_str())
    }
}

/// One slot of the participant-facing experiment sequence
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SequenceEntry {
    pub experiment_id: String,
    pub anchored: bool,
}

#[derive(Debug, Clone)]
pub struct Catalog {
    experiments: Vec<Experiment>,
    sequence: Vec<SequenceEntry>,
}

impl Catalog {
    /// Build a catalog, rejecting duplicate ids and dangling sequence entries.
    pub fn new(experiments: Vec<Experiment>, sequence: Vec<SequenceEntry>) -> Result<Self> {
        let mut experiment_ids = HashSet::new();
        for experiment in &experiments {
            if !experiment_ids.insert(experiment.id.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate experiment id '{}'",
                    experiment.id
                )));
            }
            if experiment.tasks.is_empty() {
                return Err(Error::Config(format!(
                    "experiment '{}' declares no tasks",
                    experiment.id
                )));
            }
            let mut task_ids = HashSet::new();
            for task in &experiment.tasks {
                if !task_ids.insert(task.id.as_str()) {
                    return Err(Error::Config(format!(
                        "duplicate task id '{}' in experiment '{}'",
                        task.id, experiment.id
                    )));
                }
            }
        }
        for entry in &sequence {
            if !experiment_ids.contains(entry.experiment_id.as_str()) {
                return Err(Error::Config(format!(
                    "sequence refers to unknown experiment '{}'",
                    entry.experiment_id
                )));
            }
        }
        Ok(Self {
            experiments,
            sequence,
        })
    }

    pub fn list_experiments(&self) -> &[Experiment] {
        &self.experiments
    }

    pub fn get_experiment(&self, experiment_id: &str) -> Result<&Experiment> {
        self.experiments
            .iter()
            .find(|e| e.id == experiment_id)
            .ok_or_else(|| Error::NotFound(format!("experiment '{}'", experiment_id)))
    }

    pub fn get_task(&self, experiment_id: &str, task_id: &str) -> Result<&TaskDef> {
        self.get_experiment(experiment_id)?
            .task(task_id)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "task '{}' in experiment '{}'",
                    task_id, experiment_id
                ))
            })
    }

    pub fn sequence(&self) -> &[SequenceEntry] {
        &self.sequence
    }

    /// Experiments a participant must finish to complete the study: the
    /// sequence when one is declared, otherwise every experiment.
    pub fn study_experiment_ids(&self) -> Vec<&str> {
        if self.sequence.is_empty() {
            self.experiments.iter().map(|e| e.id.as_str()).collect()
        } else {
            self.sequence
                .iter()
                .map(|e| e.experiment_id.as_str())
                .collect()
        }
    }

    /// The study as run in the lab.
    pub fn builtin() -> Self {
        use TaskType::*;

        let exp1a = Experiment::new(
            "exp1a",
            "Experiment 1A: helpful votes vs. selective reactions",
            "Rate reviews with helpful votes and with selective reactions, then compare.",
            vec![
                TaskDef::new("task-numeric", "Task A: helpful votes", HelpfulVotes),
                TaskDef::new(
                    "task-proposed-1",
                    "Task B: selective reactions",
                    SentenceAnnotations,
                ),
                TaskDef::new("q-comp-1a", "Comparison questionnaire (1A)", Questionnaire)
                    .anchored()
                    .config(questionnaire("q_comparison_1a", None)),
            ],
        );

        let exp1b = Experiment::new(
            "exp1b",
            "Experiment 1B: free-text feedback vs. selective reactions",
            "Rate reviews with free text and with selective reactions, then compare.",
            vec![
                TaskDef::new("task-text", "Task A: free-text feedback", TextFeedback),
                TaskDef::new(
                    "task-proposed-2",
                    "Task B: selective reactions",
                    SentenceAnnotations,
                ),
                TaskDef::new("q-comp-1b", "Comparison questionnaire (1B)", Questionnaire)
                    .anchored()
                    .config(questionnaire("q_comparison_1b", None)),
            ],
        );

        let exp1c = Experiment::new(
            "exp1c",
            "Experiment 1C: selective reactions in detail",
            "Evaluate the selective reaction interface and compare all methods.",
            vec![
                TaskDef::new("q-proposed-detail", "Selective reactions in detail", Questionnaire)
                    .anchored()
                    .config(questionnaire(
                        "q_method_proposed_detail",
                        Some("selective reactions"),
                    )),
                TaskDef::new("q-compare-all", "Overall comparison", Questionnaire)
                    .anchored()
                    .config(questionnaire("q_compare_all", None)),
            ],
        );

        let exp2 = Experiment::new(
            "exp2",
            "Experiment 2: review browsing and comprehension",
            "Browse reviews under two conditions and answer comprehension questions.",
            vec![
                TaskDef::new("task2-1", "Browse reviews (condition A)", ComprehensionTest)
                    .config(comprehension("control", "unknown-product-a")),
                TaskDef::new("task2-2", "Browse reviews (condition B)", ComprehensionTest)
                    .config(comprehension("proposed", "unknown-product-b")),
                TaskDef::new("task2-3", "Interface questionnaire", Questionnaire)
                    .anchored()
                    .config(questionnaire("q3_ui", None)),
            ],
        );

        let text_vs_selection = Experiment::new(
            "text-vs-selection",
            "Free-text vs. selection-based review rating",
            "Compare free-text review rating with selection-based rating.",
            vec![
                TaskDef::new("task-text-1", "Free-text rating", TextFeedback)
                    .product("wireless-earbuds-pro"),
                TaskDef::new("task-selection-1", "Selection-based rating", SentenceAnnotations)
                    .product("wireless-earbuds-pro"),
                TaskDef::new("task-questionnaire-1", "Questionnaire", Questionnaire)
                    .anchored()
                    .config(questionnaire("questionnaire-text-vs-selection", None)),
            ],
        );

        let numeric_evaluation = Experiment::new(
            "numeric-evaluation",
            "Numeric review rating",
            "Check how well helpful votes reflect your own judgement.",
            vec![
                TaskDef::new("task-numeric-1", "Helpful votes", HelpfulVotes)
                    .product("smart-watch-x1"),
                TaskDef::new("task-questionnaire-2", "Questionnaire", Questionnaire)
                    .anchored()
                    .config(questionnaire("questionnaire-numeric-evaluation", None)),
            ],
        );

        let effectiveness = Experiment::new(
            "effectiveness",
            "Effectiveness of selection-based review rating",
            "Measure how much review ratings help product understanding.",
            vec![
                TaskDef::new("task-review-viewing", "Browse rated reviews", HelpfulVotes)
                    .product("mechanical-keyboard-rgb")
                    .with_variant_type(Variant::Control, HelpfulVotes)
                    .with_variant_type(Variant::Treatment, SentenceAnnotations),
                TaskDef::new("task-comprehension-test", "Comprehension test", ComprehensionTest)
                    .product("mechanical-keyboard-rgb")
                    .anchored()
                    .config(comprehension("control", "mechanical-keyboard-rgb")),
                TaskDef::new("task-questionnaire-3", "Questionnaire", Questionnaire)
                    .anchored()
                    .config(questionnaire("questionnaire-effectiveness", None)),
            ],
        )
        .with_variants(&[Variant::Control, Variant::Treatment]);

        let sequence = vec![
            sequence_entry("exp1a", false),
            sequence_entry("exp1b", false),
            sequence_entry("exp1c", true),
            sequence_entry("exp2", true),
        ];

        Self {
            experiments: vec![
                exp1a,
                exp1b,
                exp1c,
                exp2,
                text_vs_selection,
                numeric_evaluation,
                effectiveness,
            ],
            sequence,
        }
    }
}

fn questionnaire(form_id: &str, method: Option<&str>) -> TaskConfig {
    TaskConfig::Questionnaire {
        form_id: form_id.to_string(),
        method: method.map(str::to_string),
    }
}

fn comprehension(condition: &str, product: &str) -> TaskConfig {
    TaskConfig::ComprehensionTest {
        condition: condition.to_string(),
        product: product.to_string(),
    }
}

fn sequence_entry(experiment_id: &str, anchored: bool) -> SequenceEntry {
    SequenceEntry {
        experiment_id: experiment_id.to_string(),
        anchored,
    }
}
