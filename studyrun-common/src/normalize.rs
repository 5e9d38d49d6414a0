//! Legacy experiment identifier normalization
//!
//! Early builds of the study persisted experiments under `exp-*` ids, with
//! the effectiveness condition folded into the id. Every read of persisted
//! state goes through this module before an id is compared or used as a
//! storage key. Unknown ids pass through untouched so that newer ids are
//! never rejected.
//!
//! Normalization is pure. Callers that see `changed == true` write the
//! normalized form back once.

use std::collections::{BTreeMap, HashMap};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::models::{ParticipantRecord, Variant};

/// Canonical identity of a legacy experiment id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CanonicalId {
    pub id: &'static str,
    pub variant: Option<Variant>,
}

static LEGACY_EXPERIMENT_IDS: Lazy<HashMap<&'static str, CanonicalId>> = Lazy::new(|| {
    HashMap::from([
        (
            "exp-text-vs-selection",
            CanonicalId {
                id: "text-vs-selection",
                variant: None,
            },
        ),
        (
            "exp-numeric-evaluation",
            CanonicalId {
                id: "numeric-evaluation",
                variant: None,
            },
        ),
        (
            "exp-effectiveness-control",
            CanonicalId {
                id: "effectiveness",
                variant: Some(Variant::Control),
            },
        ),
        (
            "exp-effectiveness-treatment",
            CanonicalId {
                id: "effectiveness",
                variant: Some(Variant::Treatment),
            },
        ),
    ])
});

/// Look up the canonical identity of `experiment_id`, if it is a legacy id.
pub fn lookup(experiment_id: &str) -> Option<CanonicalId> {
    LEGACY_EXPERIMENT_IDS.get(experiment_id).copied()
}

/// Canonical form of `experiment_id`; unmapped ids are returned as-is.
pub fn canonical_id(experiment_id: &str) -> &str {
    match lookup(experiment_id) {
        Some(canonical) => canonical.id,
        None => experiment_id,
    }
}

/// All legacy ids that map to `canonical`, for storage rewrites.
pub fn legacy_ids() -> impl Iterator<Item = (&'static str, CanonicalId)> {
    LEGACY_EXPERIMENT_IDS.iter().map(|(k, v)| (*k, *v))
}

/// A persisted structure that carries an experiment id and optional variant
pub trait ExperimentKeyed {
    fn experiment_id(&self) -> &str;
    fn set_identity(&mut self, experiment_id: String, variant: Option<Variant>);
}

/// Bare experiment reference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExperimentRef {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<Variant>,
}

impl ExperimentRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            variant: None,
        }
    }
}

impl ExperimentKeyed for ExperimentRef {
    fn experiment_id(&self) -> &str {
        &self.id
    }

    fn set_identity(&mut self, experiment_id: String, variant: Option<Variant>) {
        self.id = experiment_id;
        if variant.is_some() {
            self.variant = variant;
        }
    }
}

/// Normalize one record. Returns the record and whether anything changed.
///
/// A mapped variant overrides the record's own; a mapping without a variant
/// leaves the record's variant alone.
pub fn normalize<T: ExperimentKeyed>(mut record: T) -> (T, bool) {
    match lookup(record.experiment_id()) {
        Some(canonical) => {
            record.set_identity(canonical.id.to_string(), canonical.variant);
            (record, true)
        }
        None => (record, false),
    }
}

/// Re-key a map whose keys are experiment ids.
///
/// `apply_variant` receives the mapped variant for values moved from a
/// variant-bearing legacy id. When both a legacy key and its canonical key
/// are present the canonical entry wins and the legacy entry is dropped.
pub fn normalize_keys<V>(
    map: BTreeMap<String, V>,
    mut apply_variant: impl FnMut(&mut V, Variant),
) -> (BTreeMap<String, V>, bool) {
    if !map.keys().any(|k| lookup(k).is_some()) {
        return (map, false);
    }

    let mut canonical_entries = BTreeMap::new();
    let mut legacy_entries = Vec::new();
    for (key, value) in map {
        match lookup(&key) {
            Some(canonical) => legacy_entries.push((canonical, value)),
            None => {
                canonical_entries.insert(key, value);
            }
        }
    }

    for (canonical, mut value) in legacy_entries {
        if canonical_entries.contains_key(canonical.id) {
            tracing::warn!(
                experiment_id = canonical.id,
                "Dropping legacy entry shadowed by canonical entry"
            );
            continue;
        }
        if let Some(variant) = canonical.variant {
            apply_variant(&mut value, variant);
        }
        canonical_entries.insert(canonical.id.to_string(), value);
    }

    (canonical_entries, true)
}

/// Normalize every experiment-keyed part of a persisted participant record.
pub fn normalize_participant(record: ParticipantRecord) -> (ParticipantRecord, bool) {
    let ParticipantRecord {
        participant_id,
        consent,
        experiment_order,
        experiment_sequence,
        experiment_progress,
        created_at,
        completed_at,
    } = record;

    let (experiment_order, order_changed) = normalize_keys(experiment_order, |_, _| {});
    let (experiment_progress, progress_changed) =
        normalize_keys(experiment_progress, |progress, variant| {
            progress.variant = Some(variant);
        });

    let mut sequence_changed = false;
    let experiment_sequence = experiment_sequence.map(|ids| {
        ids.into_iter()
            .map(|id| {
                let canonical = canonical_id(&id);
                if canonical != id {
                    sequence_changed = true;
                    canonical.to_string()
                } else {
                    id
                }
            })
            .collect()
    });

    let normalized = ParticipantRecord {
        participant_id,
        consent,
        experiment_order,
        experiment_sequence,
        experiment_progress,
        created_at,
        completed_at,
    };
    (
        normalized,
        order_changed || progress_changed || sequence_changed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExperimentProgress, ExperimentStatus};
    use chrono::Utc;

    #[test]
    fn test_legacy_id_maps_to_canonical() {
        for _ in 0..3 {
            let (normalized, changed) = normalize(ExperimentRef::new("exp-text-vs-selection"));
            assert!(changed);
            assert_eq!(normalized, ExperimentRef::new("text-vs-selection"));
        }
    }

    #[test]
    fn test_legacy_id_with_variant() {
        let (normalized, changed) = normalize(ExperimentRef::new("exp-effectiveness-control"));
        assert!(changed);
        assert_eq!(normalized.id, "effectiveness");
        assert_eq!(normalized.variant, Some(Variant::Control));
    }

    #[test]
    fn test_unknown_id_passes_through() {
        let input = ExperimentRef {
            id: "exp3-future".to_string(),
            variant: Some(Variant::Treatment),
        };
        let (normalized, changed) = normalize(input.clone());
        assert!(!changed);
        assert_eq!(normalized, input);
    }

    #[test]
    fn test_canonical_id_is_idempotent() {
        assert_eq!(canonical_id("exp-numeric-evaluation"), "numeric-evaluation");
        assert_eq!(canonical_id("numeric-evaluation"), "numeric-evaluation");
        assert_eq!(canonical_id("exp1a"), "exp1a");
    }

    #[test]
    fn test_participant_record_rekeyed() {
        let mut record = ParticipantRecord::new("p1", Utc::now());
        record.experiment_order.insert(
            "exp-text-vs-selection".to_string(),
            vec!["task-selection-1".to_string(), "task-text-1".to_string()],
        );
        record.experiment_progress.insert(
            "exp-effectiveness-treatment".to_string(),
            ExperimentProgress {
                status: ExperimentStatus::InProgress,
                ..Default::default()
            },
        );

        let (normalized, changed) = normalize_participant(record);
        assert!(changed);
        assert!(normalized.experiment_order.contains_key("text-vs-selection"));
        let progress = &normalized.experiment_progress["effectiveness"];
        assert_eq!(progress.variant, Some(Variant::Treatment));

        let (_, changed_again) = normalize_participant(normalized);
        assert!(!changed_again);
    }

    #[test]
    fn test_canonical_entry_shadows_legacy_entry() {
        let mut map = BTreeMap::new();
        map.insert("text-vs-selection".to_string(), 1);
        map.insert("exp-text-vs-selection".to_string(), 2);

        let (normalized, changed) = normalize_keys(map, |_, _| {});
        assert!(changed);
        assert_eq!(normalized.len(), 1);
        assert_eq!(normalized["text-vs-selection"], 1);
    }
}
