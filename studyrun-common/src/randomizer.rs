//! Counterbalanced task ordering
//!
//! Anchored items keep their declared slots; the remaining items are
//! permuted uniformly (Fisher-Yates) and poured into the free slots in
//! declared-slot order. The randomizer holds no assignment state: the
//! write-once discipline belongs to the store that persists its output.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

use crate::catalog::{Catalog, Experiment};
use crate::models::Variant;

/// Uniform in-place permutation: for i from last index down to 1, swap
/// item i with a uniformly chosen index in [0, i].
pub fn shuffle_in_place<T, R: Rng + ?Sized>(items: &mut [T], rng: &mut R) {
    for i in (1..items.len()).rev() {
        let j = rng.gen_range(0..=i);
        items.swap(i, j);
    }
}

/// Permute the non-anchored items of `items`, leaving anchored ones in place.
pub fn counterbalance<T: Clone, R: Rng + ?Sized>(items: &[(T, bool)], rng: &mut R) -> Vec<T> {
    let mut shufflable: Vec<T> = items
        .iter()
        .filter(|(_, anchored)| !anchored)
        .map(|(item, _)| item.clone())
        .collect();
    shuffle_in_place(&mut shufflable, rng);

    let mut shuffled = shufflable.into_iter();
    items
        .iter()
        .filter_map(|(item, anchored)| {
            if *anchored {
                Some(item.clone())
            } else {
                shuffled.next()
            }
        })
        .collect()
}

/// Task order for one participant in one experiment.
pub fn assign_order<R: Rng + ?Sized>(experiment: &Experiment, rng: &mut R) -> Vec<String> {
    let items: Vec<(String, bool)> = experiment
        .tasks
        .iter()
        .map(|t| (t.id.clone(), t.anchored))
        .collect();
    counterbalance(&items, rng)
}

/// Experiment sequence for one participant.
pub fn assign_sequence<R: Rng + ?Sized>(catalog: &Catalog, rng: &mut R) -> Vec<String> {
    let items: Vec<(String, bool)> = catalog
        .sequence()
        .iter()
        .map(|e| (e.experiment_id.clone(), e.anchored))
        .collect();
    counterbalance(&items, rng)
}

/// Uniform choice among the experiment's declared variants.
pub fn assign_variant<R: Rng + ?Sized>(experiment: &Experiment, rng: &mut R) -> Option<Variant> {
    if experiment.variants.is_empty() {
        return None;
    }
    let index = rng.gen_range(0..experiment.variants.len());
    Some(experiment.variants[index])
}

/// Injectable random source shared by the request handlers
///
/// Tests construct it from a fixed seed; production uses OS entropy.
pub struct Randomizer {
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Randomizer {
    pub fn from_entropy() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
        }
    }

    /// Per-participant source: a fixed seed gives a reproducible assignment.
    pub fn for_participant(participant_seed: Option<u64>) -> Self {
        match participant_seed {
            Some(seed) => Self::seeded(seed),
            None => Self::from_entropy(),
        }
    }

    fn with_source<T>(&self, f: impl FnOnce(&mut dyn RngCore) -> T) -> T {
        // A panic while holding the lock leaves the generator usable.
        let mut guard = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        f(guard.as_mut())
    }

    pub fn order_for(&self, experiment: &Experiment) -> Vec<String> {
        self.with_source(|rng| assign_order(experiment, rng))
    }

    pub fn sequence_for(&self, catalog: &Catalog) -> Vec<String> {
        self.with_source(|rng| assign_sequence(catalog, rng))
    }

    pub fn variant_for(&self, experiment: &Experiment) -> Option<Variant> {
        self.with_source(|rng| assign_variant(experiment, rng))
    }
}

impl std::fmt::Debug for Randomizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Randomizer").finish_non_exhaustive()
    }
}
