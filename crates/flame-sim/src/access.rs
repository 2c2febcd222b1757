//! Synthetic access pattern: a few fragments are touched every epoch, picked
//! with probability proportional to their hotness, and each touch makes the
//! fragment a little hotter. Seeded, so runs are reproducible.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;

use flame_core::FragmentKey;
use flame_services::PlacementPlan;

/// Hotness gained per access.
const TOUCH_HEAT: f64 = 0.01;

/// Floor so that a zero-importance fragment can still be picked.
const MIN_HEAT: f64 = 0.01;

pub struct AccessModel {
    rng: StdRng,
    keys: Vec<FragmentKey>,
    hotness: Vec<f64>,
}

impl AccessModel {
    /// Initial hotness is each fragment's importance.
    pub fn new(plan: &PlacementPlan, seed: u64) -> Self {
        let (keys, hotness): (Vec<_>, Vec<_>) = plan
            .keyed_fragments()
            .map(|(key, f)| (key, f.importance.max(MIN_HEAT)))
            .unzip();
        Self {
            rng: StdRng::seed_from_u64(seed),
            keys,
            hotness,
        }
    }

    /// Sample `n` accesses (with replacement) and heat up what was touched.
    pub fn step(&mut self, n: usize) -> Vec<FragmentKey> {
        let Ok(dist) = WeightedIndex::new(&self.hotness) else {
            return Vec::new();
        };
        let picks: Vec<usize> = (0..n).map(|_| dist.sample(&mut self.rng)).collect();
        for &i in &picks {
            self.hotness[i] += TOUCH_HEAT;
        }
        picks.into_iter().map(|i| self.keys[i]).collect()
    }

    /// The `k` hottest fragments, hottest first. Ties go to the lower key.
    pub fn hottest(&self, k: usize) -> Vec<FragmentKey> {
        let mut ranked: Vec<(FragmentKey, f64)> =
            self.keys.iter().copied().zip(self.hotness.iter().copied()).collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.into_iter().take(k).map(|(key, _)| key).collect()
    }
}
