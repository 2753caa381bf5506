//! Reproducibility: per-trial seed derivation and start jitter.
//!
//! Nothing here reads process-global random state. Every draw comes from a
//! generator seeded from values carried in the trial's context.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;

/// Seed manager for reproducible training.
///
/// Component seeds are derived from the global seed and the component name,
/// so the same name always yields the same seed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeedManager {
    pub global_seed: u64,
    pub component_seeds: HashMap<String, u64>,
}

impl SeedManager {
    pub fn new(global_seed: u64) -> Self {
        Self {
            global_seed,
            component_seeds: HashMap::new(),
        }
    }

    pub fn get_seed(&mut self, component: &str) -> u64 {
        let global_seed = self.global_seed;
        *self
            .component_seeds
            .entry(component.to_string())
            .or_insert_with(|| derive_seed(global_seed, component))
    }
}

fn derive_seed(global_seed: u64, component: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(global_seed.to_le_bytes());
    hasher.update(component.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

/// Delay before claiming a run identity, uniform in `[0, max]`.
///
/// Spreads out trials that were launched together so their version claims
/// don't all land at once.
pub fn start_jitter(seed: u64, max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = StdRng::seed_from_u64(derive_seed(seed, "start_jitter"));
    Duration::from_millis(rng.gen_range(0..=max_ms))
}
