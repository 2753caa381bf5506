//! Grid expansion: base parameters crossed with candidate value lists.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::params::HParams;
use crate::training::SeedManager;

/// A grid sweep over hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sweep {
    pub id: Uuid,
    /// Root for per-trial seeds.
    pub seed: u64,
    pub base: HParams,
    pub grid: BTreeMap<String, Vec<Value>>,
}

/// One expanded configuration, ready to launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trial {
    pub index: usize,
    pub seed: u64,
    pub params: HParams,
}

impl Sweep {
    pub fn new(base: HParams, grid: BTreeMap<String, Vec<Value>>, seed: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            seed,
            base,
            grid,
        }
    }

    /// Number of configurations in the full grid.
    pub fn size(&self) -> usize {
        self.grid.values().map(Vec::len).product()
    }

    /// Expand the grid, keys in sorted order with the last key varying
    /// fastest, keeping at most `limit` trials.
    ///
    /// Grid values override base values of the same key.
    pub fn trials(&self, limit: Option<usize>) -> Vec<Trial> {
        let mut configs = vec![HParams::new()];
        for (key, values) in &self.grid {
            let mut expanded = Vec::with_capacity(configs.len() * values.len());
            for config in &configs {
                for value in values {
                    let mut c = config.clone();
                    c.insert(key.clone(), value.clone());
                    expanded.push(c);
                }
            }
            configs = expanded;
        }

        let mut seeds = SeedManager::new(self.seed);
        configs
            .into_iter()
            .take(limit.unwrap_or(usize::MAX))
            .enumerate()
            .map(|(index, point)| {
                let mut params = self.base.clone();
                params.extend(point);
                Trial {
                    index,
                    seed: seeds.get_seed(&format!("trial_{index}")),
                    params,
                }
            })
            .collect()
    }
}
