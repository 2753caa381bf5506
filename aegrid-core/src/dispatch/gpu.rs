//! GPU groups: partitioning visible device ids for multi-GPU trials.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DispatchError;

/// Ordered device ids that jointly run one trial.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GpuGroup(Vec<String>);

impl GpuGroup {
    pub fn new(ids: Vec<String>) -> Self {
        Self(ids)
    }

    /// Ids `0..n`, for a trial that was not launched on a specific group.
    pub fn sequential(n: usize) -> Self {
        Self((0..n).map(|i| i.to_string()).collect())
    }

    pub fn ids(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value for `CUDA_VISIBLE_DEVICES`.
    pub fn visible_devices(&self) -> String {
        self.0.join(",")
    }
}

impl fmt::Display for GpuGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.visible_devices())
    }
}

/// Split a `;`-separated `gpus_viz` list into device ids.
pub fn parse_visible_gpus(gpus_viz: &str) -> Result<Vec<String>, DispatchError> {
    let ids: Vec<String> = gpus_viz
        .split(';')
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(String::from)
        .collect();
    if ids.is_empty() {
        return Err(DispatchError::NoGpus);
    }
    Ok(ids)
}

/// Contiguous groups of `per_group` ids, in original order.
///
/// The last group holds the remainder when `per_group` does not divide the
/// id count.
pub fn partition_gpus(ids: &[String], per_group: usize) -> Result<Vec<GpuGroup>, DispatchError> {
    if per_group == 0 {
        return Err(DispatchError::ZeroParallelGpus);
    }
    if ids.is_empty() {
        return Err(DispatchError::NoGpus);
    }
    Ok(ids
        .chunks(per_group)
        .map(|chunk| GpuGroup(chunk.to_vec()))
        .collect())
}
