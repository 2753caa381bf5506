//! Dispatch: deciding where trials run and fanning them out.
//!
//! The launch mode is chosen once from [`DispatchSettings`]:
//! - `slurm = true`: every trial becomes a cluster job ([`ClusterLauncher`]).
//! - GPU device: visible ids are partitioned into groups of
//!   `n_parallel_gpus`, one local worker slot per group.
//! - CPU device: `tt_n_cpu_workers` local worker slots.
//!
//! Both paths sit behind [`JobLauncher`].

pub mod cluster;
pub mod gpu;
pub mod local;
pub mod sweep;

pub use cluster::{ClusterConfig, ClusterJobDescriptor, ClusterLauncher, render_script};
pub use gpu::{GpuGroup, parse_visible_gpus, partition_gpus};
pub use local::{LocalLauncher, ProcessExecutor, Slot, TrialExecutor, TrialRequest};
pub use sweep::{Sweep, Trial};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ConfigError, DispatchError};
use crate::params::{DEFAULT_EXPERIMENT_NAME, Device, HParams, get_bool, get_str, get_u64, require};

/// Sweep-level knobs that drive the launch decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchSettings {
    pub experiment_name: String,
    pub slurm: bool,
    /// Already normalized: `gpu` arrives here as [`Device::Cuda`].
    pub device: Device,
    /// `;`-separated visible GPU ids.
    pub gpus_viz: Option<String>,
    pub n_parallel_gpus: usize,
    /// Trial cap for CPU and cluster sweeps. `None` runs the full grid.
    pub tt_n_cpu_trials: Option<usize>,
    pub tt_n_cpu_workers: usize,
}

impl DispatchSettings {
    pub fn from_params(hparams: &HParams) -> Result<Self, ConfigError> {
        let device = Device::from_tag(require(get_str(hparams, "device")?, "device")?)?;
        Ok(Self {
            experiment_name: get_str(hparams, "experiment_name")?
                .unwrap_or(DEFAULT_EXPERIMENT_NAME)
                .to_string(),
            slurm: get_bool(hparams, "slurm")?.unwrap_or(false),
            device,
            gpus_viz: get_str(hparams, "gpus_viz")?.map(String::from),
            n_parallel_gpus: get_u64(hparams, "n_parallel_gpus")?.unwrap_or(1) as usize,
            tt_n_cpu_trials: get_u64(hparams, "tt_n_cpu_trials")?.map(|n| n as usize),
            tt_n_cpu_workers: get_u64(hparams, "tt_n_cpu_workers")?.unwrap_or(1) as usize,
        })
    }
}

/// Where a sweep's trials will run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchPlan {
    Cluster {
        gpu: bool,
        trial_cap: Option<usize>,
    },
    Local {
        slots: Vec<Slot>,
        trial_cap: Option<usize>,
    },
}

impl LaunchPlan {
    pub fn from_settings(settings: &DispatchSettings) -> Result<Self, DispatchError> {
        if settings.slurm {
            return Ok(Self::Cluster {
                gpu: settings.device.is_gpu(),
                trial_cap: settings.tt_n_cpu_trials,
            });
        }

        if settings.device.is_gpu() {
            let ids = parse_visible_gpus(settings.gpus_viz.as_deref().unwrap_or_default())?;
            let slots = partition_gpus(&ids, settings.n_parallel_gpus)?
                .into_iter()
                .map(Slot::Gpu)
                .collect();
            return Ok(Self::Local {
                slots,
                trial_cap: None,
            });
        }

        if settings.tt_n_cpu_workers == 0 {
            return Err(DispatchError::NoWorkers);
        }
        Ok(Self::Local {
            slots: (0..settings.tt_n_cpu_workers).map(Slot::Cpu).collect(),
            trial_cap: settings.tt_n_cpu_trials,
        })
    }

    pub fn trial_cap(&self) -> Option<usize> {
        match self {
            Self::Cluster { trial_cap, .. } | Self::Local { trial_cap, .. } => *trial_cap,
        }
    }
}

impl fmt::Display for LaunchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cluster { gpu, .. } => {
                write!(f, "cluster ({})", if *gpu { "gpu" } else { "cpu" })?
            }
            Self::Local { slots, .. } => {
                write!(f, "local, {} slot(s):", slots.len())?;
                for slot in slots {
                    write!(f, " {slot}")?;
                }
            }
        }
        if let Some(cap) = self.trial_cap() {
            write!(f, ", at most {cap} trial(s)")?;
        }
        Ok(())
    }
}

/// Launches a batch of trials and reports how each one went.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn launch(&self, trials: Vec<Trial>) -> Result<SweepReport, DispatchError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TrialStatus {
    Succeeded,
    Failed { message: String },
    /// Handed to the cluster scheduler; the outcome is not tracked.
    Submitted { job_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialRecord {
    pub index: usize,
    pub slot: Option<String>,
    #[serde(flatten)]
    pub status: TrialStatus,
}

/// Per-trial results of a launch, ordered by trial index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub records: Vec<TrialRecord>,
}

impl SweepReport {
    pub fn from_records(mut records: Vec<TrialRecord>) -> Self {
        records.sort_by_key(|r| r.index);
        Self { records }
    }

    pub fn succeeded(&self) -> usize {
        self.count(|s| matches!(s, TrialStatus::Succeeded))
    }

    pub fn failed(&self) -> usize {
        self.count(|s| matches!(s, TrialStatus::Failed { .. }))
    }

    pub fn submitted(&self) -> usize {
        self.count(|s| matches!(s, TrialStatus::Submitted { .. }))
    }

    pub fn is_success(&self) -> bool {
        self.failed() == 0
    }

    fn count(&self, pred: impl Fn(&TrialStatus) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.status)).count()
    }
}
