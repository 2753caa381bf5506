//! Local fan-out: one async worker per slot, pulling from a shared queue.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{GpuGroup, JobLauncher, SweepReport, Trial, TrialRecord, TrialStatus};
use crate::error::DispatchError;
use crate::params::HParams;

/// A local worker's resource lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Gpu(GpuGroup),
    Cpu(usize),
}

impl Slot {
    pub fn visible_gpus(&self) -> Option<&GpuGroup> {
        match self {
            Self::Gpu(group) => Some(group),
            Self::Cpu(_) => None,
        }
    }
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Gpu(group) => write!(f, "gpu[{group}]"),
            Self::Cpu(worker) => write!(f, "cpu#{worker}"),
        }
    }
}

/// What a trial process receives on stdin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRequest {
    pub index: usize,
    pub seed: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_gpus: Option<GpuGroup>,
    pub params: HParams,
}

impl TrialRequest {
    pub fn new(trial: &Trial, visible_gpus: Option<GpuGroup>) -> Self {
        Self {
            index: trial.index,
            seed: trial.seed,
            visible_gpus,
            params: trial.params.clone(),
        }
    }
}

/// Runs one trial on one slot to completion.
#[async_trait]
pub trait TrialExecutor: Send + Sync {
    async fn execute(&self, trial: &Trial, slot: &Slot) -> Result<(), DispatchError>;
}

/// Runs each trial as a child process with a [`TrialRequest`] on stdin.
///
/// GPU slots export their group as `CUDA_VISIBLE_DEVICES`. The child's
/// output streams through to this process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl TrialExecutor for ProcessExecutor {
    async fn execute(&self, trial: &Trial, slot: &Slot) -> Result<(), DispatchError> {
        let launch_err = |message: String| DispatchError::Launch {
            index: trial.index,
            message,
        };

        let request = TrialRequest::new(trial, slot.visible_gpus().cloned());
        let body = serde_json::to_vec(&request).map_err(|e| launch_err(e.to_string()))?;

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        if let Some(group) = slot.visible_gpus() {
            command.env("CUDA_VISIBLE_DEVICES", group.visible_devices());
        }

        let mut child = command.spawn().map_err(|e| {
            launch_err(format!("failed to spawn {}: {e}", self.program.display()))
        })?;
        debug!(index = trial.index, pid = child.id(), %slot, "Spawned trial process");

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(&body)
                .await
                .map_err(|e| launch_err(format!("failed to send parameters: {e}")))?;
        }

        let status = child
            .wait()
            .await
            .map_err(|e| launch_err(e.to_string()))?;
        if !status.success() {
            return Err(launch_err(format!("trial process exited with {status}")));
        }
        Ok(())
    }
}

/// Fans trials out over a fixed set of local slots.
pub struct LocalLauncher {
    slots: Vec<Slot>,
    executor: Arc<dyn TrialExecutor>,
}

impl LocalLauncher {
    pub fn new(slots: Vec<Slot>, executor: Arc<dyn TrialExecutor>) -> Result<Self, DispatchError> {
        if slots.is_empty() {
            return Err(DispatchError::NoWorkers);
        }
        Ok(Self { slots, executor })
    }

    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }
}

#[async_trait]
impl JobLauncher for LocalLauncher {
    async fn launch(&self, trials: Vec<Trial>) -> Result<SweepReport, DispatchError> {
        info!(
            trials = trials.len(),
            slots = self.slots.len(),
            "Launching local sweep"
        );
        let queue = Arc::new(Mutex::new(VecDeque::from(trials)));

        let workers: Vec<_> = self
            .slots
            .iter()
            .cloned()
            .map(|slot| {
                let queue = Arc::clone(&queue);
                let executor = Arc::clone(&self.executor);
                async move {
                    let mut records = Vec::new();
                    loop {
                        let Some(trial) = queue.lock().await.pop_front() else {
                            break;
                        };
                        info!(index = trial.index, %slot, "Starting trial");
                        let status = match executor.execute(&trial, &slot).await {
                            Ok(()) => TrialStatus::Succeeded,
                            Err(e) => {
                                warn!(index = trial.index, %slot, error = %e, "Trial failed");
                                TrialStatus::Failed {
                                    message: e.to_string(),
                                }
                            }
                        };
                        records.push(TrialRecord {
                            index: trial.index,
                            slot: Some(slot.to_string()),
                            status,
                        });
                    }
                    records
                }
            })
            .collect();

        let records = futures::future::join_all(workers)
            .await
            .into_iter()
            .flatten()
            .collect();
        let report = SweepReport::from_records(records);
        info!(
            succeeded = report.succeeded(),
            failed = report.failed(),
            "Local sweep finished"
        );
        Ok(report)
    }
}
