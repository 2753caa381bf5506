//! Cluster dispatch: one batch script per trial, handed to a submit command.
//!
//! Scripts target a SLURM-style scheduler (`#SBATCH` directives). The
//! scheduler owns retries and placement; a submitted trial is reported as
//! [`TrialStatus::Submitted`] with whatever job id the submit command printed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tracing::{info, warn};

use super::{JobLauncher, SweepReport, Trial, TrialRecord, TrialRequest, TrialStatus};
use crate::error::DispatchError;
use crate::persistence;

/// The `[cluster]` section of a sweep file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Scheduler stdout/stderr land here.
    pub log_path: PathBuf,
    /// Generated scripts and trial requests land here.
    pub script_dir: PathBuf,
    pub cpus_per_trial: u32,
    pub gpus_per_trial: u32,
    pub gpu_type: Option<String>,
    pub memory_mb: Option<u64>,
    /// `HH:MM:SS`
    pub job_time: String,
    pub partition: Option<String>,
    /// Shell lines run before the trial, e.g. environment activation.
    pub setup_commands: Vec<String>,
    /// Raw directive bodies, emitted as `#SBATCH <directive>`.
    pub extra_directives: Vec<String>,
    /// Program and leading arguments; the script path is appended.
    pub submit_command: Vec<String>,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            log_path: PathBuf::from("slurm_logs"),
            script_dir: PathBuf::from("slurm_scripts"),
            cpus_per_trial: 1,
            gpus_per_trial: 1,
            gpu_type: None,
            memory_mb: None,
            job_time: "24:00:00".into(),
            partition: None,
            setup_commands: Vec::new(),
            extra_directives: Vec::new(),
            submit_command: vec!["sbatch".into()],
        }
    }
}

/// Everything needed to turn a trial into a cluster job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterJobDescriptor {
    pub experiment_name: String,
    /// Request GPUs for each job.
    pub gpu: bool,
    pub config: ClusterConfig,
    /// Command that runs a single trial; the request file is fed on stdin.
    pub trial_command: Vec<String>,
}

impl ClusterJobDescriptor {
    fn job_name(&self, index: usize) -> String {
        format!("{}_{index}", self.experiment_name)
    }

    fn script_path(&self, index: usize) -> PathBuf {
        self.config.script_dir.join(format!("trial_{index}.sh"))
    }

    fn request_path(&self, index: usize) -> PathBuf {
        self.config.script_dir.join(format!("trial_{index}.json"))
    }
}

/// Render the batch script for one trial.
pub fn render_script(job: &ClusterJobDescriptor, index: usize, request_path: &Path) -> String {
    let cfg = &job.config;
    let name = job.job_name(index);
    let log = cfg.log_path.join(&name);

    let mut s = String::from("#!/bin/bash\n");
    let _ = writeln!(s, "#SBATCH --job-name={name}");
    let _ = writeln!(s, "#SBATCH --output={}_%j.out", log.display());
    let _ = writeln!(s, "#SBATCH --error={}_%j.err", log.display());
    let _ = writeln!(s, "#SBATCH --time={}", cfg.job_time);
    let _ = writeln!(s, "#SBATCH --cpus-per-task={}", cfg.cpus_per_trial);
    if let Some(mb) = cfg.memory_mb {
        let _ = writeln!(s, "#SBATCH --mem={mb}");
    }
    if let Some(partition) = &cfg.partition {
        let _ = writeln!(s, "#SBATCH --partition={partition}");
    }
    if job.gpu {
        match &cfg.gpu_type {
            Some(kind) => {
                let _ = writeln!(s, "#SBATCH --gres=gpu:{kind}:{}", cfg.gpus_per_trial);
            }
            None => {
                let _ = writeln!(s, "#SBATCH --gres=gpu:{}", cfg.gpus_per_trial);
            }
        }
    }
    for directive in &cfg.extra_directives {
        let _ = writeln!(s, "#SBATCH {directive}");
    }
    s.push('\n');
    for line in &cfg.setup_commands {
        let _ = writeln!(s, "{line}");
    }

    let command: Vec<String> = job.trial_command.iter().map(|a| shell_quote(a)).collect();
    let _ = writeln!(
        s,
        "{} < {}",
        command.join(" "),
        shell_quote(&request_path.to_string_lossy())
    );
    s
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

/// `sbatch` prints `Submitted batch job <id>`; take the last token.
fn parse_job_id(stdout: &str) -> String {
    stdout
        .split_whitespace()
        .last()
        .unwrap_or_default()
        .to_string()
}

/// Submits each trial as an independent cluster job.
pub struct ClusterLauncher {
    job: ClusterJobDescriptor,
}

impl ClusterLauncher {
    pub fn new(job: ClusterJobDescriptor) -> Self {
        Self { job }
    }

    /// Write the request and script for one trial, returning the script path.
    pub fn prepare(&self, trial: &Trial) -> Result<PathBuf, DispatchError> {
        let request_path = self.job.request_path(trial.index);
        persistence::atomic_write_json(&request_path, &TrialRequest::new(trial, None))?;

        let script_path = self.job.script_path(trial.index);
        let script = render_script(&self.job, trial.index, &request_path);
        persistence::atomic_write(&script_path, script.as_bytes())?;
        Ok(script_path)
    }

    async fn submit(&self, index: usize, script: &Path) -> Result<String, DispatchError> {
        let submit_err = |message: String| DispatchError::Submit { index, message };
        let Some((program, args)) = self.job.config.submit_command.split_first() else {
            return Err(submit_err("submit_command is empty".into()));
        };
        let output = Command::new(program)
            .args(args)
            .arg(script)
            .output()
            .await
            .map_err(|e| submit_err(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(submit_err(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }
        Ok(parse_job_id(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl JobLauncher for ClusterLauncher {
    async fn launch(&self, trials: Vec<Trial>) -> Result<SweepReport, DispatchError> {
        std::fs::create_dir_all(&self.job.config.script_dir)?;
        std::fs::create_dir_all(&self.job.config.log_path)?;
        info!(
            trials = trials.len(),
            gpu = self.job.gpu,
            scripts = %self.job.config.script_dir.display(),
            "Submitting cluster sweep"
        );

        let mut records = Vec::with_capacity(trials.len());
        for trial in &trials {
            let submitted = match self.prepare(trial) {
                Ok(script) => self.submit(trial.index, &script).await,
                Err(e) => Err(e),
            };
            let status = match submitted {
                Ok(job_id) => {
                    info!(index = trial.index, %job_id, "Submitted trial");
                    TrialStatus::Submitted { job_id }
                }
                Err(e) => {
                    warn!(index = trial.index, error = %e, "Submission failed");
                    TrialStatus::Failed {
                        message: e.to_string(),
                    }
                }
            };
            records.push(TrialRecord {
                index: trial.index,
                slot: None,
                status,
            });
        }
        Ok(SweepReport::from_records(records))
    }
}
