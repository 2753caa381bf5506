//! Training backends: the blocking `fit` contract and a subprocess backend.
//!
//! The training loop itself is external. [`CommandTrainer`] hands the
//! resolved parameters and model description to a configured program as JSON
//! on stdin and waits for it to exit.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};
use tracing::{debug, info};

use crate::data::{DataGenerator, Split};
use crate::error::TrainError;
use crate::identity::RunIdentity;
use crate::model::{FitMethod, Model};
use crate::params::TrialParams;

/// Runs the training loop for one trial. Blocking; no timeout, no cancellation.
pub trait Trainer: Send + Sync {
    fn fit(
        &self,
        params: &TrialParams,
        model: &Model,
        data: &mut dyn DataGenerator,
        run: &RunIdentity,
        method: FitMethod,
    ) -> Result<(), TrainError>;
}

/// Renders loss curves for a finished run.
pub trait PlotExporter: Send + Sync {
    fn export(&self, params: &TrialParams, split: Split, save_file: &Path)
    -> Result<(), TrainError>;
}

/// External program invocation: program plus fixed arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn is_set(&self) -> bool {
        !self.program.trim().is_empty()
    }
}

/// Trainer that delegates to an external program.
///
/// The program runs inside the version directory and receives
/// `{"hparams", "model", "fit_method", "version_dir"}` on stdin. The model's
/// kind is tagged at `model.variant.variant`. Program output streams through to
/// the trial's own stdout and stderr.
#[derive(Debug, Clone)]
pub struct CommandTrainer {
    spec: CommandSpec,
}

impl CommandTrainer {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl Trainer for CommandTrainer {
    fn fit(
        &self,
        params: &TrialParams,
        model: &Model,
        _data: &mut dyn DataGenerator,
        run: &RunIdentity,
        method: FitMethod,
    ) -> Result<(), TrainError> {
        let payload = json!({
            "hparams": params,
            "model": model,
            "fit_method": method,
            "version_dir": run.version_dir(),
        });
        info!(program = %self.spec.program, %method, version = run.version, "Starting training");
        run_with_stdin(&self.spec, &run.version_dir(), &[], &payload)
    }
}

/// Plot exporter that delegates to an external program.
///
/// Called as `<program> <args...> --split <split> --save-file <path>` with the
/// snapshot parameters on stdin.
#[derive(Debug, Clone)]
pub struct CommandPlotExporter {
    spec: CommandSpec,
}

impl CommandPlotExporter {
    pub fn new(spec: CommandSpec) -> Self {
        Self { spec }
    }
}

impl PlotExporter for CommandPlotExporter {
    fn export(
        &self,
        params: &TrialParams,
        split: Split,
        save_file: &Path,
    ) -> Result<(), TrainError> {
        let workdir = save_file.parent().unwrap_or_else(|| Path::new("."));
        let save_file = save_file.to_string_lossy();
        let extra = ["--split", split.as_str(), "--save-file", save_file.as_ref()];
        let payload = serde_json::to_value(params).map_err(|e| TrainError::Plots {
            message: e.to_string(),
        })?;
        run_with_stdin(&self.spec, workdir, &extra, &payload).map_err(|e| TrainError::Plots {
            message: e.to_string(),
        })
    }
}

fn run_with_stdin(
    spec: &CommandSpec,
    workdir: &Path,
    extra_args: &[&str],
    payload: &serde_json::Value,
) -> Result<(), TrainError> {
    let mut child = Command::new(&spec.program)
        .args(&spec.args)
        .args(extra_args)
        .current_dir(workdir)
        .stdin(Stdio::piped())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| TrainError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

    if let Some(mut stdin) = child.stdin.take() {
        let body = serde_json::to_vec(payload).map_err(|e| TrainError::Backend(e.to_string()))?;
        // A backend that ignores its input may close stdin early.
        if let Err(e) = stdin.write_all(&body) {
            debug!(error = %e, "Trainer closed stdin before reading parameters");
        }
    }

    let status = child.wait().map_err(|source| TrainError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    if !status.success() {
        return Err(TrainError::Failed {
            program: spec.program.clone(),
            status: status.to_string(),
        });
    }
    Ok(())
}
