//! Trial lifecycle: the entry point every dispatcher schedules.
//!
//! resolve → preflight → jitter → claim → data → model → snapshot(false) → fit → plots →
//! snapshot(true) → cleanup. A killed run leaves `training_completed=false`
//! as its last snapshot.

use serde::Serialize;
use std::io;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::data::{DataSource, Split};
use crate::dispatch::GpuGroup;
use crate::error::AegridError;
use crate::identity::{Claim, ExperimentStore, META_FILE, RunIdentity};
use crate::model::ModelFactory;
use crate::params::{TrialParams, resolve};
use crate::persistence;
use crate::training::reproducibility::{SeedManager, start_jitter};
use crate::training::trainer::{PlotExporter, Trainer};

/// Upper bound of the pre-claim delay when none is configured.
pub const DEFAULT_START_JITTER: Duration = Duration::from_millis(1000);

/// Per-trial context, passed by value from the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrialContext {
    /// Seeds the start jitter.
    pub seed: u64,
    /// GPU group this trial was launched on, if any.
    pub visible_gpus: Option<GpuGroup>,
    pub max_start_jitter: Duration,
}

impl TrialContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            visible_gpus: None,
            max_start_jitter: DEFAULT_START_JITTER,
        }
    }

    pub fn with_visible_gpus(mut self, group: Option<GpuGroup>) -> Self {
        self.visible_gpus = group;
        self
    }

    pub fn with_max_start_jitter(mut self, max: Duration) -> Self {
        self.max_start_jitter = max;
        self
    }
}

/// How a trial ended, when it did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrialOutcome {
    Completed(RunIdentity),
    /// An identical completed run already exists; nothing was written.
    Skipped { version: u32 },
}

/// Drives one trial from raw parameters to a completed snapshot.
pub struct TrialRunner {
    trainer: Box<dyn Trainer>,
    data: Box<dyn DataSource>,
    plots: Option<Box<dyn PlotExporter>>,
}

impl TrialRunner {
    pub fn new(trainer: Box<dyn Trainer>, data: Box<dyn DataSource>) -> Self {
        Self {
            trainer,
            data,
            plots: None,
        }
    }

    pub fn with_plot_exporter(mut self, plots: Box<dyn PlotExporter>) -> Self {
        self.plots = Some(plots);
        self
    }

    /// Run one trial.
    ///
    /// Configuration errors, unreachable data and missing pretrained weights
    /// surface before a version directory is claimed.
    pub fn run<T: Serialize + ?Sized>(
        &self,
        raw: &T,
        ctx: &TrialContext,
    ) -> Result<TrialOutcome, AegridError> {
        let mut params = resolve(raw)?;
        self.data.check(&params)?;
        ModelFactory::pretrained_weights(&params)?;

        let jitter = start_jitter(ctx.seed, ctx.max_start_jitter);
        debug!(jitter_ms = jitter.as_millis() as u64, "Delaying identity claim");
        std::thread::sleep(jitter);

        let store = ExperimentStore::for_params(&params);
        let run = match store.claim(&params)? {
            Claim::Created(run) => run,
            Claim::AlreadyExists { version } => {
                info!(
                    version,
                    expt_dir = %store.expt_dir().display(),
                    "Experiment exists! Aborting fit"
                );
                return Ok(TrialOutcome::Skipped { version });
            }
        };
        params.version = Some(run.version);

        let mut data = self.data.open(&params, &run.sessions)?;

        let mut seeds = SeedManager::new(params.rng_seed_model);
        params.model_build_rng_seed = Some(seeds.get_seed("model_build"));
        params.n_datasets = Some(data.n_datasets());
        let (model, fit_method) =
            ModelFactory::build(&mut params, data.as_mut(), &run, ctx.visible_gpus.as_ref())?;
        params.training_rng_seed = Some(seeds.get_seed("training"));

        params.training_completed = false;
        export_hparams(&params, &run)?;
        info!(%model, %fit_method, "Constructed model");

        self.trainer
            .fit(&params, &model, data.as_mut(), &run, fit_method)?;

        if params.export_train_plots {
            self.export_plots(&params, &run)?;
        }

        params.training_completed = true;
        export_hparams(&params, &run)?;
        clean_version_dir(&run)?;

        info!(version = run.version, "Training completed");
        Ok(TrialOutcome::Completed(run))
    }

    fn export_plots(&self, params: &TrialParams, run: &RunIdentity) -> Result<(), AegridError> {
        let Some(plots) = &self.plots else {
            warn!("export_train_plots is set but no plot exporter is configured");
            return Ok(());
        };
        info!("Creating training plots");
        for (split, name) in [(Split::Train, "loss_training"), (Split::Val, "loss_validation")] {
            let save_file: PathBuf = run.version_dir().join(name);
            plots.export(params, split, &save_file)?;
        }
        Ok(())
    }
}

/// Write the hyperparameter snapshot for a run.
pub fn export_hparams(params: &TrialParams, run: &RunIdentity) -> io::Result<()> {
    persistence::atomic_write_json(&run.hparams_path(), params)
}

/// Remove logging artifacts a finished run no longer needs.
///
/// The hyperparameter snapshot is kept.
pub fn clean_version_dir(run: &RunIdentity) -> io::Result<()> {
    let version_dir = run.version_dir();
    for artifact in ["media", META_FILE] {
        if persistence::remove_if_exists(&version_dir.join(artifact))? {
            debug!(artifact, "Removed run artifact");
        }
    }
    Ok(())
}
