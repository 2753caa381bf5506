//! Training lifecycle: trainers, plot export, seeds, and the trial runner.

pub mod reproducibility;
pub mod runner;
pub mod trainer;

pub use reproducibility::{SeedManager, start_jitter};
pub use runner::{
    DEFAULT_START_JITTER, TrialContext, TrialOutcome, TrialRunner, clean_version_dir,
    export_hparams,
};
pub use trainer::{CommandPlotExporter, CommandSpec, CommandTrainer, PlotExporter, Trainer};
