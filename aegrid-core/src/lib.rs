//! # aegrid-core: autoencoder grid-search dispatch
//!
//! Turns a sweep description into trials, and runs each trial through a fixed
//! lifecycle: resolve parameters, claim a run identity, build the model,
//! snapshot, train, snapshot again, clean up.
//!
//! Trials are fanned out either to local worker slots (one per GPU group or
//! CPU worker) or to a cluster scheduler, behind the [`dispatch::JobLauncher`]
//! trait.

pub mod config;
pub mod data;
pub mod dispatch;
pub mod error;
pub mod identity;
pub mod model;
pub mod params;
pub mod persistence;
pub mod training;

// Re-exports
pub use config::{SweepConfig, load_sweep};
pub use data::{Batch, DataGenerator, DataSource, ManifestDataSource, SessionId, Split};
pub use dispatch::{
    DispatchSettings, JobLauncher, LaunchPlan, Slot, SweepReport, Trial, TrialStatus,
};
pub use error::{AegridError, ConfigError, DispatchError, IdentityError, ModelError, TrainError};
pub use identity::{Claim, ExperimentStore, RunIdentity};
pub use model::{FitMethod, Model, ModelFactory, ModelVariant};
pub use params::{Device, HParams, ModelClass, ModelFamily, TrialParams, resolve};
pub use training::{
    CommandTrainer, PlotExporter, Trainer, TrialContext, TrialOutcome, TrialRunner,
};
