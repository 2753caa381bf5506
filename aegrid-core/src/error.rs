//! Error types for aegrid.
//!
//! Uses `thiserror` for structured error variants covering parameter
//! resolution, run identity, model construction, training, and dispatch.

use std::path::PathBuf;

/// Everything a trial run can fail with.
///
/// Dispatch keeps its own [`DispatchError`]; a failed trial is recorded in
/// the sweep report rather than bubbling up as a run error.
#[derive(Debug, thiserror::Error)]
pub enum AegridError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Identity error: {0}")]
    Identity(#[from] IdentityError),

    #[error("Model error: {0}")]
    Model(#[from] ModelError),

    #[error("Training error: {0}")]
    Train(#[from] TrainError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fatal configuration problems, raised before any resource is allocated.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Number of latents ({n_ae_latents}) higher than max latents ({max_latents}), architecture will not work")]
    LatentsExceedMax { n_ae_latents: u64, max_latents: u64 },

    #[error("The model class \"{tag}\" is not currently implemented")]
    ModelClassNotImplemented { tag: String },

    #[error("Unknown model type \"{tag}\" (expected conv or linear)")]
    UnknownModelType { tag: String },

    #[error("Unknown device \"{tag}\" (expected cpu, cuda, or gpu)")]
    UnknownDevice { tag: String },

    #[error("Missing required parameter: {key}")]
    MissingKey { key: String },

    #[error("Invalid value for '{key}': {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("Parameters must be a key-value mapping, got {found}")]
    NotAMapping { found: String },

    #[error("Sweep file not found: {path}")]
    SweepNotFound { path: PathBuf },

    #[error("Failed to load sweep configuration: {0}")]
    Load(#[from] Box<figment::Error>),
}

/// Failures while claiming or inspecting a run identity on disk.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Failed to create experiment directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to scan experiment directory {path}: {source}")]
    Scan {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write run metadata to {path}: {source}")]
    WriteMeta {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Errors from model selection and construction.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("Training batch has no labels tensor; {model_class} needs one to size its label input")]
    MissingLabels { model_class: String },

    #[error("Labels tensor has shape {shape:?}; expected [batch, n_t, n_labels]")]
    LabelsRank { shape: Vec<usize> },

    #[error("Pretrained weights not found at {path}")]
    PretrainedNotFound { path: PathBuf },

    #[error("Data generator error: {message}")]
    Data { message: String },
}

/// Errors surfaced by a training backend.
#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error("Failed to spawn trainer '{program}': {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("'{program}' exited with {status}")]
    Failed { program: String, status: String },

    #[error("Failed to export training plots: {message}")]
    Plots { message: String },

    #[error("{0}")]
    Backend(String),
}

/// Errors from sweep expansion and job launching.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("No visible GPUs listed in gpus_viz")]
    NoGpus,

    #[error("n_parallel_gpus must be at least 1")]
    ZeroParallelGpus,

    #[error("Worker pool size must be at least 1")]
    NoWorkers,

    #[error("Failed to launch trial {index}: {message}")]
    Launch { index: usize, message: String },

    #[error("Cluster submission failed for trial {index}: {message}")]
    Submit { index: usize, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
