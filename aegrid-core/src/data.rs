//! Data access seam: session identifiers, batches, and generators.
//!
//! Batching itself belongs to the training backend. The dispatcher only needs
//! to peek at one training batch to size the label input of conditioned
//! models, so a [`Batch`] carries signal shapes rather than tensors.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::trace;

use crate::error::{ConfigError, ModelError};
use crate::params::{HParams, TrialParams, get_str};

/// Name of the per-session shape manifest read by [`ManifestDataSource`].
pub const MANIFEST_FILE: &str = "manifest.json";

/// One recording session: `lab/expt/animal/session`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId {
    pub lab: String,
    pub expt: String,
    pub animal: String,
    pub session: String,
}

impl SessionId {
    pub fn new(
        lab: impl Into<String>,
        expt: impl Into<String>,
        animal: impl Into<String>,
        session: impl Into<String>,
    ) -> Self {
        Self {
            lab: lab.into(),
            expt: expt.into(),
            animal: animal.into(),
            session: session.into(),
        }
    }

    /// Parse `lab/expt/animal/session`.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let parts: Vec<&str> = s.split('/').map(str::trim).collect();
        match parts.as_slice() {
            [lab, expt, animal, session] if parts.iter().all(|p| !p.is_empty()) => {
                Ok(Self::new(*lab, *expt, *animal, *session))
            }
            _ => Err(ConfigError::InvalidValue {
                key: "sessions".into(),
                reason: format!("\"{s}\" is not of the form lab/expt/animal/session"),
            }),
        }
    }

    /// Read sessions from hyperparameters.
    ///
    /// A `sessions` list of `lab/expt/animal/session` strings takes priority;
    /// otherwise the four individual keys describe a single session. No keys
    /// at all means no sessions; a partial set is an error.
    pub fn from_hparams(hparams: &HParams) -> Result<Vec<Self>, ConfigError> {
        if let Some(list) = hparams.get("sessions") {
            let items = list.as_array().ok_or_else(|| ConfigError::InvalidValue {
                key: "sessions".into(),
                reason: "expected a list of lab/expt/animal/session strings".into(),
            })?;
            return items
                .iter()
                .map(|item| match item.as_str() {
                    Some(s) => Self::parse(s),
                    None => Err(ConfigError::InvalidValue {
                        key: "sessions".into(),
                        reason: format!("expected a string entry, got {item}"),
                    }),
                })
                .collect();
        }

        const KEYS: [&str; 4] = ["lab", "expt", "animal", "session"];
        let values = KEYS
            .iter()
            .map(|key| get_str(hparams, key))
            .collect::<Result<Vec<_>, _>>()?;
        if values.iter().all(Option::is_none) {
            return Ok(Vec::new());
        }
        if let Some(pos) = values.iter().position(Option::is_none) {
            return Err(ConfigError::MissingKey {
                key: KEYS[pos].to_string(),
            });
        }
        let [lab, expt, animal, session] = [values[0], values[1], values[2], values[3]]
            .map(|v| v.unwrap_or_default());
        Ok(vec![Self::new(lab, expt, animal, session)])
    }

    /// Nested directory for this session under `root`.
    pub fn path_in(&self, root: &Path) -> PathBuf {
        root.join(&self.lab)
            .join(&self.expt)
            .join(&self.animal)
            .join(&self.session)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.lab, self.expt, self.animal, self.session)
    }
}

/// Dataset split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Split {
    Train,
    Val,
    Test,
}

impl Split {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Val => "val",
            Self::Test => "test",
        }
    }
}

/// One batch, described by the shape of each named signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub dataset: usize,
    pub signals: BTreeMap<String, Vec<usize>>,
}

impl Batch {
    pub fn shape(&self, signal: &str) -> Option<&[usize]> {
        self.signals.get(signal).map(Vec::as_slice)
    }

    /// Shape of the `labels` tensor, `[batch, n_t, n_labels]` when present.
    pub fn labels_shape(&self) -> Option<&[usize]> {
        self.shape("labels")
    }
}

/// Source of training batches for one trial.
pub trait DataGenerator: Send {
    /// Number of datasets (sessions) this generator serves.
    fn n_datasets(&self) -> usize;

    /// Next batch from the given split.
    fn next_batch(&mut self, split: Split) -> Result<Batch, ModelError>;
}

/// Builds the data generator for a trial once its sessions are known.
pub trait DataSource: Send + Sync {
    /// Cheap pre-claim validation; nothing is read beyond metadata.
    fn check(&self, _params: &TrialParams) -> Result<(), ModelError> {
        Ok(())
    }

    fn open(
        &self,
        params: &TrialParams,
        sessions: &[SessionId],
    ) -> Result<Box<dyn DataGenerator>, ModelError>;
}

/// Per-session shape manifest.
///
/// ```json
/// { "n_trials": 120, "signals": { "images": [100, 1, 128, 128], "labels": [100, 4] } }
/// ```
///
/// Signal shapes are per trial, time first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionManifest {
    pub n_trials: usize,
    pub signals: BTreeMap<String, Vec<usize>>,
}

/// Opens `<data_dir>/<lab>/<expt>/<animal>/<session>/manifest.json` for each session.
#[derive(Debug, Clone, Default)]
pub struct ManifestDataSource;

impl ManifestDataSource {
    fn data_dir(params: &TrialParams) -> Result<&Path, ModelError> {
        params.data_dir.as_deref().ok_or_else(|| ModelError::Data {
            message: "data_dir is not set".into(),
        })
    }
}

impl DataSource for ManifestDataSource {
    fn check(&self, params: &TrialParams) -> Result<(), ModelError> {
        let data_dir = Self::data_dir(params)?;
        if params.sessions.is_empty() {
            return Err(no_sessions());
        }
        for session in &params.sessions {
            let path = session.path_in(data_dir).join(MANIFEST_FILE);
            if !path.is_file() {
                return Err(ModelError::Data {
                    message: format!("missing manifest {}", path.display()),
                });
            }
        }
        Ok(())
    }

    fn open(
        &self,
        params: &TrialParams,
        sessions: &[SessionId],
    ) -> Result<Box<dyn DataGenerator>, ModelError> {
        let data_dir = Self::data_dir(params)?;
        Ok(Box::new(ManifestDataGenerator::open(data_dir, sessions)?))
    }
}

fn no_sessions() -> ModelError {
    ModelError::Data {
        message: "no sessions configured".into(),
    }
}

/// Serves single-trial batches round-robin across sessions.
#[derive(Debug, Clone)]
pub struct ManifestDataGenerator {
    manifests: Vec<SessionManifest>,
    cursors: BTreeMap<Split, usize>,
}

impl ManifestDataGenerator {
    pub fn open(data_dir: &Path, sessions: &[SessionId]) -> Result<Self, ModelError> {
        if sessions.is_empty() {
            return Err(no_sessions());
        }
        let manifests = sessions
            .iter()
            .map(|session| {
                let path = session.path_in(data_dir).join(MANIFEST_FILE);
                crate::persistence::load_json::<SessionManifest>(&path)
                    .map_err(|e| ModelError::Data {
                        message: format!("failed to read {}: {e}", path.display()),
                    })?
                    .ok_or_else(|| ModelError::Data {
                        message: format!("missing manifest {}", path.display()),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::from_manifests(manifests))
    }

    pub fn from_manifests(manifests: Vec<SessionManifest>) -> Self {
        Self {
            manifests,
            cursors: BTreeMap::new(),
        }
    }
}

impl DataGenerator for ManifestDataGenerator {
    fn n_datasets(&self) -> usize {
        self.manifests.len()
    }

    fn next_batch(&mut self, split: Split) -> Result<Batch, ModelError> {
        if self.manifests.is_empty() {
            return Err(ModelError::Data {
                message: "no datasets to draw from".into(),
            });
        }
        let cursor = self.cursors.entry(split).or_insert(0);
        let dataset = *cursor % self.manifests.len();
        *cursor += 1;

        let manifest = &self.manifests[dataset];
        let signals = manifest
            .signals
            .iter()
            .map(|(name, shape)| {
                let mut batched = Vec::with_capacity(shape.len() + 1);
                batched.push(1);
                batched.extend_from_slice(shape);
                (name.clone(), batched)
            })
            .collect();
        trace!(split = split.as_str(), dataset, "Serving batch");
        Ok(Batch { dataset, signals })
    }
}
