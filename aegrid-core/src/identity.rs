//! Run identity: experiment directories, version claims, collision checks.
//!
//! Layout under `save_dir`:
//!
//! ```text
//! <save_dir>/<sessions>/<model_class>/<model_type>/<NN>_latents/<experiment_name>/version_<N>/
//!     hparams.json       snapshot, written before and after training
//!     meta.experiment    identity record, removed by post-run cleanup
//! ```
//!
//! Trials launched at the same time race for versions. The collision check is
//! best-effort detection; the version claim itself uses an exclusive
//! `create_dir`, so two trials never end up in the same directory.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::data::SessionId;
use crate::error::IdentityError;
use crate::params::{HParams, TrialParams};
use crate::persistence;

/// Snapshot file name inside a version directory.
pub const HPARAMS_FILE: &str = "hparams.json";
/// Identity record written when a version is claimed.
pub const META_FILE: &str = "meta.experiment";
const VERSION_PREFIX: &str = "version_";

/// Keys that describe how or when a run happened rather than what it is.
/// Ignored when deciding whether two runs are the same experiment.
const BOOKKEEPING_KEYS: &[&str] = &[
    "architecture_params",
    "version",
    "training_completed",
    "model_build_rng_seed",
    "training_rng_seed",
    "n_datasets",
    "n_labels",
    "device",
    "gpus_viz",
    "n_parallel_gpus",
    "slurm",
    "export_train_plots",
    "list_index",
    "tt_n_cpu_trials",
    "tt_n_cpu_workers",
    "tt_n_gpu_trials",
];

/// A claimed run: experiment, sessions, and version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunIdentity {
    pub experiment_name: String,
    pub expt_dir: PathBuf,
    pub sessions: Vec<SessionId>,
    pub version: u32,
}

impl RunIdentity {
    pub fn version_dir(&self) -> PathBuf {
        self.expt_dir.join(format!("{VERSION_PREFIX}{}", self.version))
    }

    pub fn hparams_path(&self) -> PathBuf {
        self.version_dir().join(HPARAMS_FILE)
    }
}

/// Outcome of a claim attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Created(RunIdentity),
    /// A completed run with the same hyperparameters already exists.
    AlreadyExists { version: u32 },
}

/// Record written to `meta.experiment` when a version is claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunMeta {
    pub experiment_name: String,
    pub version: u32,
    pub sessions: Vec<String>,
    pub fingerprint: String,
    pub created_at: DateTime<Utc>,
}

/// One experiment directory and the versions inside it.
#[derive(Debug, Clone)]
pub struct ExperimentStore {
    expt_dir: PathBuf,
}

impl ExperimentStore {
    pub fn new(expt_dir: impl Into<PathBuf>) -> Self {
        Self {
            expt_dir: expt_dir.into(),
        }
    }

    /// Store for the experiment directory derived from `params`.
    pub fn for_params(params: &TrialParams) -> Self {
        Self::new(expt_dir(params))
    }

    pub fn expt_dir(&self) -> &Path {
        &self.expt_dir
    }

    /// Existing version numbers, ascending.
    pub fn versions(&self) -> Result<Vec<u32>, IdentityError> {
        let entries = match std::fs::read_dir(&self.expt_dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(IdentityError::Scan {
                    path: self.expt_dir.clone(),
                    source,
                });
            }
        };

        let mut versions = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| IdentityError::Scan {
                path: self.expt_dir.clone(),
                source,
            })?;
            if !entry.path().is_dir() {
                continue;
            }
            let name = entry.file_name();
            if let Some(version) = name
                .to_str()
                .and_then(|n| n.strip_prefix(VERSION_PREFIX))
                .and_then(|n| n.parse::<u32>().ok())
            {
                versions.push(version);
            }
        }
        versions.sort_unstable();
        Ok(versions)
    }

    /// Find a completed version whose shared hyperparameters equal `candidate`.
    ///
    /// Versions without a readable snapshot are skipped.
    pub fn find_completed(&self, candidate: &HParams) -> Result<Option<u32>, IdentityError> {
        for version in self.versions()? {
            let path = self
                .expt_dir
                .join(format!("{VERSION_PREFIX}{version}"))
                .join(HPARAMS_FILE);
            let stored: HParams = match persistence::load_json(&path) {
                Ok(Some(stored)) => stored,
                Ok(None) => continue,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable snapshot");
                    continue;
                }
            };
            let completed = matches!(stored.get("training_completed"), Some(Value::Bool(true)));
            if completed && same_experiment(candidate, &stored) {
                return Ok(Some(version));
            }
        }
        Ok(None)
    }

    /// Claim a fresh version for `params`, unless a completed twin exists.
    ///
    /// Nothing is written when the twin is found.
    pub fn claim(&self, params: &TrialParams) -> Result<Claim, IdentityError> {
        let candidate = params.to_hparams();
        if let Some(version) = self.find_completed(&candidate)? {
            return Ok(Claim::AlreadyExists { version });
        }

        std::fs::create_dir_all(&self.expt_dir).map_err(|source| IdentityError::CreateDir {
            path: self.expt_dir.clone(),
            source,
        })?;

        let mut version = self.versions()?.last().map_or(0, |v| v + 1);
        let version_dir = loop {
            let dir = self.expt_dir.join(format!("{VERSION_PREFIX}{version}"));
            match std::fs::create_dir(&dir) {
                Ok(()) => break dir,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(version, "Version taken by a concurrent trial, trying next");
                    version += 1;
                }
                Err(source) => return Err(IdentityError::CreateDir { path: dir, source }),
            }
        };

        let identity = RunIdentity {
            experiment_name: params.experiment_name.clone(),
            expt_dir: self.expt_dir.clone(),
            sessions: params.sessions.clone(),
            version,
        };
        let meta = RunMeta {
            experiment_name: identity.experiment_name.clone(),
            version,
            sessions: identity.sessions.iter().map(ToString::to_string).collect(),
            fingerprint: fingerprint(&candidate),
            created_at: Utc::now(),
        };
        let meta_path = version_dir.join(META_FILE);
        persistence::atomic_write_json(&meta_path, &meta).map_err(|source| {
            IdentityError::WriteMeta {
                path: meta_path.clone(),
                source,
            }
        })?;

        info!(
            experiment = %identity.experiment_name,
            version,
            dir = %version_dir.display(),
            "Claimed run version"
        );
        Ok(Claim::Created(identity))
    }
}

/// Experiment directory for a trial.
pub fn expt_dir(params: &TrialParams) -> PathBuf {
    sessions_dir(&params.save_dir, &params.sessions)
        .join(params.model_class.as_tag())
        .join(params.model_type.as_tag())
        .join(format!("{:02}_latents", params.n_ae_latents))
        .join(&params.experiment_name)
}

fn sessions_dir(save_dir: &Path, sessions: &[SessionId]) -> PathBuf {
    match sessions {
        [] => save_dir.to_path_buf(),
        [single] => single.path_in(save_dir),
        many => {
            let mut hasher = Sha256::new();
            for session in many {
                hasher.update(session.to_string().as_bytes());
                hasher.update(b"\n");
            }
            let digest = format!("{:x}", hasher.finalize());
            save_dir.join(format!("multisession-{}", &digest[..8]))
        }
    }
}

/// Whether every non-bookkeeping key present in both maps has the same value.
pub fn same_experiment(a: &HParams, b: &HParams) -> bool {
    a.iter()
        .filter(|(key, _)| !BOOKKEEPING_KEYS.contains(&key.as_str()))
        .all(|(key, value)| b.get(key).is_none_or(|other| values_match(value, other)))
}

fn values_match(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_match(x, y))
        }
        _ => a == b,
    }
}

/// SHA-256 over the non-bookkeeping hyperparameters, in sorted key order.
pub fn fingerprint(hparams: &HParams) -> String {
    let sorted: BTreeMap<&String, &Value> = hparams
        .iter()
        .filter(|(key, _)| !BOOKKEEPING_KEYS.contains(&key.as_str()))
        .collect();
    let mut hasher = Sha256::new();
    for (key, value) in sorted {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(value.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::resolve;
    use serde_json::json;
    use tempfile::TempDir;

    fn params_in(dir: &Path, n_ae_latents: u64) -> TrialParams {
        resolve(&json!({
            "experiment_name": "sweep",
            "model_type": "conv",
            "model_class": "ae",
            "device": "cpu",
            "n_ae_latents": n_ae_latents,
            "save_dir": dir.to_string_lossy(),
            "learning_rate": 1e-4,
            "architecture_params": { "max_latents": 64 }
        }))
        .unwrap()
    }

    fn complete(identity: &RunIdentity, params: &TrialParams) {
        let mut params = params.clone();
        params.version = Some(identity.version);
        params.training_completed = true;
        persistence::atomic_write_json(&identity.hparams_path(), &params).unwrap();
    }

    fn created(claim: Claim) -> RunIdentity {
        match claim {
            Claim::Created(identity) => identity,
            other => panic!("expected a new version, got {other:?}"),
        }
    }

    #[test]
    fn test_expt_dir_layout() {
        let dir = TempDir::new().unwrap();
        let mut params = params_in(dir.path(), 8);
        params.sessions = vec![SessionId::new("lab", "expt", "mouse", "s1")];
        assert_eq!(
            expt_dir(&params),
            dir.path().join("lab/expt/mouse/s1/ae/conv/08_latents/sweep")
        );
    }

    #[test]
    fn test_first_claim_is_version_zero_with_meta() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path(), 8);
        let store = ExperimentStore::for_params(&params);
        let identity = created(store.claim(&params).unwrap());
        assert_eq!(identity.version, 0);
        assert!(identity.version_dir().join(META_FILE).exists());
        assert!(!identity.hparams_path().exists());
    }

    #[test]
    fn test_incomplete_run_does_not_block_new_version() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path(), 8);
        let store = ExperimentStore::for_params(&params);
        let first = created(store.claim(&params).unwrap());
        let mut snapshot = params.clone();
        snapshot.version = Some(first.version);
        persistence::atomic_write_json(&first.hparams_path(), &snapshot).unwrap();

        let second = created(store.claim(&params).unwrap());
        assert_eq!(second.version, 1);
    }

    #[test]
    fn test_completed_twin_is_detected_without_writing() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path(), 8);
        let store = ExperimentStore::for_params(&params);
        let first = created(store.claim(&params).unwrap());
        complete(&first, &params);
        let before = std::fs::read_to_string(first.hparams_path()).unwrap();

        assert_eq!(
            store.claim(&params).unwrap(),
            Claim::AlreadyExists { version: 0 }
        );
        assert_eq!(store.versions().unwrap(), vec![0]);
        assert_eq!(std::fs::read_to_string(first.hparams_path()).unwrap(), before);
    }

    #[test]
    fn test_different_hyperparameters_get_new_version() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path(), 8);
        let store = ExperimentStore::for_params(&params);
        let first = created(store.claim(&params).unwrap());
        complete(&first, &params);

        let mut other = params.clone();
        other.extra.insert("learning_rate".into(), json!(1e-3));
        assert_eq!(created(store.claim(&other).unwrap()).version, 1);
    }

    #[test]
    fn test_claim_skips_versions_taken_concurrently() {
        let dir = TempDir::new().unwrap();
        let params = params_in(dir.path(), 8);
        let store = ExperimentStore::for_params(&params);
        std::fs::create_dir_all(store.expt_dir().join("version_0")).unwrap();
        std::fs::create_dir_all(store.expt_dir().join("version_3")).unwrap();
        std::fs::create_dir_all(store.expt_dir().join("not_a_version")).unwrap();
        assert_eq!(created(store.claim(&params).unwrap()).version, 4);
    }

    #[test]
    fn test_bookkeeping_keys_do_not_distinguish_runs() {
        let a = json!({ "n_ae_latents": 8, "device": "cuda", "version": 0, "lr": 1e-3 });
        let b = json!({ "n_ae_latents": 8.0, "device": "cpu", "version": 5, "lr": 0.001 });
        let (a, b) = (a.as_object().unwrap(), b.as_object().unwrap());
        assert!(same_experiment(a, b));
        assert_eq!(fingerprint(a), fingerprint(&json!({ "lr": 1e-3, "n_ae_latents": 8 }).as_object().unwrap().clone()));
    }

    #[test]
    fn test_multisession_dir_is_stable() {
        let sessions = vec![
            SessionId::new("l", "e", "a", "s1"),
            SessionId::new("l", "e", "a", "s2"),
        ];
        let a = sessions_dir(Path::new("/r"), &sessions);
        let b = sessions_dir(Path::new("/r"), &sessions);
        assert_eq!(a, b);
        assert!(a.to_string_lossy().contains("multisession-"));
    }
}
