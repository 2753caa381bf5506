//! End-to-end trial lifecycle tests against a temporary results tree.
//!
//! Training is replaced by a recording trainer; everything else (resolution,
//! identity claims, manifest-backed data, snapshots, cleanup) is real.

use serde_json::{Value, json};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use aegrid_core::data::SessionManifest;
use aegrid_core::error::{ConfigError, TrainError};
use aegrid_core::identity::{ExperimentStore, HPARAMS_FILE, META_FILE};
use aegrid_core::persistence::load_json;
use aegrid_core::{
    AegridError, DataGenerator, FitMethod, HParams, ManifestDataSource, Model, ModelVariant,
    RunIdentity, SessionId, Trainer, TrialContext, TrialOutcome, TrialParams, TrialRunner, resolve,
};

#[derive(Clone, Default)]
struct RecordingTrainer {
    fits: Arc<Mutex<Vec<(Model, FitMethod)>>>,
}

impl Trainer for RecordingTrainer {
    fn fit(
        &self,
        _params: &TrialParams,
        model: &Model,
        _data: &mut dyn DataGenerator,
        run: &RunIdentity,
        method: FitMethod,
    ) -> Result<(), TrainError> {
        // Leave behind the kind of artifacts a logger would.
        std::fs::create_dir_all(run.version_dir().join("media")).map_err(|e| {
            TrainError::Backend(e.to_string())
        })?;
        self.fits.lock().unwrap().push((model.clone(), method));
        Ok(())
    }
}

struct Fixture {
    _root: TempDir,
    save_dir: std::path::PathBuf,
    data_dir: std::path::PathBuf,
}

impl Fixture {
    fn new() -> Self {
        let root = TempDir::new().unwrap();
        let save_dir = root.path().join("results");
        let data_dir = root.path().join("data");
        let session = SessionId::new("lab", "expt", "animal", "session-0");
        let manifest = SessionManifest {
            n_trials: 10,
            signals: [
                ("images".to_string(), vec![100, 1, 64, 64]),
                ("labels".to_string(), vec![100, 4]),
            ]
            .into_iter()
            .collect(),
        };
        aegrid_core::persistence::atomic_write_json(
            &session.path_in(&data_dir).join("manifest.json"),
            &manifest,
        )
        .unwrap();
        Self {
            _root: root,
            save_dir,
            data_dir,
        }
    }

    fn params(&self, model_class: &str, n_ae_latents: u64) -> Value {
        json!({
            "experiment_name": "e2e",
            "model_type": "conv",
            "model_class": model_class,
            "device": "cpu",
            "n_ae_latents": n_ae_latents,
            "n_parallel_gpus": 1,
            "rng_seed_model": 0,
            "save_dir": self.save_dir,
            "data_dir": self.data_dir,
            "lab": "lab",
            "expt": "expt",
            "animal": "animal",
            "session": "session-0",
            "architecture_params": { "max_latents": 16, "n_input_channels": 1 }
        })
    }

    fn runner(&self, trainer: &RecordingTrainer) -> TrialRunner {
        TrialRunner::new(Box::new(trainer.clone()), Box::new(ManifestDataSource))
    }
}

fn ctx(seed: u64) -> TrialContext {
    TrialContext::new(seed).with_max_start_jitter(Duration::ZERO)
}

fn snapshot(run: &RunIdentity) -> HParams {
    load_json(&run.hparams_path()).unwrap().unwrap()
}

fn file_count(dir: &Path) -> usize {
    if !dir.exists() {
        return 0;
    }
    walk(dir)
}

fn walk(dir: &Path) -> usize {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|entry| {
            let path = entry.unwrap().path();
            if path.is_dir() { walk(&path) } else { 1 }
        })
        .sum()
}

#[test]
fn plain_autoencoder_runs_to_completion() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let outcome = fx.runner(&trainer).run(&fx.params("ae", 8), &ctx(1)).unwrap();

    let TrialOutcome::Completed(run) = outcome else {
        panic!("expected a completed run");
    };
    assert_eq!(run.version, 0);
    assert!(run.expt_dir.ends_with("lab/expt/animal/session-0/ae/conv/08_latents/e2e"));

    let fits = trainer.fits.lock().unwrap();
    assert_eq!(fits.len(), 1);
    let (model, method) = &fits[0];
    assert_eq!(*method, FitMethod::Ae);
    assert!(matches!(
        model.variant,
        ModelVariant::Autoencoder { variational: false, .. }
    ));
    assert_eq!(model.variant.backbone().n_datasets, 1);
    assert_eq!(model.data_parallel, None);

    let hparams = snapshot(&run);
    assert_eq!(hparams["training_completed"], json!(true));
    assert_eq!(hparams["version"], json!(0));
    assert_eq!(hparams["max_latents"], json!(16));
    assert_eq!(hparams["n_input_channels"], json!(1));

    let version_dir = run.version_dir();
    assert!(version_dir.join(HPARAMS_FILE).exists());
    assert!(!version_dir.join("media").exists());
    assert!(!version_dir.join(META_FILE).exists());
}

#[test]
fn latents_over_max_claims_nothing() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let err = fx
        .runner(&trainer)
        .run(&fx.params("ae", 32), &ctx(1))
        .unwrap_err();

    assert!(matches!(
        err,
        AegridError::Config(ConfigError::LatentsExceedMax {
            n_ae_latents: 32,
            max_latents: 16
        })
    ));
    assert!(trainer.fits.lock().unwrap().is_empty());
    assert_eq!(file_count(&fx.save_dir), 0);
}

#[test]
fn unknown_model_class_builds_nothing() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let err = fx
        .runner(&trainer)
        .run(&fx.params("gan", 8), &ctx(1))
        .unwrap_err();

    assert!(matches!(
        err,
        AegridError::Config(ConfigError::ModelClassNotImplemented { .. })
    ));
    assert!(trainer.fits.lock().unwrap().is_empty());
    assert_eq!(file_count(&fx.save_dir), 0);
}

#[test]
fn identical_completed_run_is_skipped_untouched() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let runner = fx.runner(&trainer);

    let TrialOutcome::Completed(first) = runner.run(&fx.params("ae", 8), &ctx(1)).unwrap() else {
        panic!("expected a completed run");
    };
    let before = std::fs::read(first.hparams_path()).unwrap();

    let again = runner.run(&fx.params("ae", 8), &ctx(2)).unwrap();
    assert_eq!(again, TrialOutcome::Skipped { version: 0 });
    assert_eq!(std::fs::read(first.hparams_path()).unwrap(), before);
    assert!(!first.expt_dir.join("version_1").exists());
    assert_eq!(trainer.fits.lock().unwrap().len(), 1);
}

#[test]
fn changed_hyperparameter_claims_next_version() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let runner = fx.runner(&trainer);

    let mut original = fx.params("ae", 8);
    original["learning_rate"] = json!(1e-3);
    runner.run(&original, &ctx(1)).unwrap();
    let mut changed = original.clone();
    changed["learning_rate"] = json!(1e-4);
    let TrialOutcome::Completed(second) = runner.run(&changed, &ctx(2)).unwrap() else {
        panic!("expected a completed run");
    };
    assert_eq!(second.version, 1);
}

#[test]
fn conditioned_models_take_label_count_from_batch() {
    let fx = Fixture::new();
    for (class, method) in [("cond-ae", FitMethod::Ae), ("cond-ae-msp", FitMethod::AeMsp)] {
        let trainer = RecordingTrainer::default();
        let TrialOutcome::Completed(run) =
            fx.runner(&trainer).run(&fx.params(class, 8), &ctx(1)).unwrap()
        else {
            panic!("expected a completed run");
        };

        let fits = trainer.fits.lock().unwrap();
        let (model, fit_method) = &fits[0];
        assert_eq!(model.variant.n_labels(), Some(4));
        assert_eq!(*fit_method, method);
        assert_eq!(snapshot(&run)["n_labels"], json!(4));
    }
}

#[test]
fn concurrent_trials_claim_distinct_versions() {
    let fx = Fixture::new();
    let trainer = RecordingTrainer::default();
    let runner = Arc::new(fx.runner(&trainer));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let runner = Arc::clone(&runner);
            let mut params = fx.params("ae", 8);
            params["learning_rate"] = json!(10f64.powi(-(i + 2)));
            std::thread::spawn(move || runner.run(&params, &ctx(i as u64)).unwrap())
        })
        .collect();

    let mut versions: Vec<u32> = handles
        .into_iter()
        .map(|h| match h.join().unwrap() {
            TrialOutcome::Completed(run) => run.version,
            other => panic!("unexpected outcome {other:?}"),
        })
        .collect();
    versions.sort();
    assert_eq!(versions, vec![0, 1, 2, 3]);

    let store = ExperimentStore::for_params(&resolve(&fx.params("ae", 8)).unwrap());
    assert_eq!(store.versions().unwrap(), vec![0, 1, 2, 3]);
}
