//! Local dispatch driving real trial runs through an in-process executor.

use async_trait::async_trait;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use aegrid_core::dispatch::{LocalLauncher, Slot, Sweep, Trial, TrialExecutor};
use aegrid_core::error::{DispatchError, ModelError, TrainError};
use aegrid_core::{
    Batch, DataGenerator, DataSource, Device, DispatchSettings, FitMethod, JobLauncher,
    LaunchPlan, Model, RunIdentity, SessionId, Split, Trainer, TrialContext, TrialParams,
    TrialRunner, TrialStatus,
};

struct ImageOnly;

impl DataGenerator for ImageOnly {
    fn n_datasets(&self) -> usize {
        1
    }

    fn next_batch(&mut self, _split: Split) -> Result<Batch, ModelError> {
        Ok(Batch {
            dataset: 0,
            signals: BTreeMap::from([("images".to_string(), vec![1, 100, 1, 32, 32])]),
        })
    }
}

struct ImageSource;

impl DataSource for ImageSource {
    fn open(
        &self,
        _params: &TrialParams,
        _sessions: &[SessionId],
    ) -> Result<Box<dyn DataGenerator>, ModelError> {
        Ok(Box::new(ImageOnly))
    }
}

#[derive(Clone, Default)]
struct RecordingTrainer {
    models: Arc<Mutex<Vec<Model>>>,
}

impl Trainer for RecordingTrainer {
    fn fit(
        &self,
        params: &TrialParams,
        model: &Model,
        _data: &mut dyn DataGenerator,
        _run: &RunIdentity,
        _method: FitMethod,
    ) -> Result<(), TrainError> {
        if params.extra.get("learning_rate") == Some(&json!("explode")) {
            return Err(TrainError::Backend("loss is NaN".into()));
        }
        self.models.lock().unwrap().push(model.clone());
        Ok(())
    }
}

/// Runs each trial in this process on a blocking thread.
struct InProcess {
    runner: Arc<TrialRunner>,
}

#[async_trait]
impl TrialExecutor for InProcess {
    async fn execute(&self, trial: &Trial, slot: &Slot) -> Result<(), DispatchError> {
        let runner = Arc::clone(&self.runner);
        let params = trial.params.clone();
        let ctx = TrialContext::new(trial.seed)
            .with_visible_gpus(slot.visible_gpus().cloned())
            .with_max_start_jitter(Duration::from_millis(20));
        let index = trial.index;
        tokio::task::spawn_blocking(move || runner.run(&params, &ctx))
            .await
            .map_err(|e| DispatchError::Launch {
                index,
                message: e.to_string(),
            })?
            .map(|_| ())
            .map_err(|e| DispatchError::Launch {
                index,
                message: e.to_string(),
            })
    }
}

fn base(save_dir: &std::path::Path) -> serde_json::Value {
    json!({
        "experiment_name": "dispatch",
        "model_type": "conv",
        "model_class": "ae",
        "device": "gpu",
        "gpus_viz": "0;1;2;3",
        "n_parallel_gpus": 2,
        "save_dir": save_dir,
        "architecture_params": { "max_latents": 16 }
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn four_gpus_in_pairs_launch_two_trials() {
    let dir = TempDir::new().unwrap();
    let base = base(dir.path()).as_object().unwrap().clone();

    let settings = DispatchSettings::from_params(&base).unwrap();
    assert_eq!(settings.device, Device::Cuda);
    let LaunchPlan::Local { slots, .. } = LaunchPlan::from_settings(&settings).unwrap() else {
        panic!("expected a local plan");
    };
    assert_eq!(slots.len(), 2);

    let grid = BTreeMap::from([("n_ae_latents".to_string(), vec![json!(4), json!(8)])]);
    let trials = Sweep::new(base, grid, 3).trials(None);
    assert_eq!(trials.len(), 2);

    let trainer = RecordingTrainer::default();
    let runner = Arc::new(TrialRunner::new(
        Box::new(trainer.clone()),
        Box::new(ImageSource),
    ));
    let launcher = LocalLauncher::new(slots, Arc::new(InProcess { runner })).unwrap();
    let report = launcher.launch(trials).await.unwrap();

    assert_eq!(report.succeeded(), 2);
    let models = trainer.models.lock().unwrap();
    assert_eq!(models.len(), 2);
    let mut groups: Vec<String> = models
        .iter()
        .map(|m| {
            assert_eq!(m.device, Device::Cuda);
            let group = m.data_parallel.as_ref().expect("multi-GPU trial");
            assert_eq!(group.len(), 2);
            group.to_string()
        })
        .collect();
    groups.sort();
    assert_eq!(groups, vec!["0,1", "2,3"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_trial_is_reported_while_others_complete() {
    let dir = TempDir::new().unwrap();
    let mut base = base(dir.path()).as_object().unwrap().clone();
    base.insert("device".into(), json!("cpu"));
    base.insert("n_ae_latents".into(), json!(8));
    base.insert("tt_n_cpu_workers".into(), json!(2));

    let settings = DispatchSettings::from_params(&base).unwrap();
    let plan = LaunchPlan::from_settings(&settings).unwrap();
    let LaunchPlan::Local { slots, .. } = plan else {
        panic!("expected a local plan");
    };

    let grid = BTreeMap::from([(
        "learning_rate".to_string(),
        vec![json!(1e-3), json!("explode"), json!(1e-4)],
    )]);
    let trials = Sweep::new(base, grid, 3).trials(None);

    let trainer = RecordingTrainer::default();
    let runner = Arc::new(TrialRunner::new(
        Box::new(trainer.clone()),
        Box::new(ImageSource),
    ));
    let launcher = LocalLauncher::new(slots, Arc::new(InProcess { runner })).unwrap();
    let report = launcher.launch(trials).await.unwrap();

    assert_eq!(report.succeeded(), 2);
    assert_eq!(report.failed(), 1);
    assert!(matches!(
        &report.records[1].status,
        TrialStatus::Failed { message } if message.contains("loss is NaN")
    ));
    assert_eq!(trainer.models.lock().unwrap().len(), 2);
}
