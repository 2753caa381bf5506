//! Model selection: picks the autoencoder variant and fit method for a trial.
//!
//! Architectures live in the training backend. What is decided here is which
//! variant to build, which configuration it needs (conditioned variants size
//! their label input from a real training batch), where it runs, and whether
//! it starts from pretrained weights.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tracing::{debug, info};

use crate::data::{DataGenerator, Split};
use crate::dispatch::GpuGroup;
use crate::error::ModelError;
use crate::identity::RunIdentity;
use crate::params::{Device, ModelClass, ModelFamily, TrialParams};

/// Training-loop variant the backend runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FitMethod {
    #[serde(rename = "ae")]
    Ae,
    #[serde(rename = "ae-msp")]
    AeMsp,
}

impl FitMethod {
    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Ae => "ae",
            Self::AeMsp => "ae-msp",
        }
    }
}

impl fmt::Display for FitMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Architecture-independent description shared by all variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backbone {
    pub model_type: ModelFamily,
    pub n_ae_latents: u64,
    pub n_datasets: usize,
}

/// The three supported autoencoder variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "variant", rename_all = "snake_case")]
pub enum ModelVariant {
    /// Plain autoencoder; `variational` for the `vae` class.
    Autoencoder { backbone: Backbone, variational: bool },
    /// Label-conditioned autoencoder.
    Conditional { backbone: Backbone, n_labels: usize },
    /// Label-conditioned autoencoder with the auxiliary structure penalty.
    ConditionalMsp { backbone: Backbone, n_labels: usize },
}

impl ModelVariant {
    pub fn backbone(&self) -> &Backbone {
        match self {
            Self::Autoencoder { backbone, .. }
            | Self::Conditional { backbone, .. }
            | Self::ConditionalMsp { backbone, .. } => backbone,
        }
    }

    pub fn n_labels(&self) -> Option<usize> {
        match self {
            Self::Autoencoder { .. } => None,
            Self::Conditional { n_labels, .. } | Self::ConditionalMsp { n_labels, .. } => {
                Some(*n_labels)
            }
        }
    }

    pub fn fit_method(&self) -> FitMethod {
        match self {
            Self::Autoencoder { .. } | Self::Conditional { .. } => FitMethod::Ae,
            Self::ConditionalMsp { .. } => FitMethod::AeMsp,
        }
    }
}

/// A constructed model, placed and tagged, ready to hand to a trainer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Model {
    pub variant: ModelVariant,
    pub device: Device,
    /// Devices to replicate across when one trial spans several GPUs.
    pub data_parallel: Option<GpuGroup>,
    pub pretrained: Option<PathBuf>,
    pub version: u32,
}

impl fmt::Display for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backbone = self.variant.backbone();
        let name = match &self.variant {
            ModelVariant::Autoencoder {
                variational: true, ..
            } => "VAE",
            ModelVariant::Autoencoder { .. } => "AE",
            ModelVariant::Conditional { .. } => "ConditionalAE",
            ModelVariant::ConditionalMsp { .. } => "AEMSP",
        };
        write!(
            f,
            "{name}({}, latents={}, datasets={}",
            backbone.model_type, backbone.n_ae_latents, backbone.n_datasets
        )?;
        if let Some(n_labels) = self.variant.n_labels() {
            write!(f, ", labels={n_labels}")?;
        }
        write!(f, ") on {} v{}", self.device, self.version)?;
        if let Some(group) = &self.data_parallel {
            write!(f, " data-parallel[{group}]")?;
        }
        Ok(())
    }
}

/// Builds models from resolved parameters.
pub struct ModelFactory;

impl ModelFactory {
    /// Select the variant and its fit method.
    ///
    /// Conditioned variants draw one training batch and take the label count
    /// from the third dimension of its labels tensor, recording it in
    /// `params.n_labels`.
    pub fn select(
        params: &mut TrialParams,
        data: &mut dyn DataGenerator,
    ) -> Result<(ModelVariant, FitMethod), ModelError> {
        let backbone = Backbone {
            model_type: params.model_type,
            n_ae_latents: params.n_ae_latents,
            n_datasets: params.n_datasets.unwrap_or_else(|| data.n_datasets()),
        };

        let variant = match params.model_class {
            ModelClass::Ae | ModelClass::Vae => ModelVariant::Autoencoder {
                backbone,
                variational: params.model_class == ModelClass::Vae,
            },
            ModelClass::CondAe => {
                let n_labels = peek_n_labels(params, data)?;
                ModelVariant::Conditional { backbone, n_labels }
            }
            ModelClass::CondAeMsp => {
                let n_labels = peek_n_labels(params, data)?;
                ModelVariant::ConditionalMsp { backbone, n_labels }
            }
        };
        let fit_method = variant.fit_method();
        debug!(model_class = %params.model_class, %fit_method, "Selected model variant");
        Ok((variant, fit_method))
    }

    /// The configured `ae_model_path`, which must exist when set.
    pub fn pretrained_weights(params: &TrialParams) -> Result<Option<PathBuf>, ModelError> {
        match &params.ae_model_path {
            Some(path) if !path.exists() => {
                Err(ModelError::PretrainedNotFound { path: path.clone() })
            }
            other => Ok(other.clone()),
        }
    }

    /// Select, place on the configured device, attach pretrained weights,
    /// wrap for data parallelism, and tag with the run version.
    ///
    /// `visible_gpus` is the trial's GPU group when it was launched on one.
    pub fn build(
        params: &mut TrialParams,
        data: &mut dyn DataGenerator,
        run: &RunIdentity,
        visible_gpus: Option<&GpuGroup>,
    ) -> Result<(Model, FitMethod), ModelError> {
        let (variant, fit_method) = Self::select(params, data)?;

        let pretrained = Self::pretrained_weights(params)?;
        if let Some(path) = &pretrained {
            info!(path = %path.display(), "Loading pretrained weights");
        }

        let data_parallel = (params.n_parallel_gpus > 1).then(|| match visible_gpus {
            Some(group) => group.clone(),
            None => GpuGroup::sequential(params.n_parallel_gpus),
        });

        let model = Model {
            variant,
            device: params.device,
            data_parallel,
            pretrained,
            version: run.version,
        };
        Ok((model, fit_method))
    }
}

fn peek_n_labels(
    params: &mut TrialParams,
    data: &mut dyn DataGenerator,
) -> Result<usize, ModelError> {
    let batch = data.next_batch(Split::Train)?;
    let shape = batch
        .labels_shape()
        .ok_or_else(|| ModelError::MissingLabels {
            model_class: params.model_class.to_string(),
        })?;
    // [batch, n_t, n_labels]
    let n_labels = match shape {
        [_, _, n_labels] => *n_labels,
        other => {
            return Err(ModelError::LabelsRank {
                shape: other.to_vec(),
            });
        }
    };
    params.n_labels = Some(n_labels);
    Ok(n_labels)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Batch;
    use crate::params::resolve;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FixedBatches {
        labels: Option<Vec<usize>>,
        draws: usize,
    }

    impl DataGenerator for FixedBatches {
        fn n_datasets(&self) -> usize {
            2
        }

        fn next_batch(&mut self, _split: Split) -> Result<Batch, ModelError> {
            self.draws += 1;
            let mut signals = BTreeMap::from([("images".to_string(), vec![1, 100, 1, 64, 64])]);
            if let Some(labels) = &self.labels {
                signals.insert("labels".to_string(), labels.clone());
            }
            Ok(Batch {
                dataset: 0,
                signals,
            })
        }
    }

    fn params(model_class: &str) -> TrialParams {
        resolve(&json!({
            "model_type": "conv", "model_class": model_class, "device": "cuda",
            "n_ae_latents": 8, "architecture_params": { "max_latents": 16 }
        }))
        .unwrap()
    }

    fn identity() -> RunIdentity {
        RunIdentity {
            experiment_name: "test".into(),
            expt_dir: PathBuf::from("/tmp/none"),
            sessions: Vec::new(),
            version: 7,
        }
    }

    #[test]
    fn test_plain_autoencoder_does_not_peek() {
        let mut params = params("ae");
        let mut data = FixedBatches { labels: None, draws: 0 };
        let (variant, fit) = ModelFactory::select(&mut params, &mut data).unwrap();
        assert_eq!(fit, FitMethod::Ae);
        assert!(matches!(variant, ModelVariant::Autoencoder { variational: false, .. }));
        assert_eq!(data.draws, 0);
        assert_eq!(params.n_labels, None);
    }

    #[test]
    fn test_vae_uses_ae_fit_method() {
        let mut params = params("vae");
        let mut data = FixedBatches { labels: None, draws: 0 };
        let (variant, fit) = ModelFactory::select(&mut params, &mut data).unwrap();
        assert_eq!(fit, FitMethod::Ae);
        assert!(matches!(variant, ModelVariant::Autoencoder { variational: true, .. }));
    }

    #[test]
    fn test_conditional_reads_third_label_dimension() {
        for (class, fit) in [("cond-ae", FitMethod::Ae), ("cond-ae-msp", FitMethod::AeMsp)] {
            let mut params = params(class);
            let mut data = FixedBatches {
                labels: Some(vec![1, 100, 6]),
                draws: 0,
            };
            let (variant, got_fit) = ModelFactory::select(&mut params, &mut data).unwrap();
            assert_eq!(got_fit, fit);
            assert_eq!(variant.n_labels(), Some(6));
            assert_eq!(params.n_labels, Some(6));
            assert_eq!(data.draws, 1);
        }
    }

    #[test]
    fn test_conditional_without_labels_fails() {
        let mut params = params("cond-ae");
        let mut data = FixedBatches { labels: None, draws: 0 };
        let err = ModelFactory::select(&mut params, &mut data).unwrap_err();
        assert!(matches!(err, ModelError::MissingLabels { .. }));
    }

    #[test]
    fn test_conditional_with_wrong_rank_fails() {
        let mut params = params("cond-ae");
        let mut data = FixedBatches {
            labels: Some(vec![100, 6]),
            draws: 0,
        };
        let err = ModelFactory::select(&mut params, &mut data).unwrap_err();
        assert!(matches!(err, ModelError::LabelsRank { shape } if shape == vec![100, 6]));
    }

    #[test]
    fn test_build_tags_version_and_wraps_parallel() {
        let mut params = params("ae");
        params.n_parallel_gpus = 2;
        let group = GpuGroup::new(vec!["2".into(), "3".into()]);
        let mut data = FixedBatches { labels: None, draws: 0 };
        let (model, _) =
            ModelFactory::build(&mut params, &mut data, &identity(), Some(&group)).unwrap();
        assert_eq!(model.version, 7);
        assert_eq!(model.device, Device::Cuda);
        assert_eq!(model.data_parallel, Some(group));
        assert_eq!(model.variant.backbone().n_datasets, 2);
    }

    #[test]
    fn test_single_gpu_is_not_wrapped() {
        let mut params = params("ae");
        let mut data = FixedBatches { labels: None, draws: 0 };
        let (model, _) = ModelFactory::build(&mut params, &mut data, &identity(), None).unwrap();
        assert_eq!(model.data_parallel, None);
        assert!(model.to_string().starts_with("AE(conv, latents=8"));
    }

    #[test]
    fn test_missing_pretrained_weights_fail() {
        let mut params = params("ae");
        params.ae_model_path = Some(PathBuf::from("/nonexistent/best_val_model.pt"));
        let mut data = FixedBatches { labels: None, draws: 0 };
        let err = ModelFactory::build(&mut params, &mut data, &identity(), None).unwrap_err();
        assert!(matches!(err, ModelError::PretrainedNotFound { .. }));
    }
}
