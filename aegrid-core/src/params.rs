//! Parameter resolution: raw hyperparameters to a validated [`TrialParams`].
//!
//! Input arrives as a flat key-value mapping (or any serializable record that
//! flattens to one). Convolutional models carry a nested `architecture_params`
//! object that is merged underneath the outer values before validation; the
//! outer values win on conflict.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use tracing::debug;

use crate::data::SessionId;
use crate::error::ConfigError;

/// Flat hyperparameter mapping, in insertion order.
pub type HParams = Map<String, Value>;

/// Key of the nested architecture sub-configuration.
pub const ARCHITECTURE_KEY: &str = "architecture_params";

pub const DEFAULT_EXPERIMENT_NAME: &str = "grid_search";
const DEFAULT_SAVE_DIR: &str = "results";

/// Keys lifted into typed [`TrialParams`] fields; everything else stays in `extra`.
const TYPED_KEYS: &[&str] = &[
    "experiment_name",
    "model_type",
    "model_class",
    "device",
    "n_ae_latents",
    "max_latents",
    "n_parallel_gpus",
    "rng_seed_model",
    "training_completed",
    "export_train_plots",
    "save_dir",
    "data_dir",
    "ae_model_path",
    "version",
    "n_datasets",
    "n_labels",
    "model_build_rng_seed",
    "training_rng_seed",
];

/// Model family tag (`model_type`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFamily {
    Conv,
    Linear,
}

impl ModelFamily {
    pub fn from_tag(tag: &str) -> Result<Self, ConfigError> {
        match tag {
            "conv" => Ok(Self::Conv),
            "linear" => Ok(Self::Linear),
            other => Err(ConfigError::UnknownModelType {
                tag: other.to_string(),
            }),
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Conv => "conv",
            Self::Linear => "linear",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Model class tag (`model_class`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelClass {
    #[serde(rename = "ae")]
    Ae,
    #[serde(rename = "vae")]
    Vae,
    #[serde(rename = "cond-ae")]
    CondAe,
    #[serde(rename = "cond-ae-msp")]
    CondAeMsp,
}

impl ModelClass {
    /// Parse a model class tag. This is the only place unknown tags are rejected.
    pub fn from_tag(tag: &str) -> Result<Self, ConfigError> {
        match tag {
            "ae" => Ok(Self::Ae),
            "vae" => Ok(Self::Vae),
            "cond-ae" => Ok(Self::CondAe),
            "cond-ae-msp" => Ok(Self::CondAeMsp),
            other => Err(ConfigError::ModelClassNotImplemented {
                tag: other.to_string(),
            }),
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Ae => "ae",
            Self::Vae => "vae",
            Self::CondAe => "cond-ae",
            Self::CondAeMsp => "cond-ae-msp",
        }
    }

    /// Whether the model conditions on labels (and so needs a batch peek).
    pub fn is_conditional(&self) -> bool {
        matches!(self, Self::CondAe | Self::CondAeMsp)
    }
}

impl fmt::Display for ModelClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// Compute device. `gpu` is accepted as an alias and normalized to `cuda`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Device {
    Cpu,
    #[serde(alias = "gpu")]
    Cuda,
}

impl Device {
    pub fn from_tag(tag: &str) -> Result<Self, ConfigError> {
        match tag {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(ConfigError::UnknownDevice {
                tag: other.to_string(),
            }),
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::Cuda => "cuda",
        }
    }

    pub fn is_gpu(&self) -> bool {
        matches!(self, Self::Cuda)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_tag())
    }
}

/// A resolved, validated trial configuration.
///
/// Mutated in place as the run progresses (version, seeds, derived counts,
/// completion flag) and serialized back to a flat mapping for snapshots.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialParams {
    pub experiment_name: String,
    pub model_type: ModelFamily,
    pub model_class: ModelClass,
    pub device: Device,
    pub n_ae_latents: u64,
    pub max_latents: Option<u64>,
    pub n_parallel_gpus: usize,
    pub rng_seed_model: u64,
    pub training_completed: bool,
    pub export_train_plots: bool,
    pub save_dir: PathBuf,
    pub data_dir: Option<PathBuf>,
    /// Pretrained weights to load after construction.
    pub ae_model_path: Option<PathBuf>,
    pub version: Option<u32>,
    pub n_datasets: Option<usize>,
    pub n_labels: Option<usize>,
    pub model_build_rng_seed: Option<u64>,
    pub training_rng_seed: Option<u64>,
    /// Sessions parsed from `lab`/`expt`/`animal`/`session` or `sessions`.
    /// The raw keys stay in `extra`.
    pub sessions: Vec<SessionId>,
    /// Every key without a typed field, including `architecture_params`.
    pub extra: HParams,
}

impl TrialParams {
    /// Flatten back to a key-value mapping: typed fields first, then `extra`.
    pub fn to_hparams(&self) -> HParams {
        let mut map = HParams::new();
        map.insert("experiment_name".into(), self.experiment_name.clone().into());
        map.insert("model_type".into(), self.model_type.as_tag().into());
        map.insert("model_class".into(), self.model_class.as_tag().into());
        map.insert("device".into(), self.device.as_tag().into());
        map.insert("n_ae_latents".into(), self.n_ae_latents.into());
        if let Some(max) = self.max_latents {
            map.insert("max_latents".into(), max.into());
        }
        map.insert("n_parallel_gpus".into(), self.n_parallel_gpus.into());
        map.insert("rng_seed_model".into(), self.rng_seed_model.into());
        map.insert("training_completed".into(), self.training_completed.into());
        map.insert("export_train_plots".into(), self.export_train_plots.into());
        map.insert(
            "save_dir".into(),
            self.save_dir.to_string_lossy().into_owned().into(),
        );
        if let Some(dir) = &self.data_dir {
            map.insert("data_dir".into(), dir.to_string_lossy().into_owned().into());
        }
        if let Some(path) = &self.ae_model_path {
            map.insert(
                "ae_model_path".into(),
                path.to_string_lossy().into_owned().into(),
            );
        }
        if let Some(version) = self.version {
            map.insert("version".into(), version.into());
        }
        if let Some(n) = self.n_datasets {
            map.insert("n_datasets".into(), n.into());
        }
        if let Some(n) = self.n_labels {
            map.insert("n_labels".into(), n.into());
        }
        if let Some(seed) = self.model_build_rng_seed {
            map.insert("model_build_rng_seed".into(), seed.into());
        }
        if let Some(seed) = self.training_rng_seed {
            map.insert("training_rng_seed".into(), seed.into());
        }
        for (key, value) in &self.extra {
            map.entry(key.clone()).or_insert_with(|| value.clone());
        }
        map
    }
}

impl Serialize for TrialParams {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_hparams().serialize(serializer)
    }
}

/// Normalize a mapping or structured record into a flat [`HParams`].
pub fn normalize<T: Serialize + ?Sized>(raw: &T) -> Result<HParams, ConfigError> {
    match serde_json::to_value(raw) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(other) => Err(ConfigError::NotAMapping {
            found: value_kind(&other).to_string(),
        }),
        Err(e) => Err(ConfigError::NotAMapping {
            found: e.to_string(),
        }),
    }
}

/// Blend `architecture_params` underneath the outer values.
///
/// The architecture dict is the base; any key also present in the outer map
/// keeps the outer value.
pub fn merge_architecture(outer: HParams) -> Result<HParams, ConfigError> {
    let mut merged = match outer.get(ARCHITECTURE_KEY) {
        Some(Value::Object(arch)) => arch.clone(),
        Some(other) => {
            return Err(ConfigError::InvalidValue {
                key: ARCHITECTURE_KEY.into(),
                reason: format!("expected a mapping, got {}", value_kind(other)),
            });
        }
        None => {
            return Err(ConfigError::MissingKey {
                key: ARCHITECTURE_KEY.into(),
            });
        }
    };
    for (key, value) in outer {
        merged.insert(key, value);
    }
    Ok(merged)
}

/// Conv architectures cannot encode more latents than they were built for.
pub fn check_latents(n_ae_latents: u64, max_latents: u64) -> Result<(), ConfigError> {
    if n_ae_latents > max_latents {
        return Err(ConfigError::LatentsExceedMax {
            n_ae_latents,
            max_latents,
        });
    }
    Ok(())
}

/// Resolve raw hyperparameters into a validated [`TrialParams`].
///
/// Runs the architecture merge first, since `max_latents` normally comes from
/// the architecture sub-configuration, then validates and types the result.
pub fn resolve<T: Serialize + ?Sized>(raw: &T) -> Result<TrialParams, ConfigError> {
    let mut hparams = normalize(raw)?;
    let dump = Value::Object(hparams.clone());
    debug!(hparams = %dump, "Resolving hyperparameters");

    let model_type = ModelFamily::from_tag(require(get_str(&hparams, "model_type")?, "model_type")?)?;
    if model_type == ModelFamily::Conv {
        hparams = merge_architecture(hparams)?;
    }

    let n_ae_latents = require(get_u64(&hparams, "n_ae_latents")?, "n_ae_latents")?;
    let max_latents = get_u64(&hparams, "max_latents")?;
    if model_type == ModelFamily::Conv {
        check_latents(n_ae_latents, require(max_latents, "max_latents")?)?;
    }

    let model_class =
        ModelClass::from_tag(require(get_str(&hparams, "model_class")?, "model_class")?)?;
    let device = Device::from_tag(require(get_str(&hparams, "device")?, "device")?)?;

    let n_parallel_gpus = get_u64(&hparams, "n_parallel_gpus")?.unwrap_or(1);
    if n_parallel_gpus == 0 {
        return Err(ConfigError::InvalidValue {
            key: "n_parallel_gpus".into(),
            reason: "must be at least 1".into(),
        });
    }

    let version = get_u64(&hparams, "version")?
        .map(|v| {
            u32::try_from(v).map_err(|_| ConfigError::InvalidValue {
                key: "version".into(),
                reason: format!("{v} does not fit a version number"),
            })
        })
        .transpose()?;

    let sessions = SessionId::from_hparams(&hparams)?;

    let params = TrialParams {
        experiment_name: get_str(&hparams, "experiment_name")?
            .unwrap_or(DEFAULT_EXPERIMENT_NAME)
            .to_string(),
        model_type,
        model_class,
        device,
        n_ae_latents,
        max_latents,
        n_parallel_gpus: n_parallel_gpus as usize,
        rng_seed_model: get_u64(&hparams, "rng_seed_model")?.unwrap_or(0),
        training_completed: get_bool(&hparams, "training_completed")?.unwrap_or(false),
        export_train_plots: get_bool(&hparams, "export_train_plots")?.unwrap_or(false),
        save_dir: get_path(&hparams, "save_dir")?.unwrap_or_else(|| DEFAULT_SAVE_DIR.into()),
        data_dir: get_path(&hparams, "data_dir")?,
        ae_model_path: get_path(&hparams, "ae_model_path")?,
        version,
        n_datasets: get_u64(&hparams, "n_datasets")?.map(|n| n as usize),
        n_labels: get_u64(&hparams, "n_labels")?.map(|n| n as usize),
        model_build_rng_seed: get_u64(&hparams, "model_build_rng_seed")?,
        training_rng_seed: get_u64(&hparams, "training_rng_seed")?,
        sessions,
        extra: HParams::new(),
    };

    let mut extra = hparams;
    for key in TYPED_KEYS {
        extra.remove(*key);
    }
    Ok(TrialParams { extra, ..params })
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "a list",
        Value::Object(_) => "a mapping",
    }
}

fn invalid(key: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        reason: reason.into(),
    }
}

pub(crate) fn require<T>(value: Option<T>, key: &str) -> Result<T, ConfigError> {
    value.ok_or_else(|| ConfigError::MissingKey {
        key: key.to_string(),
    })
}

pub(crate) fn get_str<'a>(map: &'a HParams, key: &str) -> Result<Option<&'a str>, ConfigError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.as_str())),
        Some(other) => Err(invalid(
            key,
            format!("expected a string, got {}", value_kind(other)),
        )),
    }
}

pub(crate) fn get_u64(map: &HParams, key: &str) -> Result<Option<u64>, ConfigError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => {
            if let Some(v) = n.as_u64() {
                return Ok(Some(v));
            }
            // TOML and JSON sources sometimes hand integers over as floats.
            match n.as_f64() {
                Some(f) if f >= 0.0 && f.fract() == 0.0 && f < u64::MAX as f64 => {
                    Ok(Some(f as u64))
                }
                _ => Err(invalid(key, format!("expected a non-negative integer, got {n}"))),
            }
        }
        Some(Value::String(s)) => s
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| invalid(key, format!("expected a non-negative integer, got \"{s}\""))),
        Some(other) => Err(invalid(
            key,
            format!("expected a non-negative integer, got {}", value_kind(other)),
        )),
    }
}

/// Flags accept booleans or the 0/1 integers hyperparameter files often use.
pub(crate) fn get_bool(map: &HParams, key: &str) -> Result<Option<bool>, ConfigError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(0) => Ok(Some(false)),
            Some(1) => Ok(Some(true)),
            _ => Err(invalid(key, format!("expected a boolean or 0/1, got {n}"))),
        },
        Some(Value::String(s)) => match s.trim() {
            "true" | "1" => Ok(Some(true)),
            "false" | "0" => Ok(Some(false)),
            _ => Err(invalid(key, format!("expected a boolean, got \"{s}\""))),
        },
        Some(other) => Err(invalid(
            key,
            format!("expected a boolean, got {}", value_kind(other)),
        )),
    }
}

fn get_path(map: &HParams, key: &str) -> Result<Option<PathBuf>, ConfigError> {
    Ok(get_str(map, key)?
        .filter(|s| !s.trim().is_empty())
        .map(PathBuf::from))
}
