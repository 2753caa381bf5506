//! Sweep configuration.
//!
//! A sweep file is TOML:
//!
//! ```toml
//! start_jitter_ms = 1000
//!
//! [params]            # base values shared by every trial
//! model_type = "conv"
//! device = "gpu"
//! gpus_viz = "0;1;2;3"
//!
//! [params.architecture_params]
//! max_latents = 64
//!
//! [grid]              # candidate lists, crossed into trials
//! n_ae_latents = [8, 16]
//!
//! [trainer]
//! program = "python"
//! args = ["train_ae.py"]
//!
//! [cluster]           # only read when params.slurm = true
//! job_time = "12:00:00"
//! ```
//!
//! Layers, lowest precedence first: built-in defaults, the user config
//! (`~/.config/aegrid/config.toml` or the platform equivalent), the sweep
//! file, `AEGRID_` environment variables with `__` as the nesting separator
//! (`AEGRID_PARAMS__DEVICE=cpu`), and command-line overrides.

use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::dispatch::{ClusterConfig, ClusterJobDescriptor, DispatchSettings, Sweep};
use crate::error::ConfigError;
use crate::params::HParams;
use crate::training::CommandSpec;

/// Everything a sweep needs, after all layers are merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SweepConfig {
    pub params: HParams,
    pub grid: BTreeMap<String, Vec<Value>>,
    pub cluster: ClusterConfig,
    pub trainer: CommandSpec,
    pub plots: CommandSpec,
    /// Upper bound of each trial's pre-claim delay.
    pub start_jitter_ms: u64,
    /// Root of the per-trial seeds.
    pub seed: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            params: HParams::new(),
            grid: BTreeMap::new(),
            cluster: ClusterConfig::default(),
            trainer: CommandSpec::default(),
            plots: CommandSpec::default(),
            start_jitter_ms: 1000,
            seed: 0,
        }
    }
}

impl SweepConfig {
    pub fn start_jitter(&self) -> Duration {
        Duration::from_millis(self.start_jitter_ms)
    }

    pub fn sweep(&self) -> Sweep {
        Sweep::new(self.params.clone(), self.grid.clone(), self.seed)
    }

    pub fn dispatch_settings(&self) -> Result<DispatchSettings, ConfigError> {
        DispatchSettings::from_params(&self.params)
    }

    /// Job descriptor for cluster mode; `trial_command` runs one trial.
    pub fn cluster_job(
        &self,
        settings: &DispatchSettings,
        trial_command: Vec<String>,
    ) -> ClusterJobDescriptor {
        ClusterJobDescriptor {
            experiment_name: settings.experiment_name.clone(),
            gpu: settings.device.is_gpu(),
            config: self.cluster.clone(),
            trial_command,
        }
    }
}

/// User-level config file, if the platform has a config directory.
pub fn user_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("dev", "aegrid", "aegrid")
        .map(|dirs| dirs.config_dir().join("config.toml"))
}

/// Load a sweep file through every configuration layer.
///
/// `overrides` are dotted paths with values, applied last.
pub fn load_sweep(path: &Path, overrides: &[(String, Value)]) -> Result<SweepConfig, ConfigError> {
    let mut figment = Figment::from(Serialized::defaults(SweepConfig::default()));

    if let Some(user_config) = user_config_path() {
        if user_config.exists() {
            debug!(path = %user_config.display(), "Merging user config");
            figment = figment.merge(Toml::file(&user_config));
        }
    }

    if !path.is_file() {
        return Err(ConfigError::SweepNotFound {
            path: path.to_path_buf(),
        });
    }
    figment = figment.merge(Toml::file_exact(path));
    figment = figment.merge(Env::prefixed("AEGRID_").split("__"));

    for (key, value) in overrides {
        figment = figment.merge(Serialized::default(key, value));
    }

    figment.extract().map_err(|e| ConfigError::Load(Box::new(e)))
}

/// Parse a `key=value` override.
///
/// The value is read as TOML (`8`, `true`, `[1, 2]`, `"x"`) and falls back
/// to a plain string. Keys without a dot address `params`.
pub fn parse_override(raw: &str) -> Result<(String, Value), ConfigError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidValue {
            key: raw.to_string(),
            reason: "expected key=value".into(),
        })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::InvalidValue {
            key: raw.to_string(),
            reason: "empty key".into(),
        });
    }
    let key = if key.contains('.') {
        key.to_string()
    } else {
        format!("params.{key}")
    };

    let value = value.trim();
    let parsed = toml::from_str::<toml::Table>(&format!("v = {value}"))
        .ok()
        .and_then(|mut table| table.remove("v"))
        .and_then(|v| serde_json::to_value(v).ok())
        .unwrap_or_else(|| Value::String(value.to_string()));
    Ok((key, parsed))
}
