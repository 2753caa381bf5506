//! CLI subcommand handlers.

use aegrid_core::config::parse_override;
use aegrid_core::dispatch::{
    ClusterLauncher, LaunchPlan, LocalLauncher, ProcessExecutor, TrialRequest,
};
use aegrid_core::identity::expt_dir;
use aegrid_core::training::CommandPlotExporter;
use aegrid_core::{
    CommandTrainer, JobLauncher, ManifestDataSource, SweepConfig, TrialContext, TrialOutcome,
    TrialRunner, load_sweep, resolve,
};
use anyhow::Context;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

use crate::Commands;

/// Handle a CLI subcommand.
pub async fn handle_command(command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Sweep {
            file,
            overrides,
            dry_run,
        } => handle_sweep(&file, &overrides, dry_run).await,
        Commands::Trial {
            config,
            overrides,
            request,
        } => handle_trial(config.as_deref(), &overrides, request.as_deref()).await,
        Commands::Resolve {
            file,
            overrides,
            index,
        } => handle_resolve(&file, &overrides, index),
    }
}

fn load(file: &Path, overrides: &[String]) -> anyhow::Result<SweepConfig> {
    let overrides = overrides
        .iter()
        .map(|raw| parse_override(raw))
        .collect::<Result<Vec<(String, Value)>, _>>()?;
    load_sweep(file, &overrides).map_err(|e| anyhow::anyhow!("Configuration error: {e}"))
}

/// Command line that runs one trial of this sweep in a child process.
fn trial_command(exe: &Path, file: &Path, overrides: &[String]) -> Vec<String> {
    let mut command = vec![
        exe.to_string_lossy().into_owned(),
        "trial".to_string(),
        "--config".to_string(),
        file.to_string_lossy().into_owned(),
    ];
    for raw in overrides {
        command.push("--set".to_string());
        command.push(raw.clone());
    }
    command
}

async fn handle_sweep(file: &Path, overrides: &[String], dry_run: bool) -> anyhow::Result<()> {
    let config = load(file, overrides)?;
    let settings = config.dispatch_settings()?;
    let plan = LaunchPlan::from_settings(&settings)?;
    let sweep = config.sweep();
    let trials = sweep.trials(plan.trial_cap());

    info!(
        sweep_id = %sweep.id,
        experiment = %settings.experiment_name,
        grid_size = sweep.size(),
        trials = trials.len(),
        "Expanded sweep"
    );

    if dry_run {
        println!("Plan: {plan}");
        println!("Trials: {} of {}", trials.len(), sweep.size());
        for trial in &trials {
            println!("  [{}] {}", trial.index, Value::Object(trial.params.clone()));
        }
        return Ok(());
    }

    let file = file
        .canonicalize()
        .with_context(|| format!("Failed to locate {}", file.display()))?;
    let exe = std::env::current_exe().context("Failed to locate the aegrid executable")?;
    let command = trial_command(&exe, &file, overrides);

    let launcher: Box<dyn JobLauncher> = match plan {
        LaunchPlan::Cluster { .. } => {
            Box::new(ClusterLauncher::new(config.cluster_job(&settings, command)))
        }
        LaunchPlan::Local { slots, .. } => {
            let executor = ProcessExecutor::new(exe, command[1..].to_vec());
            Box::new(LocalLauncher::new(slots, Arc::new(executor))?)
        }
    };

    let report = launcher.launch(trials).await?;
    println!(
        "Sweep {}: {} succeeded, {} submitted, {} failed",
        sweep.id,
        report.succeeded(),
        report.submitted(),
        report.failed()
    );
    for record in &report.records {
        println!("  {}", serde_json::to_string(record)?);
    }
    if !report.is_success() {
        anyhow::bail!("{} trial(s) failed", report.failed());
    }
    Ok(())
}

async fn read_request(path: Option<&Path>) -> anyhow::Result<TrialRequest> {
    let body = match path {
        Some(path) => tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?,
        None => {
            let mut buf = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut buf)
                .await
                .context("Failed to read trial request from stdin")?;
            buf
        }
    };
    serde_json::from_slice(&body).context("Invalid trial request")
}

async fn handle_trial(
    config: Option<&Path>,
    overrides: &[String],
    request: Option<&Path>,
) -> anyhow::Result<()> {
    let config = match config {
        Some(file) => load(file, overrides)?,
        None => SweepConfig::default(),
    };
    if !config.trainer.is_set() {
        anyhow::bail!("No trainer configured; set [trainer] program in the sweep file");
    }
    let request = read_request(request).await?;

    let mut runner = TrialRunner::new(
        Box::new(CommandTrainer::new(config.trainer.clone())),
        Box::new(ManifestDataSource),
    );
    if config.plots.is_set() {
        runner = runner.with_plot_exporter(Box::new(CommandPlotExporter::new(config.plots.clone())));
    }
    let ctx = TrialContext::new(request.seed)
        .with_visible_gpus(request.visible_gpus.clone())
        .with_max_start_jitter(config.start_jitter());

    let index = request.index;
    let outcome = tokio::task::spawn_blocking(move || runner.run(&request.params, &ctx))
        .await
        .context("Trial task panicked")??;

    match outcome {
        TrialOutcome::Completed(run) => {
            println!(
                "Trial {index} completed: {}",
                run.version_dir().display()
            );
        }
        TrialOutcome::Skipped { version } => {
            println!("Trial {index} skipped: matches completed version {version}");
        }
    }
    Ok(())
}

fn handle_resolve(file: &Path, overrides: &[String], index: usize) -> anyhow::Result<()> {
    let config = load(file, overrides)?;
    let trial = config
        .sweep()
        .trials(Some(index + 1))
        .pop()
        .filter(|t| t.index == index)
        .with_context(|| format!("Sweep has no trial {index}"))?;

    let params = resolve(&trial.params)?;
    let dir: PathBuf = expt_dir(&params);
    println!("{}", serde_json::to_string_pretty(&params)?);
    println!("Experiment directory: {}", dir.display());
    Ok(())
}
