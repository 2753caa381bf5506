//! aegrid CLI: expand a sweep file into trials and launch them.
//!
//! `aegrid sweep` is the dispatcher. Local launches re-invoke this binary as
//! `aegrid trial` once per trial, feeding the trial request on stdin.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// aegrid: grid-search dispatcher for autoencoder training
#[derive(Parser, Debug)]
#[command(name = "aegrid", version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Expand a sweep file and launch its trials
    Sweep {
        /// Sweep file (TOML)
        file: PathBuf,

        /// Override a value, e.g. `--set n_ae_latents=8` or `--set cluster.job_time="2:00:00"`
        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Print the launch plan and trials without launching
        #[arg(long)]
        dry_run: bool,
    },
    /// Run a single trial (request JSON on stdin unless --request is given)
    Trial {
        /// Sweep file supplying trainer, plot, and jitter settings
        #[arg(short, long)]
        config: Option<PathBuf>,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Read the trial request from this file instead of stdin
        #[arg(long)]
        request: Option<PathBuf>,
    },
    /// Print the resolved parameters of one trial
    Resolve {
        file: PathBuf,

        #[arg(long = "set", value_name = "KEY=VALUE")]
        overrides: Vec<String>,

        /// Trial index within the expanded grid
        #[arg(long, default_value_t = 0)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr)
        .with_filter(EnvFilter::new(filter));

    // JSON file layer for structured logging
    let log_dir = directories::ProjectDirs::from("dev", "aegrid", "aegrid")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "aegrid.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    commands::handle_command(cli.command).await
}
