mod config;
mod pipeline;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline::{EvalArgs, TrainArgs};

/// clf-train: learn control-Lyapunov functions and controllers through a
/// differentiable CLF-QP.
#[derive(Parser)]
#[command(name = "clf-train", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// CLI subcommands for training and evaluation.
#[derive(Subcommand)]
enum Command {
    /// Train a CLF-QP network from a run config.
    Train {
        /// Path to the run config TOML file.
        #[arg(long, default_value = "configs/quad9d.toml")]
        config: PathBuf,
        /// Checkpoint directory to continue training from.
        #[arg(long)]
        resume_from: Option<PathBuf>,
        /// Override the number of epochs.
        #[arg(long)]
        epochs: Option<usize>,
        /// Override the checkpoint directory.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Override the data and shuffling seeds.
        #[arg(long)]
        seed: Option<u64>,
    },
    /// Evaluate a checkpoint on the config's test set.
    Eval {
        /// Path to the run config TOML file.
        #[arg(long, default_value = "configs/quad9d.toml")]
        config: PathBuf,
        /// Checkpoint directory (containing model.mpk and meta.json).
        #[arg(long)]
        checkpoint: PathBuf,
        /// Path to write the JSON report. Printed to stdout when omitted.
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Train {
            config,
            resume_from,
            epochs,
            output_dir,
            seed,
        } => pipeline::run_train(TrainArgs {
            config,
            resume_from,
            epochs,
            output_dir,
            seed,
        }),
        Command::Eval {
            config,
            checkpoint,
            output,
        } => pipeline::run_eval(EvalArgs {
            config,
            checkpoint,
            output,
        }),
    }
}
