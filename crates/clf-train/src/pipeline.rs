//! Train and eval pipelines: build the dynamics, network, dataset and QP
//! from a run config, then hand off to the `clf` trainer.

use std::path::{Path, PathBuf};
use std::time::Instant;

use burn::backend::ndarray::NdArray;
use burn::backend::Autodiff;
use burn::prelude::*;
use serde::Serialize;

use clf::model::filter::{ClfQpNet, ClfQpNetConfig};
use clf::model::network::{ClfNetwork, ClfNetworkConfig};
use clf::training::checkpoint::load_checkpoint;
use clf::training::data::ClfDataset;
use clf::training::metrics::{ControllerDiagnostics, LyapunovDiagnostics};
use clf::training::trainer::{evaluate, train};
use dynamics::{ControlAffine, Pvtol, Quad9d};

use crate::config::{load_run_toml, ModelSection, RunToml};

type TrainBackend = Autodiff<NdArray<f64>>;
type EvalBackend = NdArray<f64>;

/// Arguments for the `train` subcommand.
#[derive(Debug)]
pub struct TrainArgs {
    /// Path to the run config TOML file.
    pub config: PathBuf,
    /// Checkpoint directory to continue from.
    pub resume_from: Option<PathBuf>,
    /// Optional CLI override for the number of epochs.
    pub epochs: Option<usize>,
    /// Optional CLI override for the checkpoint directory.
    pub output_dir: Option<PathBuf>,
    /// Optional CLI override for the data and shuffling seeds.
    pub seed: Option<u64>,
}

/// Arguments for the `eval` subcommand.
#[derive(Debug)]
pub struct EvalArgs {
    /// Path to the run config TOML file.
    pub config: PathBuf,
    /// Checkpoint directory to evaluate.
    pub checkpoint: PathBuf,
    /// Where to write the JSON report.
    pub output: Option<PathBuf>,
}

/// Result of `clf-train eval`.
#[derive(Debug, Serialize)]
pub struct EvalReport {
    pub model: String,
    pub checkpoint: PathBuf,
    pub epoch: usize,
    pub n_test: usize,
    pub test_loss: f64,
    pub lyapunov: LyapunovDiagnostics,
    pub controller: ControllerDiagnostics,
}

/// Train a CLF-QP network as described by the run config.
pub fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let mut run = load_run_toml(&args.config)?;
    if let Some(seed) = args.seed {
        run.data.seed = seed;
        run.training.seed = seed;
    }
    if let Some(epochs) = args.epochs {
        run.training.epochs = epochs;
    }
    if let Some(dir) = &args.output_dir {
        run.training.checkpoint_dir = dir.clone();
    }

    match run.model.clone() {
        ModelSection::Pvtol { scenarios, nominal } => {
            train_model(Pvtol, scenarios, nominal, &run, args.resume_from.as_deref())
        }
        ModelSection::Quad9d { scenarios, nominal } => {
            train_model(Quad9d, scenarios, nominal, &run, args.resume_from.as_deref())
        }
    }
}

/// Evaluate a checkpoint on the run config's test set.
pub fn run_eval(args: EvalArgs) -> anyhow::Result<()> {
    let run = load_run_toml(&args.config)?;
    let report = match run.model.clone() {
        ModelSection::Pvtol { scenarios, nominal } => {
            eval_model(Pvtol, scenarios, nominal, &run, &args.checkpoint)?
        }
        ModelSection::Quad9d { scenarios, nominal } => {
            eval_model(Quad9d, scenarios, nominal, &run, &args.checkpoint)?
        }
    };

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", path.display()))?;
            tracing::info!(path = %path.display(), "Wrote evaluation report");
        }
        None => println!("{json}"),
    }
    Ok(())
}

/// Join a network to `dynamics` using the `[clf]` section.
fn build_net<B: Backend, D: ControlAffine>(
    dynamics: D,
    scenarios: Vec<D::Scenario>,
    nominal: D::Scenario,
    run: &RunToml,
    relaxation_penalty: f64,
    network: ClfNetwork<B>,
) -> anyhow::Result<ClfQpNet<B, D>> {
    let mut config = ClfQpNetConfig::from_dynamics(
        dynamics,
        scenarios,
        nominal,
        run.clf.lambda,
        relaxation_penalty,
    )?;
    if !run.clf.control_bounds {
        config.control_bounds = None;
    }
    config.qp_settings = run.clf.qp.clone();
    Ok(ClfQpNet::new(network, config)?)
}

fn train_model<D: ControlAffine>(
    dynamics: D,
    scenarios: Vec<D::Scenario>,
    nominal: D::Scenario,
    run: &RunToml,
    resume_from: Option<&Path>,
) -> anyhow::Result<()> {
    let start = Instant::now();
    let device = Default::default();
    let mut training = run.training_config();

    // 1. Network: fresh, or restored from a checkpoint
    let network = match resume_from {
        Some(dir) => {
            let (network, meta) = load_checkpoint::<TrainBackend>(dir, &device)?;
            if meta.model != dynamics.name() {
                anyhow::bail!(
                    "Checkpoint {} was trained on {}, config is for {}",
                    dir.display(),
                    meta.model,
                    dynamics.name()
                );
            }
            training.start_epoch = meta.epoch + 1;
            training.best_test_loss = Some(meta.test_loss);
            tracing::info!(
                epoch = meta.epoch,
                test_loss = meta.test_loss,
                "Resuming from checkpoint"
            );
            network
        }
        None => ClfNetworkConfig::new(dynamics.n_dims(), dynamics.n_controls())
            .with_n_hidden(run.network.n_hidden)
            .init::<TrainBackend>(&device),
    };

    // 2. QP filter
    let penalty = training.schedule.at_epoch(training.start_epoch).relaxation_penalty;
    let net = build_net(dynamics, scenarios, nominal, run, penalty, network)?;

    // 3. Data
    let dataset = ClfDataset::generate(&run.data, net.x_goal().to_vec())?;

    // 4. Train
    let (_, history) = train(&training, net, &dataset, &run.region, &device)?;

    let best = history.best();
    tracing::info!(
        epochs = history.len(),
        best_epoch = ?best.map(|r| r.epoch),
        best_test_loss = ?best.map(|r| r.test_loss),
        checkpoint_dir = %Path::new(&training.checkpoint_dir).join("best").display(),
        elapsed_secs = format!("{:.1}", start.elapsed().as_secs_f64()),
        "Run finished"
    );
    Ok(())
}

fn eval_model<D: ControlAffine>(
    dynamics: D,
    scenarios: Vec<D::Scenario>,
    nominal: D::Scenario,
    run: &RunToml,
    checkpoint: &Path,
) -> anyhow::Result<EvalReport> {
    let device = Default::default();
    let (network, meta) = load_checkpoint::<EvalBackend>(checkpoint, &device)?;
    if meta.model != dynamics.name() {
        anyhow::bail!(
            "Checkpoint {} was trained on {}, config is for {}",
            checkpoint.display(),
            meta.model,
            dynamics.name()
        );
    }

    let model = dynamics.name().to_string();
    let mut net = build_net(dynamics, scenarios, nominal, run, meta.relaxation_penalty, network)?;
    net.set_use_qp(true);
    let dataset = ClfDataset::generate(&run.data, net.x_goal().to_vec())?;

    let training = run.training_config().with_safe_level(meta.safe_level);
    let coeff = training.schedule.at_epoch(meta.epoch).controller_loss_coeff;
    let eval = evaluate(&net, &dataset, &meta.region, &training, coeff, &device)?;

    tracing::info!(epoch = meta.epoch, test_loss = eval.loss, "{}", eval.lyapunov);
    Ok(EvalReport {
        model,
        checkpoint: checkpoint.to_path_buf(),
        epoch: meta.epoch,
        n_test: dataset.n_test(),
        test_loss: eval.loss,
        lyapunov: eval.lyapunov,
        controller: eval.controller,
    })
}
