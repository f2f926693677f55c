//! CLF-QP training loop.
//!
//! Ties together the dataset, safety masks, loss functions and schedule into
//! an SGD loop over the Lyapunov and gain networks. Gradients flow through the
//! QP via its KKT Jacobian, so the same loop trains with the filter on or off.

use std::path::Path;
use std::time::Instant;

use burn::optim::decay::WeightDecayConfig;
use burn::optim::{GradientsParams, Optimizer, SgdConfig};
use burn::prelude::*;
use burn::tensor::backend::AutodiffBackend;
use indicatif::{ProgressBar, ProgressStyle};
use rand::rngs::StdRng;
use rand::SeedableRng;

use dynamics::ControlAffine;

use crate::model::bridge::tensor_to_f64;
use crate::model::filter::ClfQpNet;
use crate::training::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::training::data::{ClfDataset, SafetyRegion};
use crate::training::loss::{
    controller_loss_with_output, lyapunov_loss_with_output, ControllerLossMode,
};
use crate::training::metrics::{
    ControllerDiagnostics, EpochRecord, LyapunovDiagnostics, RunningAvg, TrainingHistory,
};
use crate::training::schedule::TrainingSchedule;

/// Relaxation penalty above which the QP becomes badly scaled.
pub const PENALTY_WARNING_THRESHOLD: f64 = 1e6;

/// Configuration for CLF-QP training.
#[derive(Config, Debug)]
pub struct ClfTrainingConfig {
    /// Number of epochs to run.
    #[config(default = 1000)]
    pub epochs: usize,
    /// Training states per SGD step.
    #[config(default = 64)]
    pub batch_size: usize,
    /// Test states per evaluation chunk.
    #[config(default = 4096)]
    pub eval_batch_size: usize,
    /// L2 weight decay for SGD.
    #[config(default = 1e-6)]
    pub weight_decay: f64,
    /// Level set of `V` separating the safe and unsafe regions.
    #[config(default = 10.0)]
    pub safe_level: f64,
    /// Euler step used by the simulated descent term.
    #[config(default = 0.001)]
    pub timestep: f64,
    #[config(default = "ControllerLossMode::Nominal")]
    pub controller_loss: ControllerLossMode,
    /// Filter training batches through the QP. Evaluation always uses it.
    #[config(default = true)]
    pub use_qp: bool,
    /// Directory for `best/` and `history.json`.
    #[config(default = "String::from(\"checkpoints/clf\")")]
    pub checkpoint_dir: String,
    /// Seed for the presentation order.
    #[config(default = 0)]
    pub seed: u64,
    /// First epoch index, for resumed runs.
    #[config(default = 0)]
    pub start_epoch: usize,
    /// Best test loss seen before this run. A checkpoint is only written when
    /// the test loss beats it.
    pub best_test_loss: Option<f64>,
    #[config(default = "TrainingSchedule::default()")]
    pub schedule: TrainingSchedule,
}

/// Test-set loss and its averaged diagnostics.
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    pub loss: f64,
    pub lyapunov: LyapunovDiagnostics,
    pub controller: ControllerDiagnostics,
}

/// Total loss over the test set with diagnostics, in chunks of
/// `config.eval_batch_size` states.
///
/// Batch-mean terms are weighted by chunk size and the region terms by mask
/// count, so the result does not depend on the chunk size. The QP setting of
/// `net` is used as is.
pub fn evaluate<B: Backend, D: ControlAffine>(
    net: &ClfQpNet<B, D>,
    dataset: &ClfDataset,
    region: &SafetyRegion,
    config: &ClfTrainingConfig,
    controller_loss_coeff: f64,
    device: &B::Device,
) -> anyhow::Result<Evaluation> {
    region.validate(dataset.n_dims())?;
    if dataset.n_dims() != net.n_dims() {
        anyhow::bail!(
            "Dataset has {}-dimensional states but {} expects {}",
            dataset.n_dims(),
            net.dynamics().name(),
            net.n_dims()
        );
    }
    let goal = dataset.goal_tensor::<B>(device);
    let mut avg = RunningAvg::default();

    for (chunk, x) in dataset
        .test_chunks::<B>(config.eval_batch_size, device)
        .enumerate()
    {
        let rows = x.dims()[0];
        let (safe, unsafe_) = region.masks(&x);
        let output = net
            .forward(x.clone())
            .map_err(|e| anyhow::anyhow!("Evaluation chunk {chunk}: {e}"))?;
        let lyapunov = lyapunov_loss_with_output(
            &x,
            &output,
            goal.clone(),
            safe,
            unsafe_,
            net,
            net.clf_lambda(),
            config.safe_level,
            config.timestep,
            true,
        )?;
        let controller = controller_loss_with_output(
            &x,
            &output,
            net,
            config.controller_loss,
            controller_loss_coeff,
            true,
        )?;

        avg.update(
            rows,
            &lyapunov.diagnostics.unwrap_or_default(),
            &controller.diagnostics.unwrap_or_default(),
        );
    }

    let (loss, lyapunov, controller) = avg
        .average()
        .ok_or_else(|| anyhow::anyhow!("Test set is empty"))?;
    Ok(Evaluation {
        loss,
        lyapunov,
        controller,
    })
}

/// Run the CLF-QP training loop.
///
/// Every epoch reshuffles the training set, applies the epoch's schedule,
/// takes one SGD step per mini-batch on `lyapunov_loss + controller_loss`,
/// then evaluates the test set with the QP enabled. The network is written to
/// `{checkpoint_dir}/best` whenever the test loss strictly improves, and the
/// full history to `{checkpoint_dir}/history.json` at the end.
///
/// # Returns
/// The trained network and one [`EpochRecord`] per epoch.
pub fn train<B: AutodiffBackend, D: ControlAffine>(
    config: &ClfTrainingConfig,
    mut net: ClfQpNet<B, D>,
    dataset: &ClfDataset,
    region: &SafetyRegion,
    device: &B::Device,
) -> anyhow::Result<(ClfQpNet<B, D>, TrainingHistory)> {
    config.schedule.validate()?;
    region.validate(dataset.n_dims())?;
    if dataset.n_dims() != net.n_dims() {
        anyhow::bail!(
            "Dataset has {}-dimensional states but {} expects {}",
            dataset.n_dims(),
            net.dynamics().name(),
            net.n_dims()
        );
    }
    if config.batch_size == 0 {
        anyhow::bail!("batch_size must be positive");
    }

    let checkpoint_dir = Path::new(&config.checkpoint_dir);
    std::fs::create_dir_all(checkpoint_dir)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", checkpoint_dir.display()))?;
    let best_dir = checkpoint_dir.join("best");

    let mut optimizer = SgdConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.weight_decay as f32)))
        .init();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let goal = dataset.goal_tensor::<B>(device);
    let n_batches = dataset.n_train().div_ceil(config.batch_size);
    let mut best_test_loss = config.best_test_loss;
    let mut history = TrainingHistory::default();
    let train_start = Instant::now();

    net.set_use_qp(config.use_qp);
    tracing::info!(
        model = net.dynamics().name(),
        epochs = config.epochs,
        start_epoch = config.start_epoch,
        n_train = dataset.n_train(),
        n_test = dataset.n_test(),
        batch_size = config.batch_size,
        use_qp = config.use_qp,
        controller_loss = %config.controller_loss,
        "Starting CLF-QP training"
    );

    for epoch in config.start_epoch..config.start_epoch + config.epochs {
        let schedule = config.schedule.at_epoch(epoch);
        net.set_relaxation_penalty(schedule.relaxation_penalty);
        if schedule.relaxation_penalty > PENALTY_WARNING_THRESHOLD {
            tracing::warn!(
                epoch,
                relaxation_penalty = schedule.relaxation_penalty,
                "Relaxation penalty is very large; consider max_relaxation_penalty"
            );
        }

        let order = dataset.shuffled_indices(&mut rng);
        let pb = ProgressBar::new(n_batches as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}")
                .map(|style| style.progress_chars("=> "))
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        pb.set_message(format!("epoch {}", epoch + 1));

        let mut loss_sum = 0.0;
        for (step, indices) in order.chunks(config.batch_size).enumerate() {
            let x = dataset.train_batch::<B>(indices, device);
            let (safe, unsafe_) = region.masks(&x);
            let output = net
                .forward(x.clone())
                .map_err(|e| anyhow::anyhow!("Epoch {epoch}, step {step}: {e}"))?;

            let lyapunov = lyapunov_loss_with_output(
                &x,
                &output,
                goal.clone(),
                safe,
                unsafe_,
                &net,
                net.clf_lambda(),
                config.safe_level,
                config.timestep,
                false,
            )?;
            let controller = controller_loss_with_output(
                &x,
                &output,
                &net,
                config.controller_loss,
                schedule.controller_loss_coeff,
                false,
            )?;
            let loss = lyapunov.loss + controller.loss;
            loss_sum += tensor_to_f64(loss.clone());

            let grads = GradientsParams::from_grads(loss.backward(), &net.network);
            net.network = optimizer.step(schedule.learning_rate, net.network, grads);
            pb.inc(1);
        }
        pb.finish_and_clear();
        let train_loss = loss_sum / n_batches.max(1) as f64;

        let mut valid = net.valid();
        valid.set_use_qp(true);
        let eval = evaluate(
            &valid,
            dataset,
            region,
            config,
            schedule.controller_loss_coeff,
            device,
        )?;

        let improved = best_test_loss.map_or(true, |best| eval.loss < best);
        if improved {
            best_test_loss = Some(eval.loss);
            let meta = CheckpointMeta {
                model: net.dynamics().name().to_string(),
                epoch,
                test_loss: eval.loss,
                n_dims: net.n_dims(),
                n_controls: net.n_controls(),
                n_hidden: net.network.n_hidden(),
                relaxation_penalty: net.relaxation_penalty(),
                clf_lambda: net.clf_lambda(),
                safe_level: config.safe_level,
                region: region.clone(),
            };
            save_checkpoint(&best_dir, &net.network, &meta)?;
        }

        let warnings = eval.lyapunov.health_check();
        if !warnings.is_empty() {
            tracing::warn!(epoch = epoch + 1, "Health check warnings: {:?}", warnings);
        }
        let lr_str = format!("{:.2e}", schedule.learning_rate);
        tracing::info!(
            epoch = epoch + 1,
            lr = %lr_str,
            relaxation_penalty = schedule.relaxation_penalty,
            train_loss,
            test_loss = eval.loss,
            improved,
            "{}",
            eval.lyapunov
        );

        history.push(EpochRecord {
            epoch,
            learning_rate: schedule.learning_rate,
            relaxation_penalty: schedule.relaxation_penalty,
            controller_loss_coeff: schedule.controller_loss_coeff,
            train_loss,
            test_loss: eval.loss,
            improved,
            lyapunov: eval.lyapunov,
            controller: eval.controller,
        });
    }

    let history_path = checkpoint_dir.join("history.json");
    let file = std::fs::File::create(&history_path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", history_path.display()))?;
    serde_json::to_writer_pretty(file, &history)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", history_path.display()))?;

    tracing::info!(
        epochs = history.len(),
        best_test_loss = ?best_test_loss,
        elapsed_secs = format!("{:.1}", train_start.elapsed().as_secs_f64()),
        "Training complete"
    );
    Ok((net, history))
}
