//! Checkpoint directory: `model.mpk` weights plus `meta.json` describing how
//! the network was configured when it was saved.

use std::path::Path;

use burn::prelude::*;
use burn::record::{DoublePrecisionSettings, NamedMpkFileRecorder};
use serde::{Deserialize, Serialize};

use crate::model::network::{ClfNetwork, ClfNetworkConfig};
use crate::training::data::SafetyRegion;

/// Metadata saved next to the weights.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    /// Dynamics model name.
    pub model: String,
    pub epoch: usize,
    pub test_loss: f64,
    pub n_dims: usize,
    pub n_controls: usize,
    pub n_hidden: usize,
    pub relaxation_penalty: f64,
    pub clf_lambda: f64,
    pub safe_level: f64,
    pub region: SafetyRegion,
}

impl CheckpointMeta {
    /// Network configuration that reproduces the saved parameter shapes.
    pub fn network_config(&self) -> ClfNetworkConfig {
        ClfNetworkConfig::new(self.n_dims, self.n_controls).with_n_hidden(self.n_hidden)
    }
}

/// Write `network` and `meta` into `dir`, creating it if needed.
pub fn save_checkpoint<B: Backend>(
    dir: &Path,
    network: &ClfNetwork<B>,
    meta: &CheckpointMeta,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(dir)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", dir.display()))?;

    let recorder = NamedMpkFileRecorder::<DoublePrecisionSettings>::new();
    network
        .clone()
        .save_file(dir.join("model"), &recorder)
        .map_err(|e| anyhow::anyhow!("Failed to save model to {}: {e}", dir.display()))?;

    let meta_path = dir.join("meta.json");
    let file = std::fs::File::create(&meta_path)
        .map_err(|e| anyhow::anyhow!("Failed to create {}: {e}", meta_path.display()))?;
    serde_json::to_writer_pretty(file, meta)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {e}", meta_path.display()))?;

    tracing::debug!(dir = %dir.display(), epoch = meta.epoch, "Checkpoint saved");
    Ok(())
}

/// Read only the metadata of a checkpoint.
pub fn load_checkpoint_meta(dir: &Path) -> anyhow::Result<CheckpointMeta> {
    let meta_path = dir.join("meta.json");
    let file = std::fs::File::open(&meta_path)
        .map_err(|e| anyhow::anyhow!("Failed to open {}: {e}", meta_path.display()))?;
    serde_json::from_reader(file)
        .map_err(|e| anyhow::anyhow!("Failed to parse {}: {e}", meta_path.display()))
}

/// Rebuild the network described by `meta.json` and load its weights.
pub fn load_checkpoint<B: Backend>(
    dir: &Path,
    device: &B::Device,
) -> anyhow::Result<(ClfNetwork<B>, CheckpointMeta)> {
    let meta = load_checkpoint_meta(dir)?;
    let network = meta
        .network_config()
        .init::<B>(device)
        .load_file(
            dir.join("model"),
            &NamedMpkFileRecorder::<DoublePrecisionSettings>::new(),
            device,
        )
        .map_err(|e| anyhow::anyhow!("Failed to load checkpoint from {}: {e}", dir.display()))?;
    tracing::info!(
        dir = %dir.display(),
        model = %meta.model,
        epoch = meta.epoch,
        test_loss = meta.test_loss,
        "Loaded checkpoint"
    );
    Ok((network, meta))
}
