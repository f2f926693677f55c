use burn::prelude::*;

use crate::model::controller::{GainController, GainControllerConfig};
use crate::model::lyapunov::{LyapunovNet, LyapunovNetConfig};

/// Sizes of the trainable part of a CLF-QP network.
#[derive(Config, Debug)]
pub struct ClfNetworkConfig {
    /// State dimension.
    pub n_input: usize,
    /// Hidden width shared by the Lyapunov and gain networks.
    #[config(default = 48)]
    pub n_hidden: usize,
    /// Control dimension.
    pub n_controls: usize,
}

/// All trainable parameters: the Lyapunov network and the gain controller.
///
/// This is the only state the optimizer and the checkpoint recorder see; the
/// dynamics, scenarios and QP live in [`ClfQpNet`](crate::model::filter::ClfQpNet).
#[derive(Module, Debug)]
pub struct ClfNetwork<B: Backend> {
    pub lyapunov: LyapunovNet<B>,
    pub controller: GainController<B>,
}

impl ClfNetworkConfig {
    pub fn init<B: Backend>(&self, device: &B::Device) -> ClfNetwork<B> {
        ClfNetwork {
            lyapunov: LyapunovNetConfig::new(self.n_input)
                .with_n_hidden(self.n_hidden)
                .init(device),
            controller: GainControllerConfig::new(self.n_input, self.n_controls)
                .with_n_hidden(self.n_hidden)
                .init(device),
        }
    }
}

impl<B: Backend> ClfNetwork<B> {
    pub fn n_input(&self) -> usize {
        self.lyapunov.n_input()
    }

    pub fn n_hidden(&self) -> usize {
        self.lyapunov.n_hidden()
    }

    pub fn n_controls(&self) -> usize {
        self.controller.n_controls()
    }
}
