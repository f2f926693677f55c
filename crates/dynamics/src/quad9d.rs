//! 9-state quadrotor with collective thrust and body-rate controls.
//!
//! State `[px, py, pz, vx, vy, vz, φ, θ, ψ]` with `z` pointing down, so
//! gravity accelerates `vz` positively and thrust pulls it negative.
//! Controls are `[f, φ̇, θ̇, ψ̇]`: collective thrust and commanded Euler rates.

use burn::prelude::*;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::types::{assemble_matrix, column, ControlAffine, GRAVITY};

pub const N_DIMS: usize = 9;
pub const N_CONTROLS: usize = 4;

/// Named state indices.
pub mod state {
    pub const PX: usize = 0;
    pub const PY: usize = 1;
    pub const PZ: usize = 2;
    pub const VX: usize = 3;
    pub const VY: usize = 4;
    pub const VZ: usize = 5;
    pub const PHI: usize = 6;
    pub const THETA: usize = 7;
    pub const PSI: usize = 8;
}

/// Named control indices.
pub mod control {
    pub const F: usize = 0;
    pub const PHI_DOT: usize = 1;
    pub const THETA_DOT: usize = 2;
    pub const PSI_DOT: usize = 3;
}

/// Mass bounds used for the robustness scenarios (kg).
pub const MASS_LOW: f64 = 1.0;
pub const MASS_HIGH: f64 = MASS_LOW * 1.5;

/// Physical parameters for one quadrotor scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadParams {
    pub mass: f64,
}

impl Default for QuadParams {
    fn default() -> Self {
        Self { mass: MASS_LOW }
    }
}

/// 9-D quadrotor dynamics oracle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Quad9d;

impl ControlAffine for Quad9d {
    type Scenario = QuadParams;

    fn name(&self) -> &'static str {
        "quad9d"
    }

    fn n_dims(&self) -> usize {
        N_DIMS
    }

    fn n_controls(&self) -> usize {
        N_CONTROLS
    }

    fn drift<B: Backend>(&self, x: &Tensor<B, 2>, _scenario: &QuadParams) -> Tensor<B, 2> {
        let [batch, _] = x.dims();
        let zeros = Tensor::<B, 2>::zeros([batch, 1], &x.device());
        Tensor::cat(
            vec![
                column(x, state::VX),
                column(x, state::VY),
                column(x, state::VZ),
                zeros.clone(),
                zeros.clone(),
                zeros.clone().add_scalar(GRAVITY),
                zeros.clone(),
                zeros.clone(),
                zeros,
            ],
            1,
        )
    }

    fn control_matrix<B: Backend>(&self, x: &Tensor<B, 2>, scenario: &QuadParams) -> Tensor<B, 3> {
        let [batch, _] = x.dims();
        let device = x.device();
        let zeros = Tensor::<B, 2>::zeros([batch, 1], &device);
        let ones = Tensor::<B, 2>::ones([batch, 1], &device);

        let phi = column(x, state::PHI);
        let theta = column(x, state::THETA);
        let (s_phi, c_phi) = (phi.clone().sin(), phi.cos());
        let (s_theta, c_theta) = (theta.clone().sin(), theta.cos());
        let m = scenario.mass;

        let mut entries = vec![zeros; N_DIMS * N_CONTROLS];
        let at = |i: usize, j: usize| i * N_CONTROLS + j;
        entries[at(state::VX, control::F)] = s_theta.div_scalar(m).neg();
        entries[at(state::VY, control::F)] = (c_theta.clone() * s_phi).div_scalar(m);
        entries[at(state::VZ, control::F)] = (c_theta * c_phi).div_scalar(m).neg();
        entries[at(state::PHI, control::PHI_DOT)] = ones.clone();
        entries[at(state::THETA, control::THETA_DOT)] = ones.clone();
        entries[at(state::PSI, control::PSI_DOT)] = ones;

        assemble_matrix(entries, N_DIMS, N_CONTROLS)
    }

    fn equilibrium_control(&self, scenario: &QuadParams) -> Vec<f64> {
        let mut u = vec![0.0; N_CONTROLS];
        u[control::F] = scenario.mass * GRAVITY;
        u
    }

    fn linearize(&self, scenario: &QuadParams) -> (DMatrix<f64>, DMatrix<f64>) {
        let mut a = DMatrix::zeros(N_DIMS, N_DIMS);
        a[(state::PX, state::VX)] = 1.0;
        a[(state::PY, state::VY)] = 1.0;
        a[(state::PZ, state::VZ)] = 1.0;
        // Tilting the thrust vector at hover
        a[(state::VX, state::THETA)] = -GRAVITY;
        a[(state::VY, state::PHI)] = GRAVITY;

        let mut b = DMatrix::zeros(N_DIMS, N_CONTROLS);
        b[(state::VZ, control::F)] = -1.0 / scenario.mass;
        b[(state::PHI, control::PHI_DOT)] = 1.0;
        b[(state::THETA, control::THETA_DOT)] = 1.0;
        b[(state::PSI, control::PSI_DOT)] = 1.0;
        (a, b)
    }
}
