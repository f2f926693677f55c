//! Planar vertical take-off and landing (PVTOL) vehicle.
//!
//! State `[x, z, θ, vx, vz, θ̇]` with `z` pointing up; controls are the two
//! rotor thrusts. Both rotors push along the body axis, and their difference
//! times the lever arm produces the pitch torque.

use burn::prelude::*;
use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

use crate::types::{assemble_matrix, column, ControlAffine, GRAVITY};

pub const N_DIMS: usize = 6;
pub const N_CONTROLS: usize = 2;

/// Named state indices.
pub mod state {
    pub const X: usize = 0;
    pub const Z: usize = 1;
    pub const THETA: usize = 2;
    pub const VX: usize = 3;
    pub const VZ: usize = 4;
    pub const THETA_DOT: usize = 5;
}

/// Lever arm from the centre of mass to each rotor (m).
pub const LEVER_ARM: f64 = 0.25;
/// Mass bounds used for the robustness scenarios (kg).
pub const MASS_LOW: f64 = 1.0;
pub const MASS_HIGH: f64 = MASS_LOW * 1.5;
/// Moment of inertia bounds (kg·m²).
pub const INERTIA_LOW: f64 = 0.01;
pub const INERTIA_HIGH: f64 = INERTIA_LOW * 1.5;
/// Per-rotor thrust limit.
pub const MAX_THRUST: f64 = 100.0;

/// Physical parameters for one PVTOL scenario.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PvtolParams {
    pub mass: f64,
    pub inertia: f64,
}

impl Default for PvtolParams {
    fn default() -> Self {
        Self {
            mass: MASS_LOW,
            inertia: INERTIA_LOW,
        }
    }
}

/// PVTOL dynamics oracle.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pvtol;

impl ControlAffine for Pvtol {
    type Scenario = PvtolParams;

    fn name(&self) -> &'static str {
        "pvtol"
    }

    fn n_dims(&self) -> usize {
        N_DIMS
    }

    fn n_controls(&self) -> usize {
        N_CONTROLS
    }

    fn drift<B: Backend>(&self, x: &Tensor<B, 2>, _scenario: &PvtolParams) -> Tensor<B, 2> {
        let [batch, _] = x.dims();
        let zeros = Tensor::<B, 2>::zeros([batch, 1], &x.device());
        Tensor::cat(
            vec![
                column(x, state::VX),
                column(x, state::VZ),
                column(x, state::THETA_DOT),
                zeros.clone(),
                zeros.clone().add_scalar(-GRAVITY),
                zeros,
            ],
            1,
        )
    }

    fn control_matrix<B: Backend>(&self, x: &Tensor<B, 2>, scenario: &PvtolParams) -> Tensor<B, 3> {
        let [batch, _] = x.dims();
        let zeros = Tensor::<B, 2>::zeros([batch, 1], &x.device());
        let theta = column(x, state::THETA);
        let sin_over_m = theta.clone().sin().div_scalar(scenario.mass).neg();
        let cos_over_m = theta.cos().div_scalar(scenario.mass);
        let torque = zeros.clone().add_scalar(LEVER_ARM / scenario.inertia);

        assemble_matrix(
            vec![
                // x, z, θ
                zeros.clone(),
                zeros.clone(),
                zeros.clone(),
                zeros.clone(),
                zeros.clone(),
                zeros,
                // vx
                sin_over_m.clone(),
                sin_over_m,
                // vz
                cos_over_m.clone(),
                cos_over_m,
                // θ̇
                torque.clone(),
                torque.neg(),
            ],
            N_DIMS,
            N_CONTROLS,
        )
    }

    fn equilibrium_control(&self, scenario: &PvtolParams) -> Vec<f64> {
        vec![scenario.mass * GRAVITY / 2.0; N_CONTROLS]
    }

    fn linearize(&self, scenario: &PvtolParams) -> (DMatrix<f64>, DMatrix<f64>) {
        let mut a = DMatrix::zeros(N_DIMS, N_DIMS);
        a[(state::X, state::VX)] = 1.0;
        a[(state::Z, state::VZ)] = 1.0;
        a[(state::THETA, state::THETA_DOT)] = 1.0;
        a[(state::VX, state::THETA)] = -GRAVITY;

        let mut b = DMatrix::zeros(N_DIMS, N_CONTROLS);
        b[(state::VZ, 0)] = 1.0 / scenario.mass;
        b[(state::VZ, 1)] = 1.0 / scenario.mass;
        b[(state::THETA_DOT, 0)] = LEVER_ARM / scenario.inertia;
        b[(state::THETA_DOT, 1)] = -LEVER_ARM / scenario.inertia;
        (a, b)
    }

    fn control_bounds(&self) -> Option<(Vec<Vec<f64>>, Vec<f64>)> {
        let g = vec![
            vec![1.0, 0.0],
            vec![-1.0, 0.0],
            vec![0.0, 1.0],
            vec![0.0, -1.0],
        ];
        Some((g, vec![MAX_THRUST; 4]))
    }
}
