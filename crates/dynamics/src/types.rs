use std::fmt;

use burn::prelude::*;
use burn::tensor::TensorData;
use nalgebra::DMatrix;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::lqr::lqr;

/// Gravitational acceleration shared by all models (m/s²).
pub const GRAVITY: f64 = 9.81;

/// Errors raised by a dynamics oracle.
#[derive(Debug, thiserror::Error)]
pub enum DynamicsError {
    /// State batch does not have the model's state dimension.
    #[error("{model}: expected states of dimension {expected}, got {got}")]
    Shape {
        model: &'static str,
        expected: usize,
        got: usize,
    },

    /// The Riccati solve behind the LQR law failed.
    #[error("Riccati solve failed: {0}")]
    Riccati(String),
}

/// A control-affine system `ẋ = f(x) + g(x)·u`.
///
/// All tensor methods are vectorised over the leading batch dimension and
/// carry no learned state. The scenario record holds the physical parameters
/// (mass, inertia, ...) that vary between robustness scenarios.
pub trait ControlAffine: Clone + fmt::Debug + Send + Sync {
    /// Physical parameters for one scenario.
    type Scenario: Clone + fmt::Debug + PartialEq + Send + Sync + Serialize + DeserializeOwned;

    /// Short model name used in logs and error messages.
    fn name(&self) -> &'static str;

    /// State dimension `n`.
    fn n_dims(&self) -> usize;

    /// Control dimension `m`.
    fn n_controls(&self) -> usize;

    /// Control-independent drift `f(x)`, shape `(batch, n)`.
    fn drift<B: Backend>(&self, x: &Tensor<B, 2>, scenario: &Self::Scenario) -> Tensor<B, 2>;

    /// Control coefficient matrix `g(x)`, shape `(batch, n, m)`.
    fn control_matrix<B: Backend>(&self, x: &Tensor<B, 2>, scenario: &Self::Scenario)
        -> Tensor<B, 3>;

    /// Equilibrium control `u_eq` holding the system at the goal state.
    fn equilibrium_control(&self, scenario: &Self::Scenario) -> Vec<f64>;

    /// Jacobians `(A, B)` of the dynamics about the goal state and `u_eq`.
    fn linearize(&self, scenario: &Self::Scenario) -> (DMatrix<f64>, DMatrix<f64>);

    /// Goal state. The origin for every bundled model.
    fn goal_state(&self) -> Vec<f64> {
        vec![0.0; self.n_dims()]
    }

    /// Optional polyhedral control bounds `G·u ≤ h`, as `(G rows, h)`.
    fn control_bounds(&self) -> Option<(Vec<Vec<f64>>, Vec<f64>)> {
        None
    }

    /// Reject batches whose state dimension does not match the model.
    fn check_batch<B: Backend>(&self, x: &Tensor<B, 2>) -> Result<(), DynamicsError> {
        let [_, got] = x.dims();
        if got != self.n_dims() {
            return Err(DynamicsError::Shape {
                model: self.name(),
                expected: self.n_dims(),
                got,
            });
        }
        Ok(())
    }

    /// Both halves of the control-affine decomposition.
    fn dynamics<B: Backend>(
        &self,
        x: &Tensor<B, 2>,
        scenario: &Self::Scenario,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 3>), DynamicsError> {
        self.check_batch(x)?;
        Ok((self.drift(x, scenario), self.control_matrix(x, scenario)))
    }

    /// LQR gain `K` (shape `m × n`) with identity state and input costs.
    fn lqr_gain(&self, scenario: &Self::Scenario) -> Result<DMatrix<f64>, DynamicsError> {
        let (a, b) = self.linearize(scenario);
        let q = DMatrix::identity(self.n_dims(), self.n_dims());
        let r = DMatrix::identity(self.n_controls(), self.n_controls());
        lqr(&a, &b, &q, &r)
    }

    /// Nominal LQR feedback `u = -K(x - x_goal) + u_eq`, shape `(batch, m)`.
    ///
    /// The gain is recomputed on every call, so scenario changes are always
    /// picked up.
    fn nominal_control<B: Backend>(
        &self,
        x: &Tensor<B, 2>,
        scenario: &Self::Scenario,
    ) -> Result<Tensor<B, 2>, DynamicsError> {
        self.check_batch(x)?;
        let n = self.n_dims();
        let m = self.n_controls();
        let device = x.device();

        let k = self.lqr_gain(scenario)?;
        // u = -(x - x_goal) Kᵀ, so upload Kᵀ as an (n, m) matrix
        let k_t: Vec<f64> = (0..n)
            .flat_map(|i| (0..m).map(move |j| (i, j)))
            .map(|(i, j)| k[(j, i)])
            .collect();
        let k_t = Tensor::<B, 2>::from_data(TensorData::new(k_t, [n, m]), &device);
        let goal = Tensor::<B, 2>::from_data(TensorData::new(self.goal_state(), [1, n]), &device);
        let u_eq = Tensor::<B, 2>::from_data(
            TensorData::new(self.equilibrium_control(scenario), [1, m]),
            &device,
        );

        Ok((x.clone() - goal).matmul(k_t).neg() + u_eq)
    }
}

/// Column `index` of a `(batch, n)` tensor, kept as shape `(batch, 1)`.
pub fn column<B: Backend>(x: &Tensor<B, 2>, index: usize) -> Tensor<B, 2> {
    let [batch, _] = x.dims();
    x.clone().slice([0..batch, index..index + 1])
}

/// Assemble a `(batch, n, m)` tensor from row-major `(batch, 1)` entries.
pub(crate) fn assemble_matrix<B: Backend>(
    entries: Vec<Tensor<B, 2>>,
    n: usize,
    m: usize,
) -> Tensor<B, 3> {
    debug_assert_eq!(entries.len(), n * m);
    let batch = entries[0].dims()[0];
    Tensor::cat(entries, 1).reshape([batch, n, m])
}
