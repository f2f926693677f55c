//! The CLF-QP network: learned Lyapunov function and controller, filtered
//! through a differentiable CLF quadratic program.
//!
//! ```text
//! x ─┬─ LyapunovNet ──── V, ∇V ──┬─ L_fV_s = ∇V·f_s(x)
//!    │                           └─ L_gV_s = ∇V·g_s(x)
//!    └─ GainController ── u_learned
//!
//! [L_fV, L_gV, V, u_learned] ── CLF-QP ── u, r
//! ```
//!
//! The QP is solved on the host for every batch element. Its KKT Jacobian `J`
//! is spliced back into the autodiff graph as `z = z* + J·(p - detach(p))`,
//! which has value exactly `z*` and backpropagates `Jᵀ` into the parameters.

use burn::module::AutodiffModule;
use burn::prelude::*;
use burn::tensor::activation::relu;
use burn::tensor::backend::AutodiffBackend;
use burn::tensor::TensorData;

use clf_qp::{ClfQp, ClfQpStructure, ControlPolytope, QpSettings};
use dynamics::ControlAffine;

use crate::error::ClfError;
use crate::model::bridge::{row_to_tensor, tensor_to_vec};
use crate::model::network::ClfNetwork;

/// Everything besides the trainable network that a [`ClfQpNet`] needs.
#[derive(Debug, Clone)]
pub struct ClfQpNetConfig<D: ControlAffine> {
    pub dynamics: D,
    /// Scenarios the CLF condition must hold in. Must be non-empty.
    pub scenarios: Vec<D::Scenario>,
    /// Scenario used for the nominal LQR law.
    pub nominal_scenario: D::Scenario,
    pub x_goal: Vec<f64>,
    pub u_eq: Vec<f64>,
    /// Exponential convergence rate `λ`.
    pub clf_lambda: f64,
    /// Initial cost per unit of CLF relaxation.
    pub relaxation_penalty: f64,
    pub control_bounds: Option<ControlPolytope>,
    pub qp_settings: QpSettings,
}

impl<D: ControlAffine> ClfQpNetConfig<D> {
    /// Goal, equilibrium control and control bounds taken from the oracle.
    pub fn from_dynamics(
        dynamics: D,
        scenarios: Vec<D::Scenario>,
        nominal_scenario: D::Scenario,
        clf_lambda: f64,
        relaxation_penalty: f64,
    ) -> Result<Self, ClfError> {
        let x_goal = dynamics.goal_state();
        let u_eq = dynamics.equilibrium_control(&nominal_scenario);
        let control_bounds = match dynamics.control_bounds() {
            Some((g, h)) => Some(
                ControlPolytope::new(g, h, dynamics.n_controls()).map_err(ClfError::QpSetup)?,
            ),
            None => None,
        };
        Ok(Self {
            dynamics,
            scenarios,
            nominal_scenario,
            x_goal,
            u_eq,
            clf_lambda,
            relaxation_penalty,
            control_bounds,
            qp_settings: QpSettings::default(),
        })
    }
}

/// Result of a forward pass over a `(batch, n)` state tensor.
#[derive(Debug, Clone)]
pub struct ClfOutput<B: Backend> {
    /// Filtered control, `(batch, m)`.
    pub u: Tensor<B, 2>,
    /// CLF relaxation averaged over scenarios, `(batch,)`.
    pub relaxation: Tensor<B, 1>,
    /// Lyapunov value, `(batch,)`.
    pub v: Tensor<B, 1>,
    /// `mean_s relu(L_fV_s + L_gV_s·u + λV)`, `(batch,)`.
    pub v_dot: Tensor<B, 1>,
}

/// Lie derivatives of `V` for every scenario.
#[derive(Debug, Clone)]
pub struct LieDerivatives<B: Backend> {
    /// `L_fV`, `(batch, S)`.
    pub lf_v: Tensor<B, 2>,
    /// `L_gV`, `(batch, S, m)`.
    pub lg_v: Tensor<B, 3>,
}

/// Lyapunov network and gain controller joined to a dynamics oracle through
/// a persistent CLF-QP.
#[derive(Debug, Clone)]
pub struct ClfQpNet<B: Backend, D: ControlAffine> {
    /// Trainable parameters.
    pub network: ClfNetwork<B>,
    dynamics: D,
    scenarios: Vec<D::Scenario>,
    nominal_scenario: D::Scenario,
    x_goal: Vec<f64>,
    u_eq: Vec<f64>,
    clf_lambda: f64,
    relaxation_penalty: f64,
    qp: ClfQp,
    use_qp: bool,
}

impl<B: Backend, D: ControlAffine> ClfQpNet<B, D> {
    /// Join `network` to the dynamics and build the QP once.
    pub fn new(network: ClfNetwork<B>, config: ClfQpNetConfig<D>) -> Result<Self, ClfError> {
        let ClfQpNetConfig {
            dynamics,
            scenarios,
            nominal_scenario,
            x_goal,
            u_eq,
            clf_lambda,
            relaxation_penalty,
            control_bounds,
            qp_settings,
        } = config;

        if scenarios.is_empty() {
            return Err(ClfError::NoScenarios);
        }
        let n = dynamics.n_dims();
        let m = dynamics.n_controls();
        for (what, expected, got) in [
            ("network input dimension", n, network.n_input()),
            ("network control dimension", m, network.n_controls()),
            ("goal state length", n, x_goal.len()),
            ("equilibrium control length", m, u_eq.len()),
        ] {
            if expected != got {
                return Err(ClfError::Dimension {
                    what,
                    expected,
                    got,
                });
            }
        }

        let qp = ClfQp::new(
            ClfQpStructure {
                n_controls: m,
                n_scenarios: scenarios.len(),
                clf_lambda,
                control_bounds,
            },
            qp_settings,
        )
        .map_err(ClfError::QpSetup)?;

        tracing::info!(
            model = dynamics.name(),
            n_dims = n,
            n_controls = m,
            n_scenarios = scenarios.len(),
            n_hidden = network.n_hidden(),
            clf_lambda,
            relaxation_penalty,
            "CLF-QP network ready"
        );

        Ok(Self {
            network,
            dynamics,
            scenarios,
            nominal_scenario,
            x_goal,
            u_eq,
            clf_lambda,
            relaxation_penalty,
            qp,
            use_qp: true,
        })
    }

    /// Evaluate the filtered controller at a `(batch, n)` state batch.
    ///
    /// With the QP disabled the learned control passes through unchanged and
    /// every relaxation is zero.
    pub fn forward(&self, x: Tensor<B, 2>) -> Result<ClfOutput<B>, ClfError> {
        self.dynamics.check_batch(&x)?;
        let [batch, _] = x.dims();
        let s_count = self.scenarios.len();
        let m = self.n_controls();

        let (v, grad_v) = self.network.lyapunov.evaluate(x.clone());
        let u_learned = self.learned_control(x.clone());
        let lie = self.lie_derivatives(&x, grad_v)?;

        let (u, relaxations) = if self.use_qp {
            self.filter(&lie, &v, u_learned)?
        } else {
            let zeros = Tensor::zeros([batch, s_count], &x.device());
            (u_learned, zeros)
        };

        let lg_u = lie
            .lg_v
            .matmul(u.clone().reshape([batch, m, 1]))
            .reshape([batch, s_count]);
        let lambda_v = v.clone().reshape([batch, 1]).repeat_dim(1, s_count) * self.clf_lambda;
        let v_dot = relu(lie.lf_v + lg_u + lambda_v)
            .mean_dim(1)
            .reshape([batch]);
        let relaxation = relaxations.mean_dim(1).reshape([batch]);

        Ok(ClfOutput {
            u,
            relaxation,
            v,
            v_dot,
        })
    }

    /// `L_fV_s = ∇V·f_s` and `L_gV_s = ∇V·g_s` for every scenario.
    pub fn lie_derivatives(
        &self,
        x: &Tensor<B, 2>,
        grad_v: Tensor<B, 2>,
    ) -> Result<LieDerivatives<B>, ClfError> {
        let [batch, n] = x.dims();
        let mut lf = Vec::with_capacity(self.scenarios.len());
        let mut lg = Vec::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            let (f, g) = self.dynamics.dynamics(x, scenario)?;
            lf.push((grad_v.clone() * f).sum_dim(1));
            lg.push(grad_v.clone().reshape([batch, 1, n]).matmul(g));
        }
        Ok(LieDerivatives {
            lf_v: Tensor::cat(lf, 1),
            lg_v: Tensor::cat(lg, 1),
        })
    }

    /// Unfiltered output of the gain controller, `(batch, m)`.
    pub fn learned_control(&self, x: Tensor<B, 2>) -> Tensor<B, 2> {
        let device = x.device();
        self.network.controller.forward(
            x,
            row_to_tensor(&self.x_goal, &device),
            row_to_tensor(&self.u_eq, &device),
        )
    }

    /// The oracle's LQR law for the nominal scenario.
    pub fn nominal_control(&self, x: &Tensor<B, 2>) -> Result<Tensor<B, 2>, ClfError> {
        Ok(self.dynamics.nominal_control(x, &self.nominal_scenario)?)
    }

    /// Solve the QP per batch element and splice its sensitivities into the
    /// graph. Returns `(u, r)` with shapes `(batch, m)` and `(batch, S)`.
    fn filter(
        &self,
        lie: &LieDerivatives<B>,
        v: &Tensor<B, 1>,
        u_learned: Tensor<B, 2>,
    ) -> Result<(Tensor<B, 2>, Tensor<B, 2>), ClfError> {
        let layout = self.qp.parameter_layout();
        let [batch, s_count] = lie.lf_v.dims();
        let m = self.n_controls();
        let n_params = layout.n_params();
        let n_decision = layout.n_decision();
        let device = v.device();

        let params = Tensor::cat(
            vec![
                lie.lf_v.clone(),
                lie.lg_v.clone().reshape([batch, s_count * m]),
                v.clone().reshape([batch, 1]),
                u_learned,
            ],
            1,
        );
        let host = tensor_to_vec(params.clone())?;

        let differentiate = B::ad_enabled();
        let mut z_star = Vec::with_capacity(batch * n_decision);
        let mut jacobians = Vec::with_capacity(if differentiate {
            batch * n_decision * n_params
        } else {
            0
        });
        for (index, row) in host.chunks(n_params).enumerate() {
            let qp_error = |source| ClfError::Qp { index, source };
            let p = layout
                .unflatten(row, self.relaxation_penalty)
                .map_err(qp_error)?;
            let solution = self.qp.solve(&p).map_err(qp_error)?;
            if differentiate {
                let jac = self.qp.jacobian(&p, &solution).map_err(qp_error)?;
                for i in 0..n_decision {
                    jacobians.extend((0..n_params).map(|k| jac[(i, k)]));
                }
            }
            z_star.extend(solution.decision());
        }

        let mut z = Tensor::<B, 2>::from_data(TensorData::new(z_star, [batch, n_decision]), &device);
        if differentiate {
            let jac = Tensor::<B, 3>::from_data(
                TensorData::new(jacobians, [batch, n_decision, n_params]),
                &device,
            );
            let delta = (params.clone() - params.detach()).reshape([batch, n_params, 1]);
            z = z + jac.matmul(delta).reshape([batch, n_decision]);
        }

        let u = z.clone().slice([0..batch, 0..m]);
        let r = z.slice([0..batch, m..n_decision]);
        Ok((u, r))
    }

    pub fn set_use_qp(&mut self, use_qp: bool) {
        self.use_qp = use_qp;
    }

    pub fn use_qp(&self) -> bool {
        self.use_qp
    }

    pub fn set_relaxation_penalty(&mut self, penalty: f64) {
        self.relaxation_penalty = penalty;
    }

    pub fn relaxation_penalty(&self) -> f64 {
        self.relaxation_penalty
    }

    pub fn clf_lambda(&self) -> f64 {
        self.clf_lambda
    }

    pub fn dynamics(&self) -> &D {
        &self.dynamics
    }

    pub fn scenarios(&self) -> &[D::Scenario] {
        &self.scenarios
    }

    pub fn nominal_scenario(&self) -> &D::Scenario {
        &self.nominal_scenario
    }

    pub fn x_goal(&self) -> &[f64] {
        &self.x_goal
    }

    pub fn u_eq(&self) -> &[f64] {
        &self.u_eq
    }

    pub fn qp(&self) -> &ClfQp {
        &self.qp
    }

    pub fn n_dims(&self) -> usize {
        self.dynamics.n_dims()
    }

    pub fn n_controls(&self) -> usize {
        self.dynamics.n_controls()
    }
}

impl<B: AutodiffBackend, D: ControlAffine> ClfQpNet<B, D> {
    /// Copy on the inner (non-autodiff) backend for evaluation.
    pub fn valid(&self) -> ClfQpNet<B::InnerBackend, D> {
        ClfQpNet {
            network: self.network.valid(),
            dynamics: self.dynamics.clone(),
            scenarios: self.scenarios.clone(),
            nominal_scenario: self.nominal_scenario.clone(),
            x_goal: self.x_goal.clone(),
            u_eq: self.u_eq.clone(),
            clf_lambda: self.clf_lambda,
            relaxation_penalty: self.relaxation_penalty,
            qp: self.qp.clone(),
            use_qp: self.use_qp,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::network::ClfNetworkConfig;
    use burn::backend::ndarray::NdArray;
    use burn::tensor::Distribution;
    use dynamics::{Pvtol, PvtolParams};

    type TestBackend = NdArray<f64>;

    fn pvtol_net(scenarios: Vec<PvtolParams>) -> Result<ClfQpNet<TestBackend, Pvtol>, ClfError> {
        let device = Default::default();
        let network = ClfNetworkConfig::new(6, 2)
            .with_n_hidden(16)
            .init::<TestBackend>(&device);
        let config =
            ClfQpNetConfig::from_dynamics(Pvtol, scenarios, PvtolParams::default(), 0.1, 10.0)?;
        ClfQpNet::new(network, config)
    }

    #[test]
    fn test_empty_scenarios_rejected() {
        assert!(matches!(pvtol_net(vec![]), Err(ClfError::NoScenarios)));
    }

    #[test]
    fn test_network_dimension_mismatch_rejected() {
        let network = ClfNetworkConfig::new(5, 2).init::<TestBackend>(&Default::default());
        let config = ClfQpNetConfig::from_dynamics(
            Pvtol,
            vec![PvtolParams::default()],
            PvtolParams::default(),
            0.1,
            10.0,
        )
        .unwrap();
        let err = ClfQpNet::new(network, config).unwrap_err();
        assert!(err.to_string().contains("network input dimension"), "{err}");
    }

    #[test]
    fn test_forward_shapes_with_two_scenarios() {
        let net = pvtol_net(vec![
            PvtolParams::default(),
            PvtolParams {
                mass: 1.5,
                inertia: 0.015,
            },
        ])
        .unwrap();
        let x = Tensor::<TestBackend, 2>::random(
            [5, 6],
            Distribution::Uniform(-1.0, 1.0),
            &Default::default(),
        );
        let out = net.forward(x.clone()).unwrap();
        assert_eq!(out.u.dims(), [5, 2]);
        assert_eq!(out.relaxation.dims(), [5]);
        assert_eq!(out.v.dims(), [5]);
        assert_eq!(out.v_dot.dims(), [5]);

        let (_, grad) = net.network.lyapunov.evaluate(x.clone());
        let lie = net.lie_derivatives(&x, grad).unwrap();
        assert_eq!(lie.lf_v.dims(), [5, 2]);
        assert_eq!(lie.lg_v.dims(), [5, 2, 2]);
    }

    #[test]
    fn test_bounds_come_from_dynamics() {
        let net = pvtol_net(vec![PvtolParams::default()]).unwrap();
        let bounds = net.qp().structure().control_bounds.as_ref().unwrap();
        assert_eq!(bounds.n_rows(), 4);
        assert_eq!(net.u_eq(), &[9.81 / 2.0, 9.81 / 2.0]);
    }

    #[test]
    fn test_wrong_state_dimension_rejected() {
        let net = pvtol_net(vec![PvtolParams::default()]).unwrap();
        let x = Tensor::<TestBackend, 2>::zeros([2, 4], &Default::default());
        assert!(matches!(net.forward(x), Err(ClfError::Dynamics(_))));
    }
}
