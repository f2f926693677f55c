//! Lyapunov and controller losses for CLF-QP training.
//!
//! Both losses are generic over `B: Backend` and return a scalar `(1,)`
//! tensor. Diagnostics are read back to the host after the loss is built and
//! never feed into it.

use std::fmt;

use burn::prelude::*;
use burn::tensor::activation::relu;
use serde::{Deserialize, Serialize};

use dynamics::ControlAffine;

use crate::error::ClfError;
use crate::model::bridge::{row_to_tensor, tensor_to_f64, tensor_to_vec};
use crate::model::filter::{ClfOutput, ClfQpNet};
use crate::training::metrics::{ControllerDiagnostics, LyapunovDiagnostics};

/// Weight of the safe- and unsafe-region level-set terms.
pub const REGION_WEIGHT: f64 = 100.0;

/// What the controller loss pulls the filtered control towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerLossMode {
    /// The oracle's LQR law at each state, nominal scenario.
    Nominal,
    /// The LQR law evaluated at the goal state.
    Equilibrium,
    /// Zero: penalize control magnitude.
    Magnitude,
}

impl fmt::Display for ControllerLossMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerLossMode::Nominal => write!(f, "nominal"),
            ControllerLossMode::Equilibrium => write!(f, "equilibrium"),
            ControllerLossMode::Magnitude => write!(f, "magnitude"),
        }
    }
}

/// A scalar loss plus optional host-side diagnostics.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend, M> {
    pub loss: Tensor<B, 1>,
    pub diagnostics: Option<M>,
}

/// Lyapunov loss at the states `x`, running a forward pass of `net`.
///
/// Sum of:
/// - `relu(V(x_goal))²` (mean over goal states)
/// - `100·relu(V - safe_level)` averaged over `safe_mask`
/// - `100·relu(safe_level - V)` averaged over `unsafe_mask`
/// - `Σ_s relu(V(x + Δt·(f_s + g_s·u)) - (1 - λΔt)·V)`, mean over the batch
/// - the mean QP-predicted descent violation `v_dot`
/// - the mean CLF relaxation
///
/// An empty mask contributes nothing. Masks must have one entry per row of
/// `x` and `x_goal` must be a non-empty `(k, n_dims)` batch; any other shape
/// is a [`ClfError::Dimension`].
#[allow(clippy::too_many_arguments)]
pub fn lyapunov_loss<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    x_goal: Tensor<B, 2>,
    safe_mask: Tensor<B, 1, Bool>,
    unsafe_mask: Tensor<B, 1, Bool>,
    net: &ClfQpNet<B, D>,
    clf_lambda: f64,
    safe_level: f64,
    timestep: f64,
    diagnostics: bool,
) -> Result<LossOutput<B, LyapunovDiagnostics>, ClfError> {
    check_lyapunov_inputs(x, &x_goal, &safe_mask, &unsafe_mask, net)?;
    let output = net.forward(x.clone())?;
    lyapunov_loss_with_output(
        x,
        &output,
        x_goal,
        safe_mask,
        unsafe_mask,
        net,
        clf_lambda,
        safe_level,
        timestep,
        diagnostics,
    )
}

/// [`lyapunov_loss`] reusing an existing forward pass over `x`.
#[allow(clippy::too_many_arguments)]
pub fn lyapunov_loss_with_output<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    output: &ClfOutput<B>,
    x_goal: Tensor<B, 2>,
    safe_mask: Tensor<B, 1, Bool>,
    unsafe_mask: Tensor<B, 1, Bool>,
    net: &ClfQpNet<B, D>,
    clf_lambda: f64,
    safe_level: f64,
    timestep: f64,
    diagnostics: bool,
) -> Result<LossOutput<B, LyapunovDiagnostics>, ClfError> {
    check_lyapunov_inputs(x, &x_goal, &safe_mask, &unsafe_mask, net)?;
    check_output(x, output, net)?;
    let [batch, n] = x.dims();
    let m = net.n_controls();
    let device = x.device();
    let v = output.v.clone();

    let goal_term = relu(net.network.lyapunov.value(x_goal)).powf_scalar(2.0).mean();

    let safe_mask = safe_mask.float();
    let unsafe_mask = unsafe_mask.float();
    let safe_violation = relu(v.clone().sub_scalar(safe_level)) * REGION_WEIGHT;
    let unsafe_violation = relu(v.clone().neg().add_scalar(safe_level)) * REGION_WEIGHT;
    let safe_term = masked_mean(safe_violation.clone(), safe_mask.clone());
    let unsafe_term = masked_mean(unsafe_violation.clone(), unsafe_mask.clone());

    // One explicit Euler step per scenario under the filtered control
    let u = output.u.clone().reshape([batch, m, 1]);
    let decay = 1.0 - clf_lambda * timestep;
    let mut descent = Tensor::<B, 1>::zeros([batch], &device);
    for scenario in net.scenarios() {
        let (f, g) = net.dynamics().dynamics(x, scenario)?;
        let x_dot = f + g.matmul(u.clone()).reshape([batch, n]);
        let v_next = net.network.lyapunov.value(x.clone() + x_dot * timestep);
        descent = descent + relu(v_next - v.clone() * decay);
    }
    let descent_term = descent.clone().mean();
    let v_dot_term = output.v_dot.clone().mean();
    let relaxation_term = output.relaxation.clone().mean();

    let loss = goal_term.clone()
        + safe_term.clone()
        + unsafe_term.clone()
        + descent_term.clone()
        + v_dot_term.clone()
        + relaxation_term.clone();

    let diagnostics = if diagnostics {
        let safe_mask = tensor_to_vec(safe_mask)?;
        let unsafe_mask = tensor_to_vec(unsafe_mask)?;
        let descent = tensor_to_vec(descent)?;
        Some(LyapunovDiagnostics {
            goal_term: tensor_to_f64(goal_term),
            safe_term: tensor_to_f64(safe_term),
            safe_satisfied_pct: satisfied_pct(&tensor_to_vec(safe_violation)?, Some(&safe_mask)),
            safe_count: mask_count(&safe_mask),
            unsafe_term: tensor_to_f64(unsafe_term),
            unsafe_satisfied_pct: satisfied_pct(
                &tensor_to_vec(unsafe_violation)?,
                Some(&unsafe_mask),
            ),
            unsafe_count: mask_count(&unsafe_mask),
            descent_term: tensor_to_f64(descent_term),
            descent_satisfied_pct: satisfied_pct(&descent, None),
            v_dot_term: tensor_to_f64(v_dot_term),
            relaxation_term: tensor_to_f64(relaxation_term),
        })
    } else {
        None
    };

    Ok(LossOutput { loss, diagnostics })
}

/// Controller loss at the states `x`, running a forward pass of `net`.
///
/// `coeff · mean ‖u_target - u‖²` where `u` is the network's (filtered)
/// control and `u_target` depends on `mode`.
pub fn controller_loss<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    net: &ClfQpNet<B, D>,
    mode: ControllerLossMode,
    coeff: f64,
    diagnostics: bool,
) -> Result<LossOutput<B, ControllerDiagnostics>, ClfError> {
    let output = net.forward(x.clone())?;
    controller_loss_with_output(x, &output, net, mode, coeff, diagnostics)
}

/// [`controller_loss`] reusing an existing forward pass over `x`.
pub fn controller_loss_with_output<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    output: &ClfOutput<B>,
    net: &ClfQpNet<B, D>,
    mode: ControllerLossMode,
    coeff: f64,
    diagnostics: bool,
) -> Result<LossOutput<B, ControllerDiagnostics>, ClfError> {
    check_output(x, output, net)?;
    let [batch, m] = output.u.dims();
    let device = x.device();

    let target = match mode {
        ControllerLossMode::Nominal => net.nominal_control(x)?,
        ControllerLossMode::Equilibrium => {
            let goal = row_to_tensor(net.x_goal(), &device);
            net.nominal_control(&goal)?.repeat_dim(0, batch)
        }
        ControllerLossMode::Magnitude => Tensor::zeros([batch, m], &device),
    };

    let squared_error = (target - output.u.clone())
        .powf_scalar(2.0)
        .sum_dim(1)
        .reshape([batch])
        * coeff;
    let loss = squared_error.mean();

    let diagnostics = diagnostics.then(|| ControllerDiagnostics {
        controller_term: tensor_to_f64(loss.clone()),
    });
    Ok(LossOutput { loss, diagnostics })
}

/// First mismatch among `(what, expected, got)` triples.
fn check_dims(checks: &[(&'static str, usize, usize)]) -> Result<(), ClfError> {
    match checks.iter().find(|(_, expected, got)| expected != got) {
        Some(&(what, expected, got)) => Err(ClfError::Dimension {
            what,
            expected,
            got,
        }),
        None => Ok(()),
    }
}

fn check_lyapunov_inputs<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    x_goal: &Tensor<B, 2>,
    safe_mask: &Tensor<B, 1, Bool>,
    unsafe_mask: &Tensor<B, 1, Bool>,
    net: &ClfQpNet<B, D>,
) -> Result<(), ClfError> {
    let [batch, n] = x.dims();
    let [goals, goal_n] = x_goal.dims();
    if goals == 0 {
        return Err(ClfError::InvalidData("goal batch is empty".to_string()));
    }
    check_dims(&[
        ("state dimension", net.n_dims(), n),
        ("goal state dimension", net.n_dims(), goal_n),
        ("safe mask length", batch, safe_mask.dims()[0]),
        ("unsafe mask length", batch, unsafe_mask.dims()[0]),
    ])
}

/// `output` must come from a forward pass over a batch shaped like `x`.
fn check_output<B: Backend, D: ControlAffine>(
    x: &Tensor<B, 2>,
    output: &ClfOutput<B>,
    net: &ClfQpNet<B, D>,
) -> Result<(), ClfError> {
    let [batch, n] = x.dims();
    let [u_rows, u_cols] = output.u.dims();
    check_dims(&[
        ("state dimension", net.n_dims(), n),
        ("control rows", batch, u_rows),
        ("control dimension", net.n_controls(), u_cols),
        ("Lyapunov value length", batch, output.v.dims()[0]),
        ("relaxation length", batch, output.relaxation.dims()[0]),
        ("v_dot length", batch, output.v_dot.dims()[0]),
    ])
}

fn mask_count(mask: &[f64]) -> usize {
    mask.iter().filter(|m| **m > 0.5).count()
}

/// Mean of `values` over entries where `mask` is one; zero for an empty mask.
fn masked_mean<B: Backend>(values: Tensor<B, 1>, mask: Tensor<B, 1>) -> Tensor<B, 1> {
    let count = mask.clone().sum().clamp_min(1.0);
    (values * mask).sum() / count
}

/// Percentage of (masked) entries whose violation is exactly zero.
fn satisfied_pct(violation: &[f64], mask: Option<&[f64]>) -> f64 {
    let (hits, total) = violation
        .iter()
        .enumerate()
        .filter(|(i, _)| mask.map_or(true, |m| m[*i] > 0.5))
        .fold((0usize, 0usize), |(hits, total), (_, v)| {
            (hits + usize::from(*v == 0.0), total + 1)
        });
    if total == 0 {
        100.0
    } else {
        100.0 * hits as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::filter::ClfQpNetConfig;
    use crate::model::network::ClfNetworkConfig;
    use burn::backend::ndarray::NdArray;
    use burn::backend::Autodiff;
    use burn::tensor::{Distribution, ElementConversion, TensorData};
    use dynamics::{Pvtol, PvtolParams};

    type TestBackend = NdArray<f64>;
    type TestAutodiffBackend = Autodiff<NdArray<f64>>;

    fn pvtol_net<B: Backend>() -> ClfQpNet<B, Pvtol> {
        let network = ClfNetworkConfig::new(6, 2)
            .with_n_hidden(8)
            .init::<B>(&Default::default());
        let config = ClfQpNetConfig::from_dynamics(
            Pvtol,
            vec![PvtolParams::default()],
            PvtolParams::default(),
            0.1,
            10.0,
        )
        .unwrap();
        ClfQpNet::new(network, config).unwrap()
    }

    fn states<B: Backend>(batch: usize) -> Tensor<B, 2> {
        Tensor::random([batch, 6], Distribution::Uniform(-1.0, 1.0), &Default::default())
    }

    fn masks<B: Backend>(values: &[bool]) -> Tensor<B, 1, Bool> {
        Tensor::from_data(
            TensorData::new(values.to_vec(), [values.len()]),
            &Default::default(),
        )
    }

    #[test]
    fn test_masked_mean_empty_is_zero() {
        let device = Default::default();
        let values = Tensor::<TestBackend, 1>::from_data(TensorData::from([5.0, 7.0]), &device);
        let mask = Tensor::<TestBackend, 1>::zeros([2], &device);
        let mean: f64 = masked_mean(values.clone(), mask).into_scalar().elem();
        assert_eq!(mean, 0.0);

        let mask = Tensor::<TestBackend, 1>::from_data(TensorData::from([0.0, 1.0]), &device);
        let mean: f64 = masked_mean(values, mask).into_scalar().elem();
        assert!((mean - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_satisfied_pct() {
        assert_eq!(satisfied_pct(&[0.0, 1.0, 0.0, 2.0], None), 50.0);
        assert_eq!(satisfied_pct(&[0.0, 1.0], Some(&[0.0, 1.0])), 0.0);
        assert_eq!(satisfied_pct(&[1.0, 1.0], Some(&[0.0, 0.0])), 100.0);
    }

    #[test]
    fn test_diagnostics_do_not_change_loss() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(6);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let safe = masks::<TestBackend>(&[true, false, true, false, true, false]);
        let unsafe_ = masks::<TestBackend>(&[false, true, false, true, false, false]);

        let plain = lyapunov_loss(
            &x, goal.clone(), safe.clone(), unsafe_.clone(), &net, 0.1, 1.0, 0.001, false,
        )
        .unwrap();
        let with_diag =
            lyapunov_loss(&x, goal, safe, unsafe_, &net, 0.1, 1.0, 0.001, true).unwrap();

        assert!(plain.diagnostics.is_none());
        let diag = with_diag.diagnostics.unwrap();
        let a: f64 = plain.loss.into_scalar().elem();
        let b: f64 = with_diag.loss.into_scalar().elem();
        assert_eq!(a, b);

        let sum = diag.goal_term
            + diag.safe_term
            + diag.unsafe_term
            + diag.descent_term
            + diag.v_dot_term
            + diag.relaxation_term;
        assert!((sum - a).abs() < 1e-9 * (1.0 + a.abs()));
    }

    #[test]
    fn test_empty_masks_contribute_nothing() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(4);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let none = masks::<TestBackend>(&[false; 4]);

        let out = lyapunov_loss(&x, goal, none.clone(), none, &net, 0.1, 1.0, 0.001, true).unwrap();
        let diag = out.diagnostics.unwrap();
        assert_eq!(diag.safe_term, 0.0);
        assert_eq!(diag.unsafe_term, 0.0);
        assert_eq!(diag.safe_satisfied_pct, 100.0);
    }

    #[test]
    fn test_unsafe_term_penalizes_low_values() {
        // safe_level far above any tanh-bounded V: every unsafe point violates
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(4);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let all = masks::<TestBackend>(&[true; 4]);
        let none = masks::<TestBackend>(&[false; 4]);

        let out = lyapunov_loss(&x, goal, none, all, &net, 0.1, 100.0, 0.001, true).unwrap();
        let diag = out.diagnostics.unwrap();
        assert_eq!(diag.unsafe_satisfied_pct, 0.0);
        // V ≤ n_hidden / 2 = 4, so each point contributes at least 100·96
        assert!(diag.unsafe_term >= REGION_WEIGHT * 96.0);
    }

    #[test]
    fn test_magnitude_mode_matches_control_norm() {
        let mut net = pvtol_net::<TestBackend>();
        net.set_use_qp(false);
        let x = states::<TestBackend>(5);
        let output = net.forward(x.clone()).unwrap();
        let u: Vec<f64> = output.u.clone().into_data().to_vec().unwrap();
        let expected = 0.5 * u.iter().map(|v| v * v).sum::<f64>() / 5.0;

        let out = controller_loss_with_output(
            &x,
            &output,
            &net,
            ControllerLossMode::Magnitude,
            0.5,
            true,
        )
        .unwrap();
        let value: f64 = out.loss.into_scalar().elem();
        assert!((value - expected).abs() < 1e-9 * (1.0 + expected));
        assert_eq!(out.diagnostics.unwrap().controller_term, value);
    }

    #[test]
    fn test_equilibrium_mode_targets_hover_thrust() {
        let mut net = pvtol_net::<TestBackend>();
        net.set_use_qp(false);
        let x = states::<TestBackend>(3);
        let output = net.forward(x.clone()).unwrap();
        let u: Vec<f64> = output.u.clone().into_data().to_vec().unwrap();
        let hover = 9.81 / 2.0;
        let expected = u.iter().map(|v| (v - hover).powi(2)).sum::<f64>() / 3.0;

        let out = controller_loss_with_output(
            &x,
            &output,
            &net,
            ControllerLossMode::Equilibrium,
            1.0,
            false,
        )
        .unwrap();
        let value: f64 = out.loss.into_scalar().elem();
        assert!((value - expected).abs() < 1e-8 * (1.0 + expected));
    }

    #[test]
    fn test_mask_length_mismatch_is_rejected() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(4);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let short = masks::<TestBackend>(&[true; 3]);
        let full = masks::<TestBackend>(&[false; 4]);

        let err = lyapunov_loss(
            &x,
            goal.clone(),
            short.clone(),
            full.clone(),
            &net,
            0.1,
            1.0,
            0.001,
            false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClfError::Dimension {
                what: "safe mask length",
                expected: 4,
                got: 3
            }
        ));

        let output = net.forward(x.clone()).unwrap();
        let err = lyapunov_loss_with_output(
            &x, &output, goal, full, short, &net, 0.1, 1.0, 0.001, false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClfError::Dimension {
                what: "unsafe mask length",
                ..
            }
        ));
    }

    #[test]
    fn test_goal_dimension_mismatch_is_rejected() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(4);
        let all = masks::<TestBackend>(&[true; 4]);

        let wide = Tensor::<TestBackend, 2>::zeros([1, 5], &Default::default());
        let err = lyapunov_loss(&x, wide, all.clone(), all.clone(), &net, 0.1, 1.0, 0.001, false)
            .unwrap_err();
        assert!(matches!(
            err,
            ClfError::Dimension {
                what: "goal state dimension",
                expected: 6,
                got: 5
            }
        ));

        let empty = Tensor::<TestBackend, 2>::zeros([0, 6], &Default::default());
        let err = lyapunov_loss(&x, empty, all.clone(), all, &net, 0.1, 1.0, 0.001, false)
            .unwrap_err();
        assert!(matches!(err, ClfError::InvalidData(_)));
    }

    #[test]
    fn test_output_from_other_batch_is_rejected() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(4);
        let other = net.forward(states::<TestBackend>(5)).unwrap();
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let all = masks::<TestBackend>(&[true; 4]);

        let err = lyapunov_loss_with_output(
            &x, &other, goal, all.clone(), all, &net, 0.1, 1.0, 0.001, false,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ClfError::Dimension {
                what: "control rows",
                expected: 4,
                got: 5
            }
        ));

        let err = controller_loss_with_output(
            &x,
            &other,
            &net,
            ControllerLossMode::Magnitude,
            1.0,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ClfError::Dimension { .. }));
    }

    #[test]
    fn test_diagnostics_count_mask_members() {
        let net = pvtol_net::<TestBackend>();
        let x = states::<TestBackend>(5);
        let goal = Tensor::<TestBackend, 2>::zeros([1, 6], &Default::default());
        let safe = masks::<TestBackend>(&[true, true, false, true, false]);
        let unsafe_ = masks::<TestBackend>(&[false, false, true, false, false]);

        let diag = lyapunov_loss(&x, goal, safe, unsafe_, &net, 0.1, 1.0, 0.001, true)
            .unwrap()
            .diagnostics
            .unwrap();
        assert_eq!(diag.safe_count, 3);
        assert_eq!(diag.unsafe_count, 1);
    }

    #[test]
    fn test_losses_backpropagate_into_both_networks() {
        use burn::optim::GradientsParams;

        let net = pvtol_net::<TestAutodiffBackend>();
        let x = states::<TestAutodiffBackend>(4);
        let goal = Tensor::<TestAutodiffBackend, 2>::zeros([1, 6], &Default::default());
        let all = masks::<TestAutodiffBackend>(&[true; 4]);
        let none = masks::<TestAutodiffBackend>(&[false; 4]);

        let lyap = lyapunov_loss(&x, goal, all, none, &net, 0.1, 0.0, 0.001, false).unwrap();
        let ctrl =
            controller_loss(&x, &net, ControllerLossMode::Nominal, 1.0, false).unwrap();
        let loss = lyap.loss + ctrl.loss;
        let grads = GradientsParams::from_grads(loss.backward(), &net.network);

        let lyap_grad = grads
            .get::<TestBackend, 2>(net.network.lyapunov.layer1.weight.id)
            .expect("Lyapunov layer 1 should have a gradient");
        let lyap_sum: f64 = lyap_grad.abs().sum().into_scalar().elem();
        assert!(lyap_sum > 0.0, "Lyapunov gradient is zero");

        let ctrl_grad = grads
            .get::<TestBackend, 2>(net.network.controller.rows[0].output.weight.id)
            .expect("gain row should have a gradient");
        let ctrl_sum: f64 = ctrl_grad.abs().sum().into_scalar().elem();
        assert!(ctrl_sum > 0.0, "controller gradient is zero");
    }
}
