//! Cross-module checks: linearization, Riccati solve and the batched nominal
//! controller agree with each other for every bundled model.

use burn::backend::ndarray::NdArray;
use burn::prelude::*;
use burn::tensor::{Distribution, TensorData};
use nalgebra::DMatrix;

use dynamics::{solve_care, ControlAffine, Pvtol, PvtolParams, Quad9d, QuadParams};

type TestBackend = NdArray<f64>;

/// `P` from the CARE must certify the LQR loop: `P ≻ 0` and
/// `(A-BK)ᵀP + P(A-BK) = -(Q + KᵀK) ≺ 0` with `Q = I`.
fn assert_lqr_certificate<D: ControlAffine>(model: &D, scenario: &D::Scenario) {
    let n = model.n_dims();
    let m = model.n_controls();
    let (a, b) = model.linearize(scenario);
    let q = DMatrix::identity(n, n);
    let r = DMatrix::identity(m, m);
    let p = solve_care(&a, &b, &q, &r).unwrap();
    let k = model.lqr_gain(scenario).unwrap();

    let p_min = p.clone().symmetric_eigenvalues().min();
    assert!(p_min > 0.0, "{}: P is not positive definite ({p_min})", model.name());

    let closed = &a - &b * &k;
    let lyap = closed.transpose() * &p + &p * &closed;
    let expected = -(q + k.transpose() * &k);
    let residual = (&lyap - &expected).abs().max();
    assert!(residual < 1e-6, "{}: Lyapunov residual {residual}", model.name());

    let sym = (&lyap + lyap.transpose()) * 0.5;
    let max_eig = sym.symmetric_eigenvalues().max();
    assert!(max_eig < 0.0, "{}: closed loop not certified ({max_eig})", model.name());
}

/// The batched law equals `u_eq - K(x - x_goal)` row by row.
fn assert_nominal_matches_host<D: ControlAffine>(model: &D, scenario: &D::Scenario) {
    let n = model.n_dims();
    let m = model.n_controls();
    let x = Tensor::<TestBackend, 2>::random([5, n], Distribution::Uniform(-1.0, 1.0), &Default::default());
    let rows: Vec<f64> = x.clone().into_data().to_vec().unwrap();
    let u: Vec<f64> = model.nominal_control(&x, scenario).unwrap().into_data().to_vec().unwrap();

    let k = model.lqr_gain(scenario).unwrap();
    let u_eq = model.equilibrium_control(scenario);
    let goal = model.goal_state();
    for row in 0..5 {
        for j in 0..m {
            let feedback: f64 = (0..n).map(|i| k[(j, i)] * (rows[row * n + i] - goal[i])).sum();
            let expected = u_eq[j] - feedback;
            let got = u[row * m + j];
            assert!((got - expected).abs() < 1e-10, "{}: u[{row}, {j}] = {got}, expected {expected}", model.name());
        }
    }
}

#[test]
fn test_pvtol_lqr_loop() {
    assert_lqr_certificate(&Pvtol, &PvtolParams::default());
    assert_lqr_certificate(
        &Pvtol,
        &PvtolParams {
            mass: 1.5,
            inertia: 0.015,
        },
    );
    assert_nominal_matches_host(&Pvtol, &PvtolParams::default());
}

#[test]
fn test_quad9d_lqr_loop() {
    assert_lqr_certificate(&Quad9d, &QuadParams::default());
    assert_lqr_certificate(&Quad9d, &QuadParams { mass: 1.5 });
    assert_nominal_matches_host(&Quad9d, &QuadParams { mass: 1.5 });
}

#[test]
fn test_scenario_changes_nominal_control() {
    let x = Tensor::<TestBackend, 2>::from_data(
        TensorData::new(vec![0.0; 6], [1, 6]),
        &Default::default(),
    );
    let light: Vec<f64> = Pvtol
        .nominal_control(&x, &PvtolParams::default())
        .unwrap()
        .into_data()
        .to_vec()
        .unwrap();
    let heavy: Vec<f64> = Pvtol
        .nominal_control(
            &x,
            &PvtolParams {
                mass: 1.5,
                inertia: 0.015,
            },
        )
        .unwrap()
        .into_data()
        .to_vec()
        .unwrap();
    assert!((heavy[0] - 1.5 * light[0]).abs() < 1e-9);
}
