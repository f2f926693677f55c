//! End-to-end solves and sensitivities on problems with hand-derived optima.

use clf_qp::{ClfQp, ClfQpParams, ClfQpStructure, ControlPolytope, QpSettings};

fn scalar_problem(lambda: f64, bounds: Option<ControlPolytope>) -> ClfQp {
    ClfQp::new(
        ClfQpStructure {
            n_controls: 1,
            n_scenarios: 1,
            clf_lambda: lambda,
            control_bounds: bounds,
        },
        QpSettings::default(),
    )
    .unwrap()
}

fn scalar_params(lf: f64, lg: f64, v: f64, u_target: f64, penalty: f64) -> ClfQpParams {
    ClfQpParams {
        lf_v: vec![lf],
        lg_v: vec![lg],
        v,
        u_target: vec![u_target],
        relaxation_penalty: penalty,
    }
}

fn assert_close(actual: f64, expected: f64, tol: f64, what: &str) {
    assert!(
        (actual - expected).abs() < tol,
        "{what}: expected {expected}, got {actual}"
    );
}

/// Two controls, two scenarios and a polytope, with the first CLF row and
/// the `u₂ ≥ -0.7` bound strictly active. Optimum `u = (-1.15, -0.7)`, `r = 0`.
fn coupled_problem() -> (ClfQp, ClfQpParams) {
    let bounds = ControlPolytope::new(
        vec![
            vec![0.0, -1.0],
            vec![0.0, 1.0],
            vec![1.0, 0.0],
            vec![-1.0, 0.0],
        ],
        vec![0.7, 5.0, 5.0, 5.0],
        2,
    )
    .unwrap();
    let qp = ClfQp::new(
        ClfQpStructure {
            n_controls: 2,
            n_scenarios: 2,
            clf_lambda: 0.5,
            control_bounds: Some(bounds),
        },
        QpSettings::default(),
    )
    .unwrap();
    let params = ClfQpParams {
        lf_v: vec![1.0, -3.0],
        lg_v: vec![1.0, 0.5, -0.3, 1.0],
        v: 1.0,
        u_target: vec![0.2, -0.1],
        relaxation_penalty: 10.0,
    };
    (qp, params)
}

fn flatten(params: &ClfQpParams) -> Vec<f64> {
    params
        .lf_v
        .iter()
        .chain(&params.lg_v)
        .chain(std::iter::once(&params.v))
        .chain(&params.u_target)
        .copied()
        .collect()
}

#[test]
fn test_active_clf_constraint() {
    // 1 + u + 0.5 ≤ r, cost u² + 10r: u = -1.5, r = 0
    let qp = scalar_problem(0.5, None);
    let params = scalar_params(1.0, 1.0, 1.0, 0.0, 10.0);
    let sol = qp.solve(&params).unwrap();
    assert_close(sol.u[0], -1.5, 1e-6, "u");
    assert_close(sol.relaxations[0], 0.0, 1e-6, "r");
    assert_close(sol.duals[0], 3.0, 1e-5, "CLF multiplier");

    let jac = qp.jacobian(&params, &sol).unwrap();
    assert_eq!(jac.shape(), (2, 4));
    let layout = qp.parameter_layout();
    assert_close(jac[(0, layout.lf_offset())], -1.0, 1e-5, "du/dlf");
    assert_close(jac[(0, layout.lg_offset())], 1.5, 1e-5, "du/dlg");
    assert_close(jac[(0, layout.v_offset())], -0.5, 1e-5, "du/dV");
    assert_close(jac[(0, layout.u_target_offset())], 0.0, 1e-5, "du/du_t");
    for k in 0..4 {
        assert_close(jac[(1, k)], 0.0, 1e-5, "dr");
    }
}

#[test]
fn test_inactive_constraint_passes_target_through() {
    let qp = scalar_problem(0.0, None);
    let params = scalar_params(-5.0, 1.0, 1.0, 1.0, 10.0);
    let sol = qp.solve(&params).unwrap();
    assert_close(sol.u[0], 1.0, 1e-6, "u");
    assert_close(sol.relaxations[0], 0.0, 1e-6, "r");

    let jac = qp.jacobian(&params, &sol).unwrap();
    let layout = qp.parameter_layout();
    assert_close(jac[(0, layout.u_target_offset())], 1.0, 1e-5, "du/du_t");
    assert_close(jac[(0, layout.lf_offset())], 0.0, 1e-5, "du/dlf");
}

#[test]
fn test_cheap_relaxation_is_used() {
    // r = 10 + u, cost u² + u + 10: u = -0.5, r = 9.5
    let qp = scalar_problem(0.0, None);
    let params = scalar_params(10.0, 1.0, 1.0, 0.0, 1.0);
    let sol = qp.solve(&params).unwrap();
    assert_close(sol.u[0], -0.5, 1e-6, "u");
    assert_close(sol.relaxations[0], 9.5, 1e-6, "r");

    let jac = qp.jacobian(&params, &sol).unwrap();
    let layout = qp.parameter_layout();
    assert_close(jac[(1, layout.lf_offset())], 1.0, 1e-5, "dr/dlf");
    assert_close(jac[(0, layout.lf_offset())], 0.0, 1e-5, "du/dlf");
    assert_close(jac[(0, layout.u_target_offset())], 1.0, 1e-5, "du/du_t");
    assert_close(jac[(1, layout.u_target_offset())], 1.0, 1e-5, "dr/du_t");
}

#[test]
fn test_polytope_clamps_control() {
    // |u| ≤ 0.5 blocks u = -1.5, so the relaxation absorbs the rest
    let bounds = ControlPolytope::new(vec![vec![1.0], vec![-1.0]], vec![0.5, 0.5], 1).unwrap();
    let qp = scalar_problem(0.5, Some(bounds.clone()));
    let params = scalar_params(1.0, 1.0, 1.0, 0.0, 10.0);
    let sol = qp.solve(&params).unwrap();

    for (row, h) in bounds.g().iter().zip(bounds.h()) {
        let violation = row[0] * sol.u[0] - h;
        assert!(violation <= 1e-6, "G·u - h = {violation}");
    }
    assert_close(sol.u[0], -0.5, 1e-6, "u");
    assert_close(sol.relaxations[0], 1.0, 1e-6, "r");
}

#[test]
fn test_solution_satisfies_every_constraint() {
    let (qp, params) = coupled_problem();
    let sol = qp.solve(&params).unwrap();
    assert_close(sol.u[0], -1.15, 1e-6, "u1");
    assert_close(sol.u[1], -0.7, 1e-6, "u2");

    let m = 2;
    for s in 0..2 {
        let lg_u: f64 = (0..m).map(|j| params.lg_v[s * m + j] * sol.u[j]).sum();
        let row = params.lf_v[s] + lg_u + 0.5 * params.v - sol.relaxations[s];
        assert!(row <= 1e-6, "CLF row {s} violated: {row}");
        assert!(sol.relaxations[s] >= -1e-6, "negative relaxation {s}");
    }
    assert!(sol.iterations > 0);
}

#[test]
fn test_jacobian_matches_finite_differences() {
    let (qp, params) = coupled_problem();
    let sol = qp.solve(&params).unwrap();
    let jac = qp.jacobian(&params, &sol).unwrap();

    let base = flatten(&params);
    let layout = qp.parameter_layout();
    let h = 1e-3;
    for k in 0..base.len() {
        let mut plus = base.clone();
        plus[k] += h;
        let mut minus = base.clone();
        minus[k] -= h;
        let z_plus = qp
            .solve(&layout.unflatten(&plus, params.relaxation_penalty).unwrap())
            .unwrap()
            .decision();
        let z_minus = qp
            .solve(&layout.unflatten(&minus, params.relaxation_penalty).unwrap())
            .unwrap()
            .decision();
        for i in 0..qp.n_decision() {
            let fd = (z_plus[i] - z_minus[i]) / (2.0 * h);
            assert!(
                (fd - jac[(i, k)]).abs() < 1e-3 * (1.0 + fd.abs()),
                "∂z{i}/∂p{k}: finite difference {fd}, KKT {}",
                jac[(i, k)]
            );
        }
    }
}

#[test]
fn test_repeated_solves_reuse_structure() {
    let qp = scalar_problem(0.5, None);
    let first = qp.solve(&scalar_params(1.0, 1.0, 1.0, 0.0, 10.0)).unwrap();
    let second = qp.solve(&scalar_params(-5.0, 1.0, 1.0, 1.0, 10.0)).unwrap();
    let again = qp.solve(&scalar_params(1.0, 1.0, 1.0, 0.0, 10.0)).unwrap();
    assert_close(first.u[0], -1.5, 1e-6, "first");
    assert_close(second.u[0], 1.0, 1e-6, "second");
    assert_eq!(first.u, again.u);
}
