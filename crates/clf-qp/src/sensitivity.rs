//! Implicit differentiation of the QP optimum.
//!
//! At a primal-dual optimum `(z, μ, s)` of `min ½zᵀPz + qᵀz  s.t. Az + s = b,
//! s ≥ 0`, perturbing the data gives the linear system
//!
//! ```text
//! [ P       Aᵀ    ] [dz]     [ dq + dAᵀμ        ]
//! [ D(μ)A  -D(s)  ] [dμ] = - [ D(μ)(dA·z - db)  ]
//! ```
//!
//! with one right-hand side per differentiable parameter. The system is
//! solved by SVD least squares so weakly active constraints (both `μ` and
//! `s` near zero) do not break the solve.

use nalgebra::DMatrix;

use crate::problem::ClfQp;
use crate::types::{ClfQpParams, ClfQpSolution, QpError};

pub(crate) fn kkt_jacobian(
    qp: &ClfQp,
    params: &ClfQpParams,
    solution: &ClfQpSolution,
) -> Result<DMatrix<f64>, QpError> {
    let structure = qp.structure();
    let layout = qp.parameter_layout();
    let m = structure.n_controls;
    let s_count = structure.n_scenarios;
    let n = qp.n_decision();
    let n_con = qp.n_constraints();

    if solution.u.len() != m || solution.relaxations.len() != s_count {
        return Err(QpError::Dimension {
            what: "solution decision vector",
            expected: n,
            got: solution.u.len() + solution.relaxations.len(),
        });
    }
    if solution.duals.len() != n_con || solution.slacks.len() != n_con {
        return Err(QpError::Dimension {
            what: "solution duals/slacks",
            expected: n_con,
            got: solution.duals.len().min(solution.slacks.len()),
        });
    }

    let a = qp.dense_constraints(params);
    let mu = &solution.duals;
    let slack = &solution.slacks;

    let dim = n + n_con;
    let mut kkt = DMatrix::<f64>::zeros(dim, dim);
    for j in 0..m {
        kkt[(j, j)] = 2.0;
    }
    kkt.view_mut((0, n), (n, n_con)).copy_from(&a.transpose());
    for i in 0..n_con {
        for j in 0..n {
            kkt[(n + i, j)] = mu[i] * a[(i, j)];
        }
        kkt[(n + i, n + i)] = -slack[i];
    }

    let lambda = structure.clf_lambda;
    let mut rhs = DMatrix::<f64>::zeros(dim, layout.n_params());
    for s in 0..s_count {
        let mu_s = mu[s];
        rhs[(n + s, layout.lf_offset() + s)] = -mu_s;
        rhs[(n + s, layout.v_offset())] = -mu_s * lambda;
        for j in 0..m {
            let col = layout.lg_offset() + s * m + j;
            rhs[(j, col)] = -mu_s;
            rhs[(n + s, col)] = -mu_s * solution.u[j];
        }
    }
    for j in 0..m {
        rhs[(j, layout.u_target_offset() + j)] = 2.0;
    }

    let svd = kkt.svd(true, true);
    let largest = svd.singular_values.max();
    if !largest.is_finite() {
        return Err(QpError::Sensitivity(
            "KKT matrix has non-finite entries".to_string(),
        ));
    }
    let eps = qp.settings().sensitivity_rcond * largest.max(1.0);
    let solved = svd
        .solve(&rhs, eps)
        .map_err(|e| QpError::Sensitivity(e.to_string()))?;

    Ok(solved.rows(0, n).into_owned())
}
