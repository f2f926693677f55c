//! Problem construction and the clarabel solve.

use clarabel::algebra::CscMatrix;
use clarabel::solver::{
    DefaultSettingsBuilder, DefaultSolver, IPSolver, SolverStatus, SupportedConeT,
};
use nalgebra::DMatrix;

use crate::sensitivity;
use crate::types::{
    ClfQpParams, ClfQpSolution, ClfQpStructure, ConstraintId, ParameterLayout, QpError,
    QpSettings,
};

/// A CLF-QP with fixed structure, solved repeatedly for new parameters.
///
/// The decision vector is `z = [u (m); r (S)]` and the constraint rows are
/// `[CLF_s (S); -r_s ≤ 0 (S); G·u ≤ h (K)]`, all in one non-negative cone.
/// The sparsity pattern of `A` is computed once; a solve only writes values.
#[derive(Debug, Clone)]
pub struct ClfQp {
    structure: ClfQpStructure,
    settings: QpSettings,
    /// Column pointers of `A` (length `n + 1`).
    a_colptr: Vec<usize>,
    /// Row indices of `A`, sorted within each column.
    a_rowval: Vec<usize>,
    /// Values of `A` that never change: relaxation and polytope entries.
    /// The `L_gV` slots are overwritten per solve.
    a_nzval: Vec<f64>,
}

impl ClfQp {
    /// Build the problem once and verify it is a convex QP.
    pub fn new(structure: ClfQpStructure, settings: QpSettings) -> Result<Self, QpError> {
        verify_convex(&structure, &settings)?;

        let m = structure.n_controls;
        let s_count = structure.n_scenarios;
        let bounds = structure.control_bounds.as_ref();
        let k_rows = bounds.map_or(0, |b| b.n_rows());

        let mut colptr = Vec::with_capacity(m + s_count + 1);
        let mut rowval = Vec::new();
        let mut nzval = Vec::new();

        colptr.push(0);
        for j in 0..m {
            for s in 0..s_count {
                rowval.push(s);
                nzval.push(0.0);
            }
            if let Some(bounds) = bounds {
                // Zeros are kept so the pattern stays fixed
                for (k, row) in bounds.g().iter().enumerate() {
                    rowval.push(2 * s_count + k);
                    nzval.push(row[j]);
                }
            }
            colptr.push(rowval.len());
        }
        for s in 0..s_count {
            rowval.push(s);
            nzval.push(-1.0);
            rowval.push(s_count + s);
            nzval.push(-1.0);
            colptr.push(rowval.len());
        }

        tracing::debug!(
            n_controls = m,
            n_scenarios = s_count,
            n_bounds = k_rows,
            nnz = nzval.len(),
            "built CLF-QP structure"
        );

        Ok(Self {
            structure,
            settings,
            a_colptr: colptr,
            a_rowval: rowval,
            a_nzval: nzval,
        })
    }

    pub fn structure(&self) -> &ClfQpStructure {
        &self.structure
    }

    pub fn settings(&self) -> &QpSettings {
        &self.settings
    }

    /// Order of the differentiable parameters.
    pub fn parameter_layout(&self) -> ParameterLayout {
        ParameterLayout {
            n_controls: self.structure.n_controls,
            n_scenarios: self.structure.n_scenarios,
        }
    }

    pub fn n_decision(&self) -> usize {
        self.structure.n_controls + self.structure.n_scenarios
    }

    pub fn n_constraints(&self) -> usize {
        2 * self.structure.n_scenarios + self.n_bound_rows()
    }

    fn n_bound_rows(&self) -> usize {
        self.structure
            .control_bounds
            .as_ref()
            .map_or(0, |b| b.n_rows())
    }

    /// Identify a constraint row.
    pub fn constraint_id(&self, row: usize) -> ConstraintId {
        let s_count = self.structure.n_scenarios;
        if row < s_count {
            ConstraintId::Clf { scenario: row }
        } else if row < 2 * s_count {
            ConstraintId::Relaxation {
                scenario: row - s_count,
            }
        } else {
            ConstraintId::ControlBound {
                row: row - 2 * s_count,
            }
        }
    }

    /// Solve for the given parameter values.
    pub fn solve(&self, params: &ClfQpParams) -> Result<ClfQpSolution, QpError> {
        self.check_params(params)?;
        let m = self.structure.n_controls;
        let s_count = self.structure.n_scenarios;
        let n = self.n_decision();

        // P = 2I on the u block, upper triangular
        let p_colptr: Vec<usize> = (0..=n).map(|j| j.min(m)).collect();
        let p_rowval: Vec<usize> = (0..m).collect();
        let p_nzval = vec![2.0; m];
        let p = CscMatrix::new(n, n, p_colptr, p_rowval, p_nzval);

        let q: Vec<f64> = params
            .u_target
            .iter()
            .map(|u| -2.0 * u)
            .chain(std::iter::repeat(params.relaxation_penalty).take(s_count))
            .collect();

        let a = CscMatrix::new(
            self.n_constraints(),
            n,
            self.a_colptr.clone(),
            self.a_rowval.clone(),
            self.a_values(params),
        );
        let b = self.constraint_rhs(params);

        let settings = DefaultSettingsBuilder::default()
            .max_iter(self.settings.max_iterations)
            .verbose(false)
            .build()
            .map_err(|e| QpError::Settings(e.to_string()))?;
        let cones = [SupportedConeT::NonnegativeConeT(self.n_constraints())];

        let mut solver = DefaultSolver::new(&p, &q, &a, &b, &cones, settings);
        solver.solve();

        let solution = &solver.solution;
        match solution.status {
            SolverStatus::Solved | SolverStatus::AlmostSolved => {}
            status => {
                return Err(QpError::Solver {
                    status: format!("{status:?}"),
                    iterations: solution.iterations,
                });
            }
        }
        if solution.status == SolverStatus::AlmostSolved {
            tracing::debug!(
                iterations = solution.iterations,
                "CLF-QP reached reduced accuracy"
            );
        }

        let result = ClfQpSolution {
            u: solution.x[..m].to_vec(),
            relaxations: solution.x[m..].to_vec(),
            duals: solution.z.clone(),
            slacks: solution.s.clone(),
            iterations: solution.iterations,
        };
        self.check_feasible(params, &result)?;
        Ok(result)
    }

    /// Sensitivity `∂[u; r]/∂[lf_v, lg_v, v, u_target]` at a solution,
    /// shape `(m + S, n_params)`.
    pub fn jacobian(
        &self,
        params: &ClfQpParams,
        solution: &ClfQpSolution,
    ) -> Result<DMatrix<f64>, QpError> {
        self.check_params(params)?;
        sensitivity::kkt_jacobian(self, params, solution)
    }

    /// Dense copy of `A` for the given parameters.
    pub(crate) fn dense_constraints(&self, params: &ClfQpParams) -> DMatrix<f64> {
        let values = self.a_values(params);
        let mut dense = DMatrix::zeros(self.n_constraints(), self.n_decision());
        for col in 0..self.n_decision() {
            for idx in self.a_colptr[col]..self.a_colptr[col + 1] {
                dense[(self.a_rowval[idx], col)] = values[idx];
            }
        }
        dense
    }

    fn a_values(&self, params: &ClfQpParams) -> Vec<f64> {
        let m = self.structure.n_controls;
        let s_count = self.structure.n_scenarios;
        let mut values = self.a_nzval.clone();
        for j in 0..m {
            let start = self.a_colptr[j];
            for s in 0..s_count {
                values[start + s] = params.lg_v[s * m + j];
            }
        }
        values
    }

    /// `b = [-(L_fV_s + λV); 0; h]`.
    pub(crate) fn constraint_rhs(&self, params: &ClfQpParams) -> Vec<f64> {
        let lambda_v = self.structure.clf_lambda * params.v;
        let mut b: Vec<f64> = params.lf_v.iter().map(|lf| -(lf + lambda_v)).collect();
        b.extend(std::iter::repeat(0.0).take(self.structure.n_scenarios));
        if let Some(bounds) = &self.structure.control_bounds {
            b.extend_from_slice(bounds.h());
        }
        b
    }

    fn check_params(&self, params: &ClfQpParams) -> Result<(), QpError> {
        let m = self.structure.n_controls;
        let s_count = self.structure.n_scenarios;
        for (what, expected, got) in [
            ("lf_v length", s_count, params.lf_v.len()),
            ("lg_v length", s_count * m, params.lg_v.len()),
            ("u_target length", m, params.u_target.len()),
        ] {
            if expected != got {
                return Err(QpError::Dimension {
                    what,
                    expected,
                    got,
                });
            }
        }

        let finite = |name: &'static str, values: &[f64]| {
            values
                .iter()
                .find(|v| !v.is_finite())
                .map_or(Ok(()), |&value| Err(QpError::InvalidParameter { name, value }))
        };
        finite("lf_v", &params.lf_v)?;
        finite("lg_v", &params.lg_v)?;
        finite("u_target", &params.u_target)?;
        if !params.v.is_finite() || params.v < 0.0 {
            return Err(QpError::InvalidParameter {
                name: "v",
                value: params.v,
            });
        }
        if !params.relaxation_penalty.is_finite() || params.relaxation_penalty < 0.0 {
            return Err(QpError::InvalidParameter {
                name: "relaxation_penalty",
                value: params.relaxation_penalty,
            });
        }
        Ok(())
    }

    fn check_feasible(&self, params: &ClfQpParams, solution: &ClfQpSolution) -> Result<(), QpError> {
        let a = self.dense_constraints(params);
        let b = self.constraint_rhs(params);
        let z = DMatrix::from_column_slice(self.n_decision(), 1, &solution.decision());
        let az = &a * z;

        let tolerance = self.settings.feasibility_tolerance;
        for (row, b_i) in b.iter().enumerate() {
            let residual = az[(row, 0)] - b_i;
            if !residual.is_finite() || residual > tolerance * (1.0 + b_i.abs()) {
                return Err(QpError::Violation {
                    constraint: self.constraint_id(row),
                    residual,
                });
            }
        }
        Ok(())
    }
}

fn verify_convex(structure: &ClfQpStructure, settings: &QpSettings) -> Result<(), QpError> {
    if structure.n_scenarios == 0 {
        return Err(QpError::NoScenarios);
    }
    if structure.n_controls == 0 {
        return Err(QpError::NotConvex("no control inputs".to_string()));
    }
    if !structure.clf_lambda.is_finite() || structure.clf_lambda < 0.0 {
        return Err(QpError::NotConvex(format!(
            "CLF rate must be finite and non-negative, got {}",
            structure.clf_lambda
        )));
    }
    if let Some(bounds) = &structure.control_bounds {
        if let Some(row) = bounds.g().iter().find(|row| row.len() != structure.n_controls) {
            return Err(QpError::Dimension {
                what: "control bound G columns",
                expected: structure.n_controls,
                got: row.len(),
            });
        }
    }
    if settings.max_iterations == 0 {
        return Err(QpError::Settings("max_iterations must be positive".to_string()));
    }
    if !(settings.feasibility_tolerance > 0.0) || !(settings.sensitivity_rcond > 0.0) {
        return Err(QpError::Settings(
            "tolerances must be positive".to_string(),
        ));
    }
    Ok(())
}
