use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors raised while building, solving or differentiating the CLF-QP.
#[derive(Debug, thiserror::Error)]
pub enum QpError {
    /// The scenario list was empty.
    #[error("at least one scenario is required")]
    NoScenarios,

    /// A matrix or vector had the wrong size.
    #[error("{what}: expected {expected}, got {got}")]
    Dimension {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    /// The problem data does not describe a convex QP.
    #[error("problem is not convex-representable: {0}")]
    NotConvex(String),

    /// A bound parameter is outside its domain (non-finite or negative).
    #[error("invalid parameter {name} = {value}")]
    InvalidParameter { name: &'static str, value: f64 },

    /// Solver settings could not be built.
    #[error("solver settings rejected: {0}")]
    Settings(String),

    /// The solver stopped without reaching an optimum.
    #[error("solver stopped with status {status} after {iterations} iterations")]
    Solver { status: String, iterations: u32 },

    /// The reported optimum violates a constraint beyond tolerance.
    #[error("constraint {constraint} violated by {residual:.3e} after solve")]
    Violation {
        constraint: ConstraintId,
        residual: f64,
    },

    /// The KKT system at the optimum could not be solved.
    #[error("KKT sensitivity failed: {0}")]
    Sensitivity(String),
}

/// Identifies one constraint row of the QP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintId {
    /// Relaxed CLF descent condition for a scenario.
    Clf { scenario: usize },
    /// Non-negativity of a scenario's relaxation.
    Relaxation { scenario: usize },
    /// Row of the control polytope `G·u ≤ h`.
    ControlBound { row: usize },
}

impl fmt::Display for ConstraintId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintId::Clf { scenario } => write!(f, "CLF descent (scenario {scenario})"),
            ConstraintId::Relaxation { scenario } => {
                write!(f, "relaxation >= 0 (scenario {scenario})")
            }
            ConstraintId::ControlBound { row } => write!(f, "control bound row {row}"),
        }
    }
}

/// Polyhedral control bounds `G·u ≤ h`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlPolytope {
    g: Vec<Vec<f64>>,
    h: Vec<f64>,
}

impl ControlPolytope {
    /// Validate and wrap `G` (rows of length `n_controls`) and `h`.
    pub fn new(g: Vec<Vec<f64>>, h: Vec<f64>, n_controls: usize) -> Result<Self, QpError> {
        if g.len() != h.len() {
            return Err(QpError::Dimension {
                what: "control bound h rows",
                expected: g.len(),
                got: h.len(),
            });
        }
        for row in &g {
            if row.len() != n_controls {
                return Err(QpError::Dimension {
                    what: "control bound G columns",
                    expected: n_controls,
                    got: row.len(),
                });
            }
        }
        if g.iter().flatten().chain(h.iter()).any(|v| !v.is_finite()) {
            return Err(QpError::NotConvex(
                "control bounds contain non-finite entries".to_string(),
            ));
        }
        Ok(Self { g, h })
    }

    pub fn n_rows(&self) -> usize {
        self.h.len()
    }

    pub fn g(&self) -> &[Vec<f64>] {
        &self.g
    }

    pub fn h(&self) -> &[f64] {
        &self.h
    }
}

/// Fixed structure of a CLF-QP, chosen once at construction.
#[derive(Debug, Clone, PartialEq)]
pub struct ClfQpStructure {
    pub n_controls: usize,
    pub n_scenarios: usize,
    /// Exponential convergence rate `λ` in the CLF condition.
    pub clf_lambda: f64,
    pub control_bounds: Option<ControlPolytope>,
}

/// Solver options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QpSettings {
    /// Interior-point iteration cap.
    pub max_iterations: u32,
    /// Post-solve constraint tolerance, relative to `1 + |rhs|`.
    pub feasibility_tolerance: f64,
    /// Singular values below this fraction of the largest are dropped when
    /// solving the KKT sensitivity system.
    pub sensitivity_rcond: f64,
}

impl Default for QpSettings {
    fn default() -> Self {
        Self {
            max_iterations: 500,
            feasibility_tolerance: 1e-6,
            sensitivity_rcond: 1e-10,
        }
    }
}

/// Parameter values bound for one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct ClfQpParams {
    /// `L_fV_s`, one per scenario.
    pub lf_v: Vec<f64>,
    /// `L_gV_s`, row-major `(n_scenarios, n_controls)`.
    pub lg_v: Vec<f64>,
    /// Lyapunov value `V ≥ 0`.
    pub v: f64,
    /// Control the QP stays close to.
    pub u_target: Vec<f64>,
    /// Cost `ρ ≥ 0` per unit of relaxation.
    pub relaxation_penalty: f64,
}

/// Optimal point and certificate of one solve.
#[derive(Debug, Clone, PartialEq)]
pub struct ClfQpSolution {
    pub u: Vec<f64>,
    pub relaxations: Vec<f64>,
    /// Constraint multipliers, in constraint-row order.
    pub duals: Vec<f64>,
    /// Constraint slacks `h - A·z`, in constraint-row order.
    pub slacks: Vec<f64>,
    pub iterations: u32,
}

impl ClfQpSolution {
    /// Decision vector `[u; r]`.
    pub fn decision(&self) -> Vec<f64> {
        self.u.iter().chain(&self.relaxations).copied().collect()
    }
}

/// Order of the differentiable parameters in a flat vector:
/// `[lf_v (S), lg_v (S·m), v (1), u_target (m)]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParameterLayout {
    pub n_controls: usize,
    pub n_scenarios: usize,
}

impl ParameterLayout {
    pub fn lf_offset(&self) -> usize {
        0
    }

    pub fn lg_offset(&self) -> usize {
        self.n_scenarios
    }

    pub fn v_offset(&self) -> usize {
        self.n_scenarios * (1 + self.n_controls)
    }

    pub fn u_target_offset(&self) -> usize {
        self.v_offset() + 1
    }

    /// Total number of differentiable parameters.
    pub fn n_params(&self) -> usize {
        self.u_target_offset() + self.n_controls
    }

    /// Number of decision variables `[u; r]`.
    pub fn n_decision(&self) -> usize {
        self.n_controls + self.n_scenarios
    }

    /// Split a flat parameter row into named parameters.
    pub fn unflatten(&self, flat: &[f64], relaxation_penalty: f64) -> Result<ClfQpParams, QpError> {
        if flat.len() != self.n_params() {
            return Err(QpError::Dimension {
                what: "flat QP parameters",
                expected: self.n_params(),
                got: flat.len(),
            });
        }
        Ok(ClfQpParams {
            lf_v: flat[self.lf_offset()..self.lg_offset()].to_vec(),
            lg_v: flat[self.lg_offset()..self.v_offset()].to_vec(),
            v: flat[self.v_offset()],
            u_target: flat[self.u_target_offset()..].to_vec(),
            relaxation_penalty,
        })
    }
}
