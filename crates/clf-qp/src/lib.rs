//! Parametric control-Lyapunov-function quadratic program.
//!
//! The QP filters a target control `u_t` so that the exponential CLF descent
//! condition holds in every dynamics scenario `s`, relaxing it by a penalised
//! slack `r_s` when it cannot:
//!
//! ```text
//! minimize    ‖u - u_t‖² + ρ Σ_s r_s
//! subject to  L_fV_s + L_gV_s·u + λV - r_s ≤ 0     for every scenario s
//!             r_s ≥ 0                               for every scenario s
//!             G·u ≤ h                               (optional control bounds)
//! ```
//!
//! [`ClfQp`] fixes the problem structure once; every call to [`ClfQp::solve`]
//! only binds fresh parameter values. [`ClfQp::jacobian`] differentiates the
//! optimum through its KKT conditions so upstream learners can backpropagate.

pub mod problem;
pub mod sensitivity;
pub mod types;

pub use problem::ClfQp;
pub use types::{
    ClfQpParams, ClfQpSolution, ClfQpStructure, ConstraintId, ControlPolytope, ParameterLayout,
    QpError, QpSettings,
};
