//! Control-affine dynamics oracles for CLF synthesis.
//!
//! Every model exposes the decomposition `ẋ = f(x) + g(x)·u` over a batch of
//! states (burn tensors, any backend) plus an LQR nominal controller obtained
//! by linearizing about the goal state and solving the continuous algebraic
//! Riccati equation.
//!
//! # Key types
//!
//! - [`ControlAffine`] — the oracle trait, with a strongly-typed scenario record
//! - [`Pvtol`] / [`PvtolParams`] — planar vertical take-off and landing vehicle
//! - [`Quad9d`] / [`QuadParams`] — 9-state quadrotor with rate controls
//! - [`lqr`] / [`solve_care`] — Riccati solver used by the nominal controllers

pub mod lqr;
pub mod pvtol;
pub mod quad9d;
pub mod types;

pub use lqr::{lqr, solve_care};
pub use pvtol::{Pvtol, PvtolParams};
pub use quad9d::{Quad9d, QuadParams};
pub use types::{column, ControlAffine, DynamicsError, GRAVITY};
