//! Neural control-Lyapunov functions with a differentiable CLF-QP filter.
//!
//! A tanh network learns `V(x) = ½‖h₂(x)‖²` and a second network learns a
//! state-dependent feedback gain. On every forward pass the learned control is
//! filtered through a CLF quadratic program built over a set of dynamics
//! scenarios, and the QP solution is differentiated so both networks train
//! end to end against the Lyapunov and controller losses.

pub mod error;
pub mod model;
pub mod training;

pub use error::ClfError;
