//! CLF-QP training pipeline: state sampling and safety masks, loss functions,
//! curriculum schedule, diagnostics, checkpoints and the SGD training loop.

pub mod checkpoint;
pub mod data;
pub mod loss;
pub mod metrics;
pub mod schedule;
pub mod trainer;
