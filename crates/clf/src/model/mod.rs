//! Learned components: Lyapunov network, gain controller, and the QP filter
//! that combines them with a dynamics oracle.

pub mod bridge;
pub mod controller;
pub mod filter;
pub mod lyapunov;
pub mod network;
