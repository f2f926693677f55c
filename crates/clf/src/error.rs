use clf_qp::QpError;
use dynamics::DynamicsError;

/// Errors raised by the CLF-QP network and its losses.
#[derive(Debug, thiserror::Error)]
pub enum ClfError {
    /// At least one dynamics scenario is required.
    #[error("at least one scenario is required")]
    NoScenarios,

    /// Two configured sizes disagree.
    #[error("{what}: expected {expected}, got {got}")]
    Dimension {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error(transparent)]
    Dynamics(#[from] DynamicsError),

    /// The QP could not be built.
    #[error("failed to build CLF-QP: {0}")]
    QpSetup(#[source] QpError),

    /// The QP failed for one element of the batch.
    #[error("CLF-QP failed for batch element {index}: {source}")]
    Qp {
        index: usize,
        #[source]
        source: QpError,
    },

    /// A sampling box, dataset or safety region is malformed.
    #[error("invalid training data: {0}")]
    InvalidData(String),

    /// Tensor data could not be read back to the host.
    #[error("tensor readback failed: {0}")]
    Tensor(String),
}
