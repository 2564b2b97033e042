//! Error types for the backend.

use thiserror::Error;

/// Failures raised by the linear-algebra layer.
///
/// These are recoverable inside the trust-region loops: the drivers treat a
/// failed solve as a rejected step and retry with a larger damping factor or a
/// smaller trust radius. They never cross the public API, which reports
/// outcomes as booleans plus observable state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BackendError {
    /// The (damped) normal-equation matrix is not positive definite, so the
    /// Cholesky factorization failed.
    #[error("normal-equation matrix is not positive definite")]
    NotPositiveDefinite,

    /// A diagonal landmark block could not be inverted during Schur
    /// elimination.
    #[error("singular landmark block at offset {offset} (dim {dim})")]
    SingularLandmarkBlock { offset: usize, dim: usize },
}
