//! Residual terms (edges of the factor graph).
//!
//! Concrete residual models (reprojection, IMU pre-integration, priors)
//! are implemented outside this crate. An edge caches its residual and
//! per-vertex Jacobians; the solver drives the `compute_*` calls and then
//! accumulates the cached values into the normal equations.

use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{DMatrix, DVector};

use crate::vertex::{Vertex, VertexId};

/// Stable edge identifier.
pub type EdgeId = u64;

static NEXT_EDGE_ID: AtomicU64 = AtomicU64::new(0);

/// Hand out a fresh, monotonically increasing edge id.
pub fn next_edge_id() -> EdgeId {
    NEXT_EDGE_ID.fetch_add(1, Ordering::Relaxed)
}

/// A factor node connecting one or more vertices.
///
/// `compute_residual` and `compute_jacobians` receive the incident vertices
/// in the same order as [`Edge::vertex_ids`]. They must be re-entrant across
/// distinct edge instances: during parallel assembly each edge is linearized
/// by exactly one worker, but different edges run concurrently.
pub trait Edge: Send {
    /// Stable identifier, unique within one problem.
    fn id(&self) -> EdgeId;

    /// Ids of the incident vertices, in the edge's own order. The i-th
    /// Jacobian belongs to the i-th vertex of this list.
    fn vertex_ids(&self) -> &[VertexId];

    /// Measurement information matrix (inverse covariance), symmetric
    /// positive semi-definite, `residual_dim x residual_dim`.
    fn information(&self) -> &DMatrix<f64>;

    /// Residual cached by the last `compute_residual` call.
    fn residual(&self) -> &DVector<f64>;

    /// Jacobians cached by the last `compute_jacobians` call, one matrix of
    /// size `residual_dim x local_dimension` per incident vertex.
    fn jacobians(&self) -> &[DMatrix<f64>];

    /// Evaluate the residual at the vertices' current estimates.
    fn compute_residual(&mut self, vertices: &[&dyn Vertex]);

    /// Evaluate the per-vertex Jacobians at the vertices' current estimates.
    fn compute_jacobians(&mut self, vertices: &[&dyn Vertex]);

    /// Robustified weight: `(drho, information)` where `drho` scales the
    /// gradient contribution and the matrix replaces the raw information in
    /// the Hessian blocks. The default is the unrobustified pass-through;
    /// edges carrying a robust kernel override this.
    fn robust_info(&self) -> (f64, DMatrix<f64>) {
        (1.0, self.information().clone())
    }

    /// Possibly-robustified squared error of this edge, `r' W r` by default.
    fn robust_chi2(&self) -> f64 {
        let r = self.residual();
        (r.transpose() * self.information() * r)[0]
    }
}
