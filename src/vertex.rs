//! Optimization variables (vertices of the factor graph).
//!
//! The backend is generic over the concrete variable types: poses, speed-bias
//! blocks, points and inverse-depth parameterizations all live outside this
//! crate. The solver only needs the narrow capability set below: a stable
//! id, the tangent-space dimension, the manifold retraction, and a backup /
//! rollback pair for rejected trust-region steps.

use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::{DVector, DVectorView};

/// Stable vertex identifier.
pub type VertexId = u64;

static NEXT_VERTEX_ID: AtomicU64 = AtomicU64::new(0);

/// Hand out a fresh, monotonically increasing vertex id.
pub fn next_vertex_id() -> VertexId {
    NEXT_VERTEX_ID.fetch_add(1, Ordering::Relaxed)
}

/// Coarse vertex classification used by the SLAM ordering.
///
/// `Pose` covers body poses and their speed-bias blocks; `Landmark` covers
/// XYZ points and inverse-depth parameterizations. `Generic` vertices are
/// only valid in generic (non-SLAM) problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VertexKind {
    Pose,
    Landmark,
    Generic,
}

impl VertexKind {
    pub fn is_pose(self) -> bool {
        self == VertexKind::Pose
    }

    pub fn is_landmark(self) -> bool {
        self == VertexKind::Landmark
    }
}

/// A variable node in the factor graph.
///
/// Implementations own their parameter storage and define the manifold
/// retraction in [`Vertex::plus`]. During Hessian assembly vertices are read
/// concurrently from worker threads, hence the `Send + Sync` bound.
pub trait Vertex: Send + Sync {
    /// Stable identifier, unique within one problem.
    fn id(&self) -> VertexId;

    /// Tangent-space dimension, i.e. the number of rows this vertex occupies
    /// in the Hessian and in the step vector.
    fn local_dimension(&self) -> usize;

    /// Classification used for the pose-before-landmark ordering.
    fn kind(&self) -> VertexKind {
        VertexKind::Generic
    }

    /// Fixed vertices contribute no Jacobian and have their prior rows and
    /// columns masked out during assembly.
    fn is_fixed(&self) -> bool {
        false
    }

    /// The raw parameter vector. Edges read this during linearization; the
    /// layout is opaque to the solver.
    fn parameters(&self) -> &DVector<f64>;

    /// Offset of this vertex in the global state vector, `None` until the
    /// ordering has been assigned.
    fn ordering_id(&self) -> Option<usize>;

    fn set_ordering_id(&mut self, id: Option<usize>);

    /// Manifold retraction: move the current estimate by the tangent vector
    /// `delta` (of length `local_dimension`).
    fn plus(&mut self, delta: DVectorView<'_, f64>);

    /// Snapshot the current parameters so a rejected step can be undone.
    fn back_up_parameters(&mut self);

    /// Restore the parameters saved by the last `back_up_parameters` call.
    fn roll_back_parameters(&mut self);
}
