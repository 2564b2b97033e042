//! Ithaca: a graph-optimization backend for sliding-window visual-inertial
//! SLAM.
//!
//! The crate owns the numerical core of the estimator: a bipartite factor
//! graph over opaque vertices and edges, block-structured assembly of the
//! Gauss-Newton normal equations, Levenberg-Marquardt and Powell dog-leg
//! trust-region drivers, a Schur-complement linear solver for the
//! pose/landmark structure, and marginalization of old states into a
//! Gaussian prior. Concrete parameterizations (poses, inverse-depth points)
//! and residual models (reprojection, IMU pre-integration) implement the
//! [`Vertex`] and [`Edge`] traits outside this crate.

pub mod assembly;
pub mod dogleg;
pub mod edge;
pub mod error;
pub mod linear;
pub mod lm;
pub mod marginalization;
pub mod problem;
pub mod vertex;

// Re-export key types
pub use assembly::AssemblyStrategy;
pub use edge::{next_edge_id, Edge, EdgeId};
pub use error::BackendError;
pub use linear::{pcg_solve, GenericLinearSolver};
pub use problem::{Problem, ProblemType, SolverOptions, SolverType};
pub use vertex::{next_vertex_id, Vertex, VertexId, VertexKind};
