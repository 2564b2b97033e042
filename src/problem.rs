//! The optimization problem: factor graph storage, variable ordering, state
//! updates and the outer `solve` / `marginalize` entry points.
//!
//! Vertices and edges are owned by the problem and addressed through stable
//! integer ids; the incidence index maps a vertex id to the edges that
//! reference it and is filtered lazily against the live edge set, so edge
//! removal never has to walk the index.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::Instant;

use nalgebra::{DMatrix, DVector};

use crate::assembly::AssemblyStrategy;
use crate::edge::{Edge, EdgeId};
use crate::linear::GenericLinearSolver;
use crate::vertex::{Vertex, VertexId, VertexKind};

pub(crate) type VertexMap = BTreeMap<VertexId, Box<dyn Vertex>>;
pub(crate) type EdgeMap = BTreeMap<EdgeId, Box<dyn Edge>>;

/// Problem flavor.
///
/// `Slam` orders pose-like vertices before landmark-like ones and solves the
/// linear system through the Schur complement over the landmark block;
/// `Generic` uses a plain dense solve over the whole state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProblemType {
    Generic,
    Slam,
}

/// Trust-region algorithm selector for [`Problem::solve`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolverType {
    LevenbergMarquardt,
    DogLeg,
}

/// Tuning knobs for the trust-region drivers.
#[derive(Debug, Clone)]
pub struct SolverOptions {
    /// Scale of the initial Levenberg-Marquardt damping relative to the
    /// largest Hessian diagonal entry.
    pub tau: f64,
    /// Maximum failed step attempts per outer iteration.
    pub max_inner_tries: usize,
    /// Stop once the cost decrease of an outer iteration falls below this.
    pub chi_tolerance: f64,
    /// Stop once the gradient norm falls below this.
    pub gradient_tolerance: f64,
    /// Initial dog-leg trust-region radius.
    pub initial_radius: f64,
    /// Lower bound for the dog-leg trust-region radius.
    pub min_radius: f64,
    /// Number of trailing pose dimensions that the stored prior whitening
    /// does not cover. In a sliding window this is the state appended since
    /// the last marginalization, one pose plus speed-bias block by default.
    pub prior_window_margin: usize,
    /// Linear solver for generic (non-Schur) problems.
    pub generic_solver: GenericLinearSolver,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            tau: 1e-5,
            max_inner_tries: 10,
            chi_tolerance: 1e-5,
            gradient_tolerance: 1e-5,
            initial_radius: 1e4,
            min_radius: 1e-7,
            prior_window_margin: 15,
            generic_solver: GenericLinearSolver::Cholesky,
        }
    }
}

/// A graph-based nonlinear least-squares problem.
pub struct Problem {
    pub(crate) problem_type: ProblemType,
    pub(crate) options: SolverOptions,

    pub(crate) vertices: VertexMap,
    pub(crate) edges: EdgeMap,
    /// Incidence index: vertex id -> edges referencing it. May contain ids of
    /// edges that have since been removed; readers filter against `edges`.
    pub(crate) vertex_to_edges: HashMap<VertexId, Vec<EdgeId>>,
    pub(crate) pose_vertex_ids: BTreeSet<VertexId>,
    pub(crate) landmark_vertex_ids: BTreeSet<VertexId>,

    pub(crate) ordering_poses: usize,
    pub(crate) ordering_landmarks: usize,
    pub(crate) ordering_generic: usize,

    pub(crate) hessian: DMatrix<f64>,
    pub(crate) b: DVector<f64>,
    pub(crate) delta_x: DVector<f64>,

    pub(crate) h_prior: DMatrix<f64>,
    pub(crate) b_prior: DVector<f64>,
    pub(crate) b_prior_backup: DVector<f64>,
    pub(crate) err_prior: DVector<f64>,
    pub(crate) err_prior_backup: DVector<f64>,
    pub(crate) jt_prior_inv: DMatrix<f64>,

    pub(crate) current_chi: f64,

    pub(crate) assembly: AssemblyStrategy,
    pub(crate) thread_count: usize,
    pub(crate) hessian_time_ms: f64,
    cost_log_path: Option<PathBuf>,
}

impl Problem {
    pub fn new(problem_type: ProblemType) -> Self {
        Self::with_options(problem_type, SolverOptions::default())
    }

    pub fn with_options(problem_type: ProblemType, options: SolverOptions) -> Self {
        Self {
            problem_type,
            options,
            vertices: BTreeMap::new(),
            edges: BTreeMap::new(),
            vertex_to_edges: HashMap::new(),
            pose_vertex_ids: BTreeSet::new(),
            landmark_vertex_ids: BTreeSet::new(),
            ordering_poses: 0,
            ordering_landmarks: 0,
            ordering_generic: 0,
            hessian: DMatrix::zeros(0, 0),
            b: DVector::zeros(0),
            delta_x: DVector::zeros(0),
            h_prior: DMatrix::zeros(0, 0),
            b_prior: DVector::zeros(0),
            b_prior_backup: DVector::zeros(0),
            err_prior: DVector::zeros(0),
            err_prior_backup: DVector::zeros(0),
            jt_prior_inv: DMatrix::zeros(0, 0),
            current_chi: 0.0,
            assembly: AssemblyStrategy::default(),
            thread_count: 4,
            hessian_time_ms: 0.0,
            cost_log_path: Some(PathBuf::from("solver_cost.txt")),
        }
    }

    // ========== Graph maintenance ==========

    /// Add a vertex. Returns false if a vertex with the same id already
    /// exists. In SLAM mode a pose-like vertex grows the prior by its local
    /// dimension so the prior always spans the pose block.
    pub fn add_vertex(&mut self, vertex: Box<dyn Vertex>) -> bool {
        let id = vertex.id();
        if self.vertices.contains_key(&id) {
            log::warn!("vertex {id} has been added before");
            return false;
        }
        let grow_prior =
            self.problem_type == ProblemType::Slam && vertex.kind() == VertexKind::Pose;
        let dim = vertex.local_dimension();
        self.vertices.insert(id, vertex);
        if grow_prior {
            self.extend_prior(dim);
        }
        true
    }

    /// Remove a vertex and every edge incident to it. Returns false if the
    /// vertex is not part of the problem.
    pub fn remove_vertex(&mut self, id: VertexId) -> bool {
        if !self.vertices.contains_key(&id) {
            log::warn!("vertex {id} is not in the problem");
            return false;
        }
        for edge_id in self.connected_edges(id) {
            self.remove_edge(edge_id);
        }
        self.pose_vertex_ids.remove(&id);
        self.landmark_vertex_ids.remove(&id);
        if let Some(vertex) = self.vertices.get_mut(&id) {
            vertex.set_ordering_id(None);
        }
        self.vertices.remove(&id);
        self.vertex_to_edges.remove(&id);
        true
    }

    /// Add an edge and index it under each incident vertex. Returns false if
    /// an edge with the same id already exists or if any incident vertex is
    /// missing from the problem.
    pub fn add_edge(&mut self, edge: Box<dyn Edge>) -> bool {
        let id = edge.id();
        if self.edges.contains_key(&id) {
            log::warn!("edge {id} has been added before");
            return false;
        }
        for vertex_id in edge.vertex_ids() {
            if !self.vertices.contains_key(vertex_id) {
                log::warn!("edge {id} references vertex {vertex_id} which is not in the problem");
                return false;
            }
        }
        for &vertex_id in edge.vertex_ids() {
            self.vertex_to_edges.entry(vertex_id).or_default().push(id);
        }
        self.edges.insert(id, edge);
        true
    }

    /// Remove an edge. Returns false if the edge is not part of the problem.
    /// Stale entries in the incidence index are filtered at read time.
    pub fn remove_edge(&mut self, id: EdgeId) -> bool {
        if self.edges.remove(&id).is_none() {
            log::warn!("edge {id} is not in the problem");
            return false;
        }
        true
    }

    /// Edges currently incident to `vertex_id`, skipping entries of edges
    /// that have been removed since they were indexed.
    pub fn connected_edges(&self, vertex_id: VertexId) -> Vec<EdgeId> {
        self.vertex_to_edges
            .get(&vertex_id)
            .map(|ids| {
                ids.iter()
                    .copied()
                    .filter(|edge_id| self.edges.contains_key(edge_id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Grow the prior by `dim` zero rows and columns.
    pub fn extend_prior(&mut self, dim: usize) {
        let size = self.h_prior.nrows() + dim;
        let h_prior = std::mem::replace(&mut self.h_prior, DMatrix::zeros(0, 0));
        self.h_prior = h_prior.resize(size, size, 0.0);
        let b_prior = std::mem::replace(&mut self.b_prior, DVector::zeros(0));
        self.b_prior = b_prior.resize_vertically(size, 0.0);
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// Total squared error `0.5 * (sum robust_chi2 + |err_prior|^2)` as of
    /// the last accepted step.
    pub fn current_chi(&self) -> f64 {
        self.current_chi
    }

    pub fn ordering_generic(&self) -> usize {
        self.ordering_generic
    }

    /// Worker count for parallel Hessian assembly.
    pub fn set_thread_count(&mut self, threads: usize) {
        self.thread_count = threads.max(1);
    }

    pub fn set_assembly_strategy(&mut self, strategy: AssemblyStrategy) {
        self.assembly = strategy;
    }

    /// Path of the append-only cost log, `None` to disable it.
    pub fn set_cost_log(&mut self, path: Option<PathBuf>) {
        self.cost_log_path = path;
    }

    // ========== Ordering ==========

    /// Assign every vertex a contiguous offset in the global state vector.
    /// In SLAM mode poses come first and landmarks are shifted behind them;
    /// in generic mode offsets follow ascending vertex id.
    pub(crate) fn set_ordering(&mut self) {
        self.ordering_poses = 0;
        self.ordering_generic = 0;
        self.ordering_landmarks = 0;
        self.pose_vertex_ids.clear();
        self.landmark_vertex_ids.clear();

        let slam = self.problem_type == ProblemType::Slam;
        for (id, vertex) in self.vertices.iter_mut() {
            let dim = vertex.local_dimension();
            if slam {
                match vertex.kind() {
                    VertexKind::Pose => {
                        vertex.set_ordering_id(Some(self.ordering_poses));
                        self.ordering_poses += dim;
                        self.pose_vertex_ids.insert(*id);
                    }
                    VertexKind::Landmark => {
                        vertex.set_ordering_id(Some(self.ordering_landmarks));
                        self.ordering_landmarks += dim;
                        self.landmark_vertex_ids.insert(*id);
                    }
                    VertexKind::Generic => {
                        panic!("generic vertex {id} cannot be ordered in a SLAM problem")
                    }
                }
            } else {
                vertex.set_ordering_id(Some(self.ordering_generic));
            }
            self.ordering_generic += dim;
        }

        if slam {
            // Landmarks were numbered inside their own block; shift them
            // behind the pose block.
            let pose_dimension = self.ordering_poses;
            for id in &self.landmark_vertex_ids {
                let vertex = self.vertices.get_mut(id).expect("landmark vertex exists");
                let shifted = vertex.ordering_id().map(|offset| offset + pose_dimension);
                vertex.set_ordering_id(shifted);
            }
            self.check_ordering();
        }
    }

    /// Verify that offsets form contiguous blocks in pose-then-landmark
    /// order. Violations are programmer errors.
    pub(crate) fn check_ordering(&self) {
        if self.problem_type != ProblemType::Slam {
            return;
        }
        let mut current = 0;
        for id in &self.pose_vertex_ids {
            let vertex = &self.vertices[id];
            assert_eq!(
                vertex.ordering_id(),
                Some(current),
                "pose vertex {id} breaks the contiguous ordering"
            );
            current += vertex.local_dimension();
        }
        for id in &self.landmark_vertex_ids {
            let vertex = &self.vertices[id];
            assert_eq!(
                vertex.ordering_id(),
                Some(current),
                "landmark vertex {id} breaks the contiguous ordering"
            );
            current += vertex.local_dimension();
        }
    }

    // ========== State updates ==========

    /// Apply the proposed step: every vertex backs up its parameters and
    /// retracts by its segment of `delta_x`; the prior residual is advanced
    /// by its first-order Taylor expansion.
    pub(crate) fn update_states(&mut self) {
        for vertex in self.vertices.values_mut() {
            vertex.back_up_parameters();
            let idx = vertex.ordering_id().expect("vertex has no ordering id");
            let dim = vertex.local_dimension();
            vertex.plus(self.delta_x.rows(idx, dim));
        }

        if self.err_prior.len() > 0 {
            self.b_prior_backup = self.b_prior.clone();
            self.err_prior_backup = self.err_prior.clone();

            // b' = b - H_prior * dx over the pose block; the whitening only
            // covers the pose dimensions that existed when the prior was
            // built, the trailing `prior_window_margin` ones are free.
            let pose_dim = self.ordering_poses;
            self.b_prior -= &self.h_prior * self.delta_x.rows(0, pose_dim);
            let margin = self.options.prior_window_margin;
            assert!(
                pose_dim >= margin,
                "prior window margin {margin} exceeds the pose block ({pose_dim})"
            );
            let covered = pose_dim - margin;
            assert_eq!(
                self.jt_prior_inv.ncols(),
                covered,
                "prior whitening does not match the pose block layout"
            );
            self.err_prior = -(&self.jt_prior_inv * self.b_prior.rows(0, covered));
        }
    }

    /// Undo the last `update_states` call: restore every vertex and the
    /// prior residual exactly as they were before the step.
    pub(crate) fn rollback_states(&mut self) {
        for vertex in self.vertices.values_mut() {
            vertex.roll_back_parameters();
        }
        if self.err_prior.len() > 0 {
            self.b_prior = self.b_prior_backup.clone();
            self.err_prior = self.err_prior_backup.clone();
        }
    }

    /// Re-evaluate every edge residual at the current estimates and return
    /// the total squared error including the prior term.
    pub(crate) fn recompute_chi(&mut self) -> f64 {
        let mut chi = 0.0;
        for edge in self.edges.values_mut() {
            let refs = crate::assembly::vertex_refs(&self.vertices, edge.vertex_ids());
            edge.compute_residual(&refs);
            chi += edge.robust_chi2();
        }
        if self.err_prior.len() > 0 {
            chi += self.err_prior.norm_squared();
        }
        0.5 * chi
    }

    // ========== Solve ==========

    /// Run the selected trust-region driver for at most `iterations` outer
    /// iterations. Returns false on an empty graph; true otherwise, also
    /// when terminated by the iteration cap.
    pub fn solve(&mut self, solver: SolverType, iterations: usize) -> bool {
        if self.edges.is_empty() || self.vertices.is_empty() {
            log::warn!("cannot solve a problem without edges or vertices");
            return false;
        }

        let start = Instant::now();
        self.hessian_time_ms = 0.0;

        self.set_ordering();
        self.make_hessian();
        match solver {
            SolverType::LevenbergMarquardt => self.solve_lm(iterations),
            SolverType::DogLeg => self.solve_dog_leg(iterations),
        }

        let solve_ms = start.elapsed().as_secs_f64() * 1000.0;
        log::debug!(
            "problem solve cost: {solve_ms:.3} ms, hessian cost: {:.3} ms",
            self.hessian_time_ms
        );
        self.append_cost_log(solve_ms, self.hessian_time_ms);
        true
    }

    fn append_cost_log(&self, solve_ms: f64, hessian_ms: f64) {
        let Some(path) = &self.cost_log_path else {
            return;
        };
        let result = OpenOptions::new()
            .append(true)
            .create(true)
            .open(path)
            .and_then(|mut file| writeln!(file, "{solve_ms:.6} {hessian_ms:.6}"));
        if let Err(err) = result {
            log::warn!("failed to append to cost log {}: {err}", path.display());
        }
    }
}
