//! Normal-equation assembly.
//!
//! Each iteration re-linearizes every edge and accumulates `J' W J` blocks
//! and `-J' W r` segments into the global `H` and `b`, then folds in the
//! prior with the rows and columns of fixed pose vertices masked out.
//!
//! Parallel variants never share mutable state: every worker accumulates
//! into its own `(H_k, b_k)` pair and the coordinator sums the partials, so
//! two edges touching the same vertex pair can be linearized concurrently
//! without write ordering concerns. The result is identical across worker
//! counts up to floating-point associativity of the reduction order.

use std::time::Instant;

use nalgebra::{DMatrix, DVector};
use rayon::prelude::*;

use crate::edge::Edge;
use crate::problem::{Problem, VertexMap};
use crate::vertex::{Vertex, VertexId, VertexKind};

/// How `make_hessian` distributes edges over workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AssemblyStrategy {
    /// One pass over the edges in ascending id order.
    Serial,
    /// Fork-join pool of scoped threads; worker k linearizes the edges whose
    /// index is congruent to k modulo the worker count.
    #[default]
    WorkerPool,
    /// Parallel-for with a `+` reduction over `(H, b)`.
    ParallelReduce,
}

/// Resolve the incident vertices of an edge against the vertex arena.
pub(crate) fn vertex_refs<'a>(vertices: &'a VertexMap, ids: &[VertexId]) -> Vec<&'a dyn Vertex> {
    ids.iter()
        .map(|id| {
            vertices
                .get(id)
                .expect("edge references a vertex missing from the problem")
                .as_ref()
        })
        .collect()
}

/// Linearize one edge and add its contribution to `(h, b)`.
///
/// For every unordered pair `(i, j)` of incident vertices the block
/// `J_i' W J_j` lands at the pair's ordering offsets, mirrored to both
/// triangles when `i != j`. The gradient side uses the raw information
/// matrix scaled by the robust kernel's `drho`.
pub(crate) fn accumulate_edge(
    edge: &mut dyn Edge,
    vertices: &VertexMap,
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    skip_fixed: bool,
) {
    let refs = vertex_refs(vertices, edge.vertex_ids());
    edge.compute_residual(&refs);
    edge.compute_jacobians(&refs);

    let (drho, robust_info) = edge.robust_info();
    let jacobians = edge.jacobians();
    let residual = edge.residual();
    let information = edge.information();
    assert_eq!(jacobians.len(), refs.len());

    for (i, vertex_i) in refs.iter().enumerate() {
        if skip_fixed && vertex_i.is_fixed() {
            continue;
        }
        let jacobian_i = &jacobians[i];
        let index_i = vertex_i.ordering_id().expect("vertex has no ordering id");
        let dim_i = vertex_i.local_dimension();

        let jt_w = jacobian_i.transpose() * &robust_info;
        for (j, vertex_j) in refs.iter().enumerate().skip(i) {
            if skip_fixed && vertex_j.is_fixed() {
                continue;
            }
            let jacobian_j = &jacobians[j];
            let index_j = vertex_j.ordering_id().expect("vertex has no ordering id");
            let dim_j = vertex_j.local_dimension();

            let block = &jt_w * jacobian_j;
            let mut upper = h.view_mut((index_i, index_j), (dim_i, dim_j));
            upper += &block;
            if j != i {
                let mut lower = h.view_mut((index_j, index_i), (dim_j, dim_i));
                lower += &block.transpose();
            }
        }

        let gradient = jacobian_i.transpose() * information * residual * drho;
        let mut segment = b.rows_mut(index_i, dim_i);
        segment -= &gradient;
    }
}

impl Problem {
    /// Rebuild `H` and `b` at the current linearization point and reset the
    /// proposed step to zero.
    pub(crate) fn make_hessian(&mut self) {
        let timer = Instant::now();
        let size = self.ordering_generic;

        let (h, b) = match self.assembly {
            AssemblyStrategy::Serial => self.assemble_serial(size),
            AssemblyStrategy::WorkerPool => self.assemble_worker_pool(size),
            AssemblyStrategy::ParallelReduce => self.assemble_parallel_reduce(size),
        };
        self.hessian = h;
        self.b = b;
        self.hessian_time_ms += timer.elapsed().as_secs_f64() * 1000.0;

        if self.h_prior.nrows() > 0 {
            // Fixed pose vertices must not be pulled by the prior: zero their
            // rows and columns on a copy, the stored prior stays intact.
            let mut h_prior = self.h_prior.clone();
            let mut b_prior = self.b_prior.clone();
            for vertex in self.vertices.values() {
                if vertex.kind() == VertexKind::Pose && vertex.is_fixed() {
                    let idx = vertex.ordering_id().expect("vertex has no ordering id");
                    let dim = vertex.local_dimension();
                    h_prior.view_mut((idx, 0), (dim, h_prior.ncols())).fill(0.0);
                    h_prior.view_mut((0, idx), (h_prior.nrows(), dim)).fill(0.0);
                    b_prior.rows_mut(idx, dim).fill(0.0);
                }
            }
            let pose_dim = self.ordering_poses;
            assert_eq!(
                h_prior.nrows(),
                pose_dim,
                "prior does not span the pose block"
            );
            let mut h_top_left = self.hessian.view_mut((0, 0), (pose_dim, pose_dim));
            h_top_left += &h_prior;
            let mut b_head = self.b.rows_mut(0, pose_dim);
            b_head += &b_prior;
        }

        self.delta_x = DVector::zeros(size);
    }

    fn assemble_serial(&mut self, size: usize) -> (DMatrix<f64>, DVector<f64>) {
        let mut h = DMatrix::zeros(size, size);
        let mut b = DVector::zeros(size);
        for edge in self.edges.values_mut() {
            accumulate_edge(edge.as_mut(), &self.vertices, &mut h, &mut b, true);
        }
        (h, b)
    }

    fn assemble_worker_pool(&mut self, size: usize) -> (DMatrix<f64>, DVector<f64>) {
        let workers = self.thread_count.max(1);
        let mut buckets: Vec<Vec<&mut Box<dyn Edge>>> = (0..workers).map(|_| Vec::new()).collect();
        for (i, edge) in self.edges.values_mut().enumerate() {
            buckets[i % workers].push(edge);
        }

        let vertices = &self.vertices;
        let partials: Vec<(DMatrix<f64>, DVector<f64>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = buckets
                .into_iter()
                .map(|bucket| {
                    scope.spawn(move || {
                        let mut h = DMatrix::zeros(size, size);
                        let mut b = DVector::zeros(size);
                        for edge in bucket {
                            accumulate_edge(edge.as_mut(), vertices, &mut h, &mut b, true);
                        }
                        (h, b)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("hessian assembly worker panicked"))
                .collect()
        });

        let mut h = DMatrix::zeros(size, size);
        let mut b = DVector::zeros(size);
        for (h_k, b_k) in partials {
            h += h_k;
            b += b_k;
        }
        (h, b)
    }

    fn assemble_parallel_reduce(&mut self, size: usize) -> (DMatrix<f64>, DVector<f64>) {
        let threads = self.thread_count.max(1);
        let vertices = &self.vertices;
        let edge_refs: Vec<&mut Box<dyn Edge>> = self.edges.values_mut().collect();

        let reduce = || {
            edge_refs
                .into_par_iter()
                .fold(
                    || (DMatrix::zeros(size, size), DVector::zeros(size)),
                    |(mut h, mut b), edge| {
                        accumulate_edge(edge.as_mut(), vertices, &mut h, &mut b, true);
                        (h, b)
                    },
                )
                .reduce(
                    || (DMatrix::zeros(size, size), DVector::zeros(size)),
                    |(h_a, b_a), (h_b, b_b)| (h_a + h_b, b_a + b_b),
                )
        };

        match rayon::ThreadPoolBuilder::new().num_threads(threads).build() {
            Ok(pool) => pool.install(reduce),
            Err(err) => {
                log::warn!("falling back to the global rayon pool: {err}");
                reduce()
            }
        }
    }
}
