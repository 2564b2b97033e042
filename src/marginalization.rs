//! Marginalization: fold dropped variables into a Gaussian prior.
//!
//! Only the edges incident to the marginalized vertices are re-linearized.
//! Landmarks touched by those edges are first Schur-eliminated block by
//! block, the existing prior is added back in, and the marginalized pose
//! blocks are rotated to the bottom-right corner so a single eigen-truncated
//! Schur complement produces the new `(H_prior, b_prior)`. The prior is then
//! re-factorized into a whitening `Jt_prior_inv` so the drivers can track
//! its residual through first-order updates.

use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector, SymmetricEigen};

use crate::assembly::accumulate_edge;
use crate::edge::EdgeId;
use crate::problem::Problem;
use crate::vertex::{VertexId, VertexKind};

/// Eigenvalues at or below this are treated as zero rank.
const EIGEN_TRUNCATION: f64 = 1e-8;
/// Prior entries below this magnitude are flushed to exact zero.
const PRIOR_SPARSIFY: f64 = 1e-9;

impl Problem {
    /// Eliminate `marg_vertex_ids`, turning their information into a prior
    /// on the surviving pose block of dimension `pose_dim`. Landmarks
    /// observed by the incident edges are eliminated along the way and
    /// removed from the graph together with the listed vertices.
    pub fn marginalize(&mut self, marg_vertex_ids: &[VertexId], pose_dim: usize) -> bool {
        if marg_vertex_ids.is_empty() {
            log::warn!("marginalize called without vertices");
            return false;
        }
        for id in marg_vertex_ids {
            if !self.vertices.contains_key(id) {
                log::warn!("cannot marginalize vertex {id}: not in the problem");
                return false;
            }
        }

        self.set_ordering();

        // Direct neighborhood: every edge incident to a marginalized vertex.
        let mut marg_edge_ids: BTreeSet<EdgeId> = BTreeSet::new();
        for &vertex_id in marg_vertex_ids {
            marg_edge_ids.extend(self.connected_edges(vertex_id));
        }

        // Pose offsets stay as ordered; landmarks touched by the
        // neighborhood are renumbered into a contiguous block above
        // `pose_dim`.
        let mut marg_landmarks: BTreeSet<VertexId> = BTreeSet::new();
        let mut marg_landmark_size = 0;
        for edge_id in &marg_edge_ids {
            let vertex_ids = self.edges[edge_id].vertex_ids().to_vec();
            for vertex_id in vertex_ids {
                let vertex = self.vertices.get_mut(&vertex_id).expect("incident vertex");
                if vertex.kind() == VertexKind::Landmark && !marg_landmarks.contains(&vertex_id) {
                    vertex.set_ordering_id(Some(pose_dim + marg_landmark_size));
                    marg_landmark_size += vertex.local_dimension();
                    marg_landmarks.insert(vertex_id);
                }
            }
        }

        let cols = pose_dim + marg_landmark_size;
        let mut h_marg = DMatrix::zeros(cols, cols);
        let mut b_marg = DVector::zeros(cols);
        for edge_id in &marg_edge_ids {
            let edge = self.edges.get_mut(edge_id).expect("incident edge");
            accumulate_edge(edge.as_mut(), &self.vertices, &mut h_marg, &mut b_marg, false);
        }

        // Schur-eliminate the landmark block; its sub-Hessian is block
        // diagonal, one block per landmark.
        if marg_landmark_size > 0 {
            let reserve = pose_dim;
            let blocks: Vec<(usize, usize)> = marg_landmarks
                .iter()
                .map(|id| {
                    let vertex = &self.vertices[id];
                    let offset = vertex.ordering_id().expect("renumbered landmark");
                    (offset - reserve, vertex.local_dimension())
                })
                .collect();

            let h_mm = h_marg
                .view((reserve, reserve), (marg_landmark_size, marg_landmark_size))
                .into_owned();
            let h_mm_inv = match crate::linear::invert_block_diagonal(&h_mm, &blocks) {
                Ok(inverse) => inverse,
                Err(err) => {
                    log::warn!("marginalization aborted: {err}");
                    return false;
                }
            };

            let h_pm = h_marg.view((0, reserve), (reserve, marg_landmark_size));
            let h_mp = h_marg.view((reserve, 0), (marg_landmark_size, reserve));
            let b_pp = b_marg.rows(0, reserve);
            let b_mm = b_marg.rows(reserve, marg_landmark_size);

            let temp = h_pm * &h_mm_inv;
            let h_pp = h_marg.view((0, 0), (reserve, reserve)) - &temp * h_mp;
            let b_pp = b_pp - &temp * b_mm;
            h_marg = h_pp;
            b_marg = b_pp;
        }

        if self.h_prior.nrows() > 0 {
            assert_eq!(
                self.h_prior.nrows(),
                pose_dim,
                "prior does not span the pose block"
            );
            h_marg += &self.h_prior;
            b_marg += &self.b_prior;
        }

        // Rotate each marginalized block to the bottom-right, highest offset
        // first so earlier offsets stay valid.
        let mut block_infos: Vec<(usize, usize)> = marg_vertex_ids
            .iter()
            .map(|id| {
                let vertex = &self.vertices[id];
                let offset = vertex.ordering_id().expect("vertex has no ordering id");
                (offset, vertex.local_dimension())
            })
            .collect();
        block_infos.sort_by(|a, b| b.0.cmp(&a.0));

        let mut marg_dim = 0;
        for &(offset, dim) in &block_infos {
            marg_dim += dim;
            rotate_block_to_tail(&mut h_marg, &mut b_marg, offset, dim, pose_dim);
        }

        // Eigen-truncated inverse of the marginalized corner, then the Schur
        // complement onto the survivors.
        let m = marg_dim;
        let n = pose_dim - marg_dim;
        let a_mm = 0.5
            * (h_marg.view((n, n), (m, m)) + h_marg.view((n, n), (m, m)).transpose());
        let a_mm_inv = eigen_truncated_inverse(a_mm);

        let b_mm = b_marg.rows(n, m).into_owned();
        let a_rm = h_marg.view((0, n), (n, m)).into_owned();
        let a_mr = h_marg.view((n, 0), (m, n)).into_owned();
        let a_rr = h_marg.view((0, 0), (n, n)).into_owned();
        let b_rr = b_marg.rows(0, n).into_owned();

        let temp = &a_rm * &a_mm_inv;
        self.h_prior = &a_rr - &temp * &a_mr;
        self.b_prior = &b_rr - &temp * &b_mm;

        self.refactor_prior();

        for &id in marg_vertex_ids {
            self.remove_vertex(id);
        }
        for &id in &marg_landmarks {
            self.remove_vertex(id);
        }
        true
    }

    /// Sanitize the prior and rebuild its whitening: drop near-zero
    /// eigenvalues, store `Jt_prior_inv = sqrt(S)^-1 V'` and the whitened
    /// residual, and reconstruct `H_prior = J' J` with tiny entries flushed
    /// to zero.
    fn refactor_prior(&mut self) {
        let eigen = SymmetricEigen::new(self.h_prior.clone());
        let s_sqrt = eigen
            .eigenvalues
            .map(|v| if v > EIGEN_TRUNCATION { v.sqrt() } else { 0.0 });
        let s_inv_sqrt = eigen
            .eigenvalues
            .map(|v| if v > EIGEN_TRUNCATION { 1.0 / v.sqrt() } else { 0.0 });

        self.jt_prior_inv =
            DMatrix::from_diagonal(&s_inv_sqrt) * eigen.eigenvectors.transpose();
        self.err_prior = -(&self.jt_prior_inv * &self.b_prior);

        let j = DMatrix::from_diagonal(&s_sqrt) * eigen.eigenvectors.transpose();
        let h_prior = j.transpose() * j;
        self.h_prior = h_prior.map(|v| if v.abs() > PRIOR_SPARSIFY { v } else { 0.0 });
    }
}

/// Move the `dim` rows/columns starting at `offset` to the tail of the
/// leading `size x size` block, shifting everything in between up/left.
fn rotate_block_to_tail(
    h: &mut DMatrix<f64>,
    b: &mut DVector<f64>,
    offset: usize,
    dim: usize,
    size: usize,
) {
    let remainder = size - offset - dim;

    let rows = h.view((offset, 0), (dim, size)).into_owned();
    let rows_below = h.view((offset + dim, 0), (remainder, size)).into_owned();
    h.view_mut((offset, 0), (remainder, size)).copy_from(&rows_below);
    h.view_mut((size - dim, 0), (dim, size)).copy_from(&rows);

    let cols = h.view((0, offset), (size, dim)).into_owned();
    let cols_right = h.view((0, offset + dim), (size, remainder)).into_owned();
    h.view_mut((0, offset), (size, remainder)).copy_from(&cols_right);
    h.view_mut((0, size - dim), (size, dim)).copy_from(&cols);

    let segment = b.rows(offset, dim).into_owned();
    let tail = b.rows(offset + dim, remainder).into_owned();
    b.rows_mut(offset, remainder).copy_from(&tail);
    b.rows_mut(size - dim, dim).copy_from(&segment);
}

/// Inverse through a self-adjoint eigendecomposition, zeroing the modes with
/// eigenvalues at or below the truncation threshold.
fn eigen_truncated_inverse(m: DMatrix<f64>) -> DMatrix<f64> {
    let eigen = SymmetricEigen::new(m);
    let inv = eigen
        .eigenvalues
        .map(|v| if v > EIGEN_TRUNCATION { 1.0 / v } else { 0.0 });
    &eigen.eigenvectors * DMatrix::from_diagonal(&inv) * eigen.eigenvectors.transpose()
}
