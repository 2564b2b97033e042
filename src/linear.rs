//! Linear solvers for the damped normal equations `(H + lambda I) dx = b`.
//!
//! Generic problems use a dense Cholesky factorization, with a
//! Jacobi-preconditioned conjugate-gradient routine as an alternative. SLAM
//! problems eliminate the landmark block through the Schur complement: the
//! landmark sub-Hessian is block diagonal, so its inverse is assembled from
//! per-landmark block inverses and only the reduced pose system is
//! factorized.

use nalgebra::{Cholesky, DMatrix, DVector};

use crate::error::BackendError;
use crate::problem::{Problem, ProblemType};

/// Relative residual threshold for the conjugate-gradient solver.
const PCG_TOLERANCE: f64 = 1e-6;

/// Dense solver selection for generic problems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GenericLinearSolver {
    #[default]
    Cholesky,
    ConjugateGradient,
}

/// Solve `(H + lambda I) dx = b` over the full state.
pub(crate) fn solve_damped(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    lambda: f64,
    solver: GenericLinearSolver,
) -> Result<DVector<f64>, BackendError> {
    let mut damped = h.clone();
    for i in 0..damped.nrows() {
        damped[(i, i)] += lambda;
    }
    match solver {
        GenericLinearSolver::Cholesky => {
            let factorization =
                Cholesky::new(damped).ok_or(BackendError::NotPositiveDefinite)?;
            Ok(factorization.solve(b))
        }
        GenericLinearSolver::ConjugateGradient => Ok(pcg_solve(&damped, b, None)),
    }
}

/// Solve the SLAM system through the Schur complement over the landmark
/// block.
///
/// `reserve_size` is the pose block dimension, `schur_size` the landmark
/// block dimension, and `landmark_blocks` lists the `(offset, dim)` of each
/// diagonal landmark block relative to the start of the landmark block. The
/// damping `lambda` is applied to the reduced pose system only. An empty
/// landmark block degenerates to a plain dense solve of the pose system.
pub(crate) fn solve_with_schur(
    h: &DMatrix<f64>,
    b: &DVector<f64>,
    reserve_size: usize,
    schur_size: usize,
    landmark_blocks: &[(usize, usize)],
    lambda: f64,
) -> Result<DVector<f64>, BackendError> {
    let h_rr = h.view((0, 0), (reserve_size, reserve_size));
    let h_ss = h.view((reserve_size, reserve_size), (schur_size, schur_size));
    let h_rs = h.view((0, reserve_size), (reserve_size, schur_size));
    let h_sr = h.view((reserve_size, 0), (schur_size, reserve_size));
    let b_r = b.rows(0, reserve_size);
    let b_s = b.rows(reserve_size, schur_size);

    let h_ss_inv = invert_block_diagonal(&h_ss.into_owned(), landmark_blocks)?;

    let temp = h_rs * &h_ss_inv;
    let mut h_rr_schur = h_rr - &temp * h_sr;
    let b_r_schur = b_r - &temp * b_s;

    for i in 0..reserve_size {
        h_rr_schur[(i, i)] += lambda;
    }

    let factorization = Cholesky::new(h_rr_schur).ok_or(BackendError::NotPositiveDefinite)?;
    let dx_r = factorization.solve(&b_r_schur);
    let dx_s = &h_ss_inv * (b_s - h_sr * &dx_r);

    let mut delta = DVector::zeros(reserve_size + schur_size);
    delta.rows_mut(0, reserve_size).copy_from(&dx_r);
    delta.rows_mut(reserve_size, schur_size).copy_from(&dx_s);
    Ok(delta)
}

/// Invert a block-diagonal matrix block by block.
pub(crate) fn invert_block_diagonal(
    m: &DMatrix<f64>,
    blocks: &[(usize, usize)],
) -> Result<DMatrix<f64>, BackendError> {
    let mut inverse = DMatrix::zeros(m.nrows(), m.ncols());
    for &(offset, dim) in blocks {
        let block = m.view((offset, offset), (dim, dim)).into_owned();
        let block_inv = block
            .try_inverse()
            .ok_or(BackendError::SingularLandmarkBlock { offset, dim })?;
        inverse
            .view_mut((offset, offset), (dim, dim))
            .copy_from(&block_inv);
    }
    Ok(inverse)
}

impl Problem {
    /// Solve the assembled normal equations for the proposed step.
    pub(crate) fn solve_linear_system(&self, lambda: f64) -> Result<DVector<f64>, BackendError> {
        match self.problem_type {
            ProblemType::Generic => solve_damped(
                &self.hessian,
                &self.b,
                lambda,
                self.options.generic_solver,
            ),
            ProblemType::Slam => solve_with_schur(
                &self.hessian,
                &self.b,
                self.ordering_poses,
                self.ordering_landmarks,
                &self.landmark_blocks(),
                lambda,
            ),
        }
    }

    /// `(offset, dim)` of each diagonal landmark block, relative to the
    /// start of the landmark block.
    fn landmark_blocks(&self) -> Vec<(usize, usize)> {
        self.landmark_vertex_ids
            .iter()
            .map(|id| {
                let vertex = &self.vertices[id];
                let offset = vertex.ordering_id().expect("vertex has no ordering id");
                (offset - self.ordering_poses, vertex.local_dimension())
            })
            .collect()
    }
}

/// Jacobi-preconditioned conjugate gradients for `A x = b`.
///
/// Stops once the residual norm drops below `1e-6 * |r0|` or after
/// `max_iter` iterations (the system size when not given).
pub fn pcg_solve(a: &DMatrix<f64>, b: &DVector<f64>, max_iter: Option<usize>) -> DVector<f64> {
    assert_eq!(a.nrows(), a.ncols(), "PCG solver needs a square matrix");
    let rows = b.len();
    let iterations = max_iter.unwrap_or(rows);

    let m_inv = a
        .diagonal()
        .map(|d| if d != 0.0 { 1.0 / d } else { 0.0 });

    let mut x = DVector::zeros(rows);
    let mut r = b.clone();
    let threshold = PCG_TOLERANCE * r.norm();
    let mut z = m_inv.component_mul(&r);
    let mut p = z.clone();
    let mut rz = r.dot(&z);

    let mut iter = 0;
    while r.norm() > threshold && iter < iterations {
        let w = a * &p;
        let denom = p.dot(&w);
        if denom == 0.0 {
            break;
        }
        let alpha = rz / denom;
        x += alpha * &p;
        r -= alpha * &w;

        z = m_inv.component_mul(&r);
        let rz_next = r.dot(&z);
        if rz == 0.0 {
            break;
        }
        p = &z + (rz_next / rz) * p;
        rz = rz_next;
        iter += 1;
    }
    x
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spd_matrix(n: usize, seed: u64) -> DMatrix<f64> {
        use rand::{Rng, SeedableRng};
        let mut rng = rand_chacha::ChaCha8Rng::seed_from_u64(seed);
        let m = DMatrix::from_fn(n, n, |_, _| rng.gen_range(-1.0..1.0));
        m.transpose() * &m + DMatrix::identity(n, n) * n as f64
    }

    #[test]
    fn pcg_matches_cholesky() {
        let a = spd_matrix(12, 3);
        let b = DVector::from_fn(12, |i, _| (i as f64 * 0.7).sin());

        let direct = Cholesky::new(a.clone()).unwrap().solve(&b);
        let iterative = pcg_solve(&a, &b, None);
        assert!((direct - iterative).norm() < 1e-5);
    }

    #[test]
    fn damped_solve_rejects_indefinite_systems() {
        let mut h = DMatrix::identity(3, 3);
        h[(2, 2)] = -5.0;
        let b = DVector::from_element(3, 1.0);
        let result = solve_damped(&h, &b, 0.0, GenericLinearSolver::Cholesky);
        assert_eq!(result, Err(BackendError::NotPositiveDefinite));
    }

    #[test]
    fn schur_solve_matches_dense_solve() {
        // Pose block of dim 4, two landmark blocks of dim 2; the landmark
        // sub-Hessian is block diagonal as produced by assembly. Zeroing the
        // cross-landmark coupling and boosting the diagonal keeps the matrix
        // strictly diagonally dominant, hence positive definite.
        let reserve = 4;
        let schur = 4;
        let n = reserve + schur;
        let blocks = [(0, 2), (2, 2)];

        let mut h = spd_matrix(n, 11);
        h.view_mut((reserve, reserve + 2), (2, 2)).fill(0.0);
        h.view_mut((reserve + 2, reserve), (2, 2)).fill(0.0);
        h += DMatrix::identity(n, n) * 100.0;
        let b = DVector::from_fn(n, |i, _| 1.0 + i as f64);

        let dense = solve_damped(&h, &b, 0.0, GenericLinearSolver::Cholesky).unwrap();
        let schur_dx = solve_with_schur(&h, &b, reserve, schur, &blocks, 0.0).unwrap();
        assert!((&dense - &schur_dx).norm() / dense.norm() < 1e-8);
    }

    #[test]
    fn schur_solve_handles_empty_landmark_block() {
        let h = spd_matrix(3, 5);
        let b = DVector::from_element(3, 1.0);
        let dx = solve_with_schur(&h, &b, 3, 0, &[], 0.5).unwrap();
        let dense = solve_damped(&h, &b, 0.5, GenericLinearSolver::Cholesky).unwrap();
        assert!((dx - dense).norm() < 1e-10);
    }

    #[test]
    fn singular_landmark_block_is_reported() {
        let h = DMatrix::zeros(2, 2);
        let b = DVector::zeros(2);
        let result = solve_with_schur(&h, &b, 0, 2, &[(0, 2)], 0.0);
        assert_eq!(
            result,
            Err(BackendError::SingularLandmarkBlock { offset: 0, dim: 2 })
        );
    }
}
