//! Levenberg-Marquardt trust-region driver.
//!
//! Outer loop over re-linearizations; the inner loop retries the damped
//! solve with growing `lambda` until a step actually lowers the cost. The
//! damping update follows Nielsen: shrink by `max(1/3, min(1 - (2 rho - 1)^3,
//! 2/3))` on success, multiply by the doubling factor `ni` on failure.

use crate::problem::Problem;

/// Cap on the Hessian diagonal entry that seeds the initial damping.
const DIAGONAL_CAP: f64 = 5e10;
/// Keeps the gain-ratio denominator away from zero.
const GAIN_DENOM_FLOOR: f64 = 1e-6;

pub(crate) struct LmState {
    pub lambda: f64,
    pub ni: f64,
    pub stop_threshold: f64,
}

/// Nielsen's multiplicative damping update for an accepted step.
pub(crate) fn nielsen_scale_factor(rho: f64) -> f64 {
    let alpha = (1.0 - (2.0 * rho - 1.0).powi(3)).min(2.0 / 3.0);
    alpha.max(1.0 / 3.0)
}

impl Problem {
    pub(crate) fn solve_lm(&mut self, iterations: usize) {
        let mut state = self.init_lm();

        let mut stop = false;
        let mut iter = 0;
        let mut last_chi = 1e20;
        while !stop && iter < iterations {
            log::debug!(
                "iter: {iter} , chi= {} , Lambda= {}",
                self.current_chi,
                state.lambda
            );

            let mut one_step_success = false;
            let mut false_cnt = 0;
            while !one_step_success && false_cnt < self.options.max_inner_tries {
                match self.solve_linear_system(state.lambda) {
                    Ok(delta) => self.delta_x = delta,
                    Err(err) => {
                        log::debug!("linear solve failed ({err}), widening lambda");
                        state.lambda *= state.ni;
                        state.ni *= 2.0;
                        false_cnt += 1;
                        continue;
                    }
                }

                self.update_states();
                one_step_success = self.is_good_step_lm(&mut state);
                if one_step_success {
                    // Re-linearize at the accepted estimate before the next
                    // outer iteration.
                    self.make_hessian();
                    false_cnt = 0;
                } else {
                    false_cnt += 1;
                    self.rollback_states();
                }
            }
            iter += 1;

            if !one_step_success {
                log::debug!("LM: {false_cnt} consecutive rejections, giving up");
                stop = true;
            }
            if last_chi - self.current_chi < self.options.chi_tolerance
                || self.b.norm() < self.options.gradient_tolerance
                || self.current_chi < state.stop_threshold
            {
                stop = true;
            }
            last_chi = self.current_chi;
        }
    }

    fn init_lm(&mut self) -> LmState {
        let mut chi = 0.0;
        for edge in self.edges.values() {
            chi += edge.robust_chi2();
        }
        if self.err_prior.len() > 0 {
            chi += self.err_prior.norm_squared();
        }
        self.current_chi = 0.5 * chi;

        assert_eq!(
            self.hessian.nrows(),
            self.hessian.ncols(),
            "Hessian is not square"
        );
        let mut max_diagonal: f64 = 0.0;
        for i in 0..self.hessian.nrows() {
            max_diagonal = max_diagonal.max(self.hessian[(i, i)].abs());
        }
        let max_diagonal = max_diagonal.min(DIAGONAL_CAP);

        LmState {
            lambda: self.options.tau * max_diagonal,
            ni: 2.0,
            stop_threshold: 1e-10 * self.current_chi,
        }
    }

    /// Gain-ratio test for the proposed step; updates the damping state and
    /// the current cost on acceptance.
    fn is_good_step_lm(&mut self, state: &mut LmState) -> bool {
        let scale = 0.5
            * self
                .delta_x
                .dot(&(state.lambda * &self.delta_x + &self.b))
            + GAIN_DENOM_FLOOR;

        let temp_chi = self.recompute_chi();
        let rho = (self.current_chi - temp_chi) / scale;

        if rho > 0.0 && temp_chi.is_finite() {
            state.lambda *= nielsen_scale_factor(rho);
            state.ni = 2.0;
            self.current_chi = temp_chi;
            true
        } else {
            state.lambda *= state.ni;
            state.ni *= 2.0;
            false
        }
    }
}
