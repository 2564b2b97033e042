//! Powell dog-leg trust-region driver.
//!
//! Each step blends the Gauss-Newton solution with the steepest-descent
//! direction inside a spherical trust region of radius `Delta`. The region
//! grows when the quadratic model predicts the observed cost drop well and
//! shrinks when it does not.

use nalgebra::DVector;

use crate::problem::Problem;

pub(crate) struct DogLegState {
    pub radius: f64,
    pub alpha: f64,
    pub stop_threshold: f64,
}

/// Which branch produced the combined step; the model reduction used in the
/// gain ratio is evaluated per branch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum DogLegCase {
    /// The full Gauss-Newton step fits inside the trust region.
    GaussNewton,
    /// Even the Cauchy point lies outside; descend along the gradient,
    /// clipped to the boundary.
    ScaledGradient,
    /// Walk from the Cauchy point toward the Gauss-Newton point until the
    /// boundary is hit.
    Interpolated { beta: f64 },
}

/// Combine the Gauss-Newton and steepest-descent steps into the dog-leg
/// step for trust radius `radius`.
pub(crate) fn dog_leg_step(
    h_gn: &DVector<f64>,
    h_sd: &DVector<f64>,
    alpha: f64,
    radius: f64,
) -> (DVector<f64>, DogLegCase) {
    let h_gn_norm = h_gn.norm();
    let h_sd_norm = h_sd.norm();

    if h_gn_norm <= radius {
        (h_gn.clone(), DogLegCase::GaussNewton)
    } else if alpha * h_sd_norm >= radius {
        ((radius / h_sd_norm) * h_sd, DogLegCase::ScaledGradient)
    } else {
        let a = alpha * h_sd;
        let d = h_gn - &a;
        let c = a.dot(&d);
        let d_sq = d.norm_squared();
        let s = (c * c + d_sq * (radius * radius - a.norm_squared())).sqrt();
        let beta = if c <= 0.0 {
            (-c + s) / d_sq
        } else {
            (radius * radius - a.norm_squared()) / (c + s)
        };
        assert!(
            beta > 0.0 && beta < 1.0,
            "dog-leg interpolation parameter out of range: {beta}"
        );
        (&a + beta * &d, DogLegCase::Interpolated { beta })
    }
}

impl Problem {
    pub(crate) fn solve_dog_leg(&mut self, iterations: usize) {
        let mut state = self.init_dog_leg();

        let mut stop = false;
        let mut iter = 0;
        let mut last_chi = 1e20;
        while !stop && iter < iterations {
            log::debug!(
                "iter: {iter} , chi= {} , currentRadius= {}",
                self.current_chi,
                state.radius
            );

            let mut one_step_success = false;
            let mut false_cnt = 0;
            while !one_step_success && false_cnt < self.options.max_inner_tries {
                match self.compute_dog_leg_step(&mut state) {
                    Ok(case) => {
                        self.update_states();
                        one_step_success = self.is_good_step_dog_leg(&mut state, case);
                        if one_step_success {
                            self.make_hessian();
                            false_cnt = 0;
                        } else {
                            false_cnt += 1;
                            self.rollback_states();
                        }
                    }
                    Err(err) => {
                        log::debug!("linear solve failed ({err}), shrinking radius");
                        state.radius = (state.radius * 0.5).max(self.options.min_radius);
                        false_cnt += 1;
                    }
                }
            }
            iter += 1;

            if !one_step_success {
                log::debug!("DogLeg: {false_cnt} consecutive rejections, giving up");
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

    fn init_dog_leg(&mut self) -> DogLegState {
        let mut chi = 0.0;
        for edge in self.edges.values() {
            chi += edge.robust_chi2();
        }
        if self.err_prior.len() > 0 {
            chi += self.err_prior.norm_squared();
        }
        self.current_chi = 0.5 * chi;

        DogLegState {
            radius: self.options.initial_radius,
            alpha: 0.0,
            stop_threshold: 1e-15 * self.current_chi,
        }
    }

    /// Solve for the Gauss-Newton step (undamped), derive the
    /// steepest-descent step, and store their dog-leg combination in
    /// `delta_x`.
    fn compute_dog_leg_step(
        &mut self,
        state: &mut DogLegState,
    ) -> Result<DogLegCase, crate::error::BackendError> {
        let h_gn = self.solve_linear_system(0.0)?;
        let h_sd = self.b.clone();
        state.alpha = self.b.norm_squared() / self.b.dot(&(&self.hessian * &self.b));

        let (h_dl, case) = dog_leg_step(&h_gn, &h_sd, state.alpha, state.radius);
        self.delta_x = h_dl;
        Ok(case)
    }

    /// Gain-ratio test with the per-branch model reduction; adapts the trust
    /// radius and accepts the step when the cost actually decreased.
    fn is_good_step_dog_leg(&mut self, state: &mut DogLegState, case: DogLegCase) -> bool {
        let temp_chi = self.recompute_chi();

        let scale = match case {
            DogLegCase::GaussNewton => self.current_chi,
            DogLegCase::ScaledGradient => {
                state.radius * (2.0 * state.alpha * self.b.norm() - state.radius)
                    / (2.0 * state.alpha)
            }
            DogLegCase::Interpolated { beta } => {
                0.5 * state.alpha * (1.0 - beta) * (1.0 - beta) * self.b.norm_squared()
                    + beta * (2.0 - beta) * self.current_chi
            }
        };
        let rho = (self.current_chi - temp_chi) / scale;

        if rho > 0.75 && temp_chi.is_finite() {
            state.radius = state.radius.max(3.0 * self.delta_x.norm());
        } else if rho < 0.25 {
            state.radius = (state.radius * 0.5).max(self.options.min_radius);
        }

        if rho > 0.0 && temp_chi.is_finite() {
            self.current_chi = temp_chi;
            true
        } else {
            false
        }
    }
}
