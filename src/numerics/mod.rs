pub mod blocks;
pub mod clock;
pub mod linear;
pub mod parallel;
pub mod solver;
pub mod sparse;
pub mod state;
pub mod timing;
pub mod transient;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Tolerance {
    Absolute(f64),
    Relative(f64),
    Combined(f64, f64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceMetric {
    L2Norm,
    MaxNorm,
}

/// Convergence criteria for iterative solvers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergenceCriteria {
    Residual,
    Update,
    Both,
}

#[derive(Debug, Clone, Copy)]
pub struct Convergence {
    pub criteria: ConvergenceCriteria,
    pub tolerance: Tolerance,
    pub metric: ConvergenceMetric,
}

impl Convergence {
    /// Local norm of `vector`. Distributed callers reduce the squared L2 norm
    /// (or the max) across workers themselves.
    pub fn norm(&self, vector: &nalgebra::DVector<f64>) -> f64 {
        match self.metric {
            ConvergenceMetric::L2Norm => vector.norm(),
            ConvergenceMetric::MaxNorm => vector.amax(),
        }
    }

    pub fn check_tolerance(&self, norm: f64, initial_norm: f64) -> bool {
        match self.tolerance {
            Tolerance::Absolute(tol) => norm < tol,
            Tolerance::Relative(tol) => initial_norm > 0.0 && norm / initial_norm < tol,
            Tolerance::Combined(abs_tol, rel_tol) => {
                norm < abs_tol || (initial_norm > 0.0 && norm / initial_norm < rel_tol)
            }
        }
    }

    /// `update` is `None` before the first Newton update has been taken.
    pub fn check_convergence(
        &self,
        residual_norm: f64,
        update_norm: Option<f64>,
        initial_residual_norm: f64,
        initial_update_norm: f64,
    ) -> bool {
        let residual_ok = || self.check_tolerance(residual_norm, initial_residual_norm);
        let update_ok = || {
            update_norm.map_or(false, |norm| self.check_tolerance(norm, initial_update_norm))
        };
        match self.criteria {
            ConvergenceCriteria::Residual => residual_ok(),
            ConvergenceCriteria::Update => update_ok(),
            ConvergenceCriteria::Both => residual_ok() && update_ok(),
        }
    }
}
