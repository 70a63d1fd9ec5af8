use std::fmt;

use log::debug;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::NewtonConfig;
use crate::numerics::linear::{LinearError, LinearSolver};
use crate::numerics::parallel::Collective;
use crate::numerics::sparse::BlockMatrix;
use crate::numerics::timing::{record_jacobian, record_linear_solve, record_residual};
use crate::numerics::{Convergence, ConvergenceMetric, Tolerance};

/// Why the Newton iteration stopped. Codes follow the usual nonlinear
/// solver convention: positive means converged, negative means diverged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConvergedReason {
    ConvergedFnormAbs,
    ConvergedFnormRelative,
    ConvergedUpdate,
    DivergedLinearSolve,
    DivergedFnormNan,
    DivergedMaxIts,
    DivergedLineSearch,
}

impl ConvergedReason {
    pub fn code(&self) -> i32 {
        match self {
            ConvergedReason::ConvergedFnormAbs => 2,
            ConvergedReason::ConvergedFnormRelative => 3,
            ConvergedReason::ConvergedUpdate => 4,
            ConvergedReason::DivergedLinearSolve => -3,
            ConvergedReason::DivergedFnormNan => -4,
            ConvergedReason::DivergedMaxIts => -5,
            ConvergedReason::DivergedLineSearch => -6,
        }
    }

    pub fn is_converged(&self) -> bool {
        self.code() > 0
    }
}

impl fmt::Display for ConvergedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConvergedReason::ConvergedFnormAbs => "CONVERGED_FNORM_ABS",
            ConvergedReason::ConvergedFnormRelative => "CONVERGED_FNORM_RELATIVE",
            ConvergedReason::ConvergedUpdate => "CONVERGED_SNORM_RELATIVE",
            ConvergedReason::DivergedLinearSolve => "DIVERGED_LINEAR_SOLVE",
            ConvergedReason::DivergedFnormNan => "DIVERGED_FNORM_NAN",
            ConvergedReason::DivergedMaxIts => "DIVERGED_MAX_IT",
            ConvergedReason::DivergedLineSearch => "DIVERGED_LINE_SEARCH",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SolverError {
    #[error("linear solve failed at Newton iteration {iterations}: {source}")]
    LinearSolveFailed {
        #[source]
        source: LinearError,
        iterations: u32,
        linear_iterations: usize,
    },
    #[error("Newton's method failed to converge: {reason}")]
    NonConvergence {
        reason: ConvergedReason,
        iterations: u32,
        linear_iterations: usize,
    },
}

impl SolverError {
    pub fn reason(&self) -> ConvergedReason {
        match self {
            SolverError::LinearSolveFailed { .. } => ConvergedReason::DivergedLinearSolve,
            SolverError::NonConvergence { reason, .. } => *reason,
        }
    }

    pub fn iterations(&self) -> u32 {
        match self {
            SolverError::LinearSolveFailed { iterations, .. }
            | SolverError::NonConvergence { iterations, .. } => *iterations,
        }
    }

    pub fn linear_iterations(&self) -> usize {
        match self {
            SolverError::LinearSolveFailed {
                linear_iterations, ..
            }
            | SolverError::NonConvergence {
                linear_iterations, ..
            } => *linear_iterations,
        }
    }
}

pub struct SolverResult {
    pub solution: DVector<f64>,
    /// Residual at the returned solution.
    pub residual: DVector<f64>,
    pub iterations: u32,
    pub linear_iterations: usize,
    pub final_residual: f64,
    pub reason: ConvergedReason,
}

/// A nonlinear system `F(x) = 0` over the stacked block unknowns.
pub trait NonlinearProblem {
    fn residual(&mut self, x: &DVector<f64>) -> DVector<f64>;
    fn jacobian(&mut self, x: &DVector<f64>) -> BlockMatrix;
}

/// Damped Newton with a backtracking Armijo line search.
pub struct NewtonArmijoSolver {
    pub convergence: Convergence,
    pub max_iterations: u32,
    /// Minimum step size before we give up (prevents infinite loops)
    pub min_step_size: f64,
    /// Parameter for sufficient decrease (usually 1e-4)
    pub armijo_param: f64,
    /// Maximum step size to prevent large jumps (None = no limit)
    pub max_step: Option<f64>,
}

impl Default for NewtonArmijoSolver {
    fn default() -> Self {
        Self::from_config(&NewtonConfig::default())
    }
}

impl NewtonArmijoSolver {
    pub fn from_config(config: &NewtonConfig) -> Self {
        Self {
            convergence: Convergence {
                criteria: config.criteria,
                tolerance: Tolerance::Combined(config.atol, config.rtol),
                metric: config.metric,
            },
            max_iterations: config.max_iterations,
            min_step_size: config.min_step_size,
            armijo_param: config.armijo_param,
            max_step: config.max_step,
        }
    }

    fn global_norm<C: Collective>(&self, comm: &C, v: &DVector<f64>) -> f64 {
        match self.convergence.metric {
            ConvergenceMetric::L2Norm => comm.norm2(v),
            ConvergenceMetric::MaxNorm => comm.norm_max(v),
        }
    }

    /// The reason to report for a converged iterate, or `None` to keep going.
    fn converged(
        &self,
        res_norm: f64,
        update_norm: Option<f64>,
        initial_res: f64,
        initial_update: f64,
    ) -> Option<ConvergedReason> {
        if !self
            .convergence
            .check_convergence(res_norm, update_norm, initial_res, initial_update)
        {
            return None;
        }
        let abs_ok = match self.convergence.tolerance {
            Tolerance::Absolute(tol) | Tolerance::Combined(tol, _) => res_norm < tol,
            Tolerance::Relative(_) => false,
        };
        Some(match self.convergence.criteria {
            crate::numerics::ConvergenceCriteria::Update => ConvergedReason::ConvergedUpdate,
            _ if abs_ok => ConvergedReason::ConvergedFnormAbs,
            _ => ConvergedReason::ConvergedFnormRelative,
        })
    }

    pub fn solve<P, C>(
        &self,
        problem: &mut P,
        linear: &LinearSolver,
        comm: &C,
        initial_guess: DVector<f64>,
    ) -> Result<SolverResult, SolverError>
    where
        P: NonlinearProblem,
        C: Collective,
    {
        let mut u = initial_guess;
        let mut residual = record_residual(|| problem.residual(&u));
        let mut current_res_norm = self.global_norm(comm, &residual);
        let initial_residual_norm = current_res_norm;
        let mut initial_update_norm = 0.0;
        let mut update_norm = None;
        let mut linear_iterations = 0usize;

        debug!("Newton started, {} unknowns", u.len());
        debug!("Initial residual: {:.4e}", initial_residual_norm);
        debug!("  Iter |  Residual  |   Step   | Alpha |  Lin. It |");

        for i in 0..self.max_iterations {
            if !current_res_norm.is_finite() {
                return Err(SolverError::NonConvergence {
                    reason: ConvergedReason::DivergedFnormNan,
                    iterations: i,
                    linear_iterations,
                });
            }

            if let Some(reason) = self.converged(
                current_res_norm,
                update_norm,
                initial_residual_norm,
                initial_update_norm,
            ) {
                return Ok(SolverResult {
                    solution: u,
                    residual,
                    iterations: i,
                    linear_iterations,
                    final_residual: current_res_norm,
                    reason,
                });
            }

            let jacobian = record_jacobian(|| problem.jacobian(&u));
            let rhs = -&residual;
            let (mut delta_u, stats) =
                record_linear_solve(|| linear.solve(&jacobian, &rhs, current_res_norm)).map_err(
                    |source| SolverError::LinearSolveFailed {
                        source,
                        iterations: i,
                        linear_iterations,
                    },
                )?;
            linear_iterations += stats.iterations;

            // Optionally limit the max norm of delta_u to prevent massive jumps
            if let Some(max_step) = self.max_step {
                let max_update = comm.norm_max(&delta_u);
                if max_update > max_step {
                    delta_u *= max_step / max_update;
                }
            }

            // Backtracking line search:
            // ||F_new|| <= (1 - alpha * armijo_param) * ||F_old||
            let mut alpha = 1.0;
            let mut accepted = None;
            while alpha > self.min_step_size {
                let next_u = &u + &delta_u * alpha;
                let next_res = record_residual(|| problem.residual(&next_u));
                let next_res_norm = self.global_norm(comm, &next_res);
                let target_norm = (1.0 - alpha * self.armijo_param) * current_res_norm;

                if next_res_norm < target_norm {
                    accepted = Some((next_u, next_res, next_res_norm));
                    break;
                }
                alpha *= 0.5;
            }

            let Some((next_u, next_res, next_res_norm)) = accepted else {
                debug!("  line search failed to find sufficient decrease");
                return Err(SolverError::NonConvergence {
                    reason: ConvergedReason::DivergedLineSearch,
                    iterations: i + 1,
                    linear_iterations,
                });
            };

            let step_norm = self.global_norm(comm, &delta_u) * alpha;
            if i == 0 {
                initial_update_norm = step_norm;
            }
            update_norm = Some(step_norm);

            debug!(
                "  {:4} | {:.4e} | {:.4e} | {:.3} | {:8} |",
                i, next_res_norm, step_norm, alpha, stats.iterations
            );

            u = next_u;
            residual = next_res;
            current_res_norm = next_res_norm;
        }

        if let Some(reason) = self.converged(
            current_res_norm,
            update_norm,
            initial_residual_norm,
            initial_update_norm,
        ) {
            return Ok(SolverResult {
                solution: u,
                residual,
                iterations: self.max_iterations,
                linear_iterations,
                final_residual: current_res_norm,
                reason,
            });
        }

        Err(SolverError::NonConvergence {
            reason: ConvergedReason::DivergedMaxIts,
            iterations: self.max_iterations,
            linear_iterations,
        })
    }
}
