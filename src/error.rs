use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::numerics::clock::FailedStep;
use crate::numerics::solver::ConvergedReason;

/// Fatal errors raised by the engine and its collaborators.
///
/// Recoverable step failures never surface here unless the restart policy
/// is disabled or the retry bound is exhausted.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("parameter '{parameter}' requested at t = {t} outside sampled range [{start}, {end}]")]
    OutOfRange {
        parameter: String,
        t: f64,
        start: f64,
        end: f64,
    },
    #[error("parameter '{parameter}' evaluated to NaN at t = {t}")]
    Numerical { parameter: String, t: f64 },
    #[error("step {step} failed at t = {t} (dt = {dt}): {reason}")]
    Convergence {
        step: usize,
        t: f64,
        dt: f64,
        reason: FailureReason,
    },
    #[error("step {step} still failing at t = {t} after {retries} retries")]
    RetryLimitExceeded {
        step: usize,
        t: f64,
        retries: usize,
        failures: Vec<FailedStep>,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Why a step attempt was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum FailureReason {
    /// Newton or the inner linear solve did not converge.
    Diverged(ConvergedReason),
    /// The converged solution had a component below the negative tolerance.
    NegativeSolution { min: f64 },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Diverged(reason) => write!(f, "{} ({})", reason, reason.code()),
            FailureReason::NegativeSolution { min } => {
                write!(f, "negative solution (min = {:.3e})", min)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Residual,
    Jacobian,
}

/// An assembled block that is empty on a sub-region it was expected to touch.
/// Logged, never returned as an error.
#[derive(Debug, Clone, PartialEq)]
pub struct StructuralWarning {
    pub role: BlockRole,
    pub domains: Vec<String>,
    pub region: String,
}

impl fmt::Display for StructuralWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let role = match self.role {
            BlockRole::Residual => "residual",
            BlockRole::Jacobian => "jacobian",
        };
        write!(
            f,
            "{} block ({}) is empty on sub-region '{}'",
            role,
            self.domains.join(", "),
            self.region
        )
    }
}
