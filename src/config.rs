use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::numerics::{ConvergenceCriteria, ConvergenceMetric};

/// Largest supported number of decimal digits for the time axis. Times are
/// held as integer ticks of `10^-precision`.
pub const MAX_TIME_PRECISION: u32 = 12;

/// Run-level solver configuration.
///
/// Everything has a default except `final_t` and `initial_dt`, which must be
/// supplied before the engine can be built.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub initial_t: f64,
    pub final_t: Option<f64>,
    pub initial_dt: Option<f64>,
    /// Number of decimal digits kept on the time axis.
    pub time_precision: u32,
    /// Prescribed `(time, new_dt)` checkpoints, strictly increasing in time.
    pub adjust_dt: Vec<(f64, f64)>,
    pub attempt_timestep_restart_on_divergence: bool,
    pub reset_timestep_for_negative_solution: bool,
    pub negative_tolerance: f64,
    pub dt_shrink_factor: f64,
    pub max_step_retries: usize,
    pub adapt_dt_to_iterations: bool,
    pub preassemble_linear_blocks: bool,
    pub newton: NewtonConfig,
    pub linear: LinearConfig,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            initial_t: 0.0,
            final_t: None,
            initial_dt: None,
            time_precision: 6,
            adjust_dt: Vec::new(),
            attempt_timestep_restart_on_divergence: true,
            reset_timestep_for_negative_solution: false,
            negative_tolerance: 1e-6,
            dt_shrink_factor: 0.2,
            max_step_retries: 10,
            adapt_dt_to_iterations: false,
            preassemble_linear_blocks: true,
            newton: NewtonConfig::default(),
            linear: LinearConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NewtonConfig {
    pub rtol: f64,
    pub atol: f64,
    pub max_iterations: u32,
    /// Smallest line-search step before the iteration is declared stalled.
    pub min_step_size: f64,
    /// Sufficient decrease parameter (usually 1e-4).
    pub armijo_param: f64,
    /// Cap on the max-norm of a Newton update (None = no limit).
    pub max_step: Option<f64>,
    /// Forcing term for inexact Newton.
    pub forcing_term: f64,
    pub criteria: ConvergenceCriteria,
    pub metric: ConvergenceMetric,
}

impl Default for NewtonConfig {
    fn default() -> Self {
        Self {
            rtol: 1e-5,
            atol: 1e-12,
            max_iterations: 50,
            min_step_size: 1e-4,
            armijo_param: 1e-4,
            max_step: None,
            forcing_term: 0.01,
            criteria: ConvergenceCriteria::Residual,
            metric: ConvergenceMetric::L2Norm,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinearSolverKind {
    /// Field-split when more than one block is active, BiCGStab otherwise.
    Auto,
    BiCgStab,
    FieldSplit,
    DirectLu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldSplitType {
    /// Block Jacobi: every block sees the previous sweep.
    Additive,
    /// Block Gauss-Seidel: later blocks see the blocks already updated.
    Multiplicative,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinearConfig {
    pub kind: LinearSolverKind,
    pub rtol: f64,
    pub max_iterations: usize,
    pub field_split: FieldSplitType,
    pub max_sweeps: usize,
}

impl Default for LinearConfig {
    fn default() -> Self {
        Self {
            kind: LinearSolverKind::Auto,
            rtol: 1e-5,
            max_iterations: 2000,
            field_split: FieldSplitType::Multiplicative,
            max_sweeps: 20,
        }
    }
}

/// The validated time window of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeWindow {
    pub start: f64,
    pub final_t: f64,
    pub initial_dt: f64,
}

impl SolverConfig {
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let text = std::fs::read_to_string(path)?;
        let config: SolverConfig = serde_json::from_str(&text)?;
        Ok(config)
    }

    pub fn with_times(mut self, final_t: f64, initial_dt: f64) -> Self {
        self.final_t = Some(final_t);
        self.initial_dt = Some(initial_dt);
        self
    }

    /// Check the configuration and return the time window it describes.
    pub fn validate(&self) -> Result<TimeWindow, EngineError> {
        let final_t = self
            .final_t
            .ok_or_else(|| EngineError::config("final_t must be set"))?;
        let initial_dt = self
            .initial_dt
            .ok_or_else(|| EngineError::config("initial_dt must be set"))?;

        if !(initial_dt > 0.0) {
            return Err(EngineError::config(format!(
                "initial_dt must be positive, got {}",
                initial_dt
            )));
        }
        if !(final_t > self.initial_t) {
            return Err(EngineError::config(format!(
                "final_t ({}) must lie after initial_t ({})",
                final_t, self.initial_t
            )));
        }
        if self.time_precision == 0 || self.time_precision > MAX_TIME_PRECISION {
            return Err(EngineError::config(format!(
                "time_precision must be in 1..={}, got {}",
                MAX_TIME_PRECISION, self.time_precision
            )));
        }
        let mut last = f64::NEG_INFINITY;
        for &(t, dt) in &self.adjust_dt {
            if t <= last {
                return Err(EngineError::config(
                    "adjust_dt checkpoints must be strictly increasing in time",
                ));
            }
            if !(dt > 0.0) {
                return Err(EngineError::config(format!(
                    "adjust_dt checkpoint at t = {} requests non-positive dt {}",
                    t, dt
                )));
            }
            last = t;
        }
        if !(self.dt_shrink_factor > 0.0 && self.dt_shrink_factor <= 1.0) {
            return Err(EngineError::config(format!(
                "dt_shrink_factor must be in (0, 1], got {}",
                self.dt_shrink_factor
            )));
        }
        if self.negative_tolerance < 0.0 {
            return Err(EngineError::config("negative_tolerance must be >= 0"));
        }
        if self.newton.max_iterations == 0 || self.linear.max_iterations == 0 {
            return Err(EngineError::config("iteration limits must be positive"));
        }

        Ok(TimeWindow {
            start: self.initial_t,
            final_t,
            initial_dt,
        })
    }
}
