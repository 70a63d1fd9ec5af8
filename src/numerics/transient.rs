use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::DVector;

use crate::config::SolverConfig;
use crate::error::{EngineError, FailureReason};
use crate::model::domain::DomainId;
use crate::model::parameter::ParameterTable;
use crate::model::Model;
use crate::numerics::blocks::BlockSystem;
use crate::numerics::clock::{FailedStep, SimulationClock};
use crate::numerics::linear::LinearSolver;
use crate::numerics::parallel::Collective;
use crate::numerics::solver::{
    ConvergedReason, NewtonArmijoSolver, NonlinearProblem, SolverError, SolverResult,
};
use crate::numerics::sparse::{BlockMatrix, BlockPattern};
use crate::numerics::state::SolutionState;
use crate::numerics::timing::{finalize_and_print, record_step, reset_timing};
use crate::physics::assembly::{Assembler, AssemblyInput};
use crate::processing::restart::RunState;

/// Diagnostics of one accepted step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub step_index: usize,
    pub t: f64,
    pub dt: f64,
    pub newton_iterations: u32,
    pub linear_iterations: usize,
    pub reason: ConvergedReason,
    /// L2 norm of each domain's residual at the accepted solution.
    pub domain_residuals: Vec<(String, f64)>,
    /// Rejected attempts before this step was accepted.
    pub retries: usize,
}

/// Residual of every block at the given iterate.
fn assemble_residual<A: Assembler>(
    assembler: &A,
    blocks: &BlockSystem,
    input: &AssemblyInput<'_>,
) -> Vec<DVector<f64>> {
    blocks
        .residual
        .iter()
        .map(|rb| {
            let mut out = DVector::zeros(input.model.domain(rb.domain).num_unknowns());
            for part in &rb.parts {
                assembler.residual(input, rb.domain, part, &mut out);
            }
            out
        })
        .collect()
}

/// The backward-Euler system of one step attempt.
///
/// Jacobian blocks flagged constant are assembled on the first Newton
/// iteration and reused for the rest of the attempt.
struct StepProblem<'a, A: Assembler> {
    model: &'a Model,
    params: &'a ParameterTable,
    assembler: &'a A,
    blocks: &'a BlockSystem,
    pattern: &'a Arc<BlockPattern>,
    state: &'a SolutionState,
    t: f64,
    dt: f64,
    cache: Option<Vec<Option<Vec<(usize, usize, f64)>>>>,
}

impl<'a, A: Assembler> StepProblem<'a, A> {
    fn input<'b>(&'b self, u: &'b [DVector<f64>]) -> AssemblyInput<'b> {
        AssemblyInput {
            model: self.model,
            params: self.params,
            u,
            n: self.state.n_blocks(),
            t: self.t,
            dt: self.dt,
        }
    }
}

impl<'a, A: Assembler> NonlinearProblem for StepProblem<'a, A> {
    fn residual(&mut self, x: &DVector<f64>) -> DVector<f64> {
        let u = self.state.split(x);
        let blocks = assemble_residual(self.assembler, self.blocks, &self.input(&u));
        let mut out = DVector::zeros(x.len());
        for (b, block) in blocks.iter().enumerate() {
            let range = self.pattern.block_range(b);
            out.rows_mut(range.start, range.len()).copy_from(block);
        }
        out
    }

    fn jacobian(&mut self, x: &DVector<f64>) -> BlockMatrix {
        let u = self.state.split(x);
        let nb = self.blocks.num_blocks();
        let mut matrix = BlockMatrix::new(self.pattern.clone());
        let mut cache = self.cache.take();
        let mut triplets = Vec::new();

        {
            let input = self.input(&u);
            for jb in self.blocks.blocks() {
                if jb.is_empty() {
                    continue;
                }
                let slot = jb.row * nb + jb.col;
                if let Some(cached) = cache.as_ref().and_then(|c| c[slot].as_ref()) {
                    matrix.add_block(jb.row, jb.col, cached);
                    continue;
                }

                triplets.clear();
                for part in &jb.parts {
                    self.assembler
                        .jacobian(&input, jb.row_domain, jb.col_domain, part, &mut triplets);
                }
                let dropped = matrix.add_block(jb.row, jb.col, &triplets);
                if dropped > 0 {
                    warn!(
                        "{} jacobian entries of block ({}, {}) fall outside the sparsity pattern",
                        dropped, jb.row, jb.col
                    );
                }
                if jb.constant {
                    if let Some(c) = cache.as_mut() {
                        c[slot] = Some(triplets.clone());
                    }
                }
            }
        }

        self.cache = cache;
        matrix
    }
}

/// Multi-domain implicit time integrator.
///
/// Owns the clock, the solution fields and the block structure; the model
/// and coefficients are read by assembly and advanced between steps.
pub struct Engine<A: Assembler, C: Collective> {
    model: Model,
    params: ParameterTable,
    assembler: A,
    comm: C,
    config: SolverConfig,
    blocks: BlockSystem,
    pattern: Arc<BlockPattern>,
    clock: SimulationClock,
    state: SolutionState,
    newton: NewtonArmijoSolver,
    linear: LinearSolver,
    reports: Vec<StepReport>,
}

impl<A: Assembler, C: Collective> Engine<A, C> {
    pub fn new(
        mut model: Model,
        mut params: ParameterTable,
        assembler: A,
        comm: C,
        config: SolverConfig,
    ) -> Result<Self, EngineError> {
        let window = config.validate()?;

        model.registry.activate()?;
        model.generate_transport_forms();
        model.validate()?;
        params.validate(&model.registry)?;

        if comm.is_root() {
            for (block, &id) in model.registry.active().iter().enumerate() {
                let d = model.domain(id);
                info!(
                    "block {}: domain '{}' ({:?}), {} cells x {} species = {} unknowns",
                    block,
                    d.name,
                    d.kind,
                    d.mesh.num_cells(),
                    d.num_species(),
                    d.num_unknowns()
                );
            }
        }

        let blocks = BlockSystem::build(&model);
        let pattern = Arc::new(BlockPattern::build(&model, &blocks, &assembler));
        debug!(
            "jacobian pattern: {} unknowns, {} nonzeros, {} coupled blocks",
            pattern.size(),
            pattern.nnz(),
            blocks.coupled_pairs().len()
        );

        let state = SolutionState::from_model(&model);
        let clock = SimulationClock::new(window, config.time_precision, &config.adjust_dt)?;
        params.initialize(clock.t())?;
        model.check_kernel_reads(&params)?;

        let newton = NewtonArmijoSolver::from_config(&config.newton);
        let linear = LinearSolver::new(config.linear.clone(), config.newton.forcing_term);

        let engine = Self {
            model,
            params,
            assembler,
            comm,
            config,
            blocks,
            pattern,
            clock,
            state,
            newton,
            linear,
            reports: Vec::new(),
        };
        engine.report_initial_residuals();
        Ok(engine)
    }

    fn report_initial_residuals(&self) {
        for (name, norm) in self.domain_residual_norms() {
            if !self.comm.is_root() {
                continue;
            }
            if norm > 1.0 {
                warn!(
                    "initial residual of domain '{}' is {:.3e}; initial conditions may be inconsistent",
                    name, norm
                );
            } else {
                info!("initial residual of domain '{}': {:.3e}", name, norm);
            }
        }
    }

    /// Global L2 residual norm of each active domain at the current iterate.
    pub fn domain_residual_norms(&self) -> Vec<(String, f64)> {
        let input = AssemblyInput {
            model: &self.model,
            params: &self.params,
            u: self.state.u_blocks(),
            n: self.state.n_blocks(),
            t: self.clock.t(),
            dt: self.clock.dt(),
        };
        let residual = assemble_residual(&self.assembler, &self.blocks, &input);
        self.named_norms(&residual)
    }

    fn named_norms(&self, blocks: &[DVector<f64>]) -> Vec<(String, f64)> {
        blocks
            .iter()
            .zip(&self.blocks.residual)
            .map(|(r, rb)| (self.model.domain(rb.domain).name.clone(), self.comm.norm2(r)))
            .collect()
    }

    /// Solve the system of the step in flight, starting from the current
    /// iterate.
    fn solve_step(&self, t: f64, dt: f64) -> Result<SolverResult, SolverError> {
        let mut problem = StepProblem {
            model: &self.model,
            params: &self.params,
            assembler: &self.assembler,
            blocks: &self.blocks,
            pattern: &self.pattern,
            state: &self.state,
            t,
            dt,
            cache: self.config.preassemble_linear_blocks.then(|| {
                let nb = self.blocks.num_blocks();
                vec![None; nb * nb]
            }),
        };
        self.newton
            .solve(&mut problem, &self.linear, &self.comm, self.state.gather_u())
    }

    /// Apply the negative-value policy to the converged iterate. Returns the
    /// offending minimum if the step must be rejected.
    fn check_negativity(&mut self) -> Result<(), f64> {
        if !self.config.reset_timestep_for_negative_solution {
            return Ok(());
        }
        let min = self.state.min_u(&self.comm);
        if min < -self.config.negative_tolerance {
            return Err(min);
        }
        if min < 0.0 {
            let clamped = self.state.clamp_negatives();
            debug!("clamped {} values down to {:.3e} to zero", clamped, min);
        }
        Ok(())
    }

    /// Advance by one accepted step.
    ///
    /// Failed attempts are rolled back and retried with a shrunk dt, up to
    /// `max_step_retries` times, unless restarts are disabled.
    pub fn take_step(&mut self) -> Result<StepReport, EngineError> {
        record_step(|| self.attempt_step())
    }

    fn attempt_step(&mut self) -> Result<StepReport, EngineError> {
        let mut retries = 0;
        loop {
            self.clock.propose_next_dt()?;
            let snapshot = self.params.snapshot();
            self.clock.forward_time_step();
            let (t, tn, dt) = (self.clock.t(), self.clock.tn(), self.clock.dt());

            if let Err(e) = self.params.advance_all(t, tn, dt) {
                self.params.restore(snapshot);
                self.clock.cancel_step();
                return Err(e);
            }

            let (reason, newton_its, linear_its) = match self.solve_step(t, dt) {
                Ok(result) => {
                    self.state.scatter_u(&result.solution);
                    match self.check_negativity() {
                        Ok(()) => return Ok(self.accept(result, retries)),
                        Err(min) => (
                            FailureReason::NegativeSolution { min },
                            result.iterations,
                            result.linear_iterations,
                        ),
                    }
                }
                Err(e) => (
                    FailureReason::Diverged(e.reason()),
                    e.iterations(),
                    e.linear_iterations(),
                ),
            };

            self.params.restore(snapshot);
            self.state.rollback_all();
            let failed =
                self.clock
                    .rollback(self.config.dt_shrink_factor, newton_its, linear_its, reason);
            if self.comm.is_root() {
                warn!(
                    "step {} failed at t = {} (dt = {}): {}; retrying with dt = {}",
                    failed.step_index,
                    failed.t,
                    failed.dt,
                    reason,
                    self.clock.dt()
                );
            }

            if !self.config.attempt_timestep_restart_on_divergence {
                return Err(EngineError::Convergence {
                    step: failed.step_index,
                    t: failed.t,
                    dt: failed.dt,
                    reason,
                });
            }

            retries += 1;
            if retries > self.config.max_step_retries {
                let log = self.clock.failed_steps();
                return Err(EngineError::RetryLimitExceeded {
                    step: failed.step_index,
                    t: self.clock.t(),
                    retries: self.config.max_step_retries,
                    failures: log[log.len().saturating_sub(retries)..].to_vec(),
                });
            }
        }
    }

    fn accept(&mut self, result: SolverResult, retries: usize) -> StepReport {
        self.state.advance_all();
        self.clock.commit();
        if self.config.adapt_dt_to_iterations {
            self.clock.adapt_to_iterations(result.iterations);
        }

        let domain_residuals = self.named_norms(&self.state.split(&result.residual));
        let report = StepReport {
            step_index: self.clock.step_index(),
            t: self.clock.t(),
            dt: self.clock.history().last().map_or(self.clock.dt(), |&(_, dt)| dt),
            newton_iterations: result.iterations,
            linear_iterations: result.linear_iterations,
            reason: result.reason,
            domain_residuals,
            retries,
        };

        if self.comm.is_root() {
            let norms: Vec<String> = report
                .domain_residuals
                .iter()
                .map(|(name, norm)| format!("{}={:.2e}", name, norm))
                .collect();
            info!(
                "step {:>5} | t = {:.6e} | dt = {:.3e} | newton {:>2} | linear {:>4} | reason {} | {}",
                report.step_index,
                report.t,
                report.dt,
                report.newton_iterations,
                report.linear_iterations,
                report.reason.code(),
                norms.join(" ")
            );
        }

        self.reports.push(report.clone());
        report
    }

    /// Step until the final time, calling `callback` after every accepted
    /// step. Returns the number of steps taken.
    pub fn run_to_final(
        &mut self,
        mut callback: impl FnMut(&StepReport, &SolutionState),
    ) -> Result<usize, EngineError> {
        reset_timing();
        let start = Instant::now();
        let mut steps = 0;
        while !self.clock.is_finished() {
            let report = self.take_step()?;
            callback(&report, &self.state);
            steps += 1;
        }
        self.comm.barrier();
        if self.comm.is_root() {
            finalize_and_print(start.elapsed());
            info!(
                "reached t = {} after {} steps ({} failed attempts)",
                self.clock.t(),
                self.clock.step_index(),
                self.clock.failed_steps().len()
            );
        }
        Ok(steps)
    }

    /// Persistable snapshot of the last accepted step, with every block
    /// gathered onto the calling worker.
    pub fn checkpoint(&self) -> RunState {
        RunState {
            t: self.clock.t(),
            dt: self.clock.dt(),
            step_index: self.clock.step_index(),
            history: self.clock.history(),
            domains: self
                .model
                .registry
                .active()
                .iter()
                .map(|&id| self.model.domain(id).name.clone())
                .collect(),
            u: self.state.u_blocks().iter().map(|v| self.comm.gather(v.as_slice())).collect(),
            n: self.state.n_blocks().iter().map(|v| self.comm.gather(v.as_slice())).collect(),
            failed_steps: self.clock.failed_steps().to_vec(),
        }
    }

    /// Continue from a persisted run state.
    pub fn resume(&mut self, saved: RunState) -> Result<(), EngineError> {
        let active: Vec<&str> = self
            .model
            .registry
            .active()
            .iter()
            .map(|&id| self.model.domain(id).name.as_str())
            .collect();
        if active != saved.domains.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(EngineError::config(format!(
                "saved run has domains {:?}, model has {:?}",
                saved.domains, active
            )));
        }
        self.state.restore(
            saved.u.into_iter().map(DVector::from_vec).collect(),
            saved.n.into_iter().map(DVector::from_vec).collect(),
        )?;
        self.clock.restore(
            saved.t,
            saved.dt,
            saved.step_index,
            &saved.history,
            saved.failed_steps,
        )?;
        self.params.initialize(self.clock.t())?;
        info!("resumed at t = {} (step {})", self.clock.t(), self.clock.step_index());
        Ok(())
    }

    /// Restart the clock from a recorded time axis, repeating its last step.
    pub fn resume_from_time_axis(&mut self, times: &[f64]) -> Result<(), EngineError> {
        self.clock.resume_from_time_axis(times)?;
        self.params.initialize(self.clock.t())?;
        info!(
            "resuming from recorded time axis at t = {} with dt = {}",
            self.clock.t(),
            self.clock.dt()
        );
        Ok(())
    }

    /// Rescale every term tested against `domain`.
    pub fn set_form_scaling(&mut self, domain: DomainId, factor: f64) {
        self.model.set_form_scaling(domain, factor);
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn params(&self) -> &ParameterTable {
        &self.params
    }

    pub fn state(&self) -> &SolutionState {
        &self.state
    }

    pub fn clock(&self) -> &SimulationClock {
        &self.clock
    }

    pub fn blocks(&self) -> &BlockSystem {
        &self.blocks
    }

    pub fn pattern(&self) -> &Arc<BlockPattern> {
        &self.pattern
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn comm(&self) -> &C {
        &self.comm
    }

    pub fn reports(&self) -> &[StepReport] {
        &self.reports
    }

    pub fn failed_steps(&self) -> &[FailedStep] {
        self.clock.failed_steps()
    }
}
