use std::collections::VecDeque;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::TimeWindow;
use crate::error::{EngineError, FailureReason};
use crate::processing::series::validate_time_axis;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerState {
    Normal,
    /// The last accepted step landed on a checkpoint whose new dt has not
    /// been applied yet.
    PendingCheckpointReset,
    /// The last attempt was rolled back; checkpoint logic waits for a commit.
    Failed,
}

/// One rejected step attempt, as recorded in the failed-step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedStep {
    pub step_index: usize,
    pub newton_iterations: u32,
    pub linear_iterations: usize,
    pub t: f64,
    pub dt: f64,
    pub reason: FailureReason,
}

/// Simulation clock and step-size controller.
///
/// Times are stored as integer ticks of `10^-precision`, so checkpoint
/// comparisons and the accumulated time are exact.
#[derive(Debug, Clone)]
pub struct SimulationClock {
    precision: u32,
    ticks_per_unit: f64,
    t: i64,
    tn: i64,
    dt: i64,
    final_t: i64,
    step_index: usize,
    /// Accepted `(t, dt)` pairs; the last entry is the attempt in flight
    /// between `forward_time_step` and `commit`/`rollback`.
    history: Vec<(i64, i64)>,
    checkpoints: VecDeque<(i64, i64)>,
    state: ControllerState,
    failed: Vec<FailedStep>,
}

impl SimulationClock {
    pub fn new(
        window: TimeWindow,
        precision: u32,
        checkpoints: &[(f64, f64)],
    ) -> Result<Self, EngineError> {
        let ticks_per_unit = 10f64.powi(precision as i32);
        let to_ticks = |x: f64| (x * ticks_per_unit).round() as i64;

        let t = to_ticks(window.start);
        let dt = to_ticks(window.initial_dt);
        if dt <= 0 {
            return Err(EngineError::config(format!(
                "dt = {} is below the time resolution 1e-{}",
                window.initial_dt, precision
            )));
        }
        let final_t = to_ticks(window.final_t);
        if final_t <= t {
            return Err(EngineError::config("final_t must lie after the start time"));
        }

        let mut queue = VecDeque::with_capacity(checkpoints.len());
        for &(ta, dta) in checkpoints {
            let dta_ticks = to_ticks(dta);
            if dta_ticks <= 0 {
                return Err(EngineError::config(format!(
                    "checkpoint dt {} at t = {} is below the time resolution",
                    dta, ta
                )));
            }
            let ta_ticks = to_ticks(ta);
            if ta_ticks < t {
                continue;
            }
            if let Some(&(prev, _)) = queue.back() {
                if ta_ticks <= prev {
                    return Err(EngineError::config(format!(
                        "checkpoint t = {} does not lie after the previous one at precision 1e-{}",
                        ta, precision
                    )));
                }
            }
            queue.push_back((ta_ticks, dta_ticks));
        }

        Ok(Self {
            precision,
            ticks_per_unit,
            t,
            tn: t,
            dt,
            final_t,
            step_index: 0,
            history: vec![(t, dt)],
            checkpoints: queue,
            state: ControllerState::Normal,
            failed: Vec::new(),
        })
    }

    #[inline]
    fn to_ticks(&self, x: f64) -> i64 {
        (x * self.ticks_per_unit).round() as i64
    }

    #[inline]
    fn to_time(&self, ticks: i64) -> f64 {
        ticks as f64 / self.ticks_per_unit
    }

    /// Round `x` to the clock's resolution.
    pub fn quantize(&self, x: f64) -> f64 {
        self.to_time(self.to_ticks(x))
    }

    pub fn t(&self) -> f64 {
        self.to_time(self.t)
    }

    pub fn tn(&self) -> f64 {
        self.to_time(self.tn)
    }

    pub fn dt(&self) -> f64 {
        self.to_time(self.dt)
    }

    pub fn final_t(&self) -> f64 {
        self.to_time(self.final_t)
    }

    pub fn precision(&self) -> u32 {
        self.precision
    }

    pub fn step_index(&self) -> usize {
        self.step_index
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn is_finished(&self) -> bool {
        self.t >= self.final_t
    }

    pub fn history(&self) -> Vec<(f64, f64)> {
        self.history
            .iter()
            .map(|&(t, dt)| (self.to_time(t), self.to_time(dt)))
            .collect()
    }

    pub fn remaining_checkpoints(&self) -> Vec<(f64, f64)> {
        self.checkpoints
            .iter()
            .map(|&(t, dt)| (self.to_time(t), self.to_time(dt)))
            .collect()
    }

    pub fn failed_steps(&self) -> &[FailedStep] {
        &self.failed
    }

    /// Choose the step size for the next attempt.
    ///
    /// Prescribed checkpoints are honoured first (skipped right after a
    /// rollback so the shrunk dt survives), then the step is clipped so it
    /// never passes `final_t`. Proposing a step once `final_t` is reached
    /// is a configuration error.
    pub fn propose_next_dt(&mut self) -> Result<f64, EngineError> {
        if self.t >= self.final_t {
            return Err(EngineError::config(format!(
                "dt is <= 0: t = {} already reached final_t = {}",
                self.t(),
                self.final_t()
            )));
        }
        if self.state != ControllerState::Failed {
            self.apply_checkpoints();
        }

        if self.t + self.dt > self.final_t {
            self.dt = self.final_t - self.t;
            debug!("dt clipped to {} to land on final time", self.dt());
        }
        if self.dt <= 0 {
            return Err(EngineError::config(format!("dt is <= 0 at t = {}", self.t())));
        }
        Ok(self.dt())
    }

    fn apply_checkpoints(&mut self) {
        let Some(&(t_adjust, dt_adjust)) = self.checkpoints.front() else {
            return;
        };

        if self.state == ControllerState::PendingCheckpointReset || self.t == t_adjust {
            self.checkpoints.pop_front();
            self.dt = dt_adjust;
            self.state = ControllerState::Normal;
            debug!(
                "checkpoint t = {} reached, dt set to {}",
                self.to_time(t_adjust),
                self.dt()
            );
        } else if self.t < t_adjust && t_adjust <= self.t + self.dt {
            let remaining = t_adjust - self.t;
            self.dt = remaining.max(dt_adjust);
            if dt_adjust > remaining {
                self.checkpoints.pop_front();
                debug!(
                    "checkpoint t = {} honoured immediately with dt = {}",
                    self.to_time(t_adjust),
                    self.dt()
                );
            } else {
                self.state = ControllerState::PendingCheckpointReset;
                debug!(
                    "dt shortened to {} to land on checkpoint t = {}",
                    self.dt(),
                    self.to_time(t_adjust)
                );
            }
        }
    }

    /// Move the clock forward by the current dt.
    pub fn forward_time_step(&mut self) {
        self.tn = self.t;
        self.t += self.dt;
        self.history.push((self.t, self.dt));
    }

    /// Accept the step in flight.
    pub fn commit(&mut self) {
        self.step_index += 1;
        if self.state == ControllerState::Failed {
            self.state = ControllerState::Normal;
        }
    }

    /// Undo the step in flight and shrink dt.
    ///
    /// `t` returns to the last accepted time and the attempt is appended to
    /// the failed-step log.
    pub fn rollback(
        &mut self,
        shrink_factor: f64,
        newton_iterations: u32,
        linear_iterations: usize,
        reason: FailureReason,
    ) -> FailedStep {
        let failed_t = self.t;
        let failed_dt = self.dt;

        if self.history.len() > 1 {
            self.history.pop();
        }
        let len = self.history.len();
        self.t = self.history[len - 1].0;
        self.tn = if len >= 2 { self.history[len - 2].0 } else { self.t };
        self.dt = ((failed_dt as f64 * shrink_factor).round() as i64).max(1);
        self.state = ControllerState::Failed;

        let record = FailedStep {
            step_index: self.step_index + 1,
            newton_iterations,
            linear_iterations,
            t: self.to_time(failed_t),
            dt: self.to_time(failed_dt),
            reason,
        };
        self.failed.push(record.clone());
        record
    }

    /// Undo the step in flight without recording a failure or touching dt.
    pub fn cancel_step(&mut self) {
        if self.history.len() > 1 {
            self.history.pop();
        }
        let len = self.history.len();
        self.t = self.history[len - 1].0;
        self.tn = if len >= 2 { self.history[len - 2].0 } else { self.t };
    }

    /// Scale dt from the Newton iteration count of the step just accepted.
    pub fn adapt_to_iterations(&mut self, newton_iterations: u32) {
        let factor = match newton_iterations {
            0..=1 => 1.1,
            2..=4 => 1.05,
            5..=10 => 1.0,
            11..=20 => 0.8,
            _ => 0.5,
        };
        self.dt = ((self.dt as f64 * factor).round() as i64).max(1);
    }

    /// Restart from a previously recorded time axis.
    ///
    /// The last recorded step is repeated: stepping resumes from the
    /// second-to-last time with dt equal to the last spacing.
    pub fn resume_from_time_axis(&mut self, times: &[f64]) -> Result<(), EngineError> {
        validate_time_axis(times)?;
        let ticks: Vec<i64> = times.iter().map(|&x| self.to_ticks(x)).collect();
        if ticks.windows(2).any(|w| w[1] <= w[0]) {
            return Err(EngineError::config(
                "recorded time axis collapses at the configured precision",
            ));
        }

        let len = ticks.len();
        if len >= 2 {
            self.dt = ticks[len - 1] - ticks[len - 2];
            self.t = ticks[len - 2];
            self.tn = if len >= 3 { ticks[len - 3] } else { self.t };
            self.history = ticks[..len - 1]
                .iter()
                .enumerate()
                .map(|(i, &t)| (t, if i == 0 { self.dt } else { t - ticks[i - 1] }))
                .collect();
            self.step_index = len - 2;
        } else {
            self.t = ticks[0];
            self.tn = self.t;
            self.history = vec![(self.t, self.dt)];
            self.step_index = 0;
        }
        self.drop_stale_checkpoints();
        self.state = ControllerState::Normal;
        Ok(())
    }

    /// Restore the clock from persisted state.
    pub fn restore(
        &mut self,
        t: f64,
        dt: f64,
        step_index: usize,
        history: &[(f64, f64)],
        failed: Vec<FailedStep>,
    ) -> Result<(), EngineError> {
        let dt_ticks = self.to_ticks(dt);
        if dt_ticks <= 0 {
            return Err(EngineError::config("restored dt must be positive"));
        }
        self.t = self.to_ticks(t);
        self.dt = dt_ticks;
        self.step_index = step_index;
        self.history = history
            .iter()
            .map(|&(t, dt)| (self.to_ticks(t), self.to_ticks(dt)))
            .collect();
        if self.history.last().map(|&(t, _)| t) != Some(self.t) {
            self.history.push((self.t, self.dt));
        }
        let len = self.history.len();
        self.tn = if len >= 2 { self.history[len - 2].0 } else { self.t };
        self.failed = failed;
        self.drop_stale_checkpoints();
        self.state = ControllerState::Normal;
        Ok(())
    }

    fn drop_stale_checkpoints(&mut self) {
        while let Some(&(ta, _)) = self.checkpoints.front() {
            if ta < self.t {
                self.checkpoints.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::solver::ConvergedReason;

    fn clock(start: f64, dt: f64, final_t: f64, checkpoints: &[(f64, f64)]) -> SimulationClock {
        let window = TimeWindow {
            start,
            final_t,
            initial_dt: dt,
        };
        SimulationClock::new(window, 6, checkpoints).unwrap()
    }

    fn accept(c: &mut SimulationClock) -> f64 {
        let dt = c.propose_next_dt().unwrap();
        c.forward_time_step();
        c.commit();
        dt
    }

    #[test]
    fn checkpoint_is_landed_on_then_applied() {
        let mut c = clock(0.95, 0.1, 2.0, &[(1.0, 0.01)]);
        let dt = accept(&mut c);
        assert_eq!(dt, 0.05);
        assert_eq!(c.t(), 1.0);
        assert_eq!(c.state(), ControllerState::PendingCheckpointReset);

        let dt = accept(&mut c);
        assert_eq!(dt, 0.01);
        assert_eq!(c.t(), 1.01);
        assert!(c.remaining_checkpoints().is_empty());
    }

    #[test]
    fn checkpoint_larger_than_remaining_is_honoured_immediately() {
        let mut c = clock(0.95, 0.1, 2.0, &[(1.0, 0.2)]);
        let dt = accept(&mut c);
        assert_eq!(dt, 0.2);
        assert!(c.remaining_checkpoints().is_empty());
        assert_eq!(c.state(), ControllerState::Normal);
    }

    #[test]
    fn checkpoint_at_current_time_applies_directly() {
        let mut c = clock(0.5, 0.1, 2.0, &[(0.5, 0.03)]);
        assert_eq!(c.propose_next_dt().unwrap(), 0.03);
    }

    #[test]
    fn final_time_clips_step() {
        let mut c = clock(0.97, 0.1, 1.0, &[]);
        assert_eq!(c.propose_next_dt().unwrap(), 0.03);
        c.forward_time_step();
        c.commit();
        assert!(c.is_finished());
        assert_eq!(c.t(), 1.0);
    }

    #[test]
    fn accepted_time_is_the_exact_sum_of_steps() {
        let mut c = clock(0.0, 0.1, 1.0, &[(0.35, 0.07)]);
        let mut sum_ticks = 0i64;
        let mut last_t = c.t();
        while !c.is_finished() {
            let dt = accept(&mut c);
            sum_ticks += (dt * 1e6).round() as i64;
            assert!(c.t() > last_t);
            last_t = c.t();
        }
        assert_eq!(sum_ticks, 1_000_000);
        assert_eq!(c.t(), 1.0);
    }

    #[test]
    fn rollback_restores_time_and_shrinks_dt() {
        let mut c = clock(0.0, 0.1, 1.0, &[]);
        accept(&mut c);
        let (t_before, tn_before) = (c.t(), c.tn());

        c.propose_next_dt().unwrap();
        c.forward_time_step();
        let failed = c.rollback(
            0.2,
            7,
            42,
            FailureReason::Diverged(ConvergedReason::DivergedMaxIts),
        );

        assert_eq!(c.t(), t_before);
        assert_eq!(c.tn(), tn_before);
        assert_eq!(c.dt(), 0.02);
        assert_eq!(c.state(), ControllerState::Failed);
        assert_eq!(failed.step_index, 2);
        assert_eq!(failed.t, 0.2);
        assert_eq!(failed.dt, 0.1);
        assert_eq!(c.failed_steps().len(), 1);
        assert_eq!(c.history().len(), 2);
    }

    #[test]
    fn failed_state_keeps_shrunk_dt_across_pending_checkpoint() {
        let mut c = clock(0.95, 0.1, 2.0, &[(1.0, 0.5)]);
        // dt_adjust exceeds the gap, so 0.5 is used right away
        assert_eq!(c.propose_next_dt().unwrap(), 0.5);
        c.forward_time_step();
        c.rollback(0.2, 3, 3, FailureReason::NegativeSolution { min: -1.0 });
        assert_eq!(c.propose_next_dt().unwrap(), 0.1);
        c.forward_time_step();
        c.commit();
        assert_eq!(c.state(), ControllerState::Normal);
    }

    #[test]
    fn iteration_adaptation_scales_dt() {
        let mut c = clock(0.0, 0.1, 10.0, &[]);
        c.adapt_to_iterations(1);
        assert_eq!(c.dt(), 0.11);
        c.adapt_to_iterations(25);
        assert_eq!(c.dt(), 0.055);
    }

    #[test]
    fn resume_repeats_last_recorded_step() {
        let mut c = clock(0.0, 0.1, 10.0, &[(0.2, 0.5), (3.0, 0.1)]);
        c.resume_from_time_axis(&[0.0, 0.1, 0.3, 0.7]).unwrap();
        assert_eq!(c.t(), 0.3);
        assert_eq!(c.dt(), 0.4);
        assert_eq!(c.step_index(), 2);
        assert_eq!(c.remaining_checkpoints(), vec![(3.0, 0.1)]);

        assert!(c.resume_from_time_axis(&[0.0, 0.2, 0.1]).is_err());
    }

    #[test]
    fn stepping_past_final_time_is_rejected() {
        let mut c = clock(0.97, 0.1, 1.0, &[]);
        accept(&mut c);
        assert!(c.is_finished());
        let err = c.propose_next_dt().unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));
        assert_eq!(c.t(), 1.0);
        assert_eq!(c.history().len(), 2);

        let mut c = clock(0.0, 0.1, 1.0, &[]);
        c.resume_from_time_axis(&[0.0, 1.1, 1.3]).unwrap();
        assert!(matches!(c.propose_next_dt(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn checkpoints_colliding_at_precision_are_rejected() {
        let window = TimeWindow {
            start: 0.0,
            final_t: 2.0,
            initial_dt: 0.1,
        };
        let checkpoints = [(0.3000001, 0.05), (0.3000002, 0.02), (1.0, 0.001)];
        let err = SimulationClock::new(window, 6, &checkpoints).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        let mut c = clock(0.0, 0.1, 1.1, &[(0.3000001, 0.05), (1.0, 0.001)]);
        let mut landed = false;
        while !c.is_finished() {
            accept(&mut c);
            landed |= c.t() == 1.0;
        }
        assert!(landed);
        assert!(c.remaining_checkpoints().is_empty());
    }
}
