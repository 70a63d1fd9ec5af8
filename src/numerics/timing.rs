#![allow(unused)]
use std::cell::RefCell;
use std::time::Duration;

/// Wall-clock time spent in each phase of the run.
#[derive(Default, Clone)]
pub struct TimingStats {
    pub residual_times: Vec<Duration>,
    pub jacobian_times: Vec<Duration>,
    pub linear_solve_times: Vec<Duration>,
    pub step_times: Vec<Duration>,
    pub total_time: Duration,
}

impl TimingStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(feature = "timing")]
    pub fn print_summary(&self) {
        if self.step_times.is_empty() {
            return;
        }

        let total_residual: Duration = self.residual_times.iter().sum();
        let total_jacobian: Duration = self.jacobian_times.iter().sum();
        let total_linear: Duration = self.linear_solve_times.iter().sum();
        let total_steps: Duration = self.step_times.iter().sum();

        let accounted = total_residual + total_jacobian + total_linear;
        let overhead = total_steps.saturating_sub(accounted);
        let avg_ms = |total: Duration, n: usize| {
            if n == 0 {
                0.0
            } else {
                total.as_secs_f64() * 1000.0 / n as f64
            }
        };

        println!("\n{}", "=".repeat(60));
        println!("{:^60}", "SOLVER TIMING SUMMARY");
        println!("{}", "=".repeat(60));
        println!(
            "Total run time:                {:.3}s",
            self.total_time.as_secs_f64()
        );
        println!(
            "Time in steps:                 {:.3}s",
            total_steps.as_secs_f64()
        );
        println!("{}", "-".repeat(60));
        println!("Component breakdown:");
        println!(
            "  Residual assembly:         {:>9.3}ms  (avg: {:>9.3}ms)",
            total_residual.as_secs_f64() * 1000.0,
            avg_ms(total_residual, self.residual_times.len())
        );
        println!(
            "  Jacobian assembly:         {:>9.3}ms  (avg: {:>9.3}ms)",
            total_jacobian.as_secs_f64() * 1000.0,
            avg_ms(total_jacobian, self.jacobian_times.len())
        );
        println!(
            "  Linear solve:              {:>9.3}s   (avg: {:>9.3}ms)",
            total_linear.as_secs_f64(),
            avg_ms(total_linear, self.linear_solve_times.len())
        );
        println!("{}", "=".repeat(60));
        println!(
            "Overhead/Other:                {:>9.3}ms",
            overhead.as_secs_f64() * 1000.0
        );
        println!(
            "Counts:                        {} steps, {} residual, {} jacobian, {} lin.solve\n",
            self.step_times.len(),
            self.residual_times.len(),
            self.jacobian_times.len(),
            self.linear_solve_times.len()
        );
    }

    #[cfg(not(feature = "timing"))]
    pub fn print_summary(&self) {}
}

#[cfg(feature = "timing")]
thread_local! {
    static TIMING_STATS: RefCell<TimingStats> = RefCell::new(TimingStats::new());
}

#[cfg(feature = "timing")]
#[derive(Clone, Copy)]
enum Phase {
    Residual,
    Jacobian,
    LinearSolve,
    Step,
}

#[cfg(feature = "timing")]
fn timed<F, R>(phase: Phase, f: F) -> R
where
    F: FnOnce() -> R,
{
    let start = std::time::Instant::now();
    let result = f();
    let elapsed = start.elapsed();
    TIMING_STATS.with(|stats| {
        let mut s = stats.borrow_mut();
        match phase {
            Phase::Residual => s.residual_times.push(elapsed),
            Phase::Jacobian => s.jacobian_times.push(elapsed),
            Phase::LinearSolve => s.linear_solve_times.push(elapsed),
            Phase::Step => s.step_times.push(elapsed),
        }
    });
    result
}

#[cfg(feature = "timing")]
pub fn reset_timing() {
    TIMING_STATS.with(|stats| {
        *stats.borrow_mut() = TimingStats::new();
    });
}

#[cfg(not(feature = "timing"))]
pub fn reset_timing() {}

#[cfg(feature = "timing")]
pub fn record_residual<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::Residual, f)
}

#[cfg(not(feature = "timing"))]
pub fn record_residual<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

#[cfg(feature = "timing")]
pub fn record_jacobian<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::Jacobian, f)
}

#[cfg(not(feature = "timing"))]
pub fn record_jacobian<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

#[cfg(feature = "timing")]
pub fn record_linear_solve<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::LinearSolve, f)
}

#[cfg(not(feature = "timing"))]
pub fn record_linear_solve<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

#[cfg(feature = "timing")]
pub fn record_step<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    timed(Phase::Step, f)
}

#[cfg(not(feature = "timing"))]
pub fn record_step<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    f()
}

#[cfg(feature = "timing")]
pub fn finalize_timing(total_time: Duration) -> TimingStats {
    TIMING_STATS.with(|stats| {
        let mut s = stats.borrow_mut();
        s.total_time = total_time;
        s.clone()
    })
}

#[cfg(not(feature = "timing"))]
pub fn finalize_timing(_total_time: Duration) -> TimingStats {
    TimingStats::new()
}

#[cfg(feature = "timing")]
pub fn finalize_and_print(total_time: Duration) {
    finalize_timing(total_time).print_summary();
}

#[cfg(not(feature = "timing"))]
pub fn finalize_and_print(_total_time: Duration) {}
