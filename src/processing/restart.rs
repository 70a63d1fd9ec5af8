use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::numerics::clock::FailedStep;

/// Everything needed to resume stepping: the last accepted time level, both
/// solution fields and the failed-step log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub t: f64,
    pub dt: f64,
    pub step_index: usize,
    pub history: Vec<(f64, f64)>,
    /// Active domain names in block order.
    pub domains: Vec<String>,
    pub u: Vec<Vec<f64>>,
    pub n: Vec<Vec<f64>>,
    pub failed_steps: Vec<FailedStep>,
}

impl RunState {
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), EngineError> {
        let writer = BufWriter::new(File::create(path)?);
        serde_json::to_writer_pretty(writer, self)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EngineError> {
        let reader = BufReader::new(File::open(path)?);
        Ok(serde_json::from_reader(reader)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureReason;
    use crate::numerics::solver::ConvergedReason;
    use std::fs;

    #[test]
    fn run_state_survives_a_file_round_trip() {
        let state = RunState {
            t: 0.5,
            dt: 0.1,
            step_index: 5,
            history: vec![(0.0, 0.1), (0.5, 0.1)],
            domains: vec!["cytosol".into()],
            u: vec![vec![1.0, 2.0]],
            n: vec![vec![0.5, 1.5]],
            failed_steps: vec![FailedStep {
                step_index: 3,
                newton_iterations: 50,
                linear_iterations: 812,
                t: 0.4,
                dt: 0.1,
                reason: FailureReason::Diverged(ConvergedReason::DivergedMaxIts),
            }],
        };
        let path = std::env::temp_dir().join("mdrd_run_state_test.json");
        state.save(&path).unwrap();
        let loaded = RunState::load(&path).unwrap();
        fs::remove_file(&path).ok();
        assert_eq!(loaded, state);
    }
}
