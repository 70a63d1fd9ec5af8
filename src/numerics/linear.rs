use std::sync::Arc;

use kryst::matrix::sparse::CsrMatrix;
use kryst::solver::LinearSolver as _;
use kryst::{
    parallel::{NoComm, UniverseComm},
    preconditioner::PcSide,
};
use log::debug;
use nalgebra::DVector;
use thiserror::Error;

use crate::config::{FieldSplitType, LinearConfig, LinearSolverKind};
use crate::numerics::sparse::BlockMatrix;

#[derive(Debug, Error)]
pub enum LinearError {
    #[error("krylov solver failed: {0}")]
    Krylov(String),
    #[error("matrix is singular")]
    Singular,
    #[error("linear solve produced NaN or Inf")]
    NotFinite,
    #[error("linear solve made no progress (relative residual {0:.3e})")]
    NoProgress(f64),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LinearStats {
    pub iterations: usize,
    /// `||b - A x|| / ||b||` of the returned solution.
    pub relative_residual: f64,
}

/// Preconditioned solve of the Newton system `J delta = -F`.
#[derive(Debug, Clone)]
pub struct LinearSolver {
    pub config: LinearConfig,
    /// Forcing term for inexact Newton.
    pub forcing_term: f64,
}

impl LinearSolver {
    pub fn new(config: LinearConfig, forcing_term: f64) -> Self {
        Self {
            config,
            forcing_term,
        }
    }

    /// Field-split is used whenever several domains are coupled.
    pub fn effective_kind(&self, num_blocks: usize) -> LinearSolverKind {
        match self.config.kind {
            LinearSolverKind::Auto if num_blocks > 1 => LinearSolverKind::FieldSplit,
            LinearSolverKind::Auto => LinearSolverKind::BiCgStab,
            kind => kind,
        }
    }

    /// Solve `A x = rhs`. `residual_norm` is the current Newton residual and
    /// sets the Krylov tolerance.
    pub fn solve(
        &self,
        matrix: &BlockMatrix,
        rhs: &DVector<f64>,
        residual_norm: f64,
    ) -> Result<(DVector<f64>, LinearStats), LinearError> {
        let n = rhs.len();
        let b_norm = rhs.norm();
        if b_norm == 0.0 {
            return Ok((DVector::zeros(n), LinearStats::default()));
        }

        let tol = (residual_norm * self.forcing_term)
            .max(self.config.rtol)
            .min(1e-2);

        let kind = self.effective_kind(matrix.pattern().num_blocks());
        let (x, iterations) = match kind {
            LinearSolverKind::DirectLu => {
                let x = matrix
                    .to_dense()
                    .lu()
                    .solve(rhs)
                    .ok_or(LinearError::Singular)?;
                (x, 1)
            }
            LinearSolverKind::FieldSplit => self.field_split(matrix, rhs, tol)?,
            LinearSolverKind::BiCgStab | LinearSolverKind::Auto => {
                bicgstab(matrix.to_kryst(), rhs, tol, self.config.max_iterations)?
            }
        };

        if !x.iter().all(|v| v.is_finite()) {
            return Err(LinearError::NotFinite);
        }
        let relative_residual = (rhs - matrix.matvec(&x)).norm() / b_norm;
        if !relative_residual.is_finite() {
            return Err(LinearError::NotFinite);
        }
        if relative_residual >= 1.0 {
            return Err(LinearError::NoProgress(relative_residual));
        }

        Ok((
            x,
            LinearStats {
                iterations,
                relative_residual,
            },
        ))
    }

    /// Block relaxation over the domain blocks, each diagonal block solved
    /// with BiCGStab, followed by a global BiCGStab correction if the sweeps
    /// stall.
    fn field_split(
        &self,
        matrix: &BlockMatrix,
        rhs: &DVector<f64>,
        tol: f64,
    ) -> Result<(DVector<f64>, usize), LinearError> {
        let pattern = matrix.pattern().clone();
        let num_blocks = pattern.num_blocks();
        let b_norm = rhs.norm();

        let mut x = DVector::zeros(rhs.len());
        let mut iterations = 0;
        let mut relative = 1.0;

        for sweep in 0..self.config.max_sweeps {
            let frozen = match self.config.field_split {
                FieldSplitType::Additive => Some(x.clone()),
                FieldSplitType::Multiplicative => None,
            };
            for block in 0..num_blocks {
                let range = pattern.block_range(block);
                if range.is_empty() {
                    continue;
                }
                let coupling = matrix.off_block_product(block, frozen.as_ref().unwrap_or(&x));
                let local_rhs = rhs.rows(range.start, range.len()).into_owned() - coupling;
                if local_rhs.norm() == 0.0 {
                    x.rows_mut(range.start, range.len()).fill(0.0);
                    continue;
                }
                let (x_i, its) = bicgstab(
                    matrix.diagonal_block_to_kryst(block),
                    &local_rhs,
                    tol * 0.1,
                    self.config.max_iterations,
                )?;
                iterations += its;
                x.rows_mut(range.start, range.len()).copy_from(&x_i);
            }

            relative = (rhs - matrix.matvec(&x)).norm() / b_norm;
            debug!(
                "field-split sweep {}: relative residual {:.3e}",
                sweep, relative
            );
            if relative < tol {
                return Ok((x, iterations));
            }
        }

        if relative.is_finite() && relative > 0.0 {
            let correction_rhs = rhs - matrix.matvec(&x);
            let (dx, its) = bicgstab(
                matrix.to_kryst(),
                &correction_rhs,
                tol / relative.max(tol),
                self.config.max_iterations,
            )?;
            iterations += its;
            x += dx;
        }
        Ok((x, iterations))
    }
}

/// Jacobi row-scaled BiCGStab on a CSR matrix.
fn bicgstab(
    mut jacobian: CsrMatrix<f64>,
    rhs: &DVector<f64>,
    tol: f64,
    max_iterations: usize,
) -> Result<(DVector<f64>, usize), LinearError> {
    let n = rhs.len();

    let d_inv: Vec<f64> = (0..n)
        .map(|row_idx| {
            let row_start = jacobian.row_ptr()[row_idx];
            let row_end = jacobian.row_ptr()[row_idx + 1];
            let diag = (row_start..row_end)
                .find(|&idx| jacobian.col_idx()[idx] == row_idx)
                .map(|idx| jacobian.values()[idx])
                .unwrap_or(1.0);
            if diag.abs() < 1e-12 { 1.0 } else { 1.0 / diag }
        })
        .collect();

    // A' = D^{-1} A
    for (row_idx, &scale) in d_inv.iter().enumerate() {
        for val in jacobian.row_values_mut(row_idx).iter_mut() {
            *val *= scale;
        }
    }
    let b: DVector<f64> = DVector::from_iterator(n, (0..n).map(|idx| rhs[idx] * d_inv[idx]));
    if !b.iter().all(|v| v.is_finite()) {
        return Err(LinearError::NotFinite);
    }

    let op = kryst::matrix::op::CsrOp::new(Arc::new(jacobian));
    let mut solver = kryst::solver::bicgstab::BiCgStabSolver::new(tol, max_iterations);
    let mut workspace = kryst::context::ksp_context::Workspace::new(n);
    solver.setup_workspace(&mut workspace);

    let mut x = DVector::from_element(n, 0.0);
    let stats = solver
        .solve(
            &op,
            None,
            b.as_slice(),
            x.as_mut_slice(),
            PcSide::Left,
            &UniverseComm::NoComm(NoComm {}),
            None,
            Some(&mut workspace),
        )
        .map_err(|e| LinearError::Krylov(format!("{:?}", e)))?;

    Ok((x, stats.iterations as usize))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::sparse::BlockPattern;
    use approx::assert_relative_eq;

    fn solver(kind: LinearSolverKind) -> LinearSolver {
        LinearSolver::new(
            LinearConfig {
                kind,
                rtol: 1e-10,
                ..LinearConfig::default()
            },
            0.0,
        )
    }

    #[test]
    fn auto_picks_field_split_for_coupled_systems() {
        let s = solver(LinearSolverKind::Auto);
        assert_eq!(s.effective_kind(1), LinearSolverKind::BiCgStab);
        assert_eq!(s.effective_kind(3), LinearSolverKind::FieldSplit);
        assert_eq!(
            solver(LinearSolverKind::DirectLu).effective_kind(3),
            LinearSolverKind::DirectLu
        );
    }

    #[test]
    fn zero_rhs_short_circuits() {
        let pattern = Arc::new(BlockPattern::from_entries(&[2], &[(0, 0), (1, 1)]));
        let mut a = BlockMatrix::new(pattern);
        a.add(0, 0, 2.0);
        a.add(1, 1, 3.0);
        let (x, stats) = solver(LinearSolverKind::DirectLu)
            .solve(&a, &DVector::zeros(2), 1.0)
            .unwrap();
        assert_eq!(x, DVector::zeros(2));
        assert_eq!(stats.iterations, 0);
    }

    #[test]
    fn direct_lu_solves_coupled_blocks() {
        // [4 1 | 1]
        // [1 3 | 0]
        // [1 0 | 2]
        let entries = [(0, 0), (0, 1), (0, 2), (1, 0), (1, 1), (2, 0), (2, 2)];
        let pattern = Arc::new(BlockPattern::from_entries(&[2, 1], &entries));
        let mut a = BlockMatrix::new(pattern);
        for (&(r, c), v) in entries.iter().zip([4.0, 1.0, 1.0, 1.0, 3.0, 1.0, 2.0]) {
            a.add(r, c, v);
        }
        let expected = DVector::from_vec(vec![1.0, -1.0, 2.0]);
        let rhs = a.matvec(&expected);
        let (x, stats) = solver(LinearSolverKind::DirectLu)
            .solve(&a, &rhs, 1.0)
            .unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-12);
        assert!(stats.relative_residual < 1e-12);
    }

    #[test]
    fn singular_matrix_is_reported() {
        let pattern = Arc::new(BlockPattern::from_entries(&[2], &[(0, 0), (1, 1)]));
        let mut a = BlockMatrix::new(pattern);
        a.add(0, 0, 1.0);
        let err = solver(LinearSolverKind::DirectLu)
            .solve(&a, &DVector::from_vec(vec![1.0, 1.0]), 1.0)
            .unwrap_err();
        assert!(matches!(err, LinearError::Singular));
    }

    // Two diagonally dominant blocks (3 + 2 unknowns) with off-block coupling.
    fn coupled_system() -> (BlockMatrix, DVector<f64>) {
        let values = [
            ((0, 0), 4.0),
            ((0, 1), -1.0),
            ((0, 3), 0.5),
            ((1, 0), -1.0),
            ((1, 1), 4.0),
            ((1, 2), -1.0),
            ((2, 1), -1.0),
            ((2, 2), 4.0),
            ((2, 4), -0.5),
            ((3, 0), 0.5),
            ((3, 3), 5.0),
            ((3, 4), 1.0),
            ((4, 2), 1.0),
            ((4, 3), 1.0),
            ((4, 4), 3.0),
        ];
        let entries: Vec<(usize, usize)> = values.iter().map(|&(rc, _)| rc).collect();
        let pattern = Arc::new(BlockPattern::from_entries(&[3, 2], &entries));
        let mut a = BlockMatrix::new(pattern);
        for &((r, c), v) in &values {
            assert!(a.add(r, c, v));
        }
        (a, DVector::from_vec(vec![1.0, -2.0, 0.5, 3.0, -1.0]))
    }

    fn field_split_solver(split: FieldSplitType) -> LinearSolver {
        LinearSolver::new(
            LinearConfig {
                kind: LinearSolverKind::FieldSplit,
                rtol: 1e-10,
                field_split: split,
                ..LinearConfig::default()
            },
            0.0,
        )
    }

    #[test]
    fn multiplicative_field_split_recovers_known_solution() {
        let (a, expected) = coupled_system();
        let rhs = a.matvec(&expected);
        let (x, stats) = field_split_solver(FieldSplitType::Multiplicative)
            .solve(&a, &rhs, 1.0)
            .unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-7);
        assert!(stats.relative_residual < 1e-8);
        assert!(stats.iterations > 0);
    }

    #[test]
    fn additive_field_split_recovers_known_solution() {
        let (a, expected) = coupled_system();
        let rhs = a.matvec(&expected);
        let (x, stats) = field_split_solver(FieldSplitType::Additive)
            .solve(&a, &rhs, 1.0)
            .unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-7);
        assert!(stats.relative_residual < 1e-8);
    }

    #[test]
    fn bicgstab_recovers_known_solution() {
        let (a, expected) = coupled_system();
        let rhs = a.matvec(&expected);
        let (x, stats) = solver(LinearSolverKind::BiCgStab)
            .solve(&a, &rhs, 1.0)
            .unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-7);
        assert!(stats.relative_residual < 1e-8);
    }

    #[test]
    fn auto_dispatches_to_field_split_on_block_systems() {
        let (a, expected) = coupled_system();
        let rhs = a.matvec(&expected);
        let (x, _) = solver(LinearSolverKind::Auto).solve(&a, &rhs, 1.0).unwrap();
        assert_relative_eq!(x, expected, epsilon = 1e-7);
    }
}
