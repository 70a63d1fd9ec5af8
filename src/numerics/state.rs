use nalgebra::DVector;

use crate::error::EngineError;
use crate::model::domain::DomainId;
use crate::model::Model;
use crate::numerics::parallel::Collective;

/// Current iterate `u` and accepted previous step `n` of every active
/// domain, indexed by block.
#[derive(Debug, Clone, PartialEq)]
pub struct SolutionState {
    u: Vec<DVector<f64>>,
    n: Vec<DVector<f64>>,
    offsets: Vec<usize>,
}

impl SolutionState {
    pub fn new(sizes: &[usize]) -> Self {
        let u: Vec<DVector<f64>> = sizes.iter().map(|&s| DVector::zeros(s)).collect();
        Self::from_blocks(u)
    }

    fn from_blocks(u: Vec<DVector<f64>>) -> Self {
        let mut offsets = Vec::with_capacity(u.len() + 1);
        offsets.push(0);
        for block in &u {
            offsets.push(offsets[offsets.len() - 1] + block.len());
        }
        Self {
            n: u.clone(),
            u,
            offsets,
        }
    }

    /// Allocate the fields of every active domain, filled with the species'
    /// initial values.
    pub fn from_model(model: &Model) -> Self {
        let u = model
            .registry
            .active()
            .iter()
            .map(|&id| {
                let domain = model.domain(id);
                let m = domain.num_species();
                DVector::from_fn(domain.num_unknowns(), |i, _| domain.species[i % m].initial)
            })
            .collect();
        Self::from_blocks(u)
    }

    pub fn num_blocks(&self) -> usize {
        self.u.len()
    }

    pub fn len(&self) -> usize {
        self.offsets[self.offsets.len() - 1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn u(&self, block: usize) -> &DVector<f64> {
        &self.u[block]
    }

    pub fn n(&self, block: usize) -> &DVector<f64> {
        &self.n[block]
    }

    pub fn u_blocks(&self) -> &[DVector<f64>] {
        &self.u
    }

    pub fn n_blocks(&self) -> &[DVector<f64>] {
        &self.n
    }

    pub fn set_u_block(&mut self, block: usize, values: DVector<f64>) -> Result<(), EngineError> {
        if values.len() != self.u[block].len() {
            return Err(EngineError::config(format!(
                "block {} expects {} values, got {}",
                block,
                self.u[block].len(),
                values.len()
            )));
        }
        self.u[block] = values;
        Ok(())
    }

    /// The current iterate stacked in block order.
    pub fn gather_u(&self) -> DVector<f64> {
        let mut x = DVector::zeros(self.len());
        for (b, block) in self.u.iter().enumerate() {
            x.rows_mut(self.offsets[b], block.len()).copy_from(block);
        }
        x
    }

    /// Overwrite the current iterate from a stacked vector.
    pub fn scatter_u(&mut self, x: &DVector<f64>) {
        for (b, block) in self.u.iter_mut().enumerate() {
            block.copy_from(&x.rows(self.offsets[b], block.len()));
        }
    }

    /// Split a stacked vector into per-block vectors.
    pub fn split(&self, x: &DVector<f64>) -> Vec<DVector<f64>> {
        (0..self.num_blocks())
            .map(|b| x.rows(self.offsets[b], self.u[b].len()).into_owned())
            .collect()
    }

    /// Accept the current iterate of `blocks` as their previous step.
    pub fn advance(&mut self, blocks: &[usize]) {
        for &b in blocks {
            self.n[b].copy_from(&self.u[b]);
        }
    }

    pub fn advance_all(&mut self) {
        for (n, u) in self.n.iter_mut().zip(&self.u) {
            n.copy_from(u);
        }
    }

    /// Reset the current iterate of `blocks` to their previous step.
    pub fn rollback(&mut self, blocks: &[usize]) {
        for &b in blocks {
            self.u[b].copy_from(&self.n[b]);
        }
    }

    pub fn rollback_all(&mut self) {
        for (u, n) in self.u.iter_mut().zip(&self.n) {
            u.copy_from(n);
        }
    }

    /// Smallest component of the current iterate over all workers.
    pub fn min_u<C: Collective>(&self, comm: &C) -> f64 {
        let local = self
            .u
            .iter()
            .flat_map(|b| b.iter())
            .copied()
            .fold(f64::INFINITY, f64::min);
        comm.all_reduce_min(local)
    }

    /// Set every negative component of the current iterate to zero and
    /// return how many were changed.
    pub fn clamp_negatives(&mut self) -> usize {
        let mut count = 0;
        for v in self.u.iter_mut().flat_map(|b| b.iter_mut()) {
            if *v < 0.0 {
                *v = 0.0;
                count += 1;
            }
        }
        count
    }

    /// Amount of `species` in `domain`: the cell integral of its current
    /// concentration. Zero for inactive domains.
    pub fn species_total(&self, model: &Model, domain: DomainId, species: usize) -> f64 {
        let Some(block) = model.registry.block_of(domain) else {
            return 0.0;
        };
        let d = model.domain(domain);
        let m = d.num_species();
        d.mesh
            .cells
            .iter()
            .map(|c| c.volume * self.u[block][c.id * m + species])
            .sum()
    }

    /// Replace both fields, checking their sizes.
    pub fn restore(
        &mut self,
        u: Vec<DVector<f64>>,
        n: Vec<DVector<f64>>,
    ) -> Result<(), EngineError> {
        let sizes_match = |fields: &[DVector<f64>]| {
            fields.len() == self.u.len()
                && fields.iter().zip(&self.u).all(|(a, b)| a.len() == b.len())
        };
        if !sizes_match(&u) || !sizes_match(&n) {
            return Err(EngineError::config(
                "restored solution does not match the active domains",
            ));
        }
        self.u = u;
        self.n = n;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::numerics::parallel::SerialComm;

    #[test]
    fn gather_and_scatter_are_inverse() {
        let mut s = SolutionState::new(&[3, 2]);
        let x = DVector::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0]);
        s.scatter_u(&x);
        assert_eq!(s.u(1), &DVector::from_vec(vec![4.0, 5.0]));
        assert_eq!(s.gather_u(), x);
        assert_eq!(s.split(&x)[0], DVector::from_vec(vec![1.0, 2.0, 3.0]));
    }

    #[test]
    fn advance_and_rollback_are_per_block() {
        let mut s = SolutionState::new(&[2, 2]);
        s.scatter_u(&DVector::from_vec(vec![1.0, 1.0, 2.0, 2.0]));
        s.advance(&[0]);
        assert_eq!(s.n(0), s.u(0));
        assert_eq!(s.n(1), &DVector::zeros(2));

        s.rollback(&[1]);
        assert_eq!(s.u(1), &DVector::zeros(2));
        assert_eq!(s.u(0), &DVector::from_vec(vec![1.0, 1.0]));

        s.scatter_u(&DVector::from_vec(vec![9.0, 9.0, 9.0, 9.0]));
        s.rollback_all();
        assert_eq!(s.gather_u(), DVector::from_vec(vec![1.0, 1.0, 0.0, 0.0]));
    }

    #[test]
    fn negatives_are_found_and_clamped() {
        let mut s = SolutionState::new(&[3]);
        s.scatter_u(&DVector::from_vec(vec![1.0, -1e-8, -2e-9]));
        assert_eq!(s.min_u(&SerialComm), -1e-8);
        assert_eq!(s.clamp_negatives(), 2);
        assert_eq!(s.min_u(&SerialComm), 0.0);
    }

    #[test]
    fn restore_checks_sizes() {
        let mut s = SolutionState::new(&[2]);
        assert!(s
            .restore(vec![DVector::zeros(3)], vec![DVector::zeros(2)])
            .is_err());
        assert!(s
            .restore(vec![DVector::from_element(2, 1.0)], vec![DVector::zeros(2)])
            .is_ok());
        assert_eq!(s.u(0)[1], 1.0);
    }
}
