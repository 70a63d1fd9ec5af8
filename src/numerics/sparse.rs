use std::sync::Arc;

use kryst::matrix::sparse::CsrMatrix;
use nalgebra::{DMatrix, DVector};

use crate::model::Model;
use crate::numerics::blocks::BlockSystem;
use crate::physics::assembly::Assembler;

/// Global CSR sparsity of the block Jacobian.
///
/// Built once from the structural nonzeros of every Jacobian block plus the
/// full diagonal, and shared by every matrix assembled during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPattern {
    /// Start of each block's unknowns; `offsets[num_blocks]` is the total.
    offsets: Vec<usize>,
    row_ptr: Vec<usize>,
    col_idx: Vec<usize>,
}

impl BlockPattern {
    pub fn build<A: Assembler>(model: &Model, blocks: &BlockSystem, assembler: &A) -> Self {
        let mut offsets = Vec::with_capacity(blocks.num_blocks() + 1);
        offsets.push(0);
        for rb in &blocks.residual {
            let last = offsets[offsets.len() - 1];
            offsets.push(last + model.domain(rb.domain).num_unknowns());
        }
        let n = offsets[offsets.len() - 1];

        let mut rows: Vec<Vec<usize>> = (0..n).map(|r| vec![r]).collect();
        let mut local = Vec::new();
        for jb in blocks.blocks() {
            let (r0, c0) = (offsets[jb.row], offsets[jb.col]);
            for part in &jb.parts {
                local.clear();
                assembler.sparsity(model, jb.row_domain, jb.col_domain, part, &mut local);
                for &(r, c) in &local {
                    rows[r0 + r].push(c0 + c);
                }
            }
        }

        Self::from_rows(offsets, rows)
    }

    /// Pattern from block sizes and explicit global entries, diagonal added.
    pub fn from_entries(block_sizes: &[usize], entries: &[(usize, usize)]) -> Self {
        let mut offsets = vec![0];
        for &size in block_sizes {
            offsets.push(offsets[offsets.len() - 1] + size);
        }
        let n = offsets[offsets.len() - 1];
        let mut rows: Vec<Vec<usize>> = (0..n).map(|r| vec![r]).collect();
        for &(r, c) in entries {
            rows[r].push(c);
        }
        Self::from_rows(offsets, rows)
    }

    fn from_rows(offsets: Vec<usize>, rows: Vec<Vec<usize>>) -> Self {
        let mut row_ptr = Vec::with_capacity(rows.len() + 1);
        let mut col_idx = Vec::new();
        row_ptr.push(0);
        for mut cols in rows {
            cols.sort_unstable();
            cols.dedup();
            col_idx.extend(cols);
            row_ptr.push(col_idx.len());
        }
        Self {
            offsets,
            row_ptr,
            col_idx,
        }
    }

    /// Number of unknowns.
    pub fn size(&self) -> usize {
        self.row_ptr.len() - 1
    }

    pub fn nnz(&self) -> usize {
        self.col_idx.len()
    }

    pub fn num_blocks(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Global unknown range of a block.
    pub fn block_range(&self, block: usize) -> std::ops::Range<usize> {
        self.offsets[block]..self.offsets[block + 1]
    }

    #[inline]
    fn row(&self, r: usize) -> std::ops::Range<usize> {
        self.row_ptr[r]..self.row_ptr[r + 1]
    }

    /// Storage slot of `(r, c)`, if structurally present.
    #[inline]
    pub fn position(&self, r: usize, c: usize) -> Option<usize> {
        let range = self.row(r);
        let start = range.start;
        self.col_idx[range]
            .binary_search(&c)
            .ok()
            .map(|k| start + k)
    }

    /// All structural `(row, col)` entries in storage order.
    pub fn entries(&self) -> Vec<(usize, usize)> {
        (0..self.size())
            .flat_map(|r| self.row(r).map(move |k| (r, k)))
            .map(|(r, k)| (r, self.col_idx[k]))
            .collect()
    }
}

/// Values of the block Jacobian on a fixed [`BlockPattern`].
#[derive(Debug, Clone)]
pub struct BlockMatrix {
    pattern: Arc<BlockPattern>,
    values: Vec<f64>,
}

impl BlockMatrix {
    pub fn new(pattern: Arc<BlockPattern>) -> Self {
        let values = vec![0.0; pattern.nnz()];
        Self { pattern, values }
    }

    pub fn pattern(&self) -> &Arc<BlockPattern> {
        &self.pattern
    }

    pub fn size(&self) -> usize {
        self.pattern.size()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Accumulate `v` at `(r, c)`. Returns false if the entry lies outside
    /// the pattern, in which case nothing is stored.
    #[inline]
    pub fn add(&mut self, r: usize, c: usize, v: f64) -> bool {
        match self.pattern.position(r, c) {
            Some(k) => {
                self.values[k] += v;
                true
            }
            None => false,
        }
    }

    /// Accumulate block-local triplets into block `(row, col)`. Returns the
    /// number of triplets that fell outside the pattern.
    pub fn add_block(&mut self, row: usize, col: usize, triplets: &[(usize, usize, f64)]) -> usize {
        let (r0, c0) = (self.pattern.offsets[row], self.pattern.offsets[col]);
        triplets
            .iter()
            .filter(|&&(r, c, v)| !self.add(r0 + r, c0 + c, v))
            .count()
    }

    pub fn get(&self, r: usize, c: usize) -> f64 {
        self.pattern.position(r, c).map_or(0.0, |k| self.values[k])
    }

    pub fn matvec(&self, x: &DVector<f64>) -> DVector<f64> {
        let p = &self.pattern;
        DVector::from_iterator(
            p.size(),
            (0..p.size()).map(|r| {
                p.row(r)
                    .map(|k| self.values[k] * x[p.col_idx[k]])
                    .sum::<f64>()
            }),
        )
    }

    /// `sum_{j != block} A[block, j] x_j` restricted to the rows of `block`.
    pub fn off_block_product(&self, block: usize, x: &DVector<f64>) -> DVector<f64> {
        let p = &self.pattern;
        let range = p.block_range(block);
        DVector::from_iterator(
            range.len(),
            range.clone().map(|r| {
                p.row(r)
                    .filter(|&k| !range.contains(&p.col_idx[k]))
                    .map(|k| self.values[k] * x[p.col_idx[k]])
                    .sum::<f64>()
            }),
        )
    }

    pub fn to_kryst(&self) -> CsrMatrix<f64> {
        let n = self.size();
        CsrMatrix::from_csr(
            n,
            n,
            self.pattern.row_ptr.clone(),
            self.pattern.col_idx.clone(),
            self.values.clone(),
        )
    }

    /// Diagonal block `(block, block)` as a standalone matrix.
    pub fn diagonal_block_to_kryst(&self, block: usize) -> CsrMatrix<f64> {
        let p = &self.pattern;
        let range = p.block_range(block);
        let n = range.len();
        let mut indptr = Vec::with_capacity(n + 1);
        let mut indices = Vec::new();
        let mut data = Vec::new();
        indptr.push(0);
        for r in range.clone() {
            for k in p.row(r) {
                let c = p.col_idx[k];
                if range.contains(&c) {
                    indices.push(c - range.start);
                    data.push(self.values[k]);
                }
            }
            indptr.push(indices.len());
        }
        CsrMatrix::from_csr(n, n, indptr, indices, data)
    }

    pub fn to_dense(&self) -> DMatrix<f64> {
        let p = &self.pattern;
        let mut dense = DMatrix::zeros(p.size(), p.size());
        for r in 0..p.size() {
            for k in p.row(r) {
                dense[(r, p.col_idx[k])] += self.values[k];
            }
        }
        dense
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern() -> Arc<BlockPattern> {
        // two blocks of size 2 and 1, coupling (0, 2) and (2, 1)
        Arc::new(BlockPattern::from_entries(&[2, 1], &[(0, 1), (0, 2), (2, 1)]))
    }

    #[test]
    fn entries_outside_pattern_are_rejected() {
        let mut a = BlockMatrix::new(pattern());
        assert!(a.add(0, 2, 1.0));
        assert!(!a.add(1, 0, 1.0));
        assert_eq!(a.add_block(1, 0, &[(0, 1, 2.0), (0, 0, 5.0)]), 1);
        assert_eq!(a.get(2, 1), 2.0);
        assert_eq!(a.get(1, 0), 0.0);
    }

    #[test]
    fn block_products_split_the_full_product() {
        let mut a = BlockMatrix::new(pattern());
        for (k, &(r, c)) in pattern().entries().iter().enumerate() {
            a.add(r, c, (k + 1) as f64);
        }
        let x = DVector::from_vec(vec![1.0, -2.0, 0.5]);
        let full = a.matvec(&x);
        assert_eq!(full, a.to_dense() * &x);

        let off = a.off_block_product(0, &x);
        // row 0: only the (0, 2) entry couples to block 1
        assert_eq!(off[0], 3.0 * 0.5);
        assert_eq!(off[1], 0.0);
        assert_eq!(a.off_block_product(1, &x)[0], 5.0 * -2.0);
        assert_eq!((a.get(0, 0), a.get(1, 1), a.get(2, 2)), (1.0, 4.0, 6.0));
    }
}
