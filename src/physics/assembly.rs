use nalgebra::{DVector, Dyn, U1};
use num_dual::{Derivative, DualDVec64};

use crate::model::domain::DomainId;
use crate::model::interface::InterfaceId;
use crate::model::parameter::ParameterTable;
use crate::model::{Model, SubRegion};
use crate::numerics::blocks::SubBlock;
use crate::physics::forms::{Form, FormKind, LocalValues};

/// Everything an assembly call may read. `u` and `n` are indexed by block.
pub struct AssemblyInput<'a> {
    pub model: &'a Model,
    pub params: &'a ParameterTable,
    pub u: &'a [DVector<f64>],
    pub n: &'a [DVector<f64>],
    pub t: f64,
    pub dt: f64,
}

impl<'a> AssemblyInput<'a> {
    /// Current iterate of a domain.
    ///
    /// # Panics
    /// If the domain is not active.
    pub fn u_of(&self, domain: DomainId) -> &'a DVector<f64> {
        let block = self.model.registry.block_of(domain);
        match block {
            Some(b) => &self.u[b],
            None => panic!("domain {:?} owns no unknowns", domain),
        }
    }

    /// Previous-step field of a domain.
    pub fn n_of(&self, domain: DomainId) -> &'a DVector<f64> {
        let block = self.model.registry.block_of(domain);
        match block {
            Some(b) => &self.n[b],
            None => panic!("domain {:?} owns no unknowns", domain),
        }
    }
}

/// Discretization collaborator: assembles one sub-region contribution of a
/// residual or Jacobian block.
///
/// Indices are local to the blocks involved: rows index the unknowns of
/// `row`, columns those of `col`.
pub trait Assembler {
    /// Add the residual of `part` into `out` (sized to the row domain).
    fn residual(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        part: &SubBlock,
        out: &mut DVector<f64>,
    );

    /// Append `(row, col, value)` triplets of `d residual(row) / d u(col)`.
    fn jacobian(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize, f64)>,
    );

    /// Append the structural nonzeros of the block `(row, col)` on `part`.
    fn sparsity(
        &self,
        model: &Model,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize)>,
    );
}

#[derive(Clone, Copy, Debug)]
pub struct NumericalTolerances {
    pub min_distance: f64,
}

impl Default for NumericalTolerances {
    fn default() -> Self {
        Self {
            min_distance: 1e-14,
        }
    }
}

/// Two-point flux finite-volume assembler.
///
/// Transport terms are assembled analytically; reaction kernels are
/// differentiated with dual numbers seeded on the column domain's species.
#[derive(Clone, Debug, Default)]
pub struct FvAssembler {
    pub tolerances: NumericalTolerances,
}

impl FvAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn safe_distance(&self, model: &Model, domain: DomainId, k: usize, l: usize) -> f64 {
        model
            .domain(domain)
            .mesh
            .cell_distance(k, l)
            .max(self.tolerances.min_distance)
    }

    /// Species values of `domain` at `cell`, seeded for differentiation
    /// when `seed` is true.
    fn cell_values(
        input: &AssemblyInput<'_>,
        domain: DomainId,
        cell: usize,
        seed: bool,
    ) -> Vec<DualDVec64> {
        let m = input.model.domain(domain).num_species();
        let u = input.u_of(domain);
        (0..m)
            .map(|j| {
                let value = u[cell * m + j];
                if seed {
                    let eps = Derivative::derivative_generic(Dyn(m), U1, j);
                    DualDVec64::new(value, eps)
                } else {
                    DualDVec64::from_re(value)
                }
            })
            .collect()
    }

    /// Evaluate a reaction kernel at one cell or interface pair.
    ///
    /// `points` lists `(domain, cell)` of every dependency; the species of
    /// `seed` (if any) carry unit derivatives.
    fn eval_kernel(
        input: &AssemblyInput<'_>,
        form: &Form,
        points: &[(DomainId, usize)],
        seed: Option<DomainId>,
    ) -> DualDVec64 {
        let mut lv = LocalValues::new(input.t, input.params);
        for &(domain, cell) in points {
            let values = Self::cell_values(input, domain, cell, seed == Some(domain));
            lv.push(domain, cell, values);
        }
        match &form.kernel {
            Some(kernel) => kernel(&lv),
            None => DualDVec64::from_re(0.0),
        }
    }

    /// `(domain, cell)` of every dependency of `form` at an interface pair.
    fn pair_points(
        model: &Model,
        form: &Form,
        iface: InterfaceId,
        pair: usize,
    ) -> Vec<(DomainId, usize)> {
        let interface = model.interface(iface);
        let p = &interface.pairs[pair];
        form.depends_on
            .iter()
            .filter_map(|&d| interface.cell_of(p, d).map(|c| (d, c)))
            .collect()
    }
}

impl Assembler for FvAssembler {
    fn residual(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        part: &SubBlock,
        out: &mut DVector<f64>,
    ) {
        let model = input.model;
        let domain = model.domain(row);
        let m = domain.num_species();
        let mesh = &domain.mesh;

        for &fi in &part.forms {
            let form = model.forms.get(fi);
            let s = form.species;
            let w = form.scaling;

            match form.kind {
                FormKind::MassCurrent => {
                    let u = input.u_of(row);
                    for cell in &mesh.cells {
                        let i = cell.id * m + s;
                        out[i] += w * cell.volume * u[i] / input.dt;
                    }
                }
                FormKind::MassPrevious => {
                    let n = input.n_of(row);
                    for cell in &mesh.cells {
                        let i = cell.id * m + s;
                        out[i] -= w * cell.volume * n[i] / input.dt;
                    }
                }
                FormKind::Diffusion => {
                    let u = input.u_of(row);
                    let d_coef = domain.species[s].diffusion;
                    for (face, k, l) in mesh.interior_faces() {
                        let d = self.safe_distance(model, row, k, l);
                        let flux = w * d_coef * face.area / d * (u[k * m + s] - u[l * m + s]);
                        out[k * m + s] += flux;
                        out[l * m + s] -= flux;
                    }
                }
                FormKind::DomainReaction => {
                    for cell in &mesh.cells {
                        let rate = Self::eval_kernel(input, form, &[(row, cell.id)], None).re;
                        out[cell.id * m + s] -= w * form.stoich * cell.volume * rate;
                    }
                }
                FormKind::BoundaryReaction => {
                    let SubRegion::Interface(iface) = form.region else {
                        continue;
                    };
                    let interface = model.interface(iface);
                    for (pi, pair) in interface.pairs.iter().enumerate() {
                        let Some(dest) = interface.cell_of(pair, row) else {
                            continue;
                        };
                        let points = Self::pair_points(model, form, iface, pi);
                        let rate = Self::eval_kernel(input, form, &points, None).re;
                        out[dest * m + s] -= w * form.stoich * pair.area * rate;
                    }
                }
            }
        }
    }

    fn jacobian(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize, f64)>,
    ) {
        let model = input.model;
        let domain = model.domain(row);
        let m = domain.num_species();
        let m_col = model.domain(col).num_species();
        let mesh = &domain.mesh;

        for &fi in &part.forms {
            let form = model.forms.get(fi);
            if !form.depends_on(col) {
                continue;
            }
            let s = form.species;
            let w = form.scaling;

            match form.kind {
                FormKind::MassCurrent => {
                    for cell in &mesh.cells {
                        let i = cell.id * m + s;
                        out.push((i, i, w * cell.volume / input.dt));
                    }
                }
                FormKind::MassPrevious => {}
                FormKind::Diffusion => {
                    let d_coef = domain.species[s].diffusion;
                    for (face, k, l) in mesh.interior_faces() {
                        let d = self.safe_distance(model, row, k, l);
                        let c = w * d_coef * face.area / d;
                        let (ik, il) = (k * m + s, l * m + s);
                        out.push((ik, ik, c));
                        out.push((ik, il, -c));
                        out.push((il, il, c));
                        out.push((il, ik, -c));
                    }
                }
                FormKind::DomainReaction => {
                    for cell in &mesh.cells {
                        let rd = Self::eval_kernel(input, form, &[(row, cell.id)], Some(col));
                        let deriv = rd.eps.unwrap_generic(Dyn(m_col), U1);
                        let scale = -w * form.stoich * cell.volume;
                        for j in 0..m_col {
                            out.push((cell.id * m + s, cell.id * m_col + j, scale * deriv[(j, 0)]));
                        }
                    }
                }
                FormKind::BoundaryReaction => {
                    let SubRegion::Interface(iface) = form.region else {
                        continue;
                    };
                    let interface = model.interface(iface);
                    for (pi, pair) in interface.pairs.iter().enumerate() {
                        let (Some(dest), Some(src)) =
                            (interface.cell_of(pair, row), interface.cell_of(pair, col))
                        else {
                            continue;
                        };
                        let points = Self::pair_points(model, form, iface, pi);
                        let rd = Self::eval_kernel(input, form, &points, Some(col));
                        let deriv = rd.eps.unwrap_generic(Dyn(m_col), U1);
                        let scale = -w * form.stoich * pair.area;
                        for j in 0..m_col {
                            out.push((dest * m + s, src * m_col + j, scale * deriv[(j, 0)]));
                        }
                    }
                }
            }
        }
    }

    fn sparsity(
        &self,
        model: &Model,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize)>,
    ) {
        let domain = model.domain(row);
        let m = domain.num_species();
        let m_col = model.domain(col).num_species();
        let mesh = &domain.mesh;

        for &fi in &part.forms {
            let form = model.forms.get(fi);
            if !form.depends_on(col) {
                continue;
            }
            let s = form.species;
            match form.kind {
                FormKind::MassCurrent => {
                    out.extend(mesh.cells.iter().map(|c| (c.id * m + s, c.id * m + s)));
                }
                FormKind::MassPrevious => {}
                FormKind::Diffusion => {
                    for (_, k, l) in mesh.interior_faces() {
                        let (ik, il) = (k * m + s, l * m + s);
                        out.extend([(ik, ik), (ik, il), (il, il), (il, ik)]);
                    }
                }
                FormKind::DomainReaction => {
                    for cell in &mesh.cells {
                        out.extend((0..m_col).map(|j| (cell.id * m + s, cell.id * m_col + j)));
                    }
                }
                FormKind::BoundaryReaction => {
                    let SubRegion::Interface(iface) = form.region else {
                        continue;
                    };
                    let interface = model.interface(iface);
                    for pair in &interface.pairs {
                        if let (Some(dest), Some(src)) =
                            (interface.cell_of(pair, row), interface.cell_of(pair, col))
                        {
                            out.extend((0..m_col).map(|j| (dest * m + s, src * m_col + j)));
                        }
                    }
                }
            }
        }
    }
}
