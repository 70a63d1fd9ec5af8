use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use num_dual::DualDVec64;

use crate::error::EngineError;
use crate::model::domain::DomainId;
use crate::model::parameter::{ParamId, ParameterTable};
use crate::model::{Model, SubRegion};

/// Integration type of a coupling term.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormKind {
    Diffusion,
    /// `u / dt` part of the backward-Euler time derivative.
    MassCurrent,
    /// `-u_n / dt` part of the backward-Euler time derivative.
    MassPrevious,
    DomainReaction,
    BoundaryReaction,
}

impl FormKind {
    /// Terms generated from species data rather than declared reactions.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            FormKind::Diffusion | FormKind::MassCurrent | FormKind::MassPrevious
        )
    }
}

/// Physical dimension as exponents of amount, length and time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Units {
    pub amount: i32,
    pub length: i32,
    pub time: i32,
}

impl Units {
    pub const AMOUNT_PER_TIME: Units = Units::new(1, 0, -1);

    pub const fn new(amount: i32, length: i32, time: i32) -> Self {
        Self {
            amount,
            length,
            time,
        }
    }

    /// Concentration on a `dim`-dimensional domain.
    pub const fn concentration(dim: usize) -> Self {
        Self::new(1, -(dim as i32), 0)
    }

    /// Rate density (concentration per time) on a `dim`-dimensional region.
    pub const fn rate_density(dim: usize) -> Self {
        Self::new(1, -(dim as i32), -1)
    }

    /// Units after integrating over a `dim`-dimensional measure.
    pub const fn integrated(self, dim: usize) -> Self {
        Self::new(self.amount, self.length + dim as i32, self.time)
    }
}

impl fmt::Display for Units {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "amount^{} length^{} time^{}",
            self.amount, self.length, self.time
        )
    }
}

/// Point-wise rate law. Receives the unknowns and coefficients at one cell
/// (or interface pair) and returns the rate with derivatives attached.
pub type Kernel = Arc<dyn Fn(&LocalValues<'_>) -> DualDVec64 + Send + Sync>;

/// A weak-form contribution to the residual of one species.
#[derive(Clone)]
pub struct Form {
    pub name: String,
    pub kind: FormKind,
    /// Domain whose test function this term multiplies.
    pub domain: DomainId,
    pub species: usize,
    pub region: SubRegion,
    /// Units of the integrand.
    pub units: Units,
    pub depends_on: Vec<DomainId>,
    /// Domains in which the term is linear.
    pub linear_in: Vec<DomainId>,
    pub stoich: f64,
    pub scaling: f64,
    pub kernel: Option<Kernel>,
}

impl Form {
    pub fn depends_on(&self, domain: DomainId) -> bool {
        self.depends_on.contains(&domain)
    }

    pub fn is_linear_in(&self, domain: DomainId) -> bool {
        !self.depends_on(domain) || self.linear_in.contains(&domain)
    }
}

impl fmt::Debug for Form {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Form")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("domain", &self.domain)
            .field("species", &self.species)
            .field("region", &self.region)
            .field("scaling", &self.scaling)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct FormContainer {
    forms: Vec<Form>,
}

impl FormContainer {
    pub fn push(&mut self, form: Form) -> usize {
        self.forms.push(form);
        self.forms.len() - 1
    }

    pub fn get(&self, idx: usize) -> &Form {
        &self.forms[idx]
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &Form)> {
        self.forms.iter().enumerate()
    }

    pub fn retain(&mut self, keep: impl FnMut(&Form) -> bool) {
        self.forms.retain(keep);
    }

    /// Set the scaling of every term tested against `domain`, replacing any
    /// previous factor.
    pub fn set_scaling(&mut self, domain: DomainId, factor: f64) {
        for form in self.forms.iter_mut().filter(|f| f.domain == domain) {
            form.scaling = factor;
        }
    }

    /// Check regions, dependencies and units of every term.
    pub fn validate(&self, model: &Model) -> Result<(), EngineError> {
        for form in &self.forms {
            let region_dim = match form.region {
                SubRegion::Cells(d) => {
                    if d != form.domain {
                        return Err(EngineError::config(format!(
                            "form '{}' integrates over cells of another domain",
                            form.name
                        )));
                    }
                    if form.depends_on.iter().any(|&dep| dep != d) {
                        return Err(EngineError::config(format!(
                            "form '{}' depends on a domain it does not live on",
                            form.name
                        )));
                    }
                    model.domain(d).mesh.dimension
                }
                SubRegion::Interface(i) => {
                    if i.0 >= model.interfaces.len() {
                        return Err(EngineError::config(format!(
                            "form '{}' refers to an undeclared interface",
                            form.name
                        )));
                    }
                    let iface = model.interface(i);
                    if let Some(bad) = std::iter::once(&form.domain)
                        .chain(&form.depends_on)
                        .find(|d| !iface.touches(**d))
                    {
                        return Err(EngineError::config(format!(
                            "form '{}': domain '{}' is not part of interface '{}'",
                            form.name,
                            model.domain(*bad).name,
                            iface.name
                        )));
                    }
                    model.domain(iface.surface).mesh.dimension
                }
            };

            if let Some(dep) = form
                .depends_on
                .iter()
                .find(|d| model.domain(**d).num_species() == 0)
            {
                return Err(EngineError::config(format!(
                    "form '{}' depends on '{}' which has no species",
                    form.name,
                    model.domain(*dep).name
                )));
            }
            if form.species >= model.domain(form.domain).num_species() {
                return Err(EngineError::config(format!(
                    "form '{}' targets a species index out of range",
                    form.name
                )));
            }

            let integrated = form.units.integrated(region_dim);
            if integrated != Units::AMOUNT_PER_TIME {
                return Err(EngineError::config(format!(
                    "form '{}' has units [{}] which integrate to [{}] over '{}', expected [{}]",
                    form.name,
                    form.units,
                    integrated,
                    model.region_name(form.region),
                    Units::AMOUNT_PER_TIME
                )));
            }

            let is_reaction = matches!(
                form.kind,
                FormKind::DomainReaction | FormKind::BoundaryReaction
            );
            if is_reaction && form.kernel.is_none() {
                return Err(EngineError::config(format!(
                    "reaction form '{}' has no rate kernel",
                    form.name
                )));
            }
        }
        Ok(())
    }

    /// Evaluate every rate kernel once at the initial state and reject
    /// kernels that read species outside their declared dependencies.
    ///
    /// Coefficients must be initialized.
    pub fn check_kernel_reads(
        &self,
        model: &Model,
        params: &ParameterTable,
    ) -> Result<(), EngineError> {
        for form in &self.forms {
            let Some(kernel) = &form.kernel else {
                continue;
            };
            let mut lv = LocalValues::new(0.0, params);
            for &d in &form.depends_on {
                let domain = model.domain(d);
                if domain.mesh.num_cells() == 0 {
                    continue;
                }
                let values = domain
                    .species
                    .iter()
                    .map(|s| DualDVec64::from_re(s.initial))
                    .collect();
                lv.push(d, 0, values);
            }
            kernel(&lv);
            if let Some(&(d, species)) = lv.undeclared_reads().first() {
                let name = if d.0 < model.registry.len() {
                    model.domain(d).name.clone()
                } else {
                    format!("{:?}", d)
                };
                return Err(EngineError::config(format!(
                    "form '{}' reads species {} of '{}' which is not among its dependencies",
                    form.name, species, name
                )));
            }
        }
        Ok(())
    }
}

/// Values visible to a rate kernel at one evaluation point.
pub struct LocalValues<'a> {
    pub t: f64,
    params: &'a ParameterTable,
    entries: Vec<(DomainId, usize, Vec<DualDVec64>)>,
    undeclared: RefCell<Vec<(DomainId, usize)>>,
}

impl<'a> LocalValues<'a> {
    pub fn new(t: f64, params: &'a ParameterTable) -> Self {
        Self {
            t,
            params,
            entries: Vec::with_capacity(3),
            undeclared: RefCell::new(Vec::new()),
        }
    }

    /// Register the species values of `domain` at `cell`.
    pub fn push(&mut self, domain: DomainId, cell: usize, values: Vec<DualDVec64>) {
        self.entries.push((domain, cell, values));
    }

    /// Value of `species` of `domain`.
    ///
    /// Reads outside the registered dependencies yield zero and are recorded
    /// in [`LocalValues::undeclared_reads`].
    pub fn u(&self, domain: DomainId, species: usize) -> DualDVec64 {
        let value = self
            .entries
            .iter()
            .find(|(d, _, _)| *d == domain)
            .and_then(|(_, _, values)| values.get(species));
        match value {
            Some(v) => v.clone(),
            None => {
                self.undeclared.borrow_mut().push((domain, species));
                DualDVec64::from_re(0.0)
            }
        }
    }

    /// `(domain, species)` pairs read without being registered.
    pub fn undeclared_reads(&self) -> Vec<(DomainId, usize)> {
        self.undeclared.borrow().clone()
    }

    /// Cell index of `domain` at this evaluation point.
    pub fn cell(&self, domain: DomainId) -> Option<usize> {
        self.entries
            .iter()
            .find(|(d, _, _)| *d == domain)
            .map(|(_, c, _)| *c)
    }

    /// Coefficient value; field parameters are read at the local cell.
    pub fn p(&self, id: ParamId) -> f64 {
        let param = self.params.get(id);
        let cell = param.field_domain().and_then(|d| self.cell(d));
        param.value_at(cell)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_integration() {
        assert_eq!(
            Units::rate_density(3).integrated(3),
            Units::AMOUNT_PER_TIME
        );
        assert_eq!(
            Units::rate_density(2).integrated(2),
            Units::AMOUNT_PER_TIME
        );
        assert_ne!(
            Units::rate_density(3).integrated(2),
            Units::AMOUNT_PER_TIME
        );
        assert_eq!(Units::concentration(3), Units::new(1, -3, 0));
    }

    fn mass_form(domain: DomainId) -> Form {
        Form {
            name: "f".into(),
            kind: FormKind::MassPrevious,
            domain,
            species: 0,
            region: SubRegion::Cells(domain),
            units: Units::rate_density(3),
            depends_on: vec![],
            linear_in: vec![],
            stoich: 1.0,
            scaling: 1.0,
            kernel: None,
        }
    }

    #[test]
    fn undeclared_reads_are_recorded() {
        let params = ParameterTable::new();
        let mut lv = LocalValues::new(0.0, &params);
        lv.push(DomainId(0), 3, vec![DualDVec64::from_re(2.0)]);

        assert_eq!(lv.u(DomainId(0), 0).re, 2.0);
        assert!(lv.undeclared_reads().is_empty());
        assert_eq!(lv.u(DomainId(1), 0).re, 0.0);
        assert_eq!(lv.u(DomainId(0), 1).re, 0.0);
        assert_eq!(
            lv.undeclared_reads(),
            vec![(DomainId(1), 0), (DomainId(0), 1)]
        );
        assert_eq!(lv.cell(DomainId(0)), Some(3));
    }

    #[test]
    fn scaling_replaces_previous_factor() {
        let mut forms = FormContainer::default();
        forms.push(mass_form(DomainId(0)));
        forms.push(mass_form(DomainId(1)));

        forms.set_scaling(DomainId(0), 4.0);
        forms.set_scaling(DomainId(0), 2.0);
        assert_eq!(forms.get(0).scaling, 2.0);
        assert_eq!(forms.get(1).scaling, 1.0);
    }

    #[test]
    fn linear_in_absent_domain() {
        let form = Form {
            name: "f".into(),
            kind: FormKind::MassPrevious,
            domain: DomainId(0),
            species: 0,
            region: SubRegion::Cells(DomainId(0)),
            units: Units::rate_density(3),
            depends_on: vec![],
            linear_in: vec![],
            stoich: 1.0,
            scaling: 1.0,
            kernel: None,
        };
        assert!(!form.depends_on(DomainId(0)));
        assert!(form.is_linear_in(DomainId(0)));
    }
}
