pub mod domain;
pub mod expression;
pub mod interface;
pub mod parameter;

use log::debug;

use crate::error::EngineError;
use crate::physics::forms::{Form, FormContainer, FormKind, Kernel, Units};
use domain::{Domain, DomainId, DomainRegistry};
use interface::{Interface, InterfaceId};
use parameter::ParameterTable;

/// Geometric region a term is integrated over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SubRegion {
    /// The cells of one domain.
    Cells(DomainId),
    /// The surface cells of an interface, with their volume neighbours.
    Interface(InterfaceId),
}

/// A declared reaction. Each target receives its own term, scaled by its
/// stoichiometric coefficient.
#[derive(Clone)]
pub struct Reaction {
    pub name: String,
    pub region: SubRegion,
    /// Units of the rate returned by the kernel.
    pub units: Units,
    pub depends_on: Vec<DomainId>,
    pub linear_in: Vec<DomainId>,
    /// `(domain, species, stoichiometry)`; positive coefficients produce.
    pub targets: Vec<(DomainId, usize, f64)>,
    pub kernel: Kernel,
}

/// Domains, interfaces and coupling terms of a simulation.
#[derive(Debug, Clone, Default)]
pub struct Model {
    pub registry: DomainRegistry,
    pub interfaces: Vec<Interface>,
    pub forms: FormContainer,
}

impl Model {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_domain(&mut self, domain: Domain) -> DomainId {
        self.registry.add(domain)
    }

    pub fn add_interface(&mut self, interface: Interface) -> InterfaceId {
        self.interfaces.push(interface);
        InterfaceId(self.interfaces.len() - 1)
    }

    pub fn domain(&self, id: DomainId) -> &Domain {
        self.registry.get(id)
    }

    pub fn interface(&self, id: InterfaceId) -> &Interface {
        &self.interfaces[id.0]
    }

    pub fn region_name(&self, region: SubRegion) -> String {
        match region {
            SubRegion::Cells(d) => self.domain(d).name.clone(),
            SubRegion::Interface(i) => self.interface(i).name.clone(),
        }
    }

    /// Add the terms of a reaction, one per target species.
    pub fn add_reaction(&mut self, reaction: Reaction) -> Result<(), EngineError> {
        let kind = match reaction.region {
            SubRegion::Cells(_) => FormKind::DomainReaction,
            SubRegion::Interface(_) => FormKind::BoundaryReaction,
        };
        if reaction.targets.is_empty() {
            return Err(EngineError::config(format!(
                "reaction '{}' has no targets",
                reaction.name
            )));
        }
        for &(domain, species, stoich) in &reaction.targets {
            if domain.0 >= self.registry.len() {
                return Err(EngineError::config(format!(
                    "reaction '{}' targets an undeclared domain",
                    reaction.name
                )));
            }
            let species_name = self
                .domain(domain)
                .species
                .get(species)
                .map(|s| s.name.clone())
                .ok_or_else(|| {
                    EngineError::config(format!(
                        "reaction '{}' targets species {} of '{}' which does not exist",
                        reaction.name,
                        species,
                        self.domain(domain).name
                    ))
                })?;
            self.forms.push(Form {
                name: format!("{}[{}]", reaction.name, species_name),
                kind,
                domain,
                species,
                region: reaction.region,
                units: reaction.units,
                depends_on: reaction.depends_on.clone(),
                linear_in: reaction.linear_in.clone(),
                stoich,
                scaling: 1.0,
                kernel: Some(reaction.kernel.clone()),
            });
        }
        Ok(())
    }

    /// (Re)generate the time-derivative and diffusion terms of every species.
    pub fn generate_transport_forms(&mut self) {
        self.forms.retain(|f| !f.kind.is_transport());

        let mut generated = Vec::new();
        for (id, domain) in self.registry.all() {
            let dim = domain.mesh.dimension;
            for (s, species) in domain.species.iter().enumerate() {
                let base = |name: String, kind: FormKind, depends_on: Vec<DomainId>| Form {
                    name,
                    kind,
                    domain: id,
                    species: s,
                    region: SubRegion::Cells(id),
                    units: Units::rate_density(dim),
                    linear_in: depends_on.clone(),
                    depends_on,
                    stoich: 1.0,
                    scaling: 1.0,
                    kernel: None,
                };
                generated.push(base(
                    format!("mass[{}]", species.name),
                    FormKind::MassCurrent,
                    vec![id],
                ));
                generated.push(base(
                    format!("mass_n[{}]", species.name),
                    FormKind::MassPrevious,
                    vec![],
                ));
                if species.diffusion > 0.0 {
                    generated.push(base(
                        format!("diffusion[{}]", species.name),
                        FormKind::Diffusion,
                        vec![id],
                    ));
                }
            }
        }
        debug!("generated {} transport terms", generated.len());
        for form in generated {
            self.forms.push(form);
        }
    }

    /// Reject rate kernels that read outside their declared dependencies.
    pub fn check_kernel_reads(&self, params: &ParameterTable) -> Result<(), EngineError> {
        self.forms.check_kernel_reads(self, params)
    }

    /// Rescale every term tested against `domain`.
    pub fn set_form_scaling(&mut self, domain: DomainId, factor: f64) {
        self.forms.set_scaling(domain, factor);
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        for iface in &self.interfaces {
            iface.validate(&self.registry)?;
        }
        self.forms.validate(self)?;

        if self.registry.num_blocks() > 0 {
            for (_, form) in self.forms.iter() {
                if self.registry.block_of(form.domain).is_none() {
                    continue;
                }
                if let Some(dep) = form
                    .depends_on
                    .iter()
                    .find(|d| self.registry.block_of(**d).is_none())
                {
                    return Err(EngineError::config(format!(
                        "form '{}' depends on '{}' which owns no unknowns",
                        form.name,
                        self.domain(*dep).name
                    )));
                }
            }
        }
        Ok(())
    }
}
