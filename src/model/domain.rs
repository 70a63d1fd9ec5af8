use std::cmp::Reverse;

use log::{debug, info};

use crate::discretization::mesh::Mesh;
use crate::error::EngineError;

/// Declaration-order identifier of a domain. Stable for the whole run,
/// unlike the block index which is reassigned on activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainId(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainKind {
    Volume,
    Surface,
}

#[derive(Debug, Clone)]
pub struct Species {
    pub name: String,
    /// Diffusion coefficient; zero disables the diffusive term.
    pub diffusion: f64,
    pub initial: f64,
}

impl Species {
    pub fn new(name: impl Into<String>, diffusion: f64, initial: f64) -> Self {
        Self {
            name: name.into(),
            diffusion,
            initial,
        }
    }
}

/// A compartment owning a mesh and the species living on it.
///
/// Unknowns are laid out cell-major: the value of species `s` in cell `c` is
/// entry `c * num_species + s` of the domain's block.
#[derive(Debug, Clone)]
pub struct Domain {
    pub name: String,
    pub kind: DomainKind,
    pub mesh: Mesh,
    pub species: Vec<Species>,
    pub block_index: Option<usize>,
}

impl Domain {
    pub fn new(name: impl Into<String>, kind: DomainKind, mesh: Mesh) -> Self {
        Self {
            name: name.into(),
            kind,
            mesh,
            species: Vec::new(),
            block_index: None,
        }
    }

    pub fn with_species(mut self, species: Species) -> Self {
        self.species.push(species);
        self
    }

    pub fn num_species(&self) -> usize {
        self.species.len()
    }

    pub fn num_unknowns(&self) -> usize {
        self.mesh.num_cells() * self.species.len()
    }

    pub fn species_index(&self, name: &str) -> Option<usize> {
        self.species.iter().position(|s| s.name == name)
    }

    #[inline]
    pub fn dof(&self, cell: usize, species: usize) -> usize {
        cell * self.species.len() + species
    }
}

/// All declared domains plus the ordered list of those that own unknowns.
#[derive(Debug, Clone, Default)]
pub struct DomainRegistry {
    domains: Vec<Domain>,
    active: Vec<DomainId>,
    dropped: Vec<DomainId>,
}

impl DomainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, domain: Domain) -> DomainId {
        self.domains.push(domain);
        DomainId(self.domains.len() - 1)
    }

    pub fn get(&self, id: DomainId) -> &Domain {
        &self.domains[id.0]
    }

    pub fn get_mut(&mut self, id: DomainId) -> &mut Domain {
        &mut self.domains[id.0]
    }

    pub fn find(&self, name: &str) -> Option<DomainId> {
        self.domains.iter().position(|d| d.name == name).map(DomainId)
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn all(&self) -> impl Iterator<Item = (DomainId, &Domain)> {
        self.domains.iter().enumerate().map(|(i, d)| (DomainId(i), d))
    }

    /// Active domains in block order.
    pub fn active(&self) -> &[DomainId] {
        &self.active
    }

    /// Domains left out by the last activation because they own no unknowns.
    pub fn dropped(&self) -> &[DomainId] {
        &self.dropped
    }

    pub fn num_blocks(&self) -> usize {
        self.active.len()
    }

    /// Domain occupying block `block`.
    pub fn at_block(&self, block: usize) -> DomainId {
        self.active[block]
    }

    pub fn block_of(&self, id: DomainId) -> Option<usize> {
        self.domains[id.0].block_index
    }

    /// Recompute the active set.
    ///
    /// Domains without unknowns are dropped; the rest are ordered by
    /// descending unknown count with ties kept in declaration order, and
    /// block indices are reassigned to match.
    pub fn activate(&mut self) -> Result<&[DomainId], EngineError> {
        let mut active: Vec<DomainId> = self
            .all()
            .filter(|(_, d)| d.num_unknowns() > 0)
            .map(|(id, _)| id)
            .collect();

        if active.is_empty() {
            return Err(EngineError::config("no domain owns any unknowns"));
        }

        // sort_by_key is stable, which gives the declaration-order tie-break
        active.sort_by_key(|id| Reverse(self.domains[id.0].num_unknowns()));

        self.dropped.clear();
        for (i, d) in self.domains.iter_mut().enumerate() {
            if d.num_unknowns() == 0 {
                debug!("domain '{}' has no unknowns and is dropped", d.name);
                self.dropped.push(DomainId(i));
            }
            d.block_index = None;
        }
        for (block, id) in active.iter().enumerate() {
            self.domains[id.0].block_index = Some(block);
        }

        info!(
            "active domains: {}",
            active
                .iter()
                .map(|id| format!(
                    "{} ({} dofs)",
                    self.domains[id.0].name,
                    self.domains[id.0].num_unknowns()
                ))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.active = active;
        Ok(&self.active)
    }
}
