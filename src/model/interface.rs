use crate::discretization::generator::FacePairing;
use crate::error::EngineError;
use crate::model::domain::{DomainId, DomainKind, DomainRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InterfaceId(pub usize);

/// One surface cell and the volume cells it touches, one per adjacent volume.
#[derive(Debug, Clone, PartialEq)]
pub struct InterfacePair {
    pub surface_cell: usize,
    pub volume_cells: Vec<usize>,
    pub area: f64,
}

/// A surface domain together with the volumes it bounds.
///
/// Boundary reactions integrate over an interface; the pairs map every
/// surface cell to the cells holding the neighbouring volume unknowns.
#[derive(Debug, Clone)]
pub struct Interface {
    pub name: String,
    pub surface: DomainId,
    pub volumes: Vec<DomainId>,
    pub pairs: Vec<InterfacePair>,
}

impl Interface {
    /// Interface between a surface and a single adjacent volume.
    pub fn from_pairings(
        name: impl Into<String>,
        surface: DomainId,
        volume: DomainId,
        pairings: &[FacePairing],
    ) -> Self {
        Self {
            name: name.into(),
            surface,
            volumes: vec![volume],
            pairs: pairings
                .iter()
                .map(|p| InterfacePair {
                    surface_cell: p.surface_cell,
                    volume_cells: vec![p.volume_cell],
                    area: p.area,
                })
                .collect(),
        }
    }

    /// Add a second volume on the other side of the surface.
    /// `pairings` must list the surface cells in the same order.
    pub fn with_volume(
        mut self,
        volume: DomainId,
        pairings: &[FacePairing],
    ) -> Result<Self, EngineError> {
        if pairings.len() != self.pairs.len() {
            return Err(EngineError::config(format!(
                "interface '{}': {} pairings for {} surface cells",
                self.name,
                pairings.len(),
                self.pairs.len()
            )));
        }
        for (pair, p) in self.pairs.iter_mut().zip(pairings) {
            if pair.surface_cell != p.surface_cell {
                return Err(EngineError::config(format!(
                    "interface '{}': pairing order mismatch at surface cell {}",
                    self.name, pair.surface_cell
                )));
            }
            pair.volume_cells.push(p.volume_cell);
        }
        self.volumes.push(volume);
        Ok(self)
    }

    pub fn touches(&self, domain: DomainId) -> bool {
        self.surface == domain || self.volumes.contains(&domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = DomainId> + '_ {
        std::iter::once(self.surface).chain(self.volumes.iter().copied())
    }

    /// Cell of `domain` that `pair` refers to.
    pub fn cell_of(&self, pair: &InterfacePair, domain: DomainId) -> Option<usize> {
        if domain == self.surface {
            return Some(pair.surface_cell);
        }
        self.volumes
            .iter()
            .position(|&v| v == domain)
            .map(|k| pair.volume_cells[k])
    }

    pub fn total_area(&self) -> f64 {
        self.pairs.iter().map(|p| p.area).sum()
    }

    pub fn validate(&self, registry: &DomainRegistry) -> Result<(), EngineError> {
        let surface = registry.get(self.surface);
        if surface.kind != DomainKind::Surface {
            return Err(EngineError::config(format!(
                "interface '{}': '{}' is not a surface domain",
                self.name, surface.name
            )));
        }
        for &v in &self.volumes {
            let volume = registry.get(v);
            if volume.kind != DomainKind::Volume {
                return Err(EngineError::config(format!(
                    "interface '{}': '{}' is not a volume domain",
                    self.name, volume.name
                )));
            }
        }
        for pair in &self.pairs {
            if pair.surface_cell >= surface.mesh.num_cells()
                || pair.volume_cells.len() != self.volumes.len()
            {
                return Err(EngineError::config(format!(
                    "interface '{}': malformed pair at surface cell {}",
                    self.name, pair.surface_cell
                )));
            }
            for (&v, &cell) in self.volumes.iter().zip(&pair.volume_cells) {
                if cell >= registry.get(v).mesh.num_cells() {
                    return Err(EngineError::config(format!(
                        "interface '{}': volume cell {} out of range",
                        self.name, cell
                    )));
                }
            }
        }
        Ok(())
    }
}
