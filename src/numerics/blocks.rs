use std::collections::BTreeMap;

use log::warn;

use crate::error::{BlockRole, StructuralWarning};
use crate::model::domain::DomainId;
use crate::model::{Model, SubRegion};

/// The terms of one block integrated over one sub-region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBlock {
    pub region: SubRegion,
    /// Indices into the model's form container.
    pub forms: Vec<usize>,
}

/// Residual of one active domain, split by sub-region. No parts means a
/// structurally empty placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidualBlock {
    pub block: usize,
    pub domain: DomainId,
    pub parts: Vec<SubBlock>,
}

impl ResidualBlock {
    pub fn is_placeholder(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Derivative of the residual of `row` with respect to the unknowns of `col`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JacobianBlock {
    pub row: usize,
    pub col: usize,
    pub row_domain: DomainId,
    pub col_domain: DomainId,
    pub parts: Vec<SubBlock>,
    /// Every term depends on `col` alone and linearly, so the block values
    /// stay fixed while dt and the coefficients do.
    pub constant: bool,
}

impl JacobianBlock {
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

/// Residual and Jacobian blocks of all active domains.
///
/// Every `(row, col)` pair has a Jacobian block, empty or not, so the
/// global sparsity pattern stays the same for the whole run.
#[derive(Debug, Clone)]
pub struct BlockSystem {
    pub residual: Vec<ResidualBlock>,
    pub jacobian: Vec<Vec<JacobianBlock>>,
    pub warnings: Vec<StructuralWarning>,
}

impl BlockSystem {
    /// Decompose the model's terms into blocks. The registry must have been
    /// activated.
    pub fn build(model: &Model) -> Self {
        let active = model.registry.active();
        let mut warnings = Vec::new();

        let residual: Vec<ResidualBlock> = active
            .iter()
            .enumerate()
            .map(|(block, &domain)| {
                let mut by_region: BTreeMap<SubRegion, Vec<usize>> = BTreeMap::new();
                for (fi, form) in model.forms.iter() {
                    if form.domain == domain {
                        by_region.entry(form.region).or_default().push(fi);
                    }
                }
                if by_region.is_empty() {
                    warnings.push(StructuralWarning {
                        role: BlockRole::Residual,
                        domains: vec![model.domain(domain).name.clone()],
                        region: "*".to_string(),
                    });
                }
                ResidualBlock {
                    block,
                    domain,
                    parts: by_region
                        .into_iter()
                        .map(|(region, forms)| SubBlock { region, forms })
                        .collect(),
                }
            })
            .collect();

        let jacobian = residual
            .iter()
            .map(|rb| {
                active
                    .iter()
                    .enumerate()
                    .map(|(col, &col_domain)| {
                        Self::derive_block(model, rb, col, col_domain, &mut warnings)
                    })
                    .collect()
            })
            .collect();

        for w in &warnings {
            warn!("{}", w);
        }

        Self {
            residual,
            jacobian,
            warnings,
        }
    }

    /// Differentiate a residual block with respect to `col_domain`, keeping
    /// only the terms that depend on it.
    fn derive_block(
        model: &Model,
        rb: &ResidualBlock,
        col: usize,
        col_domain: DomainId,
        warnings: &mut Vec<StructuralWarning>,
    ) -> JacobianBlock {
        let mut parts = Vec::new();
        for part in &rb.parts {
            let forms: Vec<usize> = part
                .forms
                .iter()
                .copied()
                .filter(|&fi| model.forms.get(fi).depends_on(col_domain))
                .collect();

            if forms.is_empty() {
                let expected = match part.region {
                    SubRegion::Cells(d) => d == col_domain,
                    SubRegion::Interface(i) => model.interface(i).touches(col_domain),
                };
                if expected {
                    let mut domains = vec![model.domain(rb.domain).name.clone()];
                    if col_domain != rb.domain {
                        domains.push(model.domain(col_domain).name.clone());
                    }
                    warnings.push(StructuralWarning {
                        role: BlockRole::Jacobian,
                        domains,
                        region: model.region_name(part.region),
                    });
                }
                continue;
            }
            parts.push(SubBlock {
                region: part.region,
                forms,
            });
        }

        let constant = parts.iter().flat_map(|p| &p.forms).all(|&fi| {
            let form = model.forms.get(fi);
            form.depends_on.iter().all(|&d| d == col_domain) && form.is_linear_in(col_domain)
        });

        JacobianBlock {
            row: rb.block,
            col,
            row_domain: rb.domain,
            col_domain,
            parts,
            constant,
        }
    }

    pub fn num_blocks(&self) -> usize {
        self.residual.len()
    }

    pub fn jacobian_block(&self, row: usize, col: usize) -> &JacobianBlock {
        &self.jacobian[row][col]
    }

    pub fn blocks(&self) -> impl Iterator<Item = &JacobianBlock> {
        self.jacobian.iter().flatten()
    }

    /// `(row, col)` of every structurally present Jacobian block.
    pub fn structural_pairs(&self) -> Vec<(usize, usize)> {
        self.blocks().map(|b| (b.row, b.col)).collect()
    }

    /// `(row, col)` of the blocks with at least one term.
    pub fn coupled_pairs(&self) -> Vec<(usize, usize)> {
        self.blocks()
            .filter(|b| !b.is_empty())
            .map(|b| (b.row, b.col))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::discretization::generator::{extract_surface, structured_mesh, Grid};
    use crate::discretization::mesh::BoundarySide;
    use crate::model::domain::{Domain, DomainKind, Species};
    use crate::model::interface::Interface;
    use crate::model::Reaction;
    use crate::physics::forms::{LocalValues, Units};
    use num_dual::DualDVec64;

    /// Volume with one species, a membrane with two, and a volume with no
    /// diffusion that only couples through its own decay.
    fn coupled_model(with_binding: bool) -> (Model, DomainId, DomainId, DomainId) {
        let grid = Grid::cuboid([1.0, 1.0, 1.0], [3, 2, 2]);
        let (surface_mesh, pairs) = extract_surface(&grid, BoundarySide::XMax).unwrap();

        let mut model = Model::new();
        let cyto = model.add_domain(
            Domain::new("cyto", DomainKind::Volume, structured_mesh(&grid))
                .with_species(Species::new("A", 1.0, 1.0)),
        );
        let pm = model.add_domain(
            Domain::new("pm", DomainKind::Surface, surface_mesh)
                .with_species(Species::new("B", 0.1, 1.0))
                .with_species(Species::new("AB", 0.1, 0.0)),
        );
        let other = model.add_domain(
            Domain::new("store", DomainKind::Volume, structured_mesh(&Grid::cuboid([1.0, 0.0, 0.0], [2, 1, 1])))
                .with_species(Species::new("C", 0.0, 1.0)),
        );
        let iface = model.add_interface(Interface::from_pairings("cyto_pm", pm, cyto, &pairs));

        if with_binding {
            model
                .add_reaction(Reaction {
                    name: "bind".into(),
                    region: SubRegion::Interface(iface),
                    units: Units::rate_density(2),
                    depends_on: vec![cyto, pm],
                    linear_in: vec![cyto],
                    targets: vec![(cyto, 0, -1.0), (pm, 0, -1.0), (pm, 1, 1.0)],
                    kernel: Arc::new(move |lv: &LocalValues<'_>| lv.u(cyto, 0) * lv.u(pm, 0) - lv.u(pm, 1) * 0.5),
                })
                .unwrap();
        }
        model
            .add_reaction(Reaction {
                name: "decay".into(),
                region: SubRegion::Cells(other),
                units: Units::rate_density(1),
                depends_on: vec![other],
                linear_in: vec![other],
                targets: vec![(other, 0, -1.0)],
                kernel: Arc::new(move |lv: &LocalValues<'_>| lv.u(other, 0) * 2.0),
            })
            .unwrap();

        model.registry.activate().unwrap();
        model.generate_transport_forms();
        model.validate().unwrap();
        (model, cyto, pm, other)
    }

    #[test]
    fn every_pair_has_a_block() {
        let (model, _, _, _) = coupled_model(true);
        let system = BlockSystem::build(&model);
        assert_eq!(system.num_blocks(), 3);
        assert_eq!(system.structural_pairs().len(), 9);
        assert!(system.residual.iter().all(|r| !r.is_placeholder()));
    }

    #[test]
    fn blocks_follow_activation_order_and_coupling() {
        let (model, cyto, pm, other) = coupled_model(true);
        let system = BlockSystem::build(&model);
        // cyto: 12 dofs, pm: 4 cells * 2 species = 8, store: 2
        assert_eq!(system.residual[0].domain, cyto);
        assert_eq!(system.residual[1].domain, pm);
        assert_eq!(system.residual[2].domain, other);

        let mut coupled = system.coupled_pairs();
        coupled.sort();
        assert_eq!(coupled, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 2)]);

        // the cytosol residual is split over its cells and the interface
        assert_eq!(system.residual[0].parts.len(), 2);
        let j01 = system.jacobian_block(0, 1);
        assert_eq!(j01.parts.len(), 1);
        assert!(matches!(j01.parts[0].region, SubRegion::Interface(_)));
        assert!(!j01.constant);
        assert!(!system.jacobian_block(0, 0).constant);
        assert!(system.jacobian_block(2, 2).constant);
        assert!(system.jacobian_block(0, 2).is_empty());
    }

    #[test]
    fn mass_previous_is_simplified_away() {
        let (model, _, _, _) = coupled_model(false);
        let system = BlockSystem::build(&model);
        for part in &system.jacobian_block(2, 2).parts {
            for &fi in &part.forms {
                assert_ne!(model.forms.get(fi).kind, crate::physics::forms::FormKind::MassPrevious);
            }
        }
    }

    #[test]
    fn missing_residual_becomes_placeholder() {
        let (mut model, _, pm, _) = coupled_model(false);
        model.forms.retain(|f| f.domain != pm);
        let system = BlockSystem::build(&model);
        assert!(system.residual[1].is_placeholder());
        assert!(system.jacobian_block(1, 1).is_empty());
        assert_eq!(system.structural_pairs().len(), 9);
        assert!(system
            .warnings
            .iter()
            .any(|w| w.role == BlockRole::Residual && w.domains == vec!["pm".to_string()]));
    }

    #[test]
    fn influx_without_dependencies_warns_on_interface() {
        let (mut model, cyto, _, _) = coupled_model(false);
        let iface = crate::model::interface::InterfaceId(0);
        model
            .add_reaction(Reaction {
                name: "influx".into(),
                region: SubRegion::Interface(iface),
                units: Units::rate_density(2),
                depends_on: vec![],
                linear_in: vec![],
                targets: vec![(cyto, 0, 1.0)],
                kernel: Arc::new(|_: &LocalValues<'_>| DualDVec64::from_re(1.0)),
            })
            .unwrap();
        let system = BlockSystem::build(&model);
        assert!(system
            .warnings
            .iter()
            .any(|w| w.role == BlockRole::Jacobian && w.region == "cyto_pm"));
        // the residual still carries the interface part
        assert_eq!(system.residual[0].parts.len(), 2);
    }
}
