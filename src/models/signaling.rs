use std::sync::Arc;

use num_dual::DualDVec64;

use crate::discretization::generator::{extract_surface, structured_mesh, Grid};
use crate::discretization::mesh::BoundarySide;
use crate::error::EngineError;
use crate::model::domain::{Domain, DomainId, DomainKind, Species};
use crate::model::expression::FnExpression;
use crate::model::interface::{Interface, InterfaceId};
use crate::model::parameter::{ParamId, Parameter, ParameterTable};
use crate::model::{Model, Reaction, SubRegion};
use crate::physics::forms::{LocalValues, Units};

/// Geometry and rate constants of the receptor-binding demo.
#[derive(Debug, Clone)]
pub struct SignalingSetup {
    /// Edge lengths of the cytosol box.
    pub lengths: [f64; 3],
    pub divisions: [usize; 3],
    pub diffusion_a: f64,
    pub diffusion_b: f64,
    pub a0: f64,
    pub b0: f64,
    pub kf: f64,
    pub kr: f64,
    /// Mean influx density of `A` through the membrane.
    pub j0: f64,
    /// Angular frequency of the influx modulation.
    pub omega: f64,
}

impl Default for SignalingSetup {
    fn default() -> Self {
        Self {
            lengths: [1.0, 0.5, 0.5],
            divisions: [8, 4, 4],
            diffusion_a: 1.0,
            diffusion_b: 0.05,
            a0: 1.0,
            b0: 1.0,
            kf: 2.0,
            kr: 0.5,
            j0: 0.2,
            omega: 6.0,
        }
    }
}

/// Handles into the model built by [`SignalingSetup::build`].
#[derive(Debug, Clone, Copy)]
pub struct SignalingHandles {
    pub cytosol: DomainId,
    pub membrane: DomainId,
    pub er: DomainId,
    pub interface: InterfaceId,
    pub kf: ParamId,
    pub kr: ParamId,
    pub influx: ParamId,
}

impl SignalingSetup {
    /// Cytosol volume with a ligand `A`, a membrane on its `x = max` face
    /// carrying a receptor `B` and the complex `AB`, and an ER compartment
    /// declared without species.
    ///
    /// `A + B <-> AB` on the membrane, plus a pulsing influx of `A` that is
    /// integrated exactly over each step.
    pub fn build(&self) -> Result<(Model, ParameterTable, SignalingHandles), EngineError> {
        let grid = Grid::cuboid(self.lengths, self.divisions);
        let (pm_mesh, pairings) = extract_surface(&grid, BoundarySide::XMax)
            .ok_or_else(|| EngineError::config("cytosol grid is collapsed along x"))?;

        let mut model = Model::new();
        let cytosol = model.add_domain(
            Domain::new("cytosol", DomainKind::Volume, structured_mesh(&grid))
                .with_species(Species::new("A", self.diffusion_a, self.a0)),
        );
        let membrane = model.add_domain(
            Domain::new("pm", DomainKind::Surface, pm_mesh)
                .with_species(Species::new("B", self.diffusion_b, self.b0))
                .with_species(Species::new("AB", self.diffusion_b, 0.0)),
        );
        let er_grid = Grid::new([0.25, 0.125, 0.125], [0.25, 0.25, 0.25], [2, 2, 2]);
        let er = model.add_domain(Domain::new("er", DomainKind::Volume, structured_mesh(&er_grid)));
        let interface =
            model.add_interface(Interface::from_pairings("cytosol_pm", membrane, cytosol, &pairings));

        let mut params = ParameterTable::new();
        let kf = params.add(Parameter::constant("kf", self.kf));
        let kr = params.add(Parameter::constant("kr", self.kr));
        let (j0, omega) = (self.j0, self.omega);
        let influx = params.add(Parameter::pre_integrated(
            "j_influx",
            FnExpression::new("j0 (1 + sin wt)", move |t| j0 * (1.0 + (omega * t).sin()))
                .with_antiderivative(move |t| j0 * (t - (omega * t).cos() / omega)),
        ));

        model.add_reaction(Reaction {
            name: "binding".into(),
            region: SubRegion::Interface(interface),
            units: Units::rate_density(2),
            depends_on: vec![cytosol, membrane],
            linear_in: vec![cytosol],
            targets: vec![(cytosol, 0, -1.0), (membrane, 0, -1.0), (membrane, 1, 1.0)],
            kernel: Arc::new(move |lv: &LocalValues<'_>| {
                lv.u(cytosol, 0) * lv.u(membrane, 0) * lv.p(kf) - lv.u(membrane, 1) * lv.p(kr)
            }),
        })?;
        model.add_reaction(Reaction {
            name: "influx".into(),
            region: SubRegion::Interface(interface),
            units: Units::rate_density(2),
            depends_on: vec![],
            linear_in: vec![],
            targets: vec![(cytosol, 0, 1.0)],
            kernel: Arc::new(move |lv: &LocalValues<'_>| DualDVec64::from_re(lv.p(influx))),
        })?;

        Ok((
            model,
            params,
            SignalingHandles {
                cytosol,
                membrane,
                er,
                interface,
                kf,
                kr,
                influx,
            },
        ))
    }

    /// Integral of the influx density over `[0, t]`.
    pub fn influx_integral(&self, t: f64) -> f64 {
        self.j0 * (t - (self.omega * t).cos() / self.omega + 1.0 / self.omega)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn demo_model_activates_two_domains() {
        let (mut model, params, h) = SignalingSetup::default().build().unwrap();
        model.registry.activate().unwrap();
        model.generate_transport_forms();
        model.validate().unwrap();
        params.validate(&model.registry).unwrap();

        assert_eq!(model.registry.active().len(), 2);
        assert!(model.registry.block_of(h.er).is_none());
        assert_eq!(model.registry.at_block(0), h.cytosol);
        assert_eq!(model.interface(h.interface).pairs.len(), 16);
    }
}
