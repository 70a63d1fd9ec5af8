use std::sync::Arc;

use approx::assert_relative_eq;
use nalgebra::DVector;
use num_dual::DualDVec64;

use mdrd_rs::config::{LinearSolverKind, SolverConfig};
use mdrd_rs::discretization::generator::{structured_mesh, Grid};
use mdrd_rs::error::{EngineError, FailureReason};
use mdrd_rs::model::domain::{Domain, DomainId, DomainKind, Species};
use mdrd_rs::model::parameter::{Parameter, ParameterTable};
use mdrd_rs::model::{Model, Reaction, SubRegion};
use mdrd_rs::models::signaling::SignalingSetup;
use mdrd_rs::numerics::blocks::SubBlock;
use mdrd_rs::numerics::parallel::SerialComm;
use mdrd_rs::numerics::solver::ConvergedReason;
use mdrd_rs::numerics::transient::Engine;
use mdrd_rs::physics::{Assembler, AssemblyInput, FvAssembler, LocalValues, Units};
use mdrd_rs::processing::restart::RunState;

fn direct_config(final_t: f64, dt: f64) -> SolverConfig {
    let mut config = SolverConfig::default().with_times(final_t, dt);
    config.linear.kind = LinearSolverKind::DirectLu;
    config
}

// One cell, one species, consumed at a constant rate k: du/dt = -k.
fn zero_order_decay(a0: f64, k: f64) -> (Model, ParameterTable, DomainId) {
    let mut model = Model::new();
    let d = model.add_domain(
        Domain::new(
            "well",
            DomainKind::Volume,
            structured_mesh(&Grid::cuboid([1.0, 0.0, 0.0], [1, 1, 1])),
        )
        .with_species(Species::new("A", 0.0, a0)),
    );
    let mut params = ParameterTable::new();
    let rate = params.add(Parameter::constant("k", k));
    model
        .add_reaction(Reaction {
            name: "consume".into(),
            region: SubRegion::Cells(d),
            units: Units::rate_density(1),
            depends_on: vec![],
            linear_in: vec![],
            targets: vec![(d, 0, -1.0)],
            kernel: Arc::new(move |lv: &LocalValues<'_>| DualDVec64::from_re(lv.p(rate))),
        })
        .unwrap();
    (model, params, d)
}

/// Produces a NaN residual whenever dt exceeds `max_dt`.
struct Flaky {
    inner: FvAssembler,
    max_dt: f64,
}

impl Assembler for Flaky {
    fn residual(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        part: &SubBlock,
        out: &mut DVector<f64>,
    ) {
        if input.dt > self.max_dt {
            out.fill(f64::NAN);
            return;
        }
        self.inner.residual(input, row, part, out);
    }

    fn jacobian(
        &self,
        input: &AssemblyInput<'_>,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize, f64)>,
    ) {
        self.inner.jacobian(input, row, col, part, out);
    }

    fn sparsity(
        &self,
        model: &Model,
        row: DomainId,
        col: DomainId,
        part: &SubBlock,
        out: &mut Vec<(usize, usize)>,
    ) {
        self.inner.sparsity(model, row, col, part, out);
    }
}

fn small_signaling() -> SignalingSetup {
    SignalingSetup {
        divisions: [4, 2, 2],
        ..SignalingSetup::default()
    }
}

#[test]
fn mass_balance_with_pre_integrated_influx() {
    let setup = small_signaling();
    let (model, params, h) = setup.build().unwrap();
    let mut config = direct_config(0.5, 0.05);
    config.newton.atol = 1e-11;
    config.newton.rtol = 1e-14;

    let mut engine = Engine::new(model, params, FvAssembler::new(), SerialComm, config).unwrap();
    let model = engine.model().clone();
    let area = model.interface(h.interface).total_area();
    let ligand = |engine: &Engine<FvAssembler, SerialComm>| {
        let s = engine.state();
        s.species_total(&model, h.cytosol, 0) + s.species_total(&model, h.membrane, 1)
    };
    let receptor = |engine: &Engine<FvAssembler, SerialComm>| {
        let s = engine.state();
        s.species_total(&model, h.membrane, 0) + s.species_total(&model, h.membrane, 1)
    };
    let (ligand0, receptor0) = (ligand(&engine), receptor(&engine));

    let steps = engine.run_to_final(|_, _| {}).unwrap();
    assert_eq!(steps, 10);
    assert_relative_eq!(engine.clock().t(), 0.5, epsilon = 1e-12);

    let expected = ligand0 + area * setup.influx_integral(0.5);
    assert_relative_eq!(ligand(&engine), expected, max_relative = 1e-8);
    assert_relative_eq!(receptor(&engine), receptor0, max_relative = 1e-8);

    // binding actually happened
    assert!(engine.state().species_total(&model, h.membrane, 1) > 0.0);
}

#[test]
fn diverged_step_is_rolled_back_and_retried() {
    let (model, params, d) = zero_order_decay(1.0, 0.1);
    let assembler = Flaky {
        inner: FvAssembler::new(),
        max_dt: 0.05,
    };
    let mut engine = Engine::new(model, params, assembler, SerialComm, direct_config(1.0, 0.1)).unwrap();

    let report = engine.take_step().unwrap();
    assert_eq!(report.retries, 1);
    assert_relative_eq!(report.dt, 0.02, epsilon = 1e-12);
    assert_relative_eq!(report.t, 0.02, epsilon = 1e-12);

    let failed = engine.failed_steps();
    assert_eq!(failed.len(), 1);
    assert_relative_eq!(failed[0].t, 0.1, epsilon = 1e-12);
    assert_eq!(
        failed[0].reason,
        FailureReason::Diverged(ConvergedReason::DivergedFnormNan)
    );

    let block = engine.model().registry.block_of(d).unwrap();
    assert_relative_eq!(engine.state().u(block)[0], 1.0 - 0.1 * 0.02, epsilon = 1e-12);
}

#[test]
fn rollback_restores_time_and_fields_exactly() {
    let (model, params, _) = zero_order_decay(1.0, 0.1);
    let mut config = direct_config(1.0, 0.1);
    config.attempt_timestep_restart_on_divergence = false;
    let assembler = Flaky {
        inner: FvAssembler::new(),
        max_dt: 0.05,
    };
    let mut engine = Engine::new(model, params, assembler, SerialComm, config).unwrap();

    let t_before = engine.clock().t();
    let state_before = engine.state().clone();

    let err = engine.take_step().unwrap_err();
    assert!(matches!(
        err,
        EngineError::Convergence {
            step: 1,
            reason: FailureReason::Diverged(ConvergedReason::DivergedFnormNan),
            ..
        }
    ));
    assert_eq!(engine.clock().t(), t_before);
    assert_eq!(engine.clock().step_index(), 0);
    assert_eq!(engine.state(), &state_before);
    assert_relative_eq!(engine.clock().dt(), 0.1 * 0.2, epsilon = 1e-12);
}

#[test]
fn retry_bound_is_fatal() {
    let (model, params, _) = zero_order_decay(1.0, 0.1);
    let mut config = direct_config(1.0, 0.1);
    config.max_step_retries = 2;
    let assembler = Flaky {
        inner: FvAssembler::new(),
        max_dt: 1e-3,
    };
    let mut engine = Engine::new(model, params, assembler, SerialComm, config).unwrap();

    match engine.take_step() {
        Err(EngineError::RetryLimitExceeded {
            step,
            retries,
            failures,
            ..
        }) => {
            assert_eq!(step, 1);
            assert_eq!(retries, 2);
            assert_eq!(failures.len(), 3);
            assert!(failures.windows(2).all(|w| w[1].dt < w[0].dt));
        }
        other => panic!("expected RetryLimitExceeded, got {:?}", other.map(|r| r.t)),
    }
    assert_eq!(engine.clock().t(), 0.0);
}

#[test]
fn large_negative_value_triggers_retry() {
    let (model, params, d) = zero_order_decay(1e-3, 1.0);
    let mut config = direct_config(1.0, 2e-3);
    config.reset_timestep_for_negative_solution = true;
    let mut engine = Engine::new(model, params, FvAssembler::new(), SerialComm, config).unwrap();

    let report = engine.take_step().unwrap();
    assert_eq!(report.retries, 1);
    assert_relative_eq!(report.dt, 4e-4, epsilon = 1e-12);

    let failed = engine.failed_steps();
    assert_eq!(failed.len(), 1);
    match failed[0].reason {
        FailureReason::NegativeSolution { min } => assert_relative_eq!(min, -1e-3, epsilon = 1e-9),
        other => panic!("unexpected failure reason {}", other),
    }

    let block = engine.model().registry.block_of(d).unwrap();
    assert_relative_eq!(engine.state().u(block)[0], 6e-4, epsilon = 1e-12);
}

#[test]
fn small_negative_value_is_clamped() {
    let (model, params, d) = zero_order_decay(1e-3, 1.0);
    let mut config = direct_config(1.0, 1.00001e-3);
    config.time_precision = 10;
    config.reset_timestep_for_negative_solution = true;
    let mut engine = Engine::new(model, params, FvAssembler::new(), SerialComm, config).unwrap();

    let report = engine.take_step().unwrap();
    assert_eq!(report.retries, 0);
    assert!(engine.failed_steps().is_empty());

    let block = engine.model().registry.block_of(d).unwrap();
    assert_eq!(engine.state().u(block)[0], 0.0);
    assert_eq!(engine.state().n(block)[0], 0.0);
}

#[test]
fn block_sparsity_is_stable_across_steps() {
    let (model, params, h) = small_signaling().build().unwrap();
    let mut engine =
        Engine::new(model, params, FvAssembler::new(), SerialComm, direct_config(1.0, 0.05)).unwrap();

    let pattern = engine.pattern().clone();
    let pairs = engine.blocks().structural_pairs();
    let coupled = engine.blocks().coupled_pairs();
    let cyto = engine.model().registry.block_of(h.cytosol).unwrap();
    let pm = engine.model().registry.block_of(h.membrane).unwrap();
    assert!(coupled.contains(&(cyto, pm)));
    assert!(coupled.contains(&(pm, cyto)));

    engine.take_step().unwrap();
    let after_one = engine.pattern().entries();
    engine.take_step().unwrap();

    assert!(Arc::ptr_eq(&pattern, engine.pattern()));
    assert_eq!(after_one, engine.pattern().entries());
    assert_eq!(pairs, engine.blocks().structural_pairs());
    assert_eq!(coupled, engine.blocks().coupled_pairs());
}

#[test]
fn clock_is_monotonic_and_lands_on_checkpoints() {
    let (model, params, _) = small_signaling().build().unwrap();
    let mut config = direct_config(0.3, 0.04);
    config.adjust_dt = vec![(0.1, 0.01)];
    let mut engine = Engine::new(model, params, FvAssembler::new(), SerialComm, config).unwrap();

    let mut reports = Vec::new();
    engine
        .run_to_final(|report, _| reports.push(report.clone()))
        .unwrap();

    assert!(reports.windows(2).all(|w| w[1].t > w[0].t));
    let total: f64 = reports.iter().map(|r| r.dt).sum();
    assert_relative_eq!(total, engine.clock().t(), epsilon = 1e-12);
    assert_relative_eq!(engine.clock().t(), 0.3, epsilon = 1e-12);

    let landing = reports
        .iter()
        .position(|r| (r.t - 0.1).abs() < 1e-12)
        .expect("no step landed on the checkpoint");
    assert_relative_eq!(reports[landing + 1].dt, 0.01, epsilon = 1e-12);
    assert!(reports.iter().all(|r| r.reason.is_converged()));
}

#[test]
fn resumed_run_matches_uninterrupted_run() {
    let build = || {
        let (model, params, _) = small_signaling().build().unwrap();
        Engine::new(model, params, FvAssembler::new(), SerialComm, direct_config(1.0, 0.05)).unwrap()
    };

    let mut reference = build();
    reference.take_step().unwrap();
    reference.take_step().unwrap();

    let path = std::env::temp_dir().join("mdrd_resume_test.json");
    reference.checkpoint().save(&path).unwrap();
    let saved = RunState::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let mut resumed = build();
    resumed.resume(saved).unwrap();
    assert_eq!(resumed.clock().step_index(), 2);

    let a = reference.take_step().unwrap();
    let b = resumed.take_step().unwrap();
    assert_relative_eq!(a.t, b.t, epsilon = 1e-12);
    let (ua, ub) = (reference.state().gather_u(), resumed.state().gather_u());
    for (x, y) in ua.iter().zip(ub.iter()) {
        assert_relative_eq!(*x, *y, max_relative = 1e-10, epsilon = 1e-14);
    }
}

#[test]
fn model_without_unknowns_is_rejected() {
    let mut model = Model::new();
    model.add_domain(Domain::new(
        "empty",
        DomainKind::Volume,
        structured_mesh(&Grid::cuboid([1.0, 1.0, 1.0], [2, 2, 2])),
    ));
    let result = Engine::new(
        model,
        ParameterTable::new(),
        FvAssembler::new(),
        SerialComm,
        direct_config(1.0, 0.1),
    );
    assert!(matches!(result, Err(EngineError::Configuration(_))));
}

#[test]
fn default_solver_conserves_mass() {
    let setup = small_signaling();
    let (model, params, h) = setup.build().unwrap();
    let mut config = SolverConfig::default().with_times(0.3, 0.05);
    assert_eq!(config.linear.kind, LinearSolverKind::Auto);
    config.newton.rtol = 1e-10;
    config.linear.rtol = 1e-10;

    let mut engine = Engine::new(model, params, FvAssembler::new(), SerialComm, config).unwrap();
    let model = engine.model().clone();
    let area = model.interface(h.interface).total_area();
    let ligand = |engine: &Engine<FvAssembler, SerialComm>| {
        let s = engine.state();
        s.species_total(&model, h.cytosol, 0) + s.species_total(&model, h.membrane, 1)
    };
    let ligand0 = ligand(&engine);

    let steps = engine.run_to_final(|_, _| {}).unwrap();
    assert_eq!(steps, 6);
    assert!(engine.failed_steps().is_empty());

    let expected = ligand0 + area * setup.influx_integral(0.3);
    assert_relative_eq!(ligand(&engine), expected, max_relative = 1e-7);
}

#[test]
fn stepping_after_final_time_is_a_configuration_error() {
    let (model, params, _) = small_signaling().build().unwrap();
    let mut engine =
        Engine::new(model, params, FvAssembler::new(), SerialComm, direct_config(0.1, 0.05)).unwrap();
    engine.run_to_final(|_, _| {}).unwrap();
    let u = engine.state().gather_u();

    let err = engine.take_step().unwrap_err();
    assert!(matches!(err, EngineError::Configuration(_)));
    assert_relative_eq!(engine.clock().t(), 0.1, epsilon = 1e-12);
    assert_eq!(engine.clock().step_index(), 2);
    assert_eq!(engine.state().gather_u(), u);
    assert!(engine.failed_steps().is_empty());
}

#[test]
fn kernel_reading_undeclared_domain_is_rejected() {
    let (mut model, params, d) = zero_order_decay(1.0, 0.1);
    model
        .add_reaction(Reaction {
            name: "hidden_decay".into(),
            region: SubRegion::Cells(d),
            units: Units::rate_density(1),
            depends_on: vec![],
            linear_in: vec![],
            targets: vec![(d, 0, -1.0)],
            kernel: Arc::new(move |lv: &LocalValues<'_>| lv.u(d, 0)),
        })
        .unwrap();

    let result = Engine::new(model, params, FvAssembler::new(), SerialComm, direct_config(1.0, 0.1));
    match result {
        Err(EngineError::Configuration(msg)) => assert!(msg.contains("hidden_decay")),
        Err(e) => panic!("unexpected error: {}", e),
        Ok(_) => panic!("kernel with an undeclared read was accepted"),
    }
}
