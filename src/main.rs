use std::fs;
use std::process;

use log::{error, info};

use mdrd_rs::config::SolverConfig;
use mdrd_rs::models::signaling::SignalingSetup;
use mdrd_rs::numerics::parallel::SerialComm;
use mdrd_rs::numerics::state::SolutionState;
use mdrd_rs::numerics::transient::Engine;
use mdrd_rs::physics::FvAssembler;
use mdrd_rs::processing::csv_writer;
use mdrd_rs::processing::summary::RunSummary;

const OUTPUT_DIR: &str = "output/main";

fn default_config() -> SolverConfig {
    let mut config = SolverConfig::default().with_times(2.0, 0.01);
    config.adjust_dt = vec![(0.5, 0.05)];
    config.reset_timestep_for_negative_solution = true;
    config
}

fn main() {
    env_logger::init();

    let config = match std::env::args().nth(1) {
        Some(path) => match SolverConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                error!("cannot read configuration '{}': {}", path, e);
                process::exit(1);
            }
        },
        None => default_config(),
    };

    fs::create_dir_all(OUTPUT_DIR).expect("Failed to create output directory");

    let setup = SignalingSetup::default();
    let (model, params, handles) = setup.build().expect("Failed to build the demo model");
    let mut engine = match Engine::new(model, params, FvAssembler::new(), SerialComm, config) {
        Ok(engine) => engine,
        Err(e) => {
            error!("setup failed: {}", e);
            process::exit(1);
        }
    };

    let model = engine.model().clone();
    let area = model.interface(handles.interface).total_area();
    let amounts = |state: &SolutionState| {
        (
            state.species_total(&model, handles.cytosol, 0),
            state.species_total(&model, handles.membrane, 1),
        )
    };
    let (a0, ab0) = amounts(engine.state());

    let mut times = vec![engine.clock().t()];
    let mut ligand = vec![a0];
    let mut complex = vec![ab0];
    let mut injected = vec![0.0];

    let result = engine.run_to_final(|report, state| {
        let (a, ab) = amounts(state);
        times.push(report.t);
        ligand.push(a);
        complex.push(ab);
        injected.push(area * setup.influx_integral(report.t));
    });

    let aborted = match result {
        Ok(_) => false,
        Err(e) => {
            error!("run aborted: {}", e);
            true
        }
    };

    csv_writer::write_csv(
        format!("{}/amounts.csv", OUTPUT_DIR),
        &["t", "A", "AB", "injected"],
        &[times, ligand, complex, injected],
    )
    .expect("Failed to write amounts");

    for &id in engine.model().registry.active() {
        let name = &engine.model().domain(id).name;
        csv_writer::write_domain_field(
            format!("{}/{}.csv", OUTPUT_DIR, name),
            engine.model(),
            engine.state(),
            id,
        )
        .expect("Failed to write domain field");
    }

    engine
        .checkpoint()
        .save(format!("{}/run_state.json", OUTPUT_DIR))
        .expect("Failed to write run state");

    let summary = RunSummary::from_run(
        engine.model(),
        engine.state(),
        engine.reports(),
        engine.failed_steps(),
        engine.clock().t(),
    );
    summary
        .write_to_file(format!("{}/run_summary.txt", OUTPUT_DIR))
        .expect("Failed to write summary");
    summary.print_to_console(engine.comm());

    info!("outputs written to {}", OUTPUT_DIR);
    if aborted {
        process::exit(1);
    }
}
