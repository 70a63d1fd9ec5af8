use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::model::Model;
use crate::numerics::clock::FailedStep;
use crate::numerics::parallel::Collective;
use crate::numerics::state::SolutionState;
use crate::numerics::transient::StepReport;

/// Per-domain figures at the end of a run.
#[derive(Debug, Clone)]
pub struct DomainSummary {
    pub name: String,
    pub block: usize,
    pub num_cells: usize,
    pub num_species: usize,
    pub measure: f64,
    /// `(species, amount)`: cell integral of each species.
    pub totals: Vec<(String, f64)>,
    pub final_residual: Option<f64>,
}

pub struct RunSummary {
    pub domains: Vec<DomainSummary>,
    pub inactive: Vec<String>,
    pub final_t: f64,
    pub steps: usize,
    pub newton_iterations: u64,
    pub linear_iterations: usize,
    pub min_dt: Option<f64>,
    pub max_dt: Option<f64>,
    pub failed_steps: Vec<FailedStep>,
}

impl RunSummary {
    pub fn from_run(
        model: &Model,
        state: &SolutionState,
        reports: &[StepReport],
        failed_steps: &[FailedStep],
        final_t: f64,
    ) -> Self {
        let last = reports.last();
        let domains = model
            .registry
            .active()
            .iter()
            .enumerate()
            .map(|(block, &id)| {
                let d = model.domain(id);
                DomainSummary {
                    name: d.name.clone(),
                    block,
                    num_cells: d.mesh.num_cells(),
                    num_species: d.num_species(),
                    measure: d.mesh.total_measure(),
                    totals: d
                        .species
                        .iter()
                        .enumerate()
                        .map(|(s, sp)| (sp.name.clone(), state.species_total(model, id, s)))
                        .collect(),
                    final_residual: last.and_then(|r| r.domain_residuals.get(block).map(|x| x.1)),
                }
            })
            .collect();
        let inactive = model
            .registry
            .dropped()
            .iter()
            .map(|&id| model.domain(id).name.clone())
            .collect();

        let dts = reports.iter().map(|r| r.dt);
        Self {
            domains,
            inactive,
            final_t,
            steps: reports.len(),
            newton_iterations: reports.iter().map(|r| r.newton_iterations as u64).sum(),
            linear_iterations: reports.iter().map(|r| r.linear_iterations).sum(),
            min_dt: dts.clone().reduce(f64::min),
            max_dt: dts.reduce(f64::max),
            failed_steps: failed_steps.to_vec(),
        }
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;

        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file, "REACTION-DIFFUSION RUN SUMMARY")?;
        writeln!(file, "{}", "=".repeat(60))?;
        writeln!(file)?;

        writeln!(file, "DOMAINS")?;
        writeln!(file, "{}", "-".repeat(60))?;
        for d in &self.domains {
            writeln!(
                file,
                "[{}] {:<16} {:>6} cells  {} species  measure {:.6e}",
                d.block, d.name, d.num_cells, d.num_species, d.measure
            )?;
            for (species, amount) in &d.totals {
                writeln!(file, "      {:<12} total = {:.6e}", species, amount)?;
            }
            if let Some(res) = d.final_residual {
                writeln!(file, "      final residual = {:.6e}", res)?;
            }
        }
        if !self.inactive.is_empty() {
            writeln!(file, "Inactive (no unknowns): {}", self.inactive.join(", "))?;
        }
        writeln!(file)?;

        writeln!(file, "TIME STEPPING")?;
        writeln!(file, "{}", "-".repeat(60))?;
        writeln!(file, "Final time:          {:.6e}", self.final_t)?;
        writeln!(file, "Accepted steps:      {}", self.steps)?;
        if let (Some(lo), Some(hi)) = (self.min_dt, self.max_dt) {
            writeln!(file, "dt range:            {:.3e} .. {:.3e}", lo, hi)?;
        }
        writeln!(file, "Newton iterations:   {}", self.newton_iterations)?;
        writeln!(file, "Linear iterations:   {}", self.linear_iterations)?;
        writeln!(file)?;

        if !self.failed_steps.is_empty() {
            self.write_failed_steps(&mut file)?;
            writeln!(file)?;
        }

        writeln!(file, "{}", "=".repeat(60))?;

        Ok(())
    }

    /// Table of rejected step attempts, one row per failure.
    pub fn write_failed_steps<W: Write>(&self, out: &mut W) -> io::Result<()> {
        writeln!(out, "FAILED STEPS")?;
        writeln!(out, "{}", "-".repeat(60))?;
        writeln!(
            out,
            "{:>6} {:>14} {:>12} {:>6} {:>8}  reason",
            "step", "t", "dt", "its", "lin.its"
        )?;
        for f in &self.failed_steps {
            writeln!(
                out,
                "{:>6} {:>14.6e} {:>12.3e} {:>6} {:>8}  {}",
                f.step_index, f.t, f.dt, f.newton_iterations, f.linear_iterations, f.reason
            )?;
        }
        Ok(())
    }

    /// Print on the root worker only.
    pub fn print_to_console<C: Collective>(&self, comm: &C) {
        if !comm.is_root() {
            return;
        }
        println!("\n{}", "=".repeat(60));
        println!("RUN SUMMARY");
        println!("{}", "=".repeat(60));
        println!("Domains:       {}", self.domains.len());
        for d in &self.domains {
            let totals: Vec<String> = d
                .totals
                .iter()
                .map(|(s, x)| format!("{}={:.4e}", s, x))
                .collect();
            println!("  {:<12} {}", d.name, totals.join(" "));
        }
        println!("Final t:       {:.6e}", self.final_t);
        println!(
            "Steps:         {} accepted, {} failed",
            self.steps,
            self.failed_steps.len()
        );
        println!(
            "Iterations:    newton={}, linear={}",
            self.newton_iterations, self.linear_iterations
        );
        if !self.failed_steps.is_empty() {
            let mut table = Vec::new();
            if self.write_failed_steps(&mut table).is_ok() {
                print!("{}", String::from_utf8_lossy(&table));
            }
        }
        println!("{}\n", "=".repeat(60));
    }
}
