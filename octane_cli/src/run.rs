use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueHint};
use octane::engine::{Engine, EngineParams};
use octane::snapshot::Snapshot;
use octane::space::SpaceParams;
use octane::transport::Transport;
use prettytable::{cell, row};
use std::path::PathBuf;
use std::process::ExitCode;

/// Step a snapshot forward in time.
#[derive(Parser)]
pub struct Opts {
    /// Path to the input snapshot.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    /// Number of steps to take.
    #[arg(default_value = "10", long, short)]
    steps: u64,
    /// End time of the run.
    #[arg(default_value = "1.0", long)]
    t_end: f64,
    /// Largest physical step any particle may take.
    #[arg(default_value = "0.01", long)]
    dt_max: f64,
    /// Opening angle of the multipole acceptance criterion.
    #[arg(default_value = "0.5", long)]
    theta: f64,
    /// Disable self-gravity.
    #[arg(long)]
    no_gravity: bool,
    /// Run the extra gradient loop between density and force.
    #[arg(long)]
    gradient: bool,
    /// Number of top-level cells per axis.
    #[arg(default_value = "4", long)]
    top_grid: usize,
    /// Write the final state to this snapshot.
    #[arg(long, value_hint = ValueHint::FilePath)]
    output: Option<PathBuf>,
}

impl Subcommand for Opts {
    fn run(&self, cfg: &GlobalConfiguration) -> Result<ExitCode> {
        let snapshot = helpers::read_snapshot(&self.input)?;

        let mut space_params = SpaceParams::default();
        space_params.set_top_grid(self.top_grid);
        let mut engine_params = EngineParams::default();
        engine_params.set_nworkers(cfg.threads);
        engine_params.set_t_end(self.t_end);
        engine_params.set_dt_max(self.dt_max);
        engine_params.set_theta_crit(self.theta);
        engine_params.set_with_self_gravity(!self.no_gravity);
        engine_params.set_with_gradient(self.gradient);

        let space = snapshot.into_space(space_params);
        let mut engine = Engine::new(space, engine_params, Transport::loopback(0));
        engine.init();

        let mut table = helpers::create_table();
        table.set_titles(row![c => "step", "time", "updated", "g-updated", "rebuild"]);
        for _ in 0..self.steps {
            let summary = engine.step();
            table.add_row(row![
                r->engine.steps_done().to_string(),
                r->format!("{:.6e}", engine.time()),
                r->summary.updated.to_string(),
                r->summary.g_updated.to_string(),
                c->if summary.rebuild { "yes" } else { "no" }
            ]);
        }
        table.printstd();

        if let Some(output) = &self.output {
            let time = engine.time();
            let snapshot = Snapshot::from_space(engine.space_mut(), time);
            helpers::write_snapshot(output, &snapshot)?;
        }
        Ok(ExitCode::SUCCESS)
    }
}
