use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Args, Parser, ValueHint};
use itertools::Itertools;
use octane::space::SpaceParams;
use prettytable::{cell, row};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Args)]
#[group(multiple = false)]
struct Group {
    /// Show the particle extremes of the snapshot.
    #[arg(long, short)]
    summary: bool,
    /// Build the tree and show the top-level cell occupation.
    #[arg(long)]
    cells: bool,
}

/// Read out information of a snapshot.
#[derive(Parser)]
pub struct Opts {
    /// Path to the input snapshot.
    #[arg(value_hint = ValueHint::FilePath)]
    input: PathBuf,
    #[command(flatten)]
    group: Group,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let snapshot = helpers::read_snapshot(&self.input)?;

        if self.group.cells {
            let mut space = snapshot.into_space(SpaceParams::default());
            space.rebuild(0);
            let mut table = helpers::create_table();
            table.set_titles(row![c => "cell", "parts", "gparts", "subtree"]);
            for (index, &top) in space.top_cells().to_vec().iter().enumerate() {
                let c = space.cell(top);
                table.add_row(row![
                    r->index.to_string(),
                    r->c.parts.count.to_string(),
                    r->c.gparts.count.to_string(),
                    r->space.subtree_size(top).to_string()
                ]);
            }
            table.printstd();
            return Ok(ExitCode::SUCCESS);
        }

        let mut table = helpers::create_table();
        table.set_titles(row![c => "field", "value"]);
        table.add_row(row!["time", r->format!("{:.6e}", snapshot.time)]);
        table.add_row(row![
            "box",
            r->snapshot.dim.iter().map(|d| format!("{d}")).join(" x ")
        ]);
        table.add_row(row!["parts", r->snapshot.parts.len().to_string()]);
        table.add_row(row!["gparts", r->snapshot.gparts.len().to_string()]);
        table.add_row(row!["sparts", r->snapshot.sparts.len().to_string()]);
        if self.group.summary && !snapshot.parts.is_empty() {
            let h_min = snapshot.parts.iter().map(|p| p.h).fold(f64::MAX, f64::min);
            let h_max = snapshot.parts.iter().map(|p| p.h).fold(0.0_f64, f64::max);
            table.add_row(row!["h min", r->format!("{h_min:.6e}")]);
            table.add_row(row!["h max", r->format!("{h_max:.6e}")]);
        }
        table.printstd();
        Ok(ExitCode::SUCCESS)
    }
}
