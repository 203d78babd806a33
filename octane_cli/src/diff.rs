use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::{bail, Result};
use clap::{Parser, ValueHint};
use prettytable::{cell, row};
use std::path::PathBuf;
use std::process::ExitCode;

/// Compare the particle state of two snapshots.
#[derive(Parser)]
pub struct Opts {
    /// Path to the first snapshot.
    #[arg(value_hint = ValueHint::FilePath)]
    input1: PathBuf,
    /// Path to the second snapshot.
    #[arg(value_hint = ValueHint::FilePath)]
    input2: PathBuf,
    /// Largest per-field difference still treated as equal.
    #[arg(default_value = "0.0", long)]
    tolerance: f64,
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let a = helpers::read_snapshot(&self.input1)?;
        let b = helpers::read_snapshot(&self.input2)?;

        if a.dim != b.dim {
            bail!("box sizes differ: {:?} vs {:?}", a.dim, b.dim);
        }
        if a.parts.len() != b.parts.len() || a.gparts.len() != b.gparts.len() {
            bail!(
                "particle counts differ: {}+{} vs {}+{}",
                a.parts.len(),
                a.gparts.len(),
                b.parts.len(),
                b.gparts.len()
            );
        }

        let mut dx_max: f64 = 0.0;
        let mut dv_max: f64 = 0.0;
        let mut dh_max: f64 = 0.0;
        let mut du_max: f64 = 0.0;
        for (pa, pb) in a.parts.iter().zip(&b.parts) {
            for k in 0..3 {
                dx_max = dx_max.max((pa.x[k] - pb.x[k]).abs());
                dv_max = dv_max.max((pa.v[k] - pb.v[k]).abs());
            }
            dh_max = dh_max.max((pa.h - pb.h).abs());
            du_max = du_max.max((pa.u - pb.u).abs());
        }

        let mut table = helpers::create_table();
        table.set_titles(row![c => "field", "max abs diff"]);
        table.add_row(row!["x", r->format!("{dx_max:.6e}")]);
        table.add_row(row!["v", r->format!("{dv_max:.6e}")]);
        table.add_row(row!["h", r->format!("{dh_max:.6e}")]);
        table.add_row(row!["u", r->format!("{du_max:.6e}")]);
        table.printstd();

        let worst = dx_max.max(dv_max).max(dh_max).max(du_max);
        if worst > self.tolerance {
            Ok(ExitCode::FAILURE)
        } else {
            Ok(ExitCode::SUCCESS)
        }
    }
}
