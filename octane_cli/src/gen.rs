use super::helpers;
use super::{GlobalConfiguration, Subcommand};
use anyhow::Result;
use clap::{Parser, ValueEnum, ValueHint};
use octane::part::{GPart, GPartLink, Part};
use octane::snapshot::Snapshot;
use rand::Rng;
use rand_pcg::Pcg64;
use std::path::PathBuf;
use std::process::ExitCode;

/// How the particle positions are laid out.
#[derive(Clone, Copy, ValueEnum)]
enum Layout {
    /// Uniform random positions.
    Uniform,
    /// Positions at the octant centres of a recursive subdivision of the
    /// box.
    Octants,
}

/// Generate an initial-conditions snapshot.
#[derive(Parser)]
pub struct Opts {
    /// Path to the snapshot to write.
    #[arg(value_hint = ValueHint::FilePath)]
    output: PathBuf,
    /// Number of gas particles.
    #[arg(default_value = "1000", long, short)]
    nparts: usize,
    /// Periodic box size.
    #[arg(default_value = "1.0", long)]
    box_size: f64,
    /// Position layout.
    #[arg(default_value = "uniform", long, value_enum)]
    layout: Layout,
    /// Velocity dispersion.
    #[arg(default_value = "0.0", long)]
    vel: f64,
    /// Smoothing length, defaulting to 1.3 times the mean inter-particle
    /// separation.
    #[arg(long)]
    smoothing: Option<f64>,
    /// Seed of the particle generator.
    #[arg(default_value = "42", long)]
    seed: u64,
}

impl Opts {
    /// Uniform random positions in the box.
    fn uniform_positions(&self, rng: &mut Pcg64) -> Vec<[f64; 3]> {
        (0..self.nparts)
            .map(|_| {
                [
                    rng.gen_range(0.0..self.box_size),
                    rng.gen_range(0.0..self.box_size),
                    rng.gen_range(0.0..self.box_size),
                ]
            })
            .collect()
    }

    /// Positions at the octant centres of the smallest power-of-two
    /// subdivision of the box that holds the request, in grid order.
    fn octant_positions(&self) -> Vec<[f64; 3]> {
        let mut m = 2_usize;
        while m * m * m < self.nparts {
            m *= 2;
        }
        let w = self.box_size / m as f64;
        let mut positions = Vec::with_capacity(self.nparts);
        'grid: for i in 0..m {
            for j in 0..m {
                for k in 0..m {
                    if positions.len() == self.nparts {
                        break 'grid;
                    }
                    positions.push([
                        (i as f64 + 0.5) * w,
                        (j as f64 + 0.5) * w,
                        (k as f64 + 0.5) * w,
                    ]);
                }
            }
        }
        positions
    }
}

impl Subcommand for Opts {
    fn run(&self, _: &GlobalConfiguration) -> Result<ExitCode> {
        let h = self
            .smoothing
            .unwrap_or_else(|| 1.3 * self.box_size / (self.nparts as f64).cbrt());
        let mut rng = Pcg64::new(u128::from(self.seed), 0xa02bdbf7bb3c0a7);
        let positions = match self.layout {
            Layout::Uniform => self.uniform_positions(&mut rng),
            Layout::Octants => self.octant_positions(),
        };

        let mut parts = Vec::with_capacity(positions.len());
        let mut gparts = Vec::with_capacity(positions.len());
        for (i, x) in positions.into_iter().enumerate() {
            let v = if self.vel > 0.0 {
                [
                    rng.gen_range(-self.vel..=self.vel),
                    rng.gen_range(-self.vel..=self.vel),
                    rng.gen_range(-self.vel..=self.vel),
                ]
            } else {
                [0.0; 3]
            };
            let mut p = Part::at(x, h, 1.0);
            p.v = v;
            p.u = 1.0;
            p.gpart = u32::try_from(i)?;
            parts.push(p);
            let mut g = GPart::dark(x, 1.0);
            g.v = v;
            g.link = GPartLink::Gas(u32::try_from(i)?);
            gparts.push(g);
        }

        let snapshot = Snapshot {
            dim: [self.box_size; 3],
            time: 0.0,
            parts,
            gparts,
            sparts: Vec::new(),
        };
        helpers::write_snapshot(&self.output, &snapshot)?;
        println!(
            "wrote {} gas and {} gravity particles to '{}'",
            snapshot.parts.len(),
            snapshot.gparts.len(),
            self.output.display()
        );
        Ok(ExitCode::SUCCESS)
    }
}
