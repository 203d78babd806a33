//! Particle records.
//!
//! Three parallel arrays with stable indices within a step: gas particles
//! ([`Part`]), gravity particles ([`GPart`]) and star particles ([`SPart`]).
//! Every gas and star particle is back-linked to exactly one gravity
//! particle; the link is re-derived after any in-place permutation. The
//! extended state [`XPart`] is index-parallel to the gas array and carries
//! the fields that must survive a drift.

use crate::timeline::{IntegerTime, TimeBin, TIME_BIN_NOT_AWAKE};
use serde::{Deserialize, Serialize};

/// Index sentinel for an unset back-link.
pub const NO_LINK: u32 = u32::MAX;

/// A gas (SPH) particle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Part {
    /// Comoving position.
    pub x: [f64; 3],
    /// Peculiar velocity.
    pub v: [f64; 3],
    /// Mass.
    pub mass: f64,
    /// Smoothing length.
    pub h: f64,
    /// Comoving internal energy per unit mass.
    pub u: f64,
    /// Density estimate from the last density loop.
    pub rho: f64,
    /// Neighbour-count accumulator for the density loop.
    pub wcount: f64,
    /// Velocity divergence from the gradient loop, when configured.
    pub div_v: f64,
    /// Acceleration accumulated by the force loop.
    pub a_hydro: [f64; 3],
    /// Index of the associated gravity particle.
    pub gpart: u32,
    /// Integer time this particle was last drifted to.
    pub ti_drift: IntegerTime,
    /// End of this particle's current step.
    pub ti_end: IntegerTime,
    /// Step-size selector.
    pub time_bin: TimeBin,
}

impl Part {
    /// A particle at rest at `x` with smoothing length `h` and mass `mass`.
    #[must_use]
    pub fn at(x: [f64; 3], h: f64, mass: f64) -> Self {
        Self {
            x,
            v: [0.0; 3],
            mass,
            h,
            u: 0.0,
            rho: 0.0,
            wcount: 0.0,
            div_v: 0.0,
            a_hydro: [0.0; 3],
            gpart: NO_LINK,
            ti_drift: 0,
            ti_end: 0,
            time_bin: TIME_BIN_NOT_AWAKE,
        }
    }
}

/// Extended gas state, index-parallel to the gas array.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct XPart {
    /// Cumulative displacement since the last rebuild.
    pub x_diff: [f64; 3],
    /// Cumulative displacement since the last sort.
    pub x_diff_sort: [f64; 3],
    /// Full-step velocity at the last kick.
    pub v_full: [f64; 3],
}

/// What a gravity particle stands in for.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum GPartLink {
    /// A gravity-only (dark matter) particle.
    Dark,
    /// Linked to the gas particle at the carried index.
    Gas(u32),
    /// Linked to the star particle at the carried index.
    Star(u32),
}

/// A gravity particle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct GPart {
    /// Comoving position.
    pub x: [f64; 3],
    /// Peculiar velocity.
    pub v: [f64; 3],
    /// Mass.
    pub mass: f64,
    /// Gravitational acceleration accumulated this step.
    pub a_grav: [f64; 3],
    /// Back-link to the particle this one mirrors.
    pub link: GPartLink,
    /// Integer time this particle was last drifted to.
    pub ti_drift: IntegerTime,
    /// End of this particle's current step.
    pub ti_end: IntegerTime,
    /// Step-size selector.
    pub time_bin: TimeBin,
}

impl GPart {
    /// A dark-matter particle at rest at `x`.
    #[must_use]
    pub fn dark(x: [f64; 3], mass: f64) -> Self {
        Self {
            x,
            v: [0.0; 3],
            mass,
            a_grav: [0.0; 3],
            link: GPartLink::Dark,
            ti_drift: 0,
            ti_end: 0,
            time_bin: TIME_BIN_NOT_AWAKE,
        }
    }
}

/// A star particle.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SPart {
    /// Comoving position.
    pub x: [f64; 3],
    /// Peculiar velocity.
    pub v: [f64; 3],
    /// Mass.
    pub mass: f64,
    /// Index of the associated gravity particle.
    pub gpart: u32,
    /// Integer time this particle was last drifted to.
    pub ti_drift: IntegerTime,
    /// Step-size selector.
    pub time_bin: TimeBin,
}

impl SPart {
    /// A star at rest at `x`.
    #[must_use]
    pub fn at(x: [f64; 3], mass: f64) -> Self {
        Self {
            x,
            v: [0.0; 3],
            mass,
            gpart: NO_LINK,
            ti_drift: 0,
            time_bin: TIME_BIN_NOT_AWAKE,
        }
    }
}

/// The particle kinds a cell tracks independently.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ParticleKind {
    /// Gas particles.
    Gas,
    /// Gravity particles.
    Gravity,
    /// Star particles.
    Stars,
}
