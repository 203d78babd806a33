//! Gravitational multipole expansions.
//!
//! Each cell carries one expansion truncated at order 2: total mass,
//! mass-weighted centre of mass and bulk velocity, and the raw second
//! moments about the centre of mass. `r_max` is a conservative radius
//! enclosing every contributing particle, used by the acceptance criterion.

use crate::part::GPart;
use serde::{Deserialize, Serialize};

/// A truncated gravitational potential expansion about a centre of mass.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct Multipole {
    /// Total mass (monopole).
    pub m: f64,
    /// Centre of mass.
    pub com: [f64; 3],
    /// Mass-weighted bulk velocity, used to drift the expansion.
    pub vel: [f64; 3],
    /// Raw second moments about `com`, upper triangle of the symmetric
    /// tensor in the order `xx, xy, xz, yy, yz, zz`.
    pub quad: [f64; 6],
    /// Conservative radius: no contributing particle lies further than this
    /// from `com`.
    pub r_max: f64,
}

impl Multipole {
    /// Resets the expansion to the empty state.
    pub fn init(&mut self) {
        *self = Self::default();
    }
}

/// Builds the expansion of `gparts` directly from the particles.
///
/// The centre of mass is the particle-weighted centroid; `r_max` is left to
/// the caller, which knows the cell geometry.
pub fn p2m(multipole: &mut Multipole, gparts: &[GPart]) {
    let mut m = 0.0;
    let mut com = [0.0; 3];
    let mut vel = [0.0; 3];
    for gp in gparts {
        m += gp.mass;
        for k in 0..3 {
            com[k] += gp.mass * gp.x[k];
            vel[k] += gp.mass * gp.v[k];
        }
    }
    assert!(m > 0.0, "P2M over a massless particle set");
    for k in 0..3 {
        com[k] /= m;
        vel[k] /= m;
    }

    let mut quad = [0.0; 6];
    for gp in gparts {
        let d = [gp.x[0] - com[0], gp.x[1] - com[1], gp.x[2] - com[2]];
        quad[0] += gp.mass * d[0] * d[0];
        quad[1] += gp.mass * d[0] * d[1];
        quad[2] += gp.mass * d[0] * d[2];
        quad[3] += gp.mass * d[1] * d[1];
        quad[4] += gp.mass * d[1] * d[2];
        quad[5] += gp.mass * d[2] * d[2];
    }

    multipole.m = m;
    multipole.com = com;
    multipole.vel = vel;
    multipole.quad = quad;
}

/// Shifts `src` from its own centre of mass to `dest_com` and returns the
/// shifted expansion. The parallel-axis terms keep the second moments exact.
#[must_use]
pub fn m2m(src: &Multipole, dest_com: [f64; 3]) -> Multipole {
    let d = [
        src.com[0] - dest_com[0],
        src.com[1] - dest_com[1],
        src.com[2] - dest_com[2],
    ];
    let mut shifted = src.clone();
    shifted.quad[0] += src.m * d[0] * d[0];
    shifted.quad[1] += src.m * d[0] * d[1];
    shifted.quad[2] += src.m * d[0] * d[2];
    shifted.quad[3] += src.m * d[1] * d[1];
    shifted.quad[4] += src.m * d[1] * d[2];
    shifted.quad[5] += src.m * d[2] * d[2];
    shifted.com = dest_com;
    shifted
}

/// Accumulates `src` into `dest`. Both must already be expanded about the
/// same centre.
pub fn multipole_add(dest: &mut Multipole, src: &Multipole) {
    let total = dest.m + src.m;
    if total > 0.0 {
        for k in 0..3 {
            dest.vel[k] = (dest.m * dest.vel[k] + src.m * src.vel[k]) / total;
        }
    }
    dest.m = total;
    for (d, s) in dest.quad.iter_mut().zip(&src.quad) {
        *d += s;
    }
}

/// The multipole acceptance criterion: a pair of expansions may interact
/// long-range iff `(r_max_i + r_max_j)^2 <= theta_crit^2 * r^2`.
#[must_use]
pub fn m2l_accept(r_max_i: f64, r_max_j: f64, theta_crit_sq: f64, r_sq: f64) -> bool {
    let s = r_max_i + r_max_j;
    s * s <= theta_crit_sq * r_sq
}

/// Advances the expansion by `dt` along its bulk velocity, inflating
/// `r_max` by the subtree's displacement envelope.
pub fn gravity_drift(multipole: &mut Multipole, dt: f64, dx_envelope: f64) {
    for k in 0..3 {
        multipole.com[k] += multipole.vel[k] * dt;
    }
    multipole.r_max += dx_envelope;
}
