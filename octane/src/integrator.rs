//! The time-integration collaborator.
//!
//! The drift engine and the kick tasks consume particles only through this
//! trait; the flavour is chosen once at startup and monomorphised through
//! the enum, keeping the hot drift loops free of indirect calls.

use crate::part::{GPart, Part, SPart, XPart};
use enum_dispatch::enum_dispatch;

/// Integration primitives the core consumes.
#[enum_dispatch]
pub trait Integrator {
    /// Advances a gas particle by `dt`, accumulating its displacement
    /// envelopes in the extended state.
    fn drift_part(&self, p: &mut Part, xp: &mut XPart, dt: f64);

    /// Advances a gravity particle by `dt`.
    fn drift_gpart(&self, g: &mut GPart, dt: f64);

    /// Advances a star particle by `dt`.
    fn drift_spart(&self, s: &mut SPart, dt: f64);

    /// Applies half a kick to a gas particle.
    fn kick_part(&self, p: &mut Part, xp: &mut XPart, dt: f64);

    /// Applies half a kick to a gravity particle.
    fn kick_gpart(&self, g: &mut GPart, dt: f64);
}

/// Closed set of integrator flavours.
#[enum_dispatch(Integrator)]
#[derive(Clone, Copy, Debug)]
pub enum IntegratorEnum {
    /// Second-order kick-drift-kick leapfrog.
    Leapfrog,
}

/// Second-order kick-drift-kick leapfrog.
#[derive(Clone, Copy, Debug, Default)]
pub struct Leapfrog;

impl Integrator for Leapfrog {
    fn drift_part(&self, p: &mut Part, xp: &mut XPart, dt: f64) {
        for k in 0..3 {
            let dx = p.v[k] * dt;
            p.x[k] += dx;
            xp.x_diff[k] += dx;
            xp.x_diff_sort[k] += dx;
        }
    }

    fn drift_gpart(&self, g: &mut GPart, dt: f64) {
        for k in 0..3 {
            g.x[k] += g.v[k] * dt;
        }
    }

    fn drift_spart(&self, s: &mut SPart, dt: f64) {
        for k in 0..3 {
            s.x[k] += s.v[k] * dt;
        }
    }

    fn kick_part(&self, p: &mut Part, xp: &mut XPart, dt: f64) {
        for k in 0..3 {
            p.v[k] += p.a_hydro[k] * dt;
            xp.v_full[k] = p.v[k];
        }
    }

    fn kick_gpart(&self, g: &mut GPart, dt: f64) {
        for k in 0..3 {
            g.v[k] += g.a_grav[k] * dt;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drift_accumulates_displacement() {
        let mut p = Part::at([1.0, 2.0, 3.0], 0.1, 1.0);
        p.v = [1.0, 0.0, -2.0];
        let mut xp = XPart::default();
        let integ = Leapfrog;
        integ.drift_part(&mut p, &mut xp, 0.5);
        integ.drift_part(&mut p, &mut xp, 0.5);
        assert_eq!(p.x, [2.0, 2.0, 1.0]);
        assert_eq!(xp.x_diff, [1.0, 0.0, -2.0]);
        assert_eq!(xp.x_diff_sort, [1.0, 0.0, -2.0]);
    }

    #[test]
    fn kick_changes_velocity_only() {
        let mut p = Part::at([0.0; 3], 0.1, 1.0);
        p.a_hydro = [2.0, 0.0, 0.0];
        let mut xp = XPart::default();
        Leapfrog.kick_part(&mut p, &mut xp, 0.25);
        assert_eq!(p.v, [0.5, 0.0, 0.0]);
        assert_eq!(p.x, [0.0; 3]);
        assert_eq!(xp.v_full, [0.5, 0.0, 0.0]);
    }
}
