//! The SPH collaborator.
//!
//! The core touches gas thermodynamics only through this trait: resetting
//! the density accumulators when a particle becomes active, folding a
//! neighbour's kernel contribution in, and converting the raw sums after
//! the density loop. The default flavour is a minimal cubic-spline scheme.

use crate::part::Part;
use enum_dispatch::enum_dispatch;

/// Ratio between the kernel support radius and the smoothing length for
/// the cubic spline.
pub const KERNEL_GAMMA: f64 = 1.825742;

/// Adiabatic index of the gas.
pub const GAMMA: f64 = 5.0 / 3.0;

/// Cubic-spline kernel value at separation `r` for smoothing length `h`,
/// normalised in 3D.
#[must_use]
pub fn kernel_w(r: f64, h: f64) -> f64 {
    let hd = h * KERNEL_GAMMA;
    let q = r / hd;
    let sigma = 8.0 / (std::f64::consts::PI * hd * hd * hd);
    if q < 0.5 {
        sigma * (6.0 * q * q * (q - 1.0) + 1.0)
    } else if q < 1.0 {
        let d = 1.0 - q;
        sigma * 2.0 * d * d * d
    } else {
        0.0
    }
}

/// Radial derivative of the cubic-spline kernel at separation `r` for
/// smoothing length `h`.
#[must_use]
pub fn kernel_dw_dr(r: f64, h: f64) -> f64 {
    let hd = h * KERNEL_GAMMA;
    let q = r / hd;
    let sigma = 8.0 / (std::f64::consts::PI * hd * hd * hd);
    if q < 0.5 {
        sigma * (18.0 * q * q - 12.0 * q) / hd
    } else if q < 1.0 {
        let d = 1.0 - q;
        sigma * (-6.0 * d * d) / hd
    } else {
        0.0
    }
}

/// SPH primitives the core consumes.
#[enum_dispatch]
pub trait Hydro {
    /// Resets the density accumulators of a particle that became active.
    fn init_density_accumulator(&self, p: &mut Part);

    /// Folds neighbour `j`'s contribution at squared separation `r2` into
    /// particle `i`'s accumulators.
    fn accumulate_density(&self, pi: &mut Part, r2: f64, mj: f64);

    /// Converts the raw density sums after the loop (self-contribution and
    /// normalisation).
    fn convert_after_density(&self, p: &mut Part);

    /// Folds neighbour `j`'s contribution to the velocity divergence of
    /// particle `i`, for the extra gradient loop. `dv_dot_dx` is the dot
    /// product of the velocity and position differences.
    fn accumulate_gradient(&self, pi: &mut Part, r: f64, dv_dot_dx: f64, mj: f64);

    /// Sound speed, used by the time-step criterion.
    fn sound_speed(&self, p: &Part) -> f64;
}

/// Closed set of SPH flavours.
#[enum_dispatch(Hydro)]
#[derive(Clone, Copy, Debug)]
pub enum HydroEnum {
    /// Density-entropy scheme with a cubic-spline kernel.
    MinimalSph,
}

/// Density-entropy scheme with a cubic-spline kernel.
#[derive(Clone, Copy, Debug, Default)]
pub struct MinimalSph;

impl Hydro for MinimalSph {
    fn init_density_accumulator(&self, p: &mut Part) {
        p.rho = 0.0;
        p.wcount = 0.0;
        p.div_v = 0.0;
        p.a_hydro = [0.0; 3];
    }

    fn accumulate_density(&self, pi: &mut Part, r2: f64, mj: f64) {
        let w = kernel_w(r2.sqrt(), pi.h);
        pi.rho += mj * w;
        pi.wcount += w;
    }

    fn convert_after_density(&self, p: &mut Part) {
        // self contribution
        let w0 = kernel_w(0.0, p.h);
        p.rho += p.mass * w0;
        p.wcount += w0;
    }

    fn accumulate_gradient(&self, pi: &mut Part, r: f64, dv_dot_dx: f64, mj: f64) {
        if pi.rho > 0.0 && r > 0.0 {
            pi.div_v -= mj * dv_dot_dx * kernel_dw_dr(r, pi.h) / (r * pi.rho);
        }
    }

    fn sound_speed(&self, p: &Part) -> f64 {
        (GAMMA * (GAMMA - 1.0) * p.u).max(0.0).sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use float_cmp::assert_approx_eq;

    #[test]
    fn kernel_has_compact_support() {
        assert!(kernel_w(0.0, 0.5) > 0.0);
        assert_eq!(kernel_w(0.5 * KERNEL_GAMMA, 0.5), 0.0);
        assert_eq!(kernel_w(10.0, 0.5), 0.0);
    }

    #[test]
    fn kernel_is_monotone_from_centre() {
        let h = 0.3;
        let mut last = kernel_w(0.0, h);
        for step in 1..=20 {
            let r = f64::from(step) / 20.0 * h * KERNEL_GAMMA;
            let w = kernel_w(r, h);
            assert!(w <= last);
            last = w;
        }
    }

    #[test]
    fn kernel_integrates_to_one() {
        // radial quadrature of 4 pi r^2 W(r)
        let h = 0.7;
        let support = h * KERNEL_GAMMA;
        let n = 20_000;
        let dr = support / f64::from(n);
        let mut sum = 0.0;
        for i in 0..n {
            let r = (f64::from(i) + 0.5) * dr;
            sum += 4.0 * std::f64::consts::PI * r * r * kernel_w(r, h) * dr;
        }
        assert_approx_eq!(f64, sum, 1.0, epsilon = 1e-3);
    }

    #[test]
    fn gradient_sign_tracks_expansion() {
        let hydro = MinimalSph;
        let mut p = Part::at([0.0; 3], 0.5, 1.0);
        p.rho = 1.0;
        p.v = [1.0, 0.0, 0.0];
        // the neighbour sits behind and moves slower: the flow expands
        hydro.accumulate_gradient(&mut p, 0.3, 0.3, 1.0);
        assert!(p.div_v > 0.0);
    }

    #[test]
    fn density_accumulation() {
        let hydro = MinimalSph;
        let mut p = Part::at([0.0; 3], 0.5, 2.0);
        hydro.init_density_accumulator(&mut p);
        hydro.accumulate_density(&mut p, 0.01, 3.0);
        assert!(p.rho > 0.0);
        let rho_pair = p.rho;
        hydro.convert_after_density(&mut p);
        assert!(p.rho > rho_pair);
    }
}
