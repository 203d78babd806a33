//! The step reducer.
//!
//! Each rank summarises its step (next end-time envelopes per kind,
//! update counts, rebuild flag) and every rank applies the combined
//! result, so all ranks agree on the next step and on whether to rebuild.

use crate::timeline::IntegerTime;
use serde::{Deserialize, Serialize};

/// One rank's per-step outcome.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct StepSummary {
    /// Earliest next end-time among the rank's gas particles.
    pub ti_hydro_end_min: IntegerTime,
    /// Earliest next end-time among the rank's gravity particles.
    pub ti_grav_end_min: IntegerTime,
    /// Gas particles updated this step.
    pub updated: u64,
    /// Gravity particles updated this step.
    pub g_updated: u64,
    /// Star particles updated this step.
    pub s_updated: u64,
    /// Whether this rank wants a rebuild before the next step.
    pub rebuild: bool,
}

impl Default for StepSummary {
    fn default() -> Self {
        Self {
            ti_hydro_end_min: IntegerTime::MAX,
            ti_grav_end_min: IntegerTime::MAX,
            updated: 0,
            g_updated: 0,
            s_updated: 0,
            rebuild: false,
        }
    }
}

impl StepSummary {
    /// Folds `other` into `self`: counts add, end-times take the minimum,
    /// the rebuild flags OR.
    pub fn combine(&mut self, other: &Self) {
        self.ti_hydro_end_min = self.ti_hydro_end_min.min(other.ti_hydro_end_min);
        self.ti_grav_end_min = self.ti_grav_end_min.min(other.ti_grav_end_min);
        self.updated += other.updated;
        self.g_updated += other.g_updated;
        self.s_updated += other.s_updated;
        self.rebuild |= other.rebuild;
    }

    /// The next global end-time: the earlier of the two envelopes.
    #[must_use]
    pub fn ti_end_min(&self) -> IntegerTime {
        self.ti_hydro_end_min.min(self.ti_grav_end_min)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn combine_takes_min_sum_or() {
        let mut a = StepSummary {
            ti_hydro_end_min: 64,
            ti_grav_end_min: 128,
            updated: 10,
            g_updated: 20,
            s_updated: 1,
            rebuild: false,
        };
        let b = StepSummary {
            ti_hydro_end_min: 96,
            ti_grav_end_min: 32,
            updated: 5,
            g_updated: 7,
            s_updated: 0,
            rebuild: true,
        };
        a.combine(&b);
        assert_eq!(a.ti_hydro_end_min, 64);
        assert_eq!(a.ti_grav_end_min, 32);
        assert_eq!(a.updated, 15);
        assert_eq!(a.g_updated, 27);
        assert_eq!(a.s_updated, 1);
        assert!(a.rebuild);
        assert_eq!(a.ti_end_min(), 32);
    }

    #[test]
    fn combine_is_commutative() {
        let a = StepSummary {
            ti_hydro_end_min: 10,
            ti_grav_end_min: 40,
            updated: 3,
            g_updated: 4,
            s_updated: 5,
            rebuild: true,
        };
        let b = StepSummary {
            ti_hydro_end_min: 20,
            ti_grav_end_min: 30,
            updated: 6,
            g_updated: 7,
            s_updated: 8,
            rebuild: false,
        };
        let mut ab = a;
        ab.combine(&b);
        let mut ba = b;
        ba.combine(&a);
        assert_eq!(ab, ba);
    }

    #[test]
    fn identity_element() {
        let a = StepSummary {
            ti_hydro_end_min: 10,
            ti_grav_end_min: 40,
            updated: 3,
            g_updated: 4,
            s_updated: 5,
            rebuild: true,
        };
        let mut out = StepSummary::default();
        out.combine(&a);
        assert_eq!(out, a);
    }
}
