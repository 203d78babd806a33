//! The integer time axis and the time-bin arithmetic built on top of it.
//!
//! The whole run is mapped onto `[0, 2^[MAX_NR_TIMESTEPS_EXP]]` integer
//! ticks. A particle in time-bin `b` integrates with a step of `2^b` ticks,
//! so a particle's step always ends on a multiple of its bin interval and
//! nested bins stay aligned.

use serde::{Deserialize, Serialize};

/// A point on the integer time axis.
pub type IntegerTime = i64;

/// Exponent of the number of integer ticks that make up the whole run.
pub const MAX_NR_TIMESTEPS_EXP: u32 = 56;

/// Largest representable integer time.
pub const MAX_NR_TIMESTEPS: IntegerTime = 1 << MAX_NR_TIMESTEPS_EXP;

/// Smallest usable time-bin.
pub const MIN_TIME_BIN: TimeBin = TimeBin(1);

/// Largest usable time-bin.
pub const MAX_TIME_BIN: TimeBin = TimeBin(MAX_NR_TIMESTEPS_EXP as i8 - 2);

/// Sentinel bin for particles that have not been assigned a step yet.
pub const TIME_BIN_NOT_AWAKE: TimeBin = TimeBin(-1);

/// A `log2` index selecting a particle's step length in integer ticks.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Ord, PartialEq, PartialOrd, Serialize)]
pub struct TimeBin(pub i8);

impl TimeBin {
    /// Returns the step length of this bin in integer ticks.
    #[must_use]
    pub const fn interval(self) -> IntegerTime {
        1 << self.0
    }

    /// Returns `true` if this bin denotes a particle with an assigned step.
    #[must_use]
    pub const fn is_awake(self) -> bool {
        self.0 > 0
    }
}

/// Returns the end of the step of a particle in bin `bin`, given the current
/// integer time. The end is the next multiple of the bin interval strictly
/// after `ti_current` unless `ti_current` already sits on one.
#[must_use]
pub const fn get_integer_time_end(ti_current: IntegerTime, bin: TimeBin) -> IntegerTime {
    let dti = bin.interval();
    let rem = ti_current % dti;
    if rem > 0 {
        ti_current - rem + dti
    } else {
        ti_current
    }
}

/// Returns the start of the step that ends at `ti_end` for bin `bin`.
#[must_use]
pub const fn get_integer_time_begin(ti_end: IntegerTime, bin: TimeBin) -> IntegerTime {
    let dti = bin.interval();
    if ti_end % dti == 0 && ti_end > 0 {
        ti_end - dti
    } else {
        ti_end - ti_end % dti
    }
}

/// Returns the largest bin whose interval does not exceed `dti` ticks.
#[must_use]
pub fn get_time_bin(dti: IntegerTime) -> TimeBin {
    debug_assert!(dti > 0, "non-positive integer timestep dti={dti}");
    TimeBin((63 - dti.leading_zeros() as i64) as i8)
}

/// Returns `true` if a particle in bin `bin` ends a step at `ti_current`,
/// i.e. is active and must be updated this step.
#[must_use]
pub const fn is_active_bin(bin: TimeBin, ti_current: IntegerTime) -> bool {
    bin.is_awake() && ti_current % bin.interval() == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn intervals_double() {
        assert_eq!(TimeBin(1).interval(), 2);
        assert_eq!(TimeBin(2).interval(), 4);
        assert_eq!(TimeBin(10).interval(), 1024);
    }

    #[test]
    fn time_end() {
        assert_eq!(get_integer_time_end(0, TimeBin(3)), 0);
        assert_eq!(get_integer_time_end(1, TimeBin(3)), 8);
        assert_eq!(get_integer_time_end(8, TimeBin(3)), 8);
        assert_eq!(get_integer_time_end(9, TimeBin(3)), 16);
    }

    #[test]
    fn time_begin() {
        assert_eq!(get_integer_time_begin(8, TimeBin(3)), 0);
        assert_eq!(get_integer_time_begin(16, TimeBin(2)), 12);
        assert_eq!(get_integer_time_begin(9, TimeBin(3)), 8);
    }

    #[test]
    fn bin_from_dti() {
        assert_eq!(get_time_bin(2), TimeBin(1));
        assert_eq!(get_time_bin(3), TimeBin(1));
        assert_eq!(get_time_bin(4), TimeBin(2));
        assert_eq!(get_time_bin(1023), TimeBin(9));
        assert_eq!(get_time_bin(1024), TimeBin(10));
    }

    #[test]
    fn activity() {
        assert!(is_active_bin(TimeBin(2), 8));
        assert!(!is_active_bin(TimeBin(2), 9));
        assert!(!is_active_bin(TIME_BIN_NOT_AWAKE, 8));
    }

    #[test]
    fn end_is_aligned() {
        for bin in 1..12_i8 {
            let bin = TimeBin(bin);
            for ti in [0, 1, 5, 100, 4095, 4096] {
                let end = get_integer_time_end(ti, bin);
                assert!(end >= ti);
                assert_eq!(end % bin.interval(), 0);
            }
        }
    }
}
