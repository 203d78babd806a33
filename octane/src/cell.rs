//! The oct-tree node.
//!
//! A [`Cell`] owns disjoint, contiguous windows of the space-wide particle
//! arrays and up to eight progeny. Structural fields (geometry, windows,
//! progeny) are only touched between steps, under `&mut Space`. Everything
//! tasks race on during a step, from temporal stamps and motion envelopes
//! to sort masks and hold counters, is atomic, so the whole parallel phase
//! runs on shared references.

use crate::lock::CellLock;
use crate::multipole::Multipole;
use crate::shared::{AtomicF64, RaceCell};
use crate::sort::SortCache;
use crate::task::TaskId;
use crate::timeline::IntegerTime;
use crate::transport::Rank;
use bitflags::bitflags;
use std::sync::atomic::{AtomicI64, AtomicU16, AtomicU32, Ordering};

/// Index of a cell in the space-wide arena.
pub type CellId = u32;

/// Number of progeny slots of a split cell.
pub const NUM_PROGENY: usize = 8;

bitflags! {
    /// Per-step drift intent markers.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct CellFlags: u32 {
        /// Gas particles of this cell must be drifted.
        const DO_PART_DRIFT = 1;
        /// Some progeny holds `DO_PART_DRIFT`.
        const DO_SUB_PART_DRIFT = 1 << 1;
        /// Gravity particles of this cell must be drifted.
        const DO_GPART_DRIFT = 1 << 2;
        /// Some progeny holds `DO_GPART_DRIFT`.
        const DO_SUB_GPART_DRIFT = 1 << 3;
        /// Star particles of this cell must be drifted.
        const DO_SPART_DRIFT = 1 << 4;
        /// Some progeny holds `DO_SPART_DRIFT`.
        const DO_SUB_SPART_DRIFT = 1 << 5;
    }
}

/// A contiguous window into one of the particle arrays.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Window {
    /// Index of the first slot.
    pub first: usize,
    /// Number of slots.
    pub count: usize,
}

impl Window {
    /// The half-open index range of this window.
    #[must_use]
    pub const fn range(&self) -> std::ops::Range<usize> {
        self.first..self.first + self.count
    }

    /// Returns `true` if the window holds no particles.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// Direct task handles a cell may own, one slot per per-cell task.
#[derive(Debug, Default)]
pub struct CellTasks {
    /// Density-phase interaction tasks linked to this cell.
    pub density: Vec<TaskId>,
    /// Gradient-phase interaction tasks linked to this cell.
    pub gradient: Vec<TaskId>,
    /// Force-phase interaction tasks linked to this cell.
    pub force: Vec<TaskId>,
    /// Gravity interaction tasks linked to this cell.
    pub grav: Vec<TaskId>,
    /// Gas drift task at the hydro super-cell.
    pub drift_part: Option<TaskId>,
    /// Gravity drift task at the gravity super-cell.
    pub drift_gpart: Option<TaskId>,
    /// Directional sort task.
    pub sort: Option<TaskId>,
    /// Density-to-force conversion cluster.
    pub ghost: Option<TaskId>,
    /// First half-kick.
    pub kick1: Option<TaskId>,
    /// Second half-kick.
    pub kick2: Option<TaskId>,
    /// New time-bin assignment.
    pub timestep: Option<TaskId>,
    /// Acceleration finalisation.
    pub end_force: Option<TaskId>,
    /// Radiative cooling hook.
    pub cooling: Option<TaskId>,
    /// Source-term hook.
    pub sourceterms: Option<TaskId>,
    /// Gravity accumulator initialisation.
    pub init_grav: Option<TaskId>,
    /// Down-sweep applying accumulated field to particles.
    pub grav_down: Option<TaskId>,
    /// Long-range multipole interactions.
    pub grav_long_range: Option<TaskId>,
    /// Send endpoints, keyed by payload kind and destination rank.
    pub send: Vec<(crate::task::SendKind, Rank, TaskId)>,
    /// Receive endpoints, keyed by payload kind.
    pub recv: Vec<(crate::task::SendKind, TaskId)>,
}

impl CellTasks {
    /// Looks up the receive endpoint for `kind`, if any.
    #[must_use]
    pub fn recv_for(&self, kind: crate::task::SendKind) -> Option<TaskId> {
        self.recv.iter().find(|(k, _)| *k == kind).map(|&(_, t)| t)
    }

    /// Looks up the send endpoint of `kind` towards `rank`, if any.
    #[must_use]
    pub fn send_for(&self, kind: crate::task::SendKind, rank: Rank) -> Option<TaskId> {
        self.send
            .iter()
            .find(|(k, r, _)| *k == kind && *r == rank)
            .map(|&(_, _, t)| t)
    }
}

/// A node of the oct-tree.
#[derive(Debug)]
pub struct Cell {
    /// Origin corner.
    pub loc: [f64; 3],
    /// Side lengths.
    pub width: [f64; 3],
    /// Smallest side length, the scale the admission tests compare against.
    pub dmin: f64,
    /// Depth below the top level.
    pub depth: u8,
    /// Parent link, absent for top-level cells.
    pub parent: Option<CellId>,
    /// Progeny slots, in canonical octant order.
    pub progeny: [Option<CellId>; NUM_PROGENY],
    /// `true` iff any progeny slot is present.
    pub split: bool,

    /// Gas particle window.
    pub parts: Window,
    /// Gravity particle window.
    pub gparts: Window,
    /// Star particle window.
    pub sparts: Window,

    /// Integer time the gas particles were last drifted to.
    pub ti_old_part: AtomicI64,
    /// Integer time the gravity particles were last drifted to.
    pub ti_old_gpart: AtomicI64,
    /// Integer time the multipole was last drifted to.
    pub ti_old_multipole: AtomicI64,
    /// Earliest step end among the gas particles of the subtree.
    pub ti_hydro_end_min: AtomicI64,
    /// Latest step end among the gas particles of the subtree.
    pub ti_hydro_end_max: AtomicI64,
    /// Earliest step end among the gravity particles of the subtree.
    pub ti_grav_end_min: AtomicI64,
    /// Latest step end among the gravity particles of the subtree.
    pub ti_grav_end_max: AtomicI64,

    /// Largest smoothing length in the subtree.
    pub h_max: AtomicF64,
    /// Largest gas displacement since the last rebuild.
    pub dx_max_part: AtomicF64,
    /// Largest gravity-particle displacement since the last rebuild.
    pub dx_max_gpart: AtomicF64,
    /// Largest gas displacement since the last sort.
    pub dx_max_sort: AtomicF64,
    /// `dx_max_sort` snapshot taken when a pair records its sort demand.
    pub dx_max_sort_old: AtomicF64,

    /// Gas write lock.
    pub part_lock: CellLock,
    /// Gravity write lock.
    pub gpart_lock: CellLock,
    /// Star write lock.
    pub spart_lock: CellLock,
    /// Multipole lock.
    pub mlock: CellLock,

    /// Directions with currently valid sort arrays.
    pub sorted: AtomicU16,
    /// Directions some pair interaction requires this step.
    pub requires_sorts: AtomicU16,
    /// Directions with a pending sort this step.
    pub do_sort: AtomicU16,
    /// The directional sort arrays, written only by this cell's sort task.
    pub sort_cache: RaceCell<SortCache>,

    /// Drift intent markers.
    pub flags: AtomicU32,

    /// Task handles, populated at rebuild.
    pub tasks: CellTasks,
    /// Shallowest self-or-ancestor owning hydro tasks.
    pub super_hydro: Option<CellId>,
    /// Shallowest self-or-ancestor owning gravity tasks.
    pub super_grav: Option<CellId>,
    /// Shallowest self-or-ancestor owning the shared per-cell tasks.
    pub super_all: Option<CellId>,

    /// Per-step message tag.
    pub tag: i32,
    /// Owning rank.
    pub nodeid: Rank,
    /// The cell's multipole, written under `mlock`.
    pub multipole: RaceCell<Multipole>,
}

impl Cell {
    /// A fresh, unsplit cell covering `loc .. loc + width` at `depth`.
    #[must_use]
    pub fn new(loc: [f64; 3], width: [f64; 3], depth: u8, parent: Option<CellId>) -> Self {
        let dmin = width[0].min(width[1]).min(width[2]);
        Self {
            loc,
            width,
            dmin,
            depth,
            parent,
            progeny: [None; NUM_PROGENY],
            split: false,
            parts: Window::default(),
            gparts: Window::default(),
            sparts: Window::default(),
            ti_old_part: AtomicI64::new(0),
            ti_old_gpart: AtomicI64::new(0),
            ti_old_multipole: AtomicI64::new(0),
            ti_hydro_end_min: AtomicI64::new(IntegerTime::MAX),
            ti_hydro_end_max: AtomicI64::new(0),
            ti_grav_end_min: AtomicI64::new(IntegerTime::MAX),
            ti_grav_end_max: AtomicI64::new(0),
            h_max: AtomicF64::new(0.0),
            dx_max_part: AtomicF64::new(0.0),
            dx_max_gpart: AtomicF64::new(0.0),
            dx_max_sort: AtomicF64::new(0.0),
            dx_max_sort_old: AtomicF64::new(0.0),
            part_lock: CellLock::new(),
            gpart_lock: CellLock::new(),
            spart_lock: CellLock::new(),
            mlock: CellLock::new(),
            sorted: AtomicU16::new(0),
            requires_sorts: AtomicU16::new(0),
            do_sort: AtomicU16::new(0),
            sort_cache: RaceCell::new(SortCache::default()),
            flags: AtomicU32::new(0),
            tasks: CellTasks::default(),
            super_hydro: None,
            super_grav: None,
            super_all: None,
            tag: -1,
            nodeid: 0,
            multipole: RaceCell::new(Multipole::default()),
        }
    }

    /// Geometric centre, the pivot used by `subdivide`.
    #[must_use]
    pub fn center(&self) -> [f64; 3] {
        [
            self.loc[0] + 0.5 * self.width[0],
            self.loc[1] + 0.5 * self.width[1],
            self.loc[2] + 0.5 * self.width[2],
        ]
    }

    /// The octant of `x` relative to this cell's centre: bit 2 for x, bit 1
    /// for y, bit 0 for z, set iff the coordinate is `>=` the pivot.
    #[must_use]
    pub fn octant(&self, x: &[f64; 3]) -> usize {
        let pivot = self.center();
        usize::from(x[0] >= pivot[0]) << 2
            | usize::from(x[1] >= pivot[1]) << 1
            | usize::from(x[2] >= pivot[2])
    }

    /// Origin corner of octant `k`, derived from the pivot.
    #[must_use]
    pub fn progeny_loc(&self, k: usize) -> [f64; 3] {
        let mut loc = self.loc;
        if k & 4 != 0 {
            loc[0] += 0.5 * self.width[0];
        }
        if k & 2 != 0 {
            loc[1] += 0.5 * self.width[1];
        }
        if k & 1 != 0 {
            loc[2] += 0.5 * self.width[2];
        }
        loc
    }

    /// Half side lengths of any progeny.
    #[must_use]
    pub fn progeny_width(&self) -> [f64; 3] {
        [
            0.5 * self.width[0],
            0.5 * self.width[1],
            0.5 * self.width[2],
        ]
    }

    /// Returns `true` if any gas particle of this cell ends its step at
    /// `ti_current`.
    #[must_use]
    pub fn is_active_hydro(&self, ti_current: IntegerTime) -> bool {
        self.ti_hydro_end_min.load(Ordering::Relaxed) == ti_current
    }

    /// Returns `true` if any gravity particle of this cell ends its step at
    /// `ti_current`.
    #[must_use]
    pub fn is_active_grav(&self, ti_current: IntegerTime) -> bool {
        self.ti_grav_end_min.load(Ordering::Relaxed) == ti_current
    }

    /// Atomically ORs `flag` in and reports whether it was already set.
    pub fn test_and_set_flag(&self, flag: CellFlags) -> bool {
        let old = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        old & flag.bits() != 0
    }

    /// Returns `true` if `flag` is currently set.
    #[must_use]
    pub fn has_flag(&self, flag: CellFlags) -> bool {
        self.flags.load(Ordering::Acquire) & flag.bits() != 0
    }

    /// Clears `flags`.
    pub fn clear_flags(&self, flags: CellFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// The lock guarding writes of `kind` on this cell.
    #[must_use]
    pub fn lock_of(&self, kind: crate::lock::LockKind) -> &CellLock {
        match kind {
            crate::lock::LockKind::Part => &self.part_lock,
            crate::lock::LockKind::GPart => &self.gpart_lock,
            crate::lock::LockKind::SPart => &self.spart_lock,
            crate::lock::LockKind::Multipole => &self.mlock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn octant_classifier() {
        let c = Cell::new([0.0; 3], [2.0; 3], 0, None);
        assert_eq!(c.octant(&[0.5, 0.5, 0.5]), 0);
        assert_eq!(c.octant(&[1.5, 0.5, 0.5]), 4);
        assert_eq!(c.octant(&[0.5, 1.5, 0.5]), 2);
        assert_eq!(c.octant(&[0.5, 0.5, 1.5]), 1);
        assert_eq!(c.octant(&[1.5, 1.5, 1.5]), 7);
        // ties go up: >= classifier
        assert_eq!(c.octant(&[1.0, 1.0, 1.0]), 7);
    }

    #[test]
    fn progeny_geometry() {
        let c = Cell::new([0.0; 3], [2.0; 3], 0, None);
        assert_eq!(c.progeny_loc(0), [0.0, 0.0, 0.0]);
        assert_eq!(c.progeny_loc(5), [1.0, 0.0, 1.0]);
        assert_eq!(c.progeny_loc(7), [1.0, 1.0, 1.0]);
        assert_eq!(c.progeny_width(), [1.0, 1.0, 1.0]);
    }

    #[test]
    fn flag_short_circuit() {
        let c = Cell::new([0.0; 3], [1.0; 3], 0, None);
        assert!(!c.test_and_set_flag(CellFlags::DO_PART_DRIFT));
        assert!(c.test_and_set_flag(CellFlags::DO_PART_DRIFT));
        c.clear_flags(CellFlags::DO_PART_DRIFT);
        assert!(!c.has_flag(CellFlags::DO_PART_DRIFT));
    }
}
