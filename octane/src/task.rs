//! Task stubs and the dependency graph they hang on.
//!
//! Tasks are constructed once per rebuild and reused every step. A task
//! starts each step skipped; the activator clears the skip flag of exactly
//! the stubs that must run and the scheduler executes the active subgraph
//! in dependency order.

use crate::cell::CellId;
use crate::part::ParticleKind;
use crate::transport::Rank;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

/// Index of a task in the scheduler's arena.
pub type TaskId = u32;

/// Payload flavour of a send/recv endpoint pair.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SendKind {
    /// Positions and velocities, needed before the density loop.
    Xv,
    /// Densities, needed before the force loop.
    Rho,
    /// Gradient data, only when the extra loop is configured.
    Gradient,
    /// Per-cell end-time vectors.
    Ti,
    /// Gravity particle payloads.
    Grav,
}

/// What a task does.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskKind {
    /// All-pairs interaction within one cell.
    SelfInteraction,
    /// Interaction between two neighbouring cells.
    PairInteraction,
    /// Self interaction delegated to the subcell recursion.
    SubSelf,
    /// Pair interaction delegated to the subcell recursion.
    SubPair,
    /// Drift of one particle kind at a super-cell.
    Drift(ParticleKind),
    /// Directional sort rebuild.
    Sort,
    /// First half-kick.
    Kick1,
    /// Second half-kick.
    Kick2,
    /// Density-loop closure (neighbour-count correction, h update).
    Ghost,
    /// New time-bin assignment and end-time fold.
    Timestep,
    /// Acceleration finalisation.
    EndForce,
    /// Gravity accumulator initialisation.
    InitGrav,
    /// Gravity intermediate closure.
    GravGhost,
    /// Down-sweep applying the accumulated field.
    GravDown,
    /// Long-range multipole interactions of one cell against the others.
    GravLongRange,
    /// Cross-rank send endpoint.
    Send(SendKind),
    /// Cross-rank receive endpoint.
    Recv(SendKind),
    /// Radiative cooling hook.
    Cooling,
    /// Source-term hook.
    SourceTerms,
}

/// Which interaction family a task belongs to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskSubtype {
    /// Not an interaction task.
    None,
    /// SPH density phase.
    Density,
    /// SPH gradient phase.
    Gradient,
    /// SPH force phase.
    Force,
    /// Gravity.
    Grav,
}

/// A schedulable unit of work.
#[derive(Debug)]
pub struct Task {
    /// What to do.
    pub kind: TaskKind,
    /// Interaction family.
    pub subtype: TaskSubtype,
    /// First cell.
    pub ci: Option<CellId>,
    /// Second cell, for pair flavours.
    pub cj: Option<CellId>,
    /// Sort direction for pair and sort tasks.
    pub flags: u32,
    /// Peer rank for send/recv endpoints.
    pub rank: Rank,
    /// Tasks that may only run after this one.
    pub unlocks: Vec<TaskId>,
    skip: AtomicBool,
    wait: AtomicI32,
}

impl Task {
    /// A new task, initially skipped.
    #[must_use]
    pub fn new(kind: TaskKind, subtype: TaskSubtype, ci: Option<CellId>, cj: Option<CellId>) -> Self {
        Self {
            kind,
            subtype,
            ci,
            cj,
            flags: 0,
            rank: 0,
            unlocks: Vec::new(),
            skip: AtomicBool::new(true),
            wait: AtomicI32::new(0),
        }
    }

    /// Clears the skip flag; returns `true` if the task was skipped before.
    pub fn activate(&self) -> bool {
        self.skip.swap(false, Ordering::AcqRel)
    }

    /// Returns `true` if the task is skipped this step.
    #[must_use]
    pub fn skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    /// Re-arms the skip flag for the next step.
    pub fn reset(&self) {
        self.skip.store(true, Ordering::Release);
        self.wait.store(0, Ordering::Release);
    }

    /// Adds one inbound dependency.
    pub fn inc_wait(&self) {
        self.wait.fetch_add(1, Ordering::AcqRel);
    }

    /// Retires one inbound dependency; returns `true` when the task became
    /// ready.
    pub fn dec_wait(&self) -> bool {
        let prev = self.wait.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "task wait counter underflow");
        prev == 1
    }

    /// Current inbound-dependency count.
    #[must_use]
    pub fn wait_count(&self) -> i32 {
        self.wait.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn activation_is_idempotent() {
        let t = Task::new(TaskKind::Sort, TaskSubtype::None, Some(0), None);
        assert!(t.skipped());
        assert!(t.activate());
        assert!(!t.activate());
        assert!(!t.skipped());
        t.reset();
        assert!(t.skipped());
    }

    #[test]
    fn wait_counts_down_to_ready() {
        let t = Task::new(TaskKind::Ghost, TaskSubtype::None, Some(0), None);
        t.inc_wait();
        t.inc_wait();
        assert!(!t.dec_wait());
        assert!(t.dec_wait());
    }

    #[test]
    #[should_panic(expected = "task wait counter underflow")]
    fn wait_underflow_aborts() {
        let t = Task::new(TaskKind::Ghost, TaskSubtype::None, Some(0), None);
        t.dec_wait();
    }
}
