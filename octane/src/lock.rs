//! The subtree lock protocol.
//!
//! Each cell carries four independent try-locks, one per particle kind plus
//! one for the multipole, each paired with an atomic hold counter counting
//! descendants that currently hold a lock. Locking a cell briefly takes each
//! ancestor's mutex only to bump its hold counter, so sibling subtrees never
//! contend and no worker ever blocks.

use crate::cell::CellId;
use crate::space::Space;
use arrayvec::ArrayVec;
use std::sync::atomic::{AtomicU32, Ordering};

/// Deepest ancestor chain the protocol supports. Tree depth is
/// `log8(N)` so this bound is far above anything reachable.
pub const MAX_TREE_DEPTH: usize = 32;

/// Which of a cell's four locks to take.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockKind {
    /// Gas particle window.
    Part,
    /// Gravity particle window.
    GPart,
    /// Star particle window.
    SPart,
    /// The cell's multipole.
    Multipole,
}

/// A non-blocking mutex plus the hold counter for descendants.
#[derive(Debug, Default)]
pub struct CellLock {
    word: AtomicU32,
    hold: AtomicU32,
}

impl CellLock {
    /// A fresh, unheld lock.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            hold: AtomicU32::new(0),
        }
    }

    /// Tries to take the mutex; never blocks.
    pub fn try_lock(&self) -> bool {
        self.word
            .compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Releases the mutex.
    pub fn unlock(&self) {
        let prev = self.word.swap(0, Ordering::Release);
        assert_eq!(prev, 1, "unlock of an unheld cell lock");
    }

    /// Number of descendants currently holding a lock below this cell.
    #[must_use]
    pub fn hold_count(&self) -> u32 {
        self.hold.load(Ordering::Acquire)
    }

    /// Bumps the hold counter.
    pub fn bump_hold(&self) {
        self.hold.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops the hold counter.
    pub fn drop_hold(&self) {
        let prev = self.hold.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "hold counter underflow");
    }
}

/// Exclusive write access to one cell's window of one particle kind.
///
/// Dropping the guard releases the cell's mutex and then drops the hold on
/// every strict ancestor.
#[must_use = "dropping the guard releases the subtree lock"]
pub struct SubtreeGuard<'s> {
    space: &'s Space,
    cell: CellId,
    kind: LockKind,
}

impl SubtreeGuard<'_> {
    /// The locked cell.
    #[must_use]
    pub const fn cell(&self) -> CellId {
        self.cell
    }
}

impl Drop for SubtreeGuard<'_> {
    fn drop(&mut self) {
        let c = self.space.cell(self.cell);
        c.lock_of(self.kind).unlock();
        let mut finger = c.parent;
        while let Some(up) = finger {
            let anc = self.space.cell(up);
            anc.lock_of(self.kind).drop_hold();
            finger = anc.parent;
        }
    }
}

/// Tries to take exclusive write access to `cell`'s window of `kind`.
///
/// Returns `None` on any contention; in that case no state has changed and
/// the caller is expected to retry later. Per the protocol:
///
/// 1. fail fast if a descendant holds the subtree or the cell mutex is
///    taken;
/// 2. re-check the hold counter after acquiring, to resolve the race with a
///    concurrent holder;
/// 3. walk the strict ancestors, taking each mutex only long enough to bump
///    its hold counter;
/// 4. unwind completely if any ancestor mutex is contended.
pub fn lock_subtree<'s>(space: &'s Space, cell: CellId, kind: LockKind) -> Option<SubtreeGuard<'s>> {
    let c = space.cell(cell);
    let lock = c.lock_of(kind);

    if lock.hold_count() > 0 || !lock.try_lock() {
        return None;
    }
    if lock.hold_count() > 0 {
        lock.unlock();
        return None;
    }

    let mut bumped: ArrayVec<CellId, MAX_TREE_DEPTH> = ArrayVec::new();
    let mut finger = c.parent;
    while let Some(up) = finger {
        let anc = space.cell(up);
        let anc_lock = anc.lock_of(kind);
        if anc_lock.try_lock() {
            anc_lock.bump_hold();
            anc_lock.unlock();
            bumped.push(up);
            finger = anc.parent;
        } else {
            for &id in bumped.iter().rev() {
                space.cell(id).lock_of(kind).drop_hold();
            }
            lock.unlock();
            return None;
        }
    }

    Some(SubtreeGuard { space, cell, kind })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::space::{Space, SpaceParams};

    fn three_level_space() -> (Space, CellId, CellId) {
        // root split once, then its first child split again
        let mut space = Space::new([8.0; 3], SpaceParams::default());
        let root = space.insert_test_cell([0.0; 3], [8.0; 3], 0, None);
        let mid = space.insert_test_cell([0.0; 3], [4.0; 3], 1, Some(root));
        let leaf = space.insert_test_cell([0.0; 3], [2.0; 3], 2, Some(mid));
        space.cell_mut(root).progeny[0] = Some(mid);
        space.cell_mut(root).split = true;
        space.cell_mut(mid).progeny[0] = Some(leaf);
        space.cell_mut(mid).split = true;
        (space, root, leaf)
    }

    #[test]
    fn lock_propagates_hold() {
        let (space, root, leaf) = three_level_space();
        let guard = lock_subtree(&space, leaf, LockKind::Part).unwrap();
        assert_eq!(space.cell(root).part_lock.hold_count(), 1);
        // the locked subtree rejects a conflicting descendant-to-root lock
        assert!(lock_subtree(&space, root, LockKind::Part).is_none());
        // but an independent kind is free
        let g2 = lock_subtree(&space, root, LockKind::Multipole).unwrap();
        drop(g2);
        drop(guard);
        assert_eq!(space.cell(root).part_lock.hold_count(), 0);
    }

    #[test]
    fn unlock_restores_holds() {
        let (space, root, leaf) = three_level_space();
        let before = space.cell(root).part_lock.hold_count();
        let guard = lock_subtree(&space, leaf, LockKind::Part).unwrap();
        drop(guard);
        assert_eq!(space.cell(root).part_lock.hold_count(), before);
        // and the root is lockable again
        let g = lock_subtree(&space, root, LockKind::Part).unwrap();
        drop(g);
    }

    #[test]
    fn held_cell_rejects_own_lock() {
        let (space, root, leaf) = three_level_space();
        let _guard = lock_subtree(&space, leaf, LockKind::GPart).unwrap();
        assert!(lock_subtree(&space, root, LockKind::GPart).is_none());
        // a second lock on the already-locked cell itself also fails
        assert!(lock_subtree(&space, leaf, LockKind::GPart).is_none());
    }

    #[test]
    fn contention_leaves_state_unchanged() {
        let (space, root, leaf) = three_level_space();
        let _root_guard = lock_subtree(&space, root, LockKind::Part).unwrap();
        // leaf lock must fail on the held ancestor and unwind fully
        assert!(lock_subtree(&space, leaf, LockKind::Part).is_none());
        assert_eq!(space.cell(root).part_lock.hold_count(), 0);
        assert_eq!(space.cell(leaf).part_lock.hold_count(), 0);
        // the failed attempt left the leaf mutex free
        assert!(space.cell(leaf).part_lock.try_lock());
        space.cell(leaf).part_lock.unlock();
    }

    #[test]
    fn disjoint_subtrees_do_not_contend() {
        let mut space = Space::new([8.0; 3], SpaceParams::default());
        let root = space.insert_test_cell([0.0; 3], [8.0; 3], 0, None);
        let a = space.insert_test_cell([0.0; 3], [4.0; 3], 1, Some(root));
        let b = space.insert_test_cell([4.0, 0.0, 0.0], [4.0; 3], 1, Some(root));
        space.cell_mut(root).progeny[0] = Some(a);
        space.cell_mut(root).progeny[4] = Some(b);
        space.cell_mut(root).split = true;

        let ga = lock_subtree(&space, a, LockKind::Part).unwrap();
        let gb = lock_subtree(&space, b, LockKind::Part).unwrap();
        assert_eq!(space.cell(root).part_lock.hold_count(), 2);
        drop(ga);
        drop(gb);
        assert_eq!(space.cell(root).part_lock.hold_count(), 0);
    }

    #[test]
    #[should_panic(expected = "hold counter underflow")]
    fn hold_underflow_aborts() {
        let lock = CellLock::new();
        lock.drop_hold();
    }
}
