//! Directional particle sorts.
//!
//! Pair interactions walk the particles of both cells ordered along the
//! axis joining them. The 27 neighbour directions fold to 13 canonical ones
//! by antisymmetry; a pair whose direction is the mirror of a canonical one
//! swaps its cells instead.

use crate::part::Part;
use serde::{Deserialize, Serialize};

/// Number of canonical sort directions.
pub const NUM_SORT_DIRECTIONS: usize = 13;

const SQRT_1_3: f64 = 0.577_350_269_189_625_8;
const SQRT_1_2: f64 = 0.707_106_781_186_547_5;

/// Canonical integer shifts, ordered so that the first non-zero component
/// is positive.
pub const SHIFT_TRIPLES: [[i32; 3]; NUM_SORT_DIRECTIONS] = [
    [1, 1, 1],
    [1, 1, 0],
    [1, 1, -1],
    [1, 0, 1],
    [1, 0, 0],
    [1, 0, -1],
    [1, -1, 1],
    [1, -1, 0],
    [1, -1, -1],
    [0, 1, 1],
    [0, 1, 0],
    [0, 1, -1],
    [0, 0, 1],
];

/// Unit vectors of the canonical directions, in `SHIFT_TRIPLES` order.
pub const UNIT_VECTORS: [[f64; 3]; NUM_SORT_DIRECTIONS] = [
    [SQRT_1_3, SQRT_1_3, SQRT_1_3],
    [SQRT_1_2, SQRT_1_2, 0.0],
    [SQRT_1_3, SQRT_1_3, -SQRT_1_3],
    [SQRT_1_2, 0.0, SQRT_1_2],
    [1.0, 0.0, 0.0],
    [SQRT_1_2, 0.0, -SQRT_1_2],
    [SQRT_1_3, -SQRT_1_3, SQRT_1_3],
    [SQRT_1_2, -SQRT_1_2, 0.0],
    [SQRT_1_3, -SQRT_1_3, -SQRT_1_3],
    [0.0, SQRT_1_2, SQRT_1_2],
    [0.0, 1.0, 0.0],
    [0.0, SQRT_1_2, -SQRT_1_2],
    [0.0, 0.0, 1.0],
];

/// Maps an arbitrary non-zero shift in `{-1, 0, 1}^3` to its canonical
/// direction id and whether the pair must be flipped to match it.
#[must_use]
pub fn sort_id_and_flip(shift: [i32; 3]) -> (usize, bool) {
    assert!(
        shift != [0, 0, 0],
        "sort direction requested for a self pair"
    );
    let flip = shift[0] < 0
        || (shift[0] == 0 && shift[1] < 0)
        || (shift[0] == 0 && shift[1] == 0 && shift[2] < 0);
    let canonical = if flip {
        [-shift[0], -shift[1], -shift[2]]
    } else {
        shift
    };
    let sid = SHIFT_TRIPLES
        .iter()
        .position(|&t| t == canonical)
        .unwrap_or_else(|| panic!("no canonical direction for shift {shift:?}"));
    (sid, flip)
}

/// Computes the direction id for the pair `(loc_i, loc_j)` of same-size
/// neighbouring cells in a periodic box of size `dim`, together with the
/// flip marker and the position shift to apply to `cj` for minimum-image
/// distances.
#[must_use]
pub fn get_sort_id(
    dim: [f64; 3],
    loc_i: [f64; 3],
    loc_j: [f64; 3],
    cell_width: [f64; 3],
) -> (usize, bool, [f64; 3]) {
    let mut triple = [0_i32; 3];
    let mut shift = [0.0; 3];
    for k in 0..3 {
        let mut dx = loc_j[k] - loc_i[k];
        if dx > 0.5 * dim[k] {
            dx -= dim[k];
            shift[k] = -dim[k];
        } else if dx < -0.5 * dim[k] {
            dx += dim[k];
            shift[k] = dim[k];
        }
        // neighbouring cells differ by at most one cell width per axis
        triple[k] = if dx > 0.5 * cell_width[k] {
            1
        } else if dx < -0.5 * cell_width[k] {
            -1
        } else {
            0
        };
    }
    let (sid, flip) = sort_id_and_flip(triple);
    (sid, flip, shift)
}

/// One entry of a directional sort: a particle index and its projected
/// distance along the direction's unit vector.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct SortEntry {
    /// Index into the space-wide gas array.
    pub i: u32,
    /// Projected distance.
    pub d: f64,
}

/// The per-cell cache of directional sort arrays.
#[derive(Debug, Default)]
pub struct SortCache {
    entries: [Vec<SortEntry>; NUM_SORT_DIRECTIONS],
}

impl SortCache {
    /// The sorted entries for direction `sid`; empty if never built.
    #[must_use]
    pub fn direction(&self, sid: usize) -> &[SortEntry] {
        &self.entries[sid]
    }

    /// Rebuilds the array for direction `sid` from the cell's particles.
    /// `first` is the window start in the space-wide array.
    pub fn rebuild(&mut self, sid: usize, first: usize, parts: &[Part]) {
        let unit = UNIT_VECTORS[sid];
        let entries = &mut self.entries[sid];
        entries.clear();
        entries.reserve(parts.len());
        for (off, p) in parts.iter().enumerate() {
            entries.push(SortEntry {
                i: u32::try_from(first + off).expect("particle index overflows u32"),
                d: p.x[0] * unit[0] + p.x[1] * unit[1] + p.x[2] * unit[2],
            });
        }
        entries.sort_unstable_by(|a, b| a.d.total_cmp(&b.d));
    }

    /// Drops every direction's array.
    pub fn invalidate(&mut self) {
        for entries in &mut self.entries {
            entries.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_ids_are_identity() {
        for (sid, &triple) in SHIFT_TRIPLES.iter().enumerate() {
            assert_eq!(sort_id_and_flip(triple), (sid, false));
        }
    }

    #[test]
    fn mirrored_ids_flip() {
        for (sid, &[i, j, k]) in SHIFT_TRIPLES.iter().enumerate() {
            assert_eq!(sort_id_and_flip([-i, -j, -k]), (sid, true));
        }
    }

    #[test]
    fn unit_vectors_are_normalised() {
        for unit in UNIT_VECTORS {
            let norm = unit.iter().map(|u| u * u).sum::<f64>();
            assert!((norm - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn pair_direction_with_wrap() {
        let dim = [8.0; 3];
        let w = [2.0; 3];
        // direct face neighbour along +x
        let (sid, flip, shift) = get_sort_id(dim, [0.0; 3], [2.0, 0.0, 0.0], w);
        assert_eq!((sid, flip), (4, false));
        assert_eq!(shift, [0.0; 3]);
        // periodic neighbour: cj at the far end wraps to -x of ci
        let (sid, flip, shift) = get_sort_id(dim, [0.0; 3], [6.0, 0.0, 0.0], w);
        assert_eq!((sid, flip), (4, true));
        assert_eq!(shift, [-8.0, 0.0, 0.0]);
    }

    #[test]
    fn rebuild_orders_by_projection() {
        let parts = vec![
            Part::at([3.0, 0.0, 0.0], 0.1, 1.0),
            Part::at([1.0, 0.0, 0.0], 0.1, 1.0),
            Part::at([2.0, 0.0, 0.0], 0.1, 1.0),
        ];
        let mut cache = SortCache::default();
        cache.rebuild(4, 10, &parts);
        let order: Vec<u32> = cache.direction(4).iter().map(|e| e.i).collect();
        assert_eq!(order, vec![11, 12, 10]);
    }
}
