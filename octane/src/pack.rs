//! Pointer-free tree images for cross-rank transfer.
//!
//! [`pack`] flattens a subtree depth-first into a cache-free sequence
//! carrying only geometry, counts, temporal stamps and tags; sibling links
//! become `i32` indices into the sequence, `-1` for an absent slot.
//! [`unpack`] rebuilds an equivalent proxy tree on the receiving side;
//! particle content and the task graph are never transported. The
//! narrower [`pack_step_info`] and [`pack_multipoles`] refresh an already
//! unpacked proxy each step.

use crate::cell::{Cell, CellId, NUM_PROGENY};
use crate::error::Result;
use crate::multipole::Multipole;
use crate::space::Space;
use crate::timeline::IntegerTime;
use crate::transport::Rank;
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;

/// One node of a packed tree image.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct PackedCell {
    /// Origin corner.
    pub loc: [f64; 3],
    /// Side lengths.
    pub width: [f64; 3],
    /// Depth below the top level.
    pub depth: u8,
    /// Gas particle count.
    pub count: u32,
    /// Gravity particle count.
    pub gcount: u32,
    /// Star particle count.
    pub scount: u32,
    /// Gas drift stamp.
    pub ti_old_part: IntegerTime,
    /// Gravity drift stamp.
    pub ti_old_gpart: IntegerTime,
    /// Multipole drift stamp.
    pub ti_old_multipole: IntegerTime,
    /// Earliest gas end-time.
    pub ti_hydro_end_min: IntegerTime,
    /// Latest gas end-time.
    pub ti_hydro_end_max: IntegerTime,
    /// Earliest gravity end-time.
    pub ti_grav_end_min: IntegerTime,
    /// Latest gravity end-time.
    pub ti_grav_end_max: IntegerTime,
    /// Per-step message tag.
    pub tag: i32,
    /// Flat-sequence indices of the progeny, `-1` for absent slots.
    pub progeny: [i32; NUM_PROGENY],
}

/// Per-step scalars of one node, refreshing an unpacked proxy.
#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Serialize)]
pub struct StepInfo {
    /// Earliest gas end-time.
    pub ti_hydro_end_min: IntegerTime,
    /// Latest gas end-time.
    pub ti_hydro_end_max: IntegerTime,
    /// Earliest gravity end-time.
    pub ti_grav_end_min: IntegerTime,
    /// Latest gravity end-time.
    pub ti_grav_end_max: IntegerTime,
    /// Gas displacement envelope.
    pub dx_max_part: f64,
    /// Gravity displacement envelope.
    pub dx_max_gpart: f64,
    /// Sort displacement envelope.
    pub dx_max_sort: f64,
}

/// Flattens the subtree rooted at `cid` depth-first.
#[must_use]
pub fn pack(space: &Space, cid: CellId) -> Vec<PackedCell> {
    let mut out = Vec::with_capacity(space.subtree_size(cid));
    pack_into(space, cid, &mut out);
    out
}

fn pack_into(space: &Space, cid: CellId, out: &mut Vec<PackedCell>) -> i32 {
    let c = space.cell(cid);
    let index = i32::try_from(out.len()).expect("packed image exceeds i32 indices");
    out.push(PackedCell {
        loc: c.loc,
        width: c.width,
        depth: c.depth,
        count: u32::try_from(c.parts.count).unwrap(),
        gcount: u32::try_from(c.gparts.count).unwrap(),
        scount: u32::try_from(c.sparts.count).unwrap(),
        ti_old_part: c.ti_old_part.load(Ordering::Relaxed),
        ti_old_gpart: c.ti_old_gpart.load(Ordering::Relaxed),
        ti_old_multipole: c.ti_old_multipole.load(Ordering::Relaxed),
        ti_hydro_end_min: c.ti_hydro_end_min.load(Ordering::Relaxed),
        ti_hydro_end_max: c.ti_hydro_end_max.load(Ordering::Relaxed),
        ti_grav_end_min: c.ti_grav_end_min.load(Ordering::Relaxed),
        ti_grav_end_max: c.ti_grav_end_max.load(Ordering::Relaxed),
        tag: c.tag,
        progeny: [-1; NUM_PROGENY],
    });
    for k in 0..NUM_PROGENY {
        if let Some(child) = space.cell(cid).progeny[k] {
            let child_index = pack_into(space, child, out);
            out[index as usize].progeny[k] = child_index;
        }
    }
    index
}

/// Rebuilds a proxy subtree from a packed image; returns the root's id.
/// The proxy carries geometry, counts, stamps and topology; its windows
/// must be assigned afterwards with [`Space::link_particles`].
pub fn unpack(space: &mut Space, packed: &[PackedCell], nodeid: Rank) -> CellId {
    assert!(!packed.is_empty(), "unpacking an empty image");
    unpack_at(space, packed, 0, None, nodeid)
}

fn unpack_at(
    space: &mut Space,
    packed: &[PackedCell],
    index: usize,
    parent: Option<CellId>,
    nodeid: Rank,
) -> CellId {
    let node = &packed[index];
    let cid = space.get_cells(1);
    let mut cell = Cell::new(node.loc, node.width, node.depth, parent);
    cell.parts.count = node.count as usize;
    cell.gparts.count = node.gcount as usize;
    cell.sparts.count = node.scount as usize;
    cell.ti_old_part.store(node.ti_old_part, Ordering::Relaxed);
    cell.ti_old_gpart.store(node.ti_old_gpart, Ordering::Relaxed);
    cell.ti_old_multipole
        .store(node.ti_old_multipole, Ordering::Relaxed);
    cell.ti_hydro_end_min
        .store(node.ti_hydro_end_min, Ordering::Relaxed);
    cell.ti_hydro_end_max
        .store(node.ti_hydro_end_max, Ordering::Relaxed);
    cell.ti_grav_end_min
        .store(node.ti_grav_end_min, Ordering::Relaxed);
    cell.ti_grav_end_max
        .store(node.ti_grav_end_max, Ordering::Relaxed);
    cell.tag = node.tag;
    cell.nodeid = nodeid;
    *space.cell_mut(cid) = cell;

    let progeny = node.progeny;
    let mut any = false;
    for (k, &child_index) in progeny.iter().enumerate() {
        if child_index >= 0 {
            any = true;
            let child = unpack_at(space, packed, child_index as usize, Some(cid), nodeid);
            space.cell_mut(cid).progeny[k] = Some(child);
        }
    }
    space.cell_mut(cid).split = any;
    cid
}

/// Flattens only the per-step scalars of the subtree, depth-first.
#[must_use]
pub fn pack_step_info(space: &Space, cid: CellId) -> Vec<StepInfo> {
    let mut out = Vec::with_capacity(space.subtree_size(cid));
    pack_step_info_into(space, cid, &mut out);
    out
}

fn pack_step_info_into(space: &Space, cid: CellId, out: &mut Vec<StepInfo>) {
    let c = space.cell(cid);
    out.push(StepInfo {
        ti_hydro_end_min: c.ti_hydro_end_min.load(Ordering::Relaxed),
        ti_hydro_end_max: c.ti_hydro_end_max.load(Ordering::Relaxed),
        ti_grav_end_min: c.ti_grav_end_min.load(Ordering::Relaxed),
        ti_grav_end_max: c.ti_grav_end_max.load(Ordering::Relaxed),
        dx_max_part: c.dx_max_part.load(),
        dx_max_gpart: c.dx_max_gpart.load(),
        dx_max_sort: c.dx_max_sort.load(),
    });
    for k in 0..NUM_PROGENY {
        if let Some(child) = space.cell(cid).progeny[k] {
            pack_step_info_into(space, child, out);
        }
    }
}

/// Applies a step-info image to the matching proxy subtree, in the same
/// depth-first order it was packed in.
pub fn unpack_step_info(space: &Space, cid: CellId, info: &[StepInfo]) {
    let consumed = unpack_step_info_at(space, cid, info, 0);
    assert_eq!(
        consumed,
        info.len(),
        "step-info image does not match the proxy topology"
    );
}

fn unpack_step_info_at(space: &Space, cid: CellId, info: &[StepInfo], at: usize) -> usize {
    let c = space.cell(cid);
    let node = &info[at];
    c.ti_hydro_end_min
        .store(node.ti_hydro_end_min, Ordering::Relaxed);
    c.ti_hydro_end_max
        .store(node.ti_hydro_end_max, Ordering::Relaxed);
    c.ti_grav_end_min
        .store(node.ti_grav_end_min, Ordering::Relaxed);
    c.ti_grav_end_max
        .store(node.ti_grav_end_max, Ordering::Relaxed);
    c.dx_max_part.store(node.dx_max_part);
    c.dx_max_gpart.store(node.dx_max_gpart);
    c.dx_max_sort.store(node.dx_max_sort);
    let mut next = at + 1;
    for k in 0..NUM_PROGENY {
        if let Some(child) = space.cell(cid).progeny[k] {
            next = unpack_step_info_at(space, child, info, next);
        }
    }
    next
}

/// Snapshots every multipole of the subtree, depth-first.
#[must_use]
pub fn pack_multipoles(space: &Space, cid: CellId) -> Vec<Multipole> {
    let mut out = Vec::with_capacity(space.subtree_size(cid));
    pack_multipoles_into(space, cid, &mut out);
    out
}

fn pack_multipoles_into(space: &Space, cid: CellId, out: &mut Vec<Multipole>) {
    // serial exchange phase: no concurrent writers
    out.push(unsafe { space.cell(cid).multipole.get() }.clone());
    for k in 0..NUM_PROGENY {
        if let Some(child) = space.cell(cid).progeny[k] {
            pack_multipoles_into(space, child, out);
        }
    }
}

/// Applies a multipole snapshot to the matching proxy subtree.
pub fn unpack_multipoles(space: &Space, cid: CellId, image: &[Multipole]) {
    let consumed = unpack_multipoles_at(space, cid, image, 0);
    assert_eq!(
        consumed,
        image.len(),
        "multipole image does not match the proxy topology"
    );
}

fn unpack_multipoles_at(space: &Space, cid: CellId, image: &[Multipole], at: usize) -> usize {
    // serial exchange phase: no concurrent writers
    unsafe { *space.cell(cid).multipole.get_racy_mut() = image[at].clone() };
    let mut next = at + 1;
    for k in 0..NUM_PROGENY {
        if let Some(child) = space.cell(cid).progeny[k] {
            next = unpack_multipoles_at(space, child, image, next);
        }
    }
    next
}

/// Encodes any packed image to bytes.
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(bincode::serialize(value)?)
}

/// Decodes a packed image from bytes.
pub fn decode<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> Result<T> {
    Ok(bincode::deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::{GPart, GPartLink, Part};
    use crate::space::SpaceParams;
    use rand::Rng;
    use rand_pcg::Pcg64;

    fn built_space() -> Space {
        let mut rng = Pcg64::new(0x853c49e6748fea9b, 0xda3e39cb94b95bdb);
        let mut parts = Vec::new();
        let mut gparts = Vec::new();
        for i in 0..300 {
            let x = [
                rng.gen_range(0.0..6.0),
                rng.gen_range(0.0..6.0),
                rng.gen_range(0.0..6.0),
            ];
            let mut p = Part::at(x, 0.05, 1.0);
            p.gpart = i;
            parts.push(p);
            let mut g = GPart::dark(x, 1.0);
            g.link = GPartLink::Gas(i);
            gparts.push(g);
        }
        let mut params = SpaceParams::default();
        params.set_split_threshold(24);
        params.set_top_grid(3);
        let mut space = Space::with_particles([6.0; 3], params, parts, gparts, Vec::new());
        space.rebuild(0);
        space
    }

    #[test]
    fn pack_unpack_round_trip() {
        let space = built_space();
        let root = space
            .top_cells()
            .iter()
            .copied()
            .max_by_key(|&c| space.subtree_size(c))
            .unwrap();
        let image = pack(&space, root);
        assert_eq!(image.len(), space.subtree_size(root));

        let mut proxy_space = Space::new(space.dim, *space.params());
        let proxy = unpack(&mut proxy_space, &image, 1);
        let reimage = pack(&proxy_space, proxy);
        assert_eq!(image, reimage);
        assert_eq!(proxy_space.cell(proxy).nodeid, 1);
    }

    #[test]
    fn unpacked_windows_link() {
        let space = built_space();
        let root = space.top_cells()[0];
        let image = pack(&space, root);
        let mut proxy_space = Space::new(space.dim, *space.params());
        let proxy = unpack(&mut proxy_space, &image, 1);
        let (pc, gc, sc) = proxy_space.link_particles(proxy, 0, 0, 0);
        assert_eq!(pc, space.cell(root).parts.count);
        assert_eq!(gc, space.cell(root).gparts.count);
        assert_eq!(sc, 0);
    }

    #[test]
    fn step_info_round_trip() {
        let space = built_space();
        let root = space.top_cells()[0];
        space.cell(root).dx_max_part.store(0.25);
        let info = pack_step_info(&space, root);

        let image = pack(&space, root);
        let mut proxy_space = Space::new(space.dim, *space.params());
        let proxy = unpack(&mut proxy_space, &image, 1);
        unpack_step_info(&proxy_space, proxy, &info);
        assert_eq!(proxy_space.cell(proxy).dx_max_part.load(), 0.25);
        assert_eq!(pack_step_info(&proxy_space, proxy), info);
    }

    #[test]
    fn multipole_round_trip() {
        let space = built_space();
        let root = space.top_cells()[0];
        let image = pack(&space, root);
        let multipoles = pack_multipoles(&space, root);

        let mut proxy_space = Space::new(space.dim, *space.params());
        let proxy = unpack(&mut proxy_space, &image, 1);
        unpack_multipoles(&proxy_space, proxy, &multipoles);
        assert_eq!(pack_multipoles(&proxy_space, proxy), multipoles);
    }

    #[test]
    fn byte_encoding_round_trip() {
        let space = built_space();
        let root = space.top_cells()[0];
        let image = pack(&space, root);
        let bytes = encode(&image).unwrap();
        let decoded: Vec<PackedCell> = decode(&bytes).unwrap();
        assert_eq!(decoded, image);
    }
}
