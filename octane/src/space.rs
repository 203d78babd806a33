//! The spatial container.
//!
//! [`Space`] owns the particle arrays and the cell arena, and carries the
//! structural tree operations: the top-level decomposition, the recursive
//! in-place octant subdivision, window linking, smoothing-length
//! sanitisation and the bottom-up multipole build. All of these run between
//! steps under `&mut self`; the step phase only ever sees `&Space`.

use crate::cell::{Cell, CellId, Window, NUM_PROGENY};
use crate::hydro::KERNEL_GAMMA;
use crate::multipole::{self, Multipole};
use crate::part::{GPart, GPartLink, Part, SPart, XPart};
use crate::shared::SharedVec;
use crate::timeline::IntegerTime;
use rayon::prelude::*;
use std::sync::atomic::Ordering;

/// Tunables of the spatial decomposition.
#[derive(Clone, Copy, Debug)]
pub struct SpaceParams {
    split_threshold: usize,
    top_grid: usize,
    h_max: f64,
    maxreldx: f64,
    sanitize_threshold: usize,
}

impl Default for SpaceParams {
    fn default() -> Self {
        Self {
            split_threshold: 400,
            top_grid: 4,
            h_max: f64::MAX,
            maxreldx: 0.1,
            sanitize_threshold: 1000,
        }
    }
}

impl SpaceParams {
    /// Returns the maximum number of particles a leaf may hold.
    #[must_use]
    pub const fn split_threshold(&self) -> usize {
        self.split_threshold
    }

    /// Returns the number of top-level cells per axis.
    #[must_use]
    pub const fn top_grid(&self) -> usize {
        self.top_grid
    }

    /// Returns the global upper bound on smoothing lengths.
    #[must_use]
    pub const fn h_max(&self) -> f64 {
        self.h_max
    }

    /// Returns the fraction of `dmin` a sort survives before invalidation.
    #[must_use]
    pub const fn maxreldx(&self) -> f64 {
        self.maxreldx
    }

    /// Returns the subtree size below which the sanitiser clamps.
    #[must_use]
    pub const fn sanitize_threshold(&self) -> usize {
        self.sanitize_threshold
    }

    /// Sets the maximum number of particles a leaf may hold.
    pub fn set_split_threshold(&mut self, split_threshold: usize) {
        self.split_threshold = split_threshold;
    }

    /// Sets the number of top-level cells per axis.
    pub fn set_top_grid(&mut self, top_grid: usize) {
        assert!(top_grid >= 3, "periodic pairing needs at least 3 top-level cells per axis");
        self.top_grid = top_grid;
    }

    /// Sets the global upper bound on smoothing lengths.
    pub fn set_h_max(&mut self, h_max: f64) {
        self.h_max = h_max;
    }

    /// Sets the fraction of `dmin` a sort survives before invalidation.
    pub fn set_maxreldx(&mut self, maxreldx: f64) {
        self.maxreldx = maxreldx;
    }

    /// Sets the subtree size below which the sanitiser clamps.
    pub fn set_sanitize_threshold(&mut self, sanitize_threshold: usize) {
        self.sanitize_threshold = sanitize_threshold;
    }
}

/// The periodic cubical domain with its particles and cell tree.
pub struct Space {
    /// Box side lengths; the domain is periodic in all three.
    pub dim: [f64; 3],
    params: SpaceParams,
    /// Gas particles.
    pub parts: SharedVec<Part>,
    /// Extended gas state, index-parallel to `parts`.
    pub xparts: SharedVec<XPart>,
    /// Gravity particles.
    pub gparts: SharedVec<GPart>,
    /// Star particles.
    pub sparts: SharedVec<SPart>,
    cells: Vec<Cell>,
    top_cells: Vec<CellId>,
}

impl Space {
    /// An empty space covering a periodic box of size `dim`.
    #[must_use]
    pub fn new(dim: [f64; 3], params: SpaceParams) -> Self {
        Self {
            dim,
            params,
            parts: SharedVec::from_vec(Vec::new()),
            xparts: SharedVec::from_vec(Vec::new()),
            gparts: SharedVec::from_vec(Vec::new()),
            sparts: SharedVec::from_vec(Vec::new()),
            cells: Vec::new(),
            top_cells: Vec::new(),
        }
    }

    /// A space populated with `parts`, `gparts` and `sparts`. The extended
    /// gas state is allocated fresh; back-links are left as provided.
    #[must_use]
    pub fn with_particles(
        dim: [f64; 3],
        params: SpaceParams,
        parts: Vec<Part>,
        gparts: Vec<GPart>,
        sparts: Vec<SPart>,
    ) -> Self {
        let xparts = vec![XPart::default(); parts.len()];
        Self {
            dim,
            params,
            parts: SharedVec::from_vec(parts),
            xparts: SharedVec::from_vec(xparts),
            gparts: SharedVec::from_vec(gparts),
            sparts: SharedVec::from_vec(sparts),
            cells: Vec::new(),
            top_cells: Vec::new(),
        }
    }

    /// The decomposition tunables.
    #[must_use]
    pub const fn params(&self) -> &SpaceParams {
        &self.params
    }

    /// The cell at `id`.
    ///
    /// # Panics
    ///
    /// Panics if `id` is not a live cell.
    #[must_use]
    pub fn cell(&self, id: CellId) -> &Cell {
        &self.cells[id as usize]
    }

    /// Unique access to the cell at `id`, for the serial phases.
    pub fn cell_mut(&mut self, id: CellId) -> &mut Cell {
        &mut self.cells[id as usize]
    }

    /// The top-level cells, in grid order.
    #[must_use]
    pub fn top_cells(&self) -> &[CellId] {
        &self.top_cells
    }

    /// Number of live cells in the arena.
    #[must_use]
    pub fn cell_count(&self) -> usize {
        self.cells.len()
    }

    /// Allocates `n` fresh cells from the arena and returns the id of the
    /// first; the `n` ids are consecutive.
    pub fn get_cells(&mut self, n: usize) -> CellId {
        let first = CellId::try_from(self.cells.len()).expect("cell arena exceeds u32 indices");
        for _ in 0..n {
            self.cells.push(Cell::new([0.0; 3], [0.0; 3], 0, None));
        }
        first
    }

    /// Inserts a bare cell with the given geometry; test scaffolding for
    /// protocol-level tests that do not need particles. Parentless cells
    /// register as top-level.
    #[doc(hidden)]
    pub fn insert_test_cell(
        &mut self,
        loc: [f64; 3],
        width: [f64; 3],
        depth: u8,
        parent: Option<CellId>,
    ) -> CellId {
        let id = self.get_cells(1);
        *self.cell_mut(id) = Cell::new(loc, width, depth, parent);
        if parent.is_none() {
            self.top_cells.push(id);
        }
        id
    }

    /// Minimum-image separation `a - b`.
    #[must_use]
    pub fn periodic_dx(&self, a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
        let mut dx = [0.0; 3];
        for k in 0..3 {
            let mut d = a[k] - b[k];
            if d > 0.5 * self.dim[k] {
                d -= self.dim[k];
            } else if d < -0.5 * self.dim[k] {
                d += self.dim[k];
            }
            dx[k] = d;
        }
        dx
    }

    /// Number of cells in the subtree rooted at `cid`, this cell included.
    #[must_use]
    pub fn subtree_size(&self, cid: CellId) -> usize {
        let c = self.cell(cid);
        1 + c
            .progeny
            .iter()
            .flatten()
            .map(|&child| self.subtree_size(child))
            .sum::<usize>()
    }

    /// Tears down the tree and rebuilds it from scratch: top-level grid
    /// assignment, recursive octant subdivision, back-link rederivation,
    /// envelope initialisation and the bottom-up multipole build.
    pub fn rebuild(&mut self, ti_current: IntegerTime) {
        let _span = tracing::info_span!("rebuild", ti_current).entered();

        self.cells.clear();
        self.top_cells.clear();

        let n = self.params.top_grid;
        assert!(n >= 3, "periodic pairing needs at least 3 top-level cells per axis");
        let width = [
            self.dim[0] / n as f64,
            self.dim[1] / n as f64,
            self.dim[2] / n as f64,
        ];

        let first = self.get_cells(n * n * n);
        for i in 0..n {
            for j in 0..n {
                for k in 0..n {
                    let id = first + CellId::try_from(i * n * n + j * n + k).unwrap();
                    let loc = [
                        i as f64 * width[0],
                        j as f64 * width[1],
                        k as f64 * width[2],
                    ];
                    *self.cell_mut(id) = Cell::new(loc, width, 0, None);
                    self.top_cells.push(id);
                }
            }
        }

        self.wrap_particles_into_box();
        self.bucket_top_level(n, width);
        self.rederive_links();

        for i in 0..self.top_cells.len() {
            let cid = self.top_cells[i];
            self.split_recursive(cid);
        }

        // the top-level subtrees are disjoint, so these passes fan out
        let tops = self.top_cells.clone();
        let this = &*self;
        tops.par_iter().for_each(|&cid| {
            this.init_envelopes(cid, ti_current);
            this.make_multipoles_in(cid, ti_current);
        });
    }

    /// Folds particle positions back into the primary box image.
    fn wrap_particles_into_box(&mut self) {
        let dim = self.dim;
        let wrap = |x: &mut [f64; 3]| {
            for k in 0..3 {
                x[k] = x[k].rem_euclid(dim[k]);
            }
        };
        self.parts.as_mut_slice().iter_mut().for_each(|p| wrap(&mut p.x));
        self.gparts.as_mut_slice().iter_mut().for_each(|g| wrap(&mut g.x));
        self.sparts.as_mut_slice().iter_mut().for_each(|s| wrap(&mut s.x));
    }

    /// Partitions all three particle arrays into the top-level grid cells
    /// and assigns the windows.
    fn bucket_top_level(&mut self, n: usize, width: [f64; 3]) {
        let grid_index = |x: &[f64; 3]| -> usize {
            let i = ((x[0] / width[0]) as usize).min(n - 1);
            let j = ((x[1] / width[1]) as usize).min(n - 1);
            let k = ((x[2] / width[2]) as usize).min(n - 1);
            i * n * n + j * n + k
        };

        let ncells = n * n * n;
        let part_cell: Vec<usize> = self
            .parts
            .as_mut_slice()
            .iter()
            .map(|p| grid_index(&p.x))
            .collect();
        let part_offsets = permute_into_buckets(
            self.parts.as_mut_slice(),
            Some(self.xparts.as_mut_slice()),
            &part_cell,
            ncells,
        );
        let gpart_cell: Vec<usize> = self
            .gparts
            .as_mut_slice()
            .iter()
            .map(|g| grid_index(&g.x))
            .collect();
        let gpart_offsets =
            permute_into_buckets::<_, ()>(self.gparts.as_mut_slice(), None, &gpart_cell, ncells);
        let spart_cell: Vec<usize> = self
            .sparts
            .as_mut_slice()
            .iter()
            .map(|s| grid_index(&s.x))
            .collect();
        let spart_offsets =
            permute_into_buckets::<_, ()>(self.sparts.as_mut_slice(), None, &spart_cell, ncells);

        for (grid, &cid) in self.top_cells.clone().iter().enumerate() {
            let c = self.cell_mut(cid);
            c.parts = Window {
                first: part_offsets[grid],
                count: part_offsets[grid + 1] - part_offsets[grid],
            };
            c.gparts = Window {
                first: gpart_offsets[grid],
                count: gpart_offsets[grid + 1] - gpart_offsets[grid],
            };
            c.sparts = Window {
                first: spart_offsets[grid],
                count: spart_offsets[grid + 1] - spart_offsets[grid],
            };
        }
    }

    /// Splits `cid` recursively until every leaf is below the split
    /// threshold in all particle kinds.
    fn split_recursive(&mut self, cid: CellId) {
        let c = self.cell(cid);
        let over = c.parts.count.max(c.gparts.count) > self.params.split_threshold;
        if !over {
            return;
        }
        self.subdivide(cid);
        let progeny = self.cell(cid).progeny;
        for child in progeny.into_iter().flatten() {
            self.split_recursive(child);
        }
    }

    /// Partitions the cell's gas, gravity and star windows into eight
    /// octants about the pivot and attaches progeny cells.
    ///
    /// The partition runs in place as a bucket cycle per window: each slot
    /// below its bucket boundary swaps its occupant towards the occupant's
    /// target bucket, advancing that bucket's cursor, until the occupant
    /// belongs to the current bucket. The extended gas state is cycled in
    /// lockstep. An empty octant still yields a child with an empty window
    /// at the pivot-derived location.
    pub fn subdivide(&mut self, cid: CellId) {
        let c = self.cell(cid);
        assert!(!c.split, "subdividing an already split cell at depth {}", c.depth);
        let pivot = c.center();
        let depth = c.depth;
        let (pw, gw, sw) = (c.parts, c.gparts, c.sparts);
        let child_width = c.progeny_width();
        let child_locs: Vec<[f64; 3]> = (0..NUM_PROGENY).map(|k| c.progeny_loc(k)).collect();

        let octant = |x: &[f64; 3]| -> usize {
            usize::from(x[0] >= pivot[0]) << 2
                | usize::from(x[1] >= pivot[1]) << 1
                | usize::from(x[2] >= pivot[2])
        };

        let part_counts = {
            let parts = self.parts.as_mut_slice();
            let keys: Vec<usize> = parts[pw.range()].iter().map(|p| octant(&p.x)).collect();
            let xparts = self.xparts.as_mut_slice();
            bucket_cycle(
                &mut parts[pw.range()],
                Some(&mut xparts[pw.range()]),
                &keys,
            )
        };
        let gpart_counts = {
            let gparts = self.gparts.as_mut_slice();
            let keys: Vec<usize> = gparts[gw.range()].iter().map(|g| octant(&g.x)).collect();
            bucket_cycle::<_, ()>(&mut gparts[gw.range()], None, &keys)
        };
        let spart_counts = {
            let sparts = self.sparts.as_mut_slice();
            let keys: Vec<usize> = sparts[sw.range()].iter().map(|s| octant(&s.x)).collect();
            bucket_cycle::<_, ()>(&mut sparts[sw.range()], None, &keys)
        };

        self.rederive_links_in(pw, gw, sw);

        let first_child = self.get_cells(NUM_PROGENY);
        let (mut po, mut go, mut so) = (pw.first, gw.first, sw.first);
        for k in 0..NUM_PROGENY {
            let child = first_child + CellId::try_from(k).unwrap();
            *self.cell_mut(child) = Cell::new(child_locs[k], child_width, depth + 1, Some(cid));
            let cc = self.cell_mut(child);
            cc.parts = Window { first: po, count: part_counts[k] };
            cc.gparts = Window { first: go, count: gpart_counts[k] };
            cc.sparts = Window { first: so, count: spart_counts[k] };
            po += part_counts[k];
            go += gpart_counts[k];
            so += spart_counts[k];
        }
        debug_assert_eq!(po, pw.first + pw.count);
        debug_assert_eq!(go, gw.first + gw.count);
        debug_assert_eq!(so, sw.first + sw.count);

        let c = self.cell_mut(cid);
        for k in 0..NUM_PROGENY {
            c.progeny[k] = Some(first_child + CellId::try_from(k).unwrap());
        }
        c.split = true;
    }

    /// Re-derives both directions of the gas/star ↔ gravity back-links for
    /// the given windows, after an in-place permutation.
    fn rederive_links_in(&mut self, pw: Window, gw: Window, sw: Window) {
        for i in pw.range() {
            let g = self.parts.as_mut_slice()[i].gpart;
            if g != crate::part::NO_LINK {
                self.gparts.as_mut_slice()[g as usize].link =
                    GPartLink::Gas(u32::try_from(i).unwrap());
            }
        }
        for i in sw.range() {
            let g = self.sparts.as_mut_slice()[i].gpart;
            if g != crate::part::NO_LINK {
                self.gparts.as_mut_slice()[g as usize].link =
                    GPartLink::Star(u32::try_from(i).unwrap());
            }
        }
        for i in gw.range() {
            let link = self.gparts.as_mut_slice()[i].link;
            let g = u32::try_from(i).unwrap();
            match link {
                GPartLink::Gas(p) => self.parts.as_mut_slice()[p as usize].gpart = g,
                GPartLink::Star(s) => self.sparts.as_mut_slice()[s as usize].gpart = g,
                GPartLink::Dark => {}
            }
        }
    }

    /// Re-derives every back-link, over the full arrays.
    pub fn rederive_links(&mut self) {
        let pw = Window { first: 0, count: self.parts.len() };
        let gw = Window { first: 0, count: self.gparts.len() };
        let sw = Window { first: 0, count: self.sparts.len() };
        self.rederive_links_in(pw, gw, sw);
    }

    /// Assigns the subtree's particle windows depth-first starting at the
    /// given bases, keeping progeny contiguous; returns the counts linked.
    /// Required after any rebuild or unpack.
    pub fn link_particles(
        &mut self,
        cid: CellId,
        part_base: usize,
        gpart_base: usize,
        spart_base: usize,
    ) -> (usize, usize, usize) {
        let c = self.cell(cid);
        let (pc, gc, sc) = (c.parts.count, c.gparts.count, c.sparts.count);
        let progeny = c.progeny;
        {
            let c = self.cell_mut(cid);
            c.parts.first = part_base;
            c.gparts.first = gpart_base;
            c.sparts.first = spart_base;
        }
        let (mut po, mut go, mut so) = (part_base, gpart_base, spart_base);
        for child in progeny.into_iter().flatten() {
            let (dp, dg, ds) = self.link_particles(child, po, go, so);
            po += dp;
            go += dg;
            so += ds;
        }
        if self.cell(cid).split {
            assert_eq!(po, part_base + pc, "progeny windows do not partition the parent");
            assert_eq!(go, gpart_base + gc, "progeny windows do not partition the parent");
            assert_eq!(so, spart_base + sc, "progeny windows do not partition the parent");
        }
        (pc, gc, sc)
    }

    /// Initialises the per-cell temporal stamps and motion envelopes from
    /// the particle content, bottom-up. Runs on a quiescent tree; every
    /// field it touches is atomic, so disjoint subtrees may run in
    /// parallel.
    fn init_envelopes(&self, cid: CellId, ti_current: IntegerTime) {
        let progeny = self.cell(cid).progeny;
        for child in progeny.into_iter().flatten() {
            self.init_envelopes(child, ti_current);
        }

        let c = self.cell(cid);
        let mut h_max: f64 = 0.0;
        let mut ti_hydro_min = IntegerTime::MAX;
        let mut ti_hydro_max = 0;
        let mut ti_grav_min = IntegerTime::MAX;
        let mut ti_grav_max = 0;

        if c.split {
            for child in c.progeny.iter().flatten() {
                let cp = self.cell(*child);
                h_max = h_max.max(cp.h_max.load());
                ti_hydro_min = ti_hydro_min.min(cp.ti_hydro_end_min.load(Ordering::Relaxed));
                ti_hydro_max = ti_hydro_max.max(cp.ti_hydro_end_max.load(Ordering::Relaxed));
                ti_grav_min = ti_grav_min.min(cp.ti_grav_end_min.load(Ordering::Relaxed));
                ti_grav_max = ti_grav_max.max(cp.ti_grav_end_max.load(Ordering::Relaxed));
            }
        } else {
            for i in c.parts.range() {
                // serial phase: unique access is guaranteed by &mut self
                let p = unsafe { self.parts.get(i) };
                h_max = h_max.max(p.h);
                if p.time_bin.is_awake() {
                    ti_hydro_min = ti_hydro_min.min(p.ti_end);
                    ti_hydro_max = ti_hydro_max.max(p.ti_end);
                }
            }
            for i in c.gparts.range() {
                let g = unsafe { self.gparts.get(i) };
                if g.time_bin.is_awake() {
                    ti_grav_min = ti_grav_min.min(g.ti_end);
                    ti_grav_max = ti_grav_max.max(g.ti_end);
                }
            }
        }

        let c = self.cell(cid);
        c.h_max.store(h_max);
        c.dx_max_part.store(0.0);
        c.dx_max_gpart.store(0.0);
        c.dx_max_sort.store(0.0);
        c.ti_old_part.store(ti_current, Ordering::Relaxed);
        c.ti_old_gpart.store(ti_current, Ordering::Relaxed);
        c.ti_hydro_end_min.store(ti_hydro_min, Ordering::Relaxed);
        c.ti_hydro_end_max.store(ti_hydro_max, Ordering::Relaxed);
        c.ti_grav_end_min.store(ti_grav_min, Ordering::Relaxed);
        c.ti_grav_end_max.store(ti_grav_max, Ordering::Relaxed);
    }

    /// Builds the multipole of the subtree rooted at `cid` bottom-up.
    pub fn make_multipoles(&mut self, cid: CellId, ti: IntegerTime) {
        self.make_multipoles_in(cid, ti);
    }

    /// Recursive body of [`Self::make_multipoles`]. Takes `&self` so the
    /// disjoint top-level subtrees can be built in parallel; the multipole
    /// slot is written through its race cell, which is sound because only
    /// one builder ever descends a given subtree.
    fn make_multipoles_in(&self, cid: CellId, ti: IntegerTime) {
        let progeny = self.cell(cid).progeny;
        for child in progeny.into_iter().flatten() {
            self.make_multipoles_in(child, ti);
        }

        let c = self.cell(cid);
        let center = c.center();
        let corners = cell_corners(c.loc, c.width);
        let split = c.split;
        let gw = c.gparts;

        let mut m = Multipole::default();
        if split {
            let mut total_mass = 0.0;
            let mut com = [0.0; 3];
            for child in c.progeny.iter().flatten() {
                let cm = unsafe { self.cell(*child).multipole.get() };
                total_mass += cm.m;
                for k in 0..3 {
                    com[k] += cm.m * cm.com[k];
                }
            }
            if total_mass > 0.0 {
                for k in 0..3 {
                    com[k] /= total_mass;
                }
            } else {
                com = center;
            }

            let mut r_max_shift: f64 = 0.0;
            for child in c.progeny.iter().flatten() {
                let cm = unsafe { self.cell(*child).multipole.get() }.clone();
                if cm.m > 0.0 {
                    let d = dist(com, cm.com);
                    r_max_shift = r_max_shift.max(cm.r_max + d);
                    multipole::multipole_add(&mut m, &multipole::m2m(&cm, com));
                } else {
                    m.com = com;
                }
            }
            m.com = com;
            // retain the tighter of the child-shift bound and the corner bound
            let r_max_corner = corners
                .iter()
                .map(|&corner| dist(com, corner))
                .fold(0.0_f64, f64::max);
            m.r_max = r_max_shift.min(r_max_corner);
        } else if gw.count > 0 {
            let gparts = unsafe { self.gparts.window(gw.first, gw.count) };
            multipole::p2m(&mut m, gparts);
            m.r_max = corners
                .iter()
                .map(|&corner| dist(m.com, corner))
                .fold(0.0_f64, f64::max);
        } else {
            m.com = center;
            m.r_max = 0.0;
        }

        let c = self.cell(cid);
        // sole builder of this subtree
        unsafe { *c.multipole.get_racy_mut() = m };
        c.ti_old_multipole.store(ti, Ordering::Relaxed);

        #[cfg(debug_assertions)]
        self.verify_multipole(cid);
    }

    /// Checks the recursively built multipole against a brute-force `P2M`
    /// over the subtree's particles.
    #[cfg(debug_assertions)]
    fn verify_multipole(&self, cid: CellId) {
        use float_cmp::approx_eq;

        let c = self.cell(cid);
        let gw = c.gparts;
        if gw.count == 0 {
            return;
        }
        let w_max = c.width[0].max(c.width[1]).max(c.width[2]);
        let m = unsafe { c.multipole.get() }.clone();
        let gparts = unsafe { self.gparts.window(gw.first, gw.count) };
        let mut brute = Multipole::default();
        multipole::p2m(&mut brute, gparts);
        let brute_r_max = gparts
            .iter()
            .map(|g| dist(m.com, g.x))
            .fold(0.0_f64, f64::max);

        assert!(
            approx_eq!(f64, m.m, brute.m, epsilon = 1e-3 * brute.m.abs()),
            "multipole mass diverges from brute force at depth {}: {} vs {}",
            c.depth,
            m.m,
            brute.m
        );
        for k in 0..3 {
            assert!(
                (m.com[k] - brute.com[k]).abs() <= 1e-3 * c.dmin,
                "multipole CoM diverges from brute force at depth {}",
                c.depth
            );
        }
        assert!(
            m.r_max + 1e-12 >= brute_r_max,
            "r_max {} does not majorise the particle bound {}",
            m.r_max,
            brute_r_max
        );
        assert!(
            m.r_max * m.r_max <= 3.0 * w_max * w_max + 1e-12,
            "r_max {} exceeds the cell diagonal",
            m.r_max
        );
    }

    /// Clamps absurd smoothing lengths in small subtrees, then recomputes
    /// `h_max` bottom-up. A subtree is sanitised once its local count drops
    /// below the configured threshold and its parent has not already been.
    pub fn sanitize(&mut self, cid: CellId, parent_sanitized: bool) {
        let c = self.cell(cid);
        let count = c.parts.count;
        let do_clamp = !parent_sanitized && count < self.params.sanitize_threshold;
        let upper = c.dmin / (1.2 * KERNEL_GAMMA);
        let pw = c.parts;
        let progeny = c.progeny;
        let split = c.split;

        if do_clamp {
            // the window covers the whole subtree's particles
            let parts = self.parts.as_mut_slice();
            for p in &mut parts[pw.range()] {
                if p.h == 0.0 || p.h > upper {
                    p.h = upper;
                }
            }
        }

        for child in progeny.into_iter().flatten() {
            self.sanitize(child, parent_sanitized || do_clamp);
        }

        // recompute h_max bottom-up
        let c = self.cell(cid);
        let h_max = if split {
            c.progeny
                .iter()
                .flatten()
                .map(|&child| self.cell(child).h_max.load())
                .fold(0.0_f64, f64::max)
        } else {
            let parts = self.parts.as_mut_slice();
            parts[pw.range()].iter().map(|p| p.h).fold(0.0_f64, f64::max)
        };
        self.cell(cid).h_max.store(h_max);
    }

    /// Verifies the structural invariants of the subtree rooted at `cid`;
    /// panics with a diagnostic on the first violation.
    pub fn check_integrity(&self, cid: CellId) {
        let c = self.cell(cid);
        if !c.split {
            for i in c.parts.range() {
                let p = unsafe { self.parts.get(i) };
                for k in 0..3 {
                    assert!(
                        p.x[k] >= c.loc[k] && p.x[k] <= c.loc[k] + c.width[k],
                        "particle {i} outside its leaf on axis {k} at depth {}",
                        c.depth
                    );
                }
            }
            return;
        }

        let mut part_total = 0;
        let mut gpart_total = 0;
        let mut spart_total = 0;
        let mut next_part = c.parts.first;
        for (k, child) in c.progeny.iter().enumerate() {
            let child = child.unwrap_or_else(|| panic!("split cell with a missing progeny slot {k}"));
            let cp = self.cell(child);
            assert_eq!(
                cp.parts.first, next_part,
                "progeny {k} window not contiguous at depth {}",
                c.depth
            );
            next_part += cp.parts.count;
            part_total += cp.parts.count;
            gpart_total += cp.gparts.count;
            spart_total += cp.sparts.count;

            assert!(
                cp.h_max.load() <= c.h_max.load() + 1e-12,
                "child h_max exceeds parent at depth {}",
                c.depth
            );
            assert!(
                cp.dx_max_part.load() <= c.dx_max_part.load() + 1e-12,
                "child dx_max_part exceeds parent at depth {}",
                c.depth
            );

            // octant containment under the >= classifier
            let pivot = c.center();
            for i in cp.parts.range() {
                let p = unsafe { self.parts.get(i) };
                let expect = usize::from(p.x[0] >= pivot[0]) << 2
                    | usize::from(p.x[1] >= pivot[1]) << 1
                    | usize::from(p.x[2] >= pivot[2]);
                assert_eq!(expect, k, "particle {i} sorted into the wrong octant");
            }

            self.check_integrity(child);
        }
        assert_eq!(part_total, c.parts.count, "progeny gas counts do not sum to parent");
        assert_eq!(gpart_total, c.gparts.count, "progeny gravity counts do not sum to parent");
        assert_eq!(spart_total, c.sparts.count, "progeny star counts do not sum to parent");
    }
}

/// Euclidean distance.
fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx.mul_add(dx, dy.mul_add(dy, dz * dz)).sqrt()
}

/// The eight corners of a box.
fn cell_corners(loc: [f64; 3], width: [f64; 3]) -> [[f64; 3]; 8] {
    let mut corners = [[0.0; 3]; 8];
    for (k, corner) in corners.iter_mut().enumerate() {
        corner[0] = loc[0] + if k & 4 != 0 { width[0] } else { 0.0 };
        corner[1] = loc[1] + if k & 2 != 0 { width[1] } else { 0.0 };
        corner[2] = loc[2] + if k & 1 != 0 { width[2] } else { 0.0 };
    }
    corners
}

/// Counting-sort permutation of `items` into `nbuckets` buckets given the
/// per-item bucket `keys`, with an optional auxiliary array permuted in
/// lockstep. Returns the bucket offsets, `nbuckets + 1` entries.
fn permute_into_buckets<T, A>(
    items: &mut [T],
    mut aux: Option<&mut [A]>,
    keys: &[usize],
    nbuckets: usize,
) -> Vec<usize> {
    debug_assert_eq!(items.len(), keys.len());
    let mut offsets = vec![0_usize; nbuckets + 1];
    for &k in keys {
        offsets[k + 1] += 1;
    }
    for b in 1..=nbuckets {
        offsets[b] += offsets[b - 1];
    }

    let mut keys = keys.to_vec();
    let mut cursors = offsets[..nbuckets].to_vec();
    for b in 0..nbuckets {
        while cursors[b] < offsets[b + 1] {
            let slot = cursors[b];
            loop {
                let occupant = keys[slot];
                if occupant == b {
                    break;
                }
                let dest = cursors[occupant];
                cursors[occupant] += 1;
                items.swap(slot, dest);
                keys.swap(slot, dest);
                if let Some(aux) = aux.as_deref_mut() {
                    aux.swap(slot, dest);
                }
            }
            cursors[b] += 1;
        }
    }
    offsets
}

/// In-place bucket-cycle partition of `items` into the eight octants, with
/// an optional auxiliary array cycled in lockstep. Returns the per-octant
/// counts.
///
/// For each slot below its bucket boundary the occupant is swapped towards
/// its target bucket's next free slot until the occupant belongs to the
/// current bucket; every swap finalises one slot, so the pass is `O(n)`.
fn bucket_cycle<T, A>(items: &mut [T], aux: Option<&mut [A]>, keys: &[usize]) -> [usize; 8] {
    let offsets = permute_into_buckets(items, aux, keys, 8);
    let mut counts = [0_usize; 8];
    for b in 0..8 {
        counts[b] = offsets[b + 1] - offsets[b];
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::part::NO_LINK;
    use rand::Rng;
    use rand_pcg::Pcg64;

    fn linked_cloud(n: usize, dim: f64, seed: u64) -> Space {
        let mut rng = Pcg64::new(seed as u128, 0xa02bdbf7bb3c0a7);
        let mut parts = Vec::new();
        let mut gparts = Vec::new();
        for i in 0..n {
            let x = [
                rng.gen_range(0.0..dim),
                rng.gen_range(0.0..dim),
                rng.gen_range(0.0..dim),
            ];
            let mut p = Part::at(x, 0.05, 1.0);
            p.gpart = u32::try_from(i).unwrap();
            parts.push(p);
            let mut g = GPart::dark(x, 1.0);
            g.link = GPartLink::Gas(u32::try_from(i).unwrap());
            gparts.push(g);
        }
        let mut params = SpaceParams::default();
        params.set_split_threshold(16);
        params.set_top_grid(3);
        Space::with_particles([dim; 3], params, parts, gparts, Vec::new())
    }

    #[test]
    fn bucket_cycle_partitions() {
        let mut items = vec![3, 1, 0, 2, 1, 3, 0, 0];
        let keys = items.clone();
        let counts = bucket_cycle(&mut items, None::<&mut [i32]>, &keys);
        assert_eq!(counts, [3, 2, 1, 2, 0, 0, 0, 0]);
        assert_eq!(items, vec![0, 0, 0, 1, 1, 2, 3, 3]);
    }

    #[test]
    fn octant_centres_subdivide() {
        // eight particles at the eight octant centres of a unit-ish cell
        let mut parts = Vec::new();
        for k in 0..8 {
            let x = [
                if k & 4 != 0 { 1.5 } else { 0.5 },
                if k & 2 != 0 { 1.5 } else { 0.5 },
                if k & 1 != 0 { 1.5 } else { 0.5 },
            ];
            let mut p = Part::at(x, 0.25, 1.0);
            p.gpart = NO_LINK;
            parts.push(p);
        }
        let mut space = Space::new([6.0; 3], SpaceParams::default());
        space.parts = SharedVec::from_vec(parts);
        space.xparts = SharedVec::from_vec(vec![XPart::default(); 8]);
        let cid = space.insert_test_cell([0.0; 3], [2.0; 3], 0, None);
        space.cell_mut(cid).parts = Window { first: 0, count: 8 };

        let h_before = 0.25;
        space.subdivide(cid);

        let c = space.cell(cid);
        assert!(c.split);
        for (k, child) in c.progeny.iter().enumerate() {
            let cp = space.cell(child.unwrap());
            assert_eq!(cp.parts.count, 1, "octant {k} does not hold exactly one particle");
            let p = unsafe { space.parts.get(cp.parts.first) };
            assert_eq!(c.octant(&p.x), k);
        }
        // h_max untouched by a pure permutation
        let max_h = (0..8)
            .map(|i| unsafe { space.parts.get(i) }.h)
            .fold(0.0_f64, f64::max);
        assert_eq!(max_h, h_before);
        space.check_integrity(cid);
    }

    #[test]
    fn rebuild_random_cloud() {
        let mut space = linked_cloud(500, 6.0, 42);
        space.rebuild(0);
        for &top in &space.top_cells().to_vec() {
            space.check_integrity(top);
        }
        // every particle accounted for exactly once
        let total: usize = space.top_cells().iter().map(|&c| space.cell(c).parts.count).sum();
        assert_eq!(total, 500);
    }

    #[test]
    fn rebuild_keeps_links_consistent() {
        let mut space = linked_cloud(300, 4.0, 7);
        space.rebuild(0);
        for i in 0..space.parts.len() {
            let p = unsafe { space.parts.get(i) };
            let g = unsafe { space.gparts.get(p.gpart as usize) };
            assert_eq!(g.link, GPartLink::Gas(u32::try_from(i).unwrap()));
            assert_eq!(g.x, p.x);
        }
    }

    #[test]
    fn subtree_size_counts_nodes() {
        let mut space = linked_cloud(200, 4.0, 3);
        space.rebuild(0);
        let total: usize = space
            .top_cells()
            .iter()
            .map(|&c| space.subtree_size(c))
            .sum();
        assert_eq!(total, space.cell_count());
    }

    #[test]
    fn link_particles_round_trip() {
        let mut space = linked_cloud(400, 6.0, 11);
        space.rebuild(0);
        let tops = space.top_cells().to_vec();
        for &top in &tops {
            let c = space.cell(top);
            let (pb, gb, sb) = (c.parts.first, c.gparts.first, c.sparts.first);
            let before: Vec<_> = (0..space.cell_count())
                .map(|i| space.cell(u32::try_from(i).unwrap()).parts)
                .collect();
            space.link_particles(top, pb, gb, sb);
            let after: Vec<_> = (0..space.cell_count())
                .map(|i| space.cell(u32::try_from(i).unwrap()).parts)
                .collect();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn sanitize_clamps_zero_h() {
        let mut space = linked_cloud(100, 4.0, 9);
        space.parts.as_mut_slice()[3].h = 0.0;
        space.parts.as_mut_slice()[7].h = 1e10;
        space.rebuild(0);
        let tops = space.top_cells().to_vec();
        for &top in &tops {
            space.sanitize(top, false);
        }
        for i in 0..space.parts.len() {
            let p = unsafe { space.parts.get(i) };
            assert!(p.h > 0.0 && p.h < 1e10);
        }
    }

    #[test]
    #[should_panic(expected = "at least 3 top-level cells")]
    fn tiny_top_grid_rejected() {
        let mut params = SpaceParams::default();
        params.set_top_grid(2);
    }
}
