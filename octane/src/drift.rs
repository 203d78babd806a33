//! The drift engine.
//!
//! Brings a subtree's particle and multipole state up to the current
//! integer time, on demand, and maintains the per-cell envelopes the
//! admission tests depend on. Drifting is idempotent and monotonic: a
//! second call with the same target is a no-op, and a target earlier than
//! the cell's recorded time is a fatal programming error.

use crate::cell::{CellFlags, CellId};
use crate::hydro::Hydro;
use crate::integrator::Integrator;
use crate::multipole::gravity_drift;
use crate::scheduler::Scheduler;
use crate::space::Space;
use crate::task::TaskId;
use crate::timeline::{is_active_bin, IntegerTime};
use std::sync::atomic::Ordering;

/// Everything a drift needs besides the cell: the collaborators and the
/// time axis.
pub struct DriftContext<'a> {
    /// The spatial container.
    pub space: &'a Space,
    /// The integration flavour.
    pub integrator: &'a crate::integrator::IntegratorEnum,
    /// The SPH flavour.
    pub hydro: &'a crate::hydro::HydroEnum,
    /// Target integer time.
    pub ti_current: IntegerTime,
    /// Physical length of one integer tick.
    pub time_base: f64,
}

/// Drifts the gas particles of the subtree rooted at `cid`.
///
/// The caller must hold the gas subtree lock on `cid`, or be in a serial
/// phase. The recursion descends where the sub-drift flags point and the
/// leaves integrate through the collaborator; maxima are folded upward on
/// the way back.
pub fn drift_part_cell(ctx: &DriftContext, cid: CellId, force: bool) {
    let c = ctx.space.cell(cid);
    let ti_old = c.ti_old_part.load(Ordering::Relaxed);
    assert!(
        ctx.ti_current >= ti_old,
        "drifting cell at depth {} backwards: {} < {}",
        c.depth,
        ctx.ti_current,
        ti_old
    );

    let force = force || c.has_flag(CellFlags::DO_PART_DRIFT);

    if c.split && (force || c.has_flag(CellFlags::DO_SUB_PART_DRIFT)) {
        let mut h_max: f64 = 0.0;
        let mut dx_max: f64 = 0.0;
        let mut dx_max_sort: f64 = 0.0;
        for child in c.progeny.iter().flatten() {
            drift_part_cell(ctx, *child, force);
            let cp = ctx.space.cell(*child);
            h_max = h_max.max(cp.h_max.load());
            dx_max = dx_max.max(cp.dx_max_part.load());
            dx_max_sort = dx_max_sort.max(cp.dx_max_sort.load());
        }
        c.h_max.store(h_max);
        c.dx_max_part.store(dx_max);
        c.dx_max_sort.store(dx_max_sort);
        c.ti_old_part.store(ctx.ti_current, Ordering::Relaxed);
    } else if !c.split && force && ctx.ti_current > ti_old {
        let dt = (ctx.ti_current - ti_old) as f64 * ctx.time_base;
        let h_max_global = ctx.space.params().h_max();
        let mut h_max: f64 = 0.0;
        let mut dx2_max: f64 = 0.0;
        let mut dx2_max_sort: f64 = 0.0;

        // sole writer of this window by the lock protocol
        let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
        let xparts = unsafe { ctx.space.xparts.window_mut(c.parts.first, c.parts.count) };
        for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
            ctx.integrator.drift_part(p, xp, dt);
            p.ti_drift = ctx.ti_current;
            if p.h > h_max_global {
                p.h = h_max_global;
            }

            let dx2 = xp.x_diff.iter().map(|d| d * d).sum::<f64>();
            let dx2_sort = xp.x_diff_sort.iter().map(|d| d * d).sum::<f64>();
            dx2_max = dx2_max.max(dx2);
            dx2_max_sort = dx2_max_sort.max(dx2_sort);
            h_max = h_max.max(p.h);

            if is_active_bin(p.time_bin, ctx.ti_current) {
                ctx.hydro.init_density_accumulator(p);
            }
        }

        c.h_max.store(h_max);
        c.dx_max_part.store(dx2_max.sqrt());
        c.dx_max_sort.store(dx2_max_sort.sqrt());
        c.ti_old_part.store(ctx.ti_current, Ordering::Relaxed);

        // stale sorts are dropped once the envelope outgrows the cell scale
        if dx2_max_sort.sqrt() > ctx.space.params().maxreldx() * c.dmin {
            c.sorted.store(0, Ordering::Release);
        }
    }

    c.clear_flags(CellFlags::DO_PART_DRIFT | CellFlags::DO_SUB_PART_DRIFT);
}

/// Drifts the gravity particles of the subtree rooted at `cid`; the
/// gravity-side analogue of [`drift_part_cell`].
pub fn drift_gpart_cell(ctx: &DriftContext, cid: CellId, force: bool) {
    let c = ctx.space.cell(cid);
    let ti_old = c.ti_old_gpart.load(Ordering::Relaxed);
    assert!(
        ctx.ti_current >= ti_old,
        "drifting cell at depth {} backwards: {} < {}",
        c.depth,
        ctx.ti_current,
        ti_old
    );

    let force = force || c.has_flag(CellFlags::DO_GPART_DRIFT);

    if c.split && (force || c.has_flag(CellFlags::DO_SUB_GPART_DRIFT)) {
        let mut dx_max: f64 = 0.0;
        for child in c.progeny.iter().flatten() {
            drift_gpart_cell(ctx, *child, force);
            dx_max = dx_max.max(ctx.space.cell(*child).dx_max_gpart.load());
        }
        c.dx_max_gpart.store(dx_max);
        c.ti_old_gpart.store(ctx.ti_current, Ordering::Relaxed);
    } else if !c.split && force && ctx.ti_current > ti_old {
        let dt = (ctx.ti_current - ti_old) as f64 * ctx.time_base;
        let mut dx2_max: f64 = 0.0;

        let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
        for g in gparts.iter_mut() {
            let x_old = g.x;
            ctx.integrator.drift_gpart(g, dt);
            g.ti_drift = ctx.ti_current;
            let dx2 = (0..3).map(|k| (g.x[k] - x_old[k]).powi(2)).sum::<f64>();
            dx2_max = dx2_max.max(dx2);
        }
        let sparts = unsafe { ctx.space.sparts.window_mut(c.sparts.first, c.sparts.count) };
        for s in sparts.iter_mut() {
            ctx.integrator.drift_spart(s, dt);
            s.ti_drift = ctx.ti_current;
        }

        c.dx_max_gpart.fetch_max(dx2_max.sqrt());
        c.ti_old_gpart.store(ctx.ti_current, Ordering::Relaxed);
    }

    c.clear_flags(CellFlags::DO_GPART_DRIFT | CellFlags::DO_SUB_GPART_DRIFT);
}

/// Advances the single multipole at `cid` to `ti`. The caller must hold
/// the cell's multipole lock.
pub fn drift_multipole(ctx: &DriftContext, cid: CellId) {
    let c = ctx.space.cell(cid);
    let ti_old = c.ti_old_multipole.load(Ordering::Relaxed);
    assert!(
        ctx.ti_current >= ti_old,
        "drifting multipole at depth {} backwards: {} < {}",
        c.depth,
        ctx.ti_current,
        ti_old
    );
    if ctx.ti_current == ti_old {
        return;
    }
    let dt = (ctx.ti_current - ti_old) as f64 * ctx.time_base;
    // caller holds mlock
    let m = unsafe { c.multipole.get_racy_mut() };
    gravity_drift(m, dt, c.dx_max_gpart.load());
    c.ti_old_multipole.store(ctx.ti_current, Ordering::Relaxed);
}

/// Recursively drifts every multipole of the subtree. Serial-phase helper.
pub fn drift_all_multipoles(ctx: &DriftContext, cid: CellId) {
    drift_multipole(ctx, cid);
    let c = ctx.space.cell(cid);
    for child in c.progeny.iter().flatten() {
        drift_all_multipoles(ctx, *child);
    }
}

/// Records the intent to drift the gas particles of `cid` this step: marks
/// the cell, walks up marking the sub-drift aggregate, and activates the
/// drift task at the registered hydro super-cell. Short-circuits as soon
/// as a flag is already set, which keeps activation `O(active cells)`.
pub fn cell_activate_drift_part(space: &Space, sched: &Scheduler, cid: CellId) {
    let c = space.cell(cid);
    if c.test_and_set_flag(CellFlags::DO_PART_DRIFT) {
        return;
    }

    if c.super_hydro == Some(cid) {
        let task = drift_task_of(space, cid, CellFlags::DO_PART_DRIFT);
        sched.activate(task);
        return;
    }

    let mut finger = c.parent;
    while let Some(up) = finger {
        let anc = space.cell(up);
        if anc.test_and_set_flag(CellFlags::DO_SUB_PART_DRIFT) {
            break;
        }
        if c.super_hydro == Some(up) {
            let task = drift_task_of(space, up, CellFlags::DO_PART_DRIFT);
            sched.activate(task);
            break;
        }
        finger = anc.parent;
    }
}

/// Gravity-side analogue of [`cell_activate_drift_part`].
pub fn cell_activate_drift_gpart(space: &Space, sched: &Scheduler, cid: CellId) {
    let c = space.cell(cid);
    if c.test_and_set_flag(CellFlags::DO_GPART_DRIFT) {
        return;
    }

    if c.super_grav == Some(cid) {
        let task = drift_task_of(space, cid, CellFlags::DO_GPART_DRIFT);
        sched.activate(task);
        return;
    }

    let mut finger = c.parent;
    while let Some(up) = finger {
        let anc = space.cell(up);
        if anc.test_and_set_flag(CellFlags::DO_SUB_GPART_DRIFT) {
            break;
        }
        if c.super_grav == Some(up) {
            let task = drift_task_of(space, up, CellFlags::DO_GPART_DRIFT);
            sched.activate(task);
            break;
        }
        finger = anc.parent;
    }
}

/// The drift task registered at `cid` for the given kind.
fn drift_task_of(space: &Space, cid: CellId, which: CellFlags) -> TaskId {
    let c = space.cell(cid);
    let task = if which == CellFlags::DO_PART_DRIFT {
        c.tasks.drift_part
    } else {
        c.tasks.drift_gpart
    };
    task.unwrap_or_else(|| {
        panic!(
            "no drift task registered at the super-cell (depth {})",
            c.depth
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hydro::HydroEnum;
    use crate::integrator::IntegratorEnum;
    use crate::part::{GPart, GPartLink, Part};
    use crate::space::SpaceParams;
    use rand::Rng;
    use rand_pcg::Pcg64;

    fn moving_cloud(n: usize, dim: f64) -> Space {
        let mut rng = Pcg64::new(0xcafef00dd15ea5e5, 0xa02bdbf7bb3c0a7);
        let mut parts = Vec::new();
        let mut gparts = Vec::new();
        for i in 0..n {
            let x = [
                rng.gen_range(0.0..dim),
                rng.gen_range(0.0..dim),
                rng.gen_range(0.0..dim),
            ];
            let v = [
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
                rng.gen_range(-1.0..1.0),
            ];
            let mut p = Part::at(x, 0.05, 1.0);
            p.v = v;
            p.gpart = u32::try_from(i).unwrap();
            parts.push(p);
            let mut g = GPart::dark(x, 1.0);
            g.v = v;
            g.link = GPartLink::Gas(u32::try_from(i).unwrap());
            gparts.push(g);
        }
        let mut params = SpaceParams::default();
        params.set_split_threshold(32);
        params.set_top_grid(3);
        let mut space = Space::with_particles([dim; 3], params, parts, gparts, Vec::new());
        space.rebuild(0);
        space
    }

    fn ctx<'a>(
        space: &'a Space,
        integrator: &'a IntegratorEnum,
        hydro: &'a HydroEnum,
        ti: IntegerTime,
    ) -> DriftContext<'a> {
        DriftContext {
            space,
            integrator,
            hydro,
            ti_current: ti,
            time_base: 1e-3,
        }
    }

    #[test]
    fn forced_drift_stamps_everything() {
        let space = moving_cloud(200, 6.0);
        let integrator = IntegratorEnum::from(crate::integrator::Leapfrog);
        let hydro = HydroEnum::from(crate::hydro::MinimalSph);
        let ctx = ctx(&space, &integrator, &hydro, 64);

        for &top in space.top_cells() {
            drift_part_cell(&ctx, top, true);
        }
        for &top in space.top_cells() {
            let c = space.cell(top);
            assert_eq!(c.ti_old_part.load(Ordering::Relaxed), 64);
            for i in c.parts.range() {
                assert_eq!(unsafe { space.parts.get(i) }.ti_drift, 64);
            }
        }
    }

    #[test]
    fn drift_is_idempotent() {
        let space = moving_cloud(100, 4.0);
        let integrator = IntegratorEnum::from(crate::integrator::Leapfrog);
        let hydro = HydroEnum::from(crate::hydro::MinimalSph);
        let ctx = ctx(&space, &integrator, &hydro, 32);

        for &top in space.top_cells() {
            drift_part_cell(&ctx, top, true);
        }
        let positions: Vec<[f64; 3]> = (0..space.parts.len())
            .map(|i| unsafe { space.parts.get(i) }.x)
            .collect();
        for &top in space.top_cells() {
            drift_part_cell(&ctx, top, true);
        }
        for (i, &x) in positions.iter().enumerate() {
            assert_eq!(unsafe { space.parts.get(i) }.x, x);
        }
    }

    #[test]
    fn envelopes_are_monotone_down_the_tree() {
        let space = moving_cloud(400, 6.0);
        let integrator = IntegratorEnum::from(crate::integrator::Leapfrog);
        let hydro = HydroEnum::from(crate::hydro::MinimalSph);
        let ctx = ctx(&space, &integrator, &hydro, 128);
        for &top in space.top_cells() {
            drift_part_cell(&ctx, top, true);
        }
        fn walk(space: &Space, cid: CellId) {
            let c = space.cell(cid);
            for child in c.progeny.iter().flatten() {
                let cp = space.cell(*child);
                assert!(cp.h_max.load() <= c.h_max.load() + 1e-12);
                assert!(cp.dx_max_part.load() <= c.dx_max_part.load() + 1e-12);
                walk(space, *child);
            }
        }
        for &top in space.top_cells() {
            walk(&space, top);
        }
    }

    #[test]
    #[should_panic(expected = "backwards")]
    fn backwards_drift_aborts() {
        let space = moving_cloud(50, 4.0);
        let integrator = IntegratorEnum::from(crate::integrator::Leapfrog);
        let hydro = HydroEnum::from(crate::hydro::MinimalSph);
        {
            let ctx = ctx(&space, &integrator, &hydro, 64);
            for &top in space.top_cells() {
                drift_part_cell(&ctx, top, true);
            }
        }
        let ctx = ctx(&space, &integrator, &hydro, 32);
        drift_part_cell(&ctx, space.top_cells()[0], true);
    }

    #[test]
    fn multipole_drift_is_idempotent() {
        let space = moving_cloud(100, 4.0);
        let integrator = IntegratorEnum::from(crate::integrator::Leapfrog);
        let hydro = HydroEnum::from(crate::hydro::MinimalSph);
        let ctx = ctx(&space, &integrator, &hydro, 16);
        let top = space.top_cells()[0];
        drift_all_multipoles(&ctx, top);
        let com = unsafe { space.cell(top).multipole.get() }.com;
        drift_all_multipoles(&ctx, top);
        assert_eq!(unsafe { space.cell(top).multipole.get() }.com, com);
    }
}
