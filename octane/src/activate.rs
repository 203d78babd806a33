//! The task-graph activator.
//!
//! Once per step, each super-cell's pre-constructed task stubs are walked
//! and exactly those that must run are un-skipped, together with the
//! minimal supporting prerequisites: drifts, sorts, sends and receives.
//! The walk also performs the geometric rebuild test and reports its
//! verdict up to the step reducer.

use crate::cell::CellId;
use crate::drift::{cell_activate_drift_gpart, cell_activate_drift_part, drift_multipole, DriftContext};
use crate::hydro::{HydroEnum, KERNEL_GAMMA};
use crate::integrator::IntegratorEnum;
use crate::lock::{lock_subtree, LockKind};
use crate::multipole::m2l_accept;
use crate::scheduler::Scheduler;
use crate::sort::get_sort_id;
use crate::space::Space;
use crate::task::{SendKind, TaskKind};
use crate::timeline::IntegerTime;
use crate::transport::Rank;
use std::sync::atomic::Ordering;

/// Everything the activation pass needs.
pub struct ActivationContext<'a> {
    /// The spatial container.
    pub space: &'a Space,
    /// The task arena.
    pub sched: &'a Scheduler,
    /// The integration flavour, for multipole drifts during traversal.
    pub integrator: &'a IntegratorEnum,
    /// The SPH flavour.
    pub hydro: &'a HydroEnum,
    /// Current integer time.
    pub ti_current: IntegerTime,
    /// Physical length of one integer tick.
    pub time_base: f64,
    /// This rank.
    pub rank: Rank,
    /// Squared opening angle for the acceptance criterion.
    pub theta_crit_sq: f64,
    /// Whether the extra gradient loop is configured.
    pub with_gradient: bool,
}

impl<'a> ActivationContext<'a> {
    fn drift_ctx(&self) -> DriftContext<'a> {
        DriftContext {
            space: self.space,
            integrator: self.integrator,
            hydro: self.hydro,
            ti_current: self.ti_current,
            time_base: self.time_base,
        }
    }

    fn is_local(&self, cid: CellId) -> bool {
        self.space.cell(cid).nodeid == self.rank
    }
}

/// Assigns every cell's super pointers: the shallowest self-or-ancestor
/// owning tasks of the relevant class. Must run after task construction
/// and before activation.
pub fn set_super_pointers(space: &mut Space) {
    for top in space.top_cells().to_vec() {
        set_super_pointers_in(space, top, None, None, None);
    }
}

fn set_super_pointers_in(
    space: &mut Space,
    cid: CellId,
    super_hydro: Option<CellId>,
    super_grav: Option<CellId>,
    super_all: Option<CellId>,
) {
    let c = space.cell(cid);
    let owns_hydro = !c.tasks.density.is_empty()
        || c.tasks.drift_part.is_some()
        || c.tasks.sort.is_some()
        || c.tasks.ghost.is_some();
    let owns_grav =
        !c.tasks.grav.is_empty() || c.tasks.drift_gpart.is_some() || c.tasks.init_grav.is_some();
    let owns_all = c.tasks.kick1.is_some() || c.tasks.timestep.is_some();

    let super_hydro = super_hydro.or_else(|| owns_hydro.then_some(cid));
    let super_grav = super_grav.or_else(|| owns_grav.then_some(cid));
    let super_all = super_all.or_else(|| owns_all.then_some(cid));

    let progeny = c.progeny;
    {
        let c = space.cell_mut(cid);
        c.super_hydro = super_hydro;
        c.super_grav = super_grav;
        c.super_all = super_all;
    }
    for child in progeny.into_iter().flatten() {
        set_super_pointers_in(space, child, super_hydro, super_grav, super_all);
    }
}

/// Decides whether the pair `(ci, cj)` has degraded enough to force a
/// rebuild: either sort envelope outgrew its cell, or the kernel support
/// plus accumulated motion no longer fits the inter-cell buffer.
#[must_use]
pub fn need_rebuild(space: &Space, ci: CellId, cj: CellId) -> bool {
    let a = space.cell(ci);
    let b = space.cell(cj);
    let maxreldx = space.params().maxreldx();
    if a.dx_max_sort.load() > maxreldx * a.dmin || b.dx_max_sort.load() > maxreldx * b.dmin {
        return true;
    }
    KERNEL_GAMMA * a.h_max.load().max(b.h_max.load()) + a.dx_max_part.load() + b.dx_max_part.load()
        > b.dmin
}

/// Requests a sort of `cid` in direction `sid`: drops a stale cache,
/// marks the pending direction and activates the owning sort task.
pub fn cell_activate_sorts(ctx: &ActivationContext, cid: CellId, sid: usize) {
    let c = ctx.space.cell(cid);
    if c.dx_max_sort.load() > ctx.space.params().maxreldx() * c.dmin {
        c.sorted.store(0, Ordering::Release);
    }
    if c.sorted.load(Ordering::Acquire) & (1 << sid) != 0 {
        return;
    }
    c.do_sort.fetch_or(1 << sid, Ordering::AcqRel);

    let mut finger = Some(cid);
    while let Some(f) = finger {
        let fc = ctx.space.cell(f);
        if let Some(task) = fc.tasks.sort {
            ctx.sched.activate(task);
            return;
        }
        finger = fc.parent;
    }
    panic!(
        "no sort task anchored above cell at depth {}",
        ctx.space.cell(cid).depth
    );
}

/// Records the sort demand of a pair interaction in both cells: the
/// required direction, the sort-bound snapshot, then the drifts (first)
/// and the sorts (second).
fn record_pair_sort_demand(ctx: &ActivationContext, ci: CellId, cj: CellId, sid: usize) {
    let a = ctx.space.cell(ci);
    let b = ctx.space.cell(cj);
    a.requires_sorts.fetch_or(1 << sid, Ordering::AcqRel);
    b.requires_sorts.fetch_or(1 << sid, Ordering::AcqRel);
    a.dx_max_sort_old.store(a.dx_max_sort.load());
    b.dx_max_sort_old.store(b.dx_max_sort.load());

    // the sort task consumes drifted positions
    if ctx.is_local(ci) {
        cell_activate_drift_part(ctx.space, ctx.sched, ci);
    }
    if ctx.is_local(cj) {
        cell_activate_drift_part(ctx.space, ctx.sched, cj);
    }
    cell_activate_sorts(ctx, ci, sid);
    cell_activate_sorts(ctx, cj, sid);
}

/// Un-skips the hydro tasks anchored at `cid` for this step; returns
/// whether the pair walk demands a rebuild.
pub fn unskip_hydro(ctx: &ActivationContext, cid: CellId) -> bool {
    let mut rebuild = false;
    let c = ctx.space.cell(cid);

    for &tid in &c.tasks.density {
        let task = ctx.sched.task(tid);
        let ci = task.ci.unwrap_or_else(|| panic!("density task {tid} with no first cell"));
        let ci_active = ctx.space.cell(ci).is_active_hydro(ctx.ti_current);
        let ci_local = ctx.is_local(ci);

        match task.cj {
            None => {
                if ci_local && ci_active {
                    task.activate();
                    match task.kind {
                        TaskKind::SelfInteraction => {
                            cell_activate_drift_part(ctx.space, ctx.sched, ci);
                        }
                        TaskKind::SubSelf => activate_subcell_hydro(ctx, ci, None),
                        other => panic!("self-side density task of kind {other:?}"),
                    }
                }
            }
            Some(cj) => {
                let cj_active = ctx.space.cell(cj).is_active_hydro(ctx.ti_current);
                let cj_local = ctx.is_local(cj);
                if !(ci_local && ci_active) && !(cj_local && cj_active) {
                    continue;
                }
                task.activate();
                match task.kind {
                    TaskKind::PairInteraction => {
                        let sid = task.flags as usize;
                        record_pair_sort_demand(ctx, ci, cj, sid);
                    }
                    TaskKind::SubPair => activate_subcell_hydro(ctx, ci, Some(cj)),
                    other => panic!("pair-side density task of kind {other:?}"),
                }
                if need_rebuild(ctx.space, ci, cj) {
                    tracing::debug!(ci, cj, "pair degraded, requesting rebuild");
                    rebuild = true;
                }
                if !ci_local {
                    activate_hydro_exchange(ctx, ci, cj, ci_active, cj_active);
                } else if !cj_local {
                    activate_hydro_exchange(ctx, cj, ci, cj_active, ci_active);
                }
            }
        }
    }

    if c.nodeid == ctx.rank && c.is_active_hydro(ctx.ti_current) {
        if ctx.with_gradient {
            for &tid in &c.tasks.gradient {
                ctx.sched.activate(tid);
            }
        }
        for &tid in &c.tasks.force {
            ctx.sched.activate(tid);
        }
        for task in [
            c.tasks.ghost,
            c.tasks.kick1,
            c.tasks.kick2,
            c.tasks.timestep,
            c.tasks.end_force,
            c.tasks.cooling,
            c.tasks.sourceterms,
        ]
        .into_iter()
        .flatten()
        {
            ctx.sched.activate(task);
        }
    }

    rebuild
}

/// Activates the send/recv cooperation for a hydro pair with `foreign` on
/// the other rank and `local` here.
fn activate_hydro_exchange(
    ctx: &ActivationContext,
    foreign: CellId,
    local: CellId,
    foreign_active: bool,
    local_active: bool,
) {
    let fc = ctx.space.cell(foreign);
    let lc = ctx.space.cell(local);
    let peer = fc.nodeid;

    if local_active {
        for kind in [SendKind::Xv, SendKind::Rho] {
            let recv = fc.tasks.recv_for(kind).unwrap_or_else(|| {
                panic!("foreign cell without a {kind:?} receive endpoint")
            });
            ctx.sched.activate(recv);
        }
        if ctx.with_gradient {
            let recv = fc
                .tasks
                .recv_for(SendKind::Gradient)
                .unwrap_or_else(|| panic!("foreign cell without a gradient receive endpoint"));
            ctx.sched.activate(recv);
        }
    }
    if foreign_active {
        for kind in [SendKind::Xv, SendKind::Rho] {
            let send = lc.tasks.send_for(kind, peer).unwrap_or_else(|| {
                panic!("local cell without a {kind:?} send endpoint towards rank {peer}")
            });
            ctx.sched.activate_send(send, peer);
        }
        if ctx.with_gradient {
            let send = lc
                .tasks
                .send_for(SendKind::Gradient, peer)
                .unwrap_or_else(|| panic!("local cell without a gradient send endpoint"));
            ctx.sched.activate_send(send, peer);
        }
        // the payload must carry drifted positions
        cell_activate_drift_part(ctx.space, ctx.sched, local);
    }
    if local_active || foreign_active {
        let recv = fc
            .tasks
            .recv_for(SendKind::Ti)
            .unwrap_or_else(|| panic!("foreign cell without a Ti receive endpoint"));
        ctx.sched.activate(recv);
        let send = lc
            .tasks
            .send_for(SendKind::Ti, peer)
            .unwrap_or_else(|| panic!("local cell without a Ti send endpoint"));
        ctx.sched.activate_send(send, peer);
    }
}

// The pair path keeps recursing on equality, the self path stops; the
// boundary-particle behaviour depends on this difference.
fn can_recurse_in_pair(ctx: &ActivationContext, cid: CellId) -> bool {
    let c = ctx.space.cell(cid);
    c.split && !(2.0 * KERNEL_GAMMA * c.h_max.load() > 0.5 * c.dmin)
}

fn can_recurse_in_self(ctx: &ActivationContext, cid: CellId) -> bool {
    let c = ctx.space.cell(cid);
    c.split && !(2.0 * KERNEL_GAMMA * c.h_max.load() >= 0.5 * c.dmin)
}

/// Conservative reach test for two subcells: their boxes, brought to the
/// minimum image, are within kernel range of each other.
fn subcells_interact(ctx: &ActivationContext, ci: CellId, cj: CellId) -> bool {
    let a = ctx.space.cell(ci);
    let b = ctx.space.cell(cj);
    let centre_a = a.center();
    let centre_b = b.center();
    let dx = ctx.space.periodic_dx(centre_a, centre_b);
    let mut gap2 = 0.0;
    for k in 0..3 {
        let gap = (dx[k].abs() - 0.5 * (a.width[k] + b.width[k])).max(0.0);
        gap2 += gap * gap;
    }
    let reach = KERNEL_GAMMA * a.h_max.load().max(b.h_max.load())
        + a.dx_max_part.load()
        + b.dx_max_part.load();
    gap2 <= reach * reach
}

/// The hydro subcell activator: recurses a sub-task's two subtrees down
/// to the level where the interaction actually happens, activating drifts
/// and sorts there.
pub fn activate_subcell_hydro(ctx: &ActivationContext, ci: CellId, cj: Option<CellId>) {
    match cj {
        None => {
            let c = ctx.space.cell(ci);
            if c.parts.count == 0 || !c.is_active_hydro(ctx.ti_current) {
                return;
            }
            if can_recurse_in_self(ctx, ci) {
                let progeny: Vec<CellId> = c.progeny.iter().flatten().copied().collect();
                for (ia, &a) in progeny.iter().enumerate() {
                    activate_subcell_hydro(ctx, a, None);
                    for &b in &progeny[ia + 1..] {
                        activate_subcell_hydro(ctx, a, Some(b));
                    }
                }
            } else if ctx.is_local(ci) {
                cell_activate_drift_part(ctx.space, ctx.sched, ci);
            }
        }
        Some(cj) => {
            let a = ctx.space.cell(ci);
            let b = ctx.space.cell(cj);
            let any_active = a.is_active_hydro(ctx.ti_current) || b.is_active_hydro(ctx.ti_current);
            if !any_active || !subcells_interact(ctx, ci, cj) {
                return;
            }
            if can_recurse_in_pair(ctx, ci) && can_recurse_in_pair(ctx, cj) {
                let pi: Vec<CellId> = a.progeny.iter().flatten().copied().collect();
                let pj: Vec<CellId> = b.progeny.iter().flatten().copied().collect();
                for &sub_i in &pi {
                    for &sub_j in &pj {
                        activate_subcell_hydro(ctx, sub_i, Some(sub_j));
                    }
                }
            } else {
                let (sid, _flip, _shift) =
                    get_sort_id(ctx.space.dim, a.loc, b.loc, a.width);
                record_pair_sort_demand(ctx, ci, cj, sid);
            }
        }
    }
}

/// Un-skips the gravity tasks anchored at `cid` for this step.
pub fn unskip_gravity(ctx: &ActivationContext, cid: CellId) {
    let c = ctx.space.cell(cid);

    for &tid in &c.tasks.grav {
        let task = ctx.sched.task(tid);
        let ci = task.ci.unwrap_or_else(|| panic!("gravity task {tid} with no first cell"));
        let ci_active = ctx.space.cell(ci).is_active_grav(ctx.ti_current);
        let ci_local = ctx.is_local(ci);

        match task.cj {
            None => {
                if ci_local && ci_active {
                    task.activate();
                    match task.kind {
                        TaskKind::SelfInteraction => {
                            cell_activate_drift_gpart(ctx.space, ctx.sched, ci);
                        }
                        TaskKind::SubSelf => activate_subcell_grav(ctx, ci, None),
                        other => panic!("self-side gravity task of kind {other:?}"),
                    }
                }
            }
            Some(cj) => {
                let cj_active = ctx.space.cell(cj).is_active_grav(ctx.ti_current);
                let cj_local = ctx.is_local(cj);
                if !(ci_local && ci_active) && !(cj_local && cj_active) {
                    continue;
                }
                task.activate();
                match task.kind {
                    TaskKind::PairInteraction => {
                        if ci_local {
                            cell_activate_drift_gpart(ctx.space, ctx.sched, ci);
                        }
                        if cj_local {
                            cell_activate_drift_gpart(ctx.space, ctx.sched, cj);
                        }
                    }
                    TaskKind::SubPair => activate_subcell_grav(ctx, ci, Some(cj)),
                    other => panic!("pair-side gravity task of kind {other:?}"),
                }
                if !ci_local {
                    activate_grav_exchange(ctx, ci, cj, ci_active, cj_active);
                } else if !cj_local {
                    activate_grav_exchange(ctx, cj, ci, cj_active, ci_active);
                }
            }
        }
    }

    if c.nodeid == ctx.rank && c.is_active_grav(ctx.ti_current) {
        for task in [
            c.tasks.init_grav,
            c.tasks.grav_long_range,
            c.tasks.grav_down,
            c.tasks.kick1,
            c.tasks.kick2,
            c.tasks.timestep,
            c.tasks.end_force,
        ]
        .into_iter()
        .flatten()
        {
            ctx.sched.activate(task);
        }
    }
}

/// Activates the send/recv cooperation for a gravity pair.
fn activate_grav_exchange(
    ctx: &ActivationContext,
    foreign: CellId,
    local: CellId,
    foreign_active: bool,
    local_active: bool,
) {
    let fc = ctx.space.cell(foreign);
    let lc = ctx.space.cell(local);
    let peer = fc.nodeid;

    if local_active {
        let recv = fc
            .tasks
            .recv_for(SendKind::Grav)
            .unwrap_or_else(|| panic!("foreign cell without a gravity receive endpoint"));
        ctx.sched.activate(recv);
    }
    if foreign_active {
        let send = lc
            .tasks
            .send_for(SendKind::Grav, peer)
            .unwrap_or_else(|| panic!("local cell without a gravity send endpoint"));
        ctx.sched.activate_send(send, peer);
        cell_activate_drift_gpart(ctx.space, ctx.sched, local);
    }
    if local_active || foreign_active {
        let recv = fc
            .tasks
            .recv_for(SendKind::Ti)
            .unwrap_or_else(|| panic!("foreign cell without a Ti receive endpoint"));
        ctx.sched.activate(recv);
        let send = lc
            .tasks
            .send_for(SendKind::Ti, peer)
            .unwrap_or_else(|| panic!("local cell without a Ti send endpoint"));
        ctx.sched.activate_send(send, peer);
    }
}

/// The gravity subcell activator: drifts both multipoles, applies the
/// acceptance criterion, and either stops (the pair interacts long-range)
/// or descends into the cell with the larger radius, ties broken towards
/// `cj`. A rejected leaf-leaf pair activates the gravity drifts.
pub fn activate_subcell_grav(ctx: &ActivationContext, ci: CellId, cj: Option<CellId>) {
    match cj {
        None => {
            let c = ctx.space.cell(ci);
            if c.gparts.count == 0 || !c.is_active_grav(ctx.ti_current) {
                return;
            }
            if c.split {
                let progeny: Vec<CellId> = c.progeny.iter().flatten().copied().collect();
                for (ia, &a) in progeny.iter().enumerate() {
                    activate_subcell_grav(ctx, a, None);
                    for &b in &progeny[ia + 1..] {
                        activate_subcell_grav(ctx, a, Some(b));
                    }
                }
            } else if ctx.is_local(ci) {
                cell_activate_drift_gpart(ctx.space, ctx.sched, ci);
            }
        }
        Some(cj) => {
            let a = ctx.space.cell(ci);
            let b = ctx.space.cell(cj);
            if a.gparts.count == 0 || b.gparts.count == 0 {
                return;
            }
            if !a.is_active_grav(ctx.ti_current) && !b.is_active_grav(ctx.ti_current) {
                return;
            }

            {
                let guard_i = lock_subtree(ctx.space, ci, LockKind::Multipole)
                    .expect("multipole lock contended during activation");
                drift_multipole(&ctx.drift_ctx(), ci);
                drop(guard_i);
                let guard_j = lock_subtree(ctx.space, cj, LockKind::Multipole)
                    .expect("multipole lock contended during activation");
                drift_multipole(&ctx.drift_ctx(), cj);
                drop(guard_j);
            }

            // serial traversal after the locked drifts
            let m_i = unsafe { a.multipole.get() };
            let m_j = unsafe { b.multipole.get() };
            let dx = ctx.space.periodic_dx(m_i.com, m_j.com);
            let r2 = dx.iter().map(|d| d * d).sum::<f64>();
            if m2l_accept(m_i.r_max, m_j.r_max, ctx.theta_crit_sq, r2) {
                return;
            }

            let descend_ci = a.split && (!b.split || m_i.r_max > m_j.r_max);
            if descend_ci {
                let progeny: Vec<CellId> = a.progeny.iter().flatten().copied().collect();
                for sub in progeny {
                    activate_subcell_grav(ctx, sub, Some(cj));
                }
            } else if b.split {
                let progeny: Vec<CellId> = b.progeny.iter().flatten().copied().collect();
                for sub in progeny {
                    activate_subcell_grav(ctx, ci, Some(sub));
                }
            } else {
                if ctx.is_local(ci) {
                    cell_activate_drift_gpart(ctx.space, ctx.sched, ci);
                }
                if ctx.is_local(cj) {
                    cell_activate_drift_gpart(ctx.space, ctx.sched, cj);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellFlags;
    use crate::hydro::MinimalSph;
    use crate::integrator::Leapfrog;
    use crate::part::{GPart, Part, ParticleKind, XPart};
    use crate::shared::SharedVec;
    use crate::space::SpaceParams;
    use crate::task::{Task, TaskSubtype};
    use crate::timeline::TimeBin;

    const TI: IntegerTime = 8;

    struct Fixture {
        space: Space,
        sched: Scheduler,
        integrator: IntegratorEnum,
        hydro: HydroEnum,
    }

    impl Fixture {
        fn ctx(&self) -> ActivationContext<'_> {
            ActivationContext {
                space: &self.space,
                sched: &self.sched,
                integrator: &self.integrator,
                hydro: &self.hydro,
                ti_current: TI,
                time_base: 1e-3,
                rank: 0,
                theta_crit_sq: 0.25,
                with_gradient: false,
            }
        }
    }

    fn empty_fixture(dim: f64) -> Fixture {
        Fixture {
            space: Space::new([dim; 3], SpaceParams::default()),
            sched: Scheduler::new(),
            integrator: IntegratorEnum::from(Leapfrog),
            hydro: HydroEnum::from(MinimalSph),
        }
    }

    /// An active gas particle plus the per-cell hydro task set on a cell.
    fn hydro_cell(fx: &mut Fixture, loc: [f64; 3], nodeid: Rank, active: bool) -> CellId {
        let cid = fx.space.insert_test_cell(loc, [2.0; 3], 0, None);
        let c = fx.space.cell_mut(cid);
        c.nodeid = nodeid;
        c.ti_hydro_end_min
            .store(if active { TI } else { IntegerTime::MAX }, Ordering::Relaxed);
        let sort = fx
            .sched
            .push(Task::new(TaskKind::Sort, TaskSubtype::None, Some(cid), None));
        fx.space.cell_mut(cid).tasks.sort = Some(sort);
        if nodeid == 0 {
            let drift = fx.sched.push(Task::new(
                TaskKind::Drift(ParticleKind::Gas),
                TaskSubtype::None,
                Some(cid),
                None,
            ));
            let c = fx.space.cell_mut(cid);
            c.tasks.drift_part = Some(drift);
            c.super_hydro = Some(cid);
        }
        cid
    }

    fn pair_task(fx: &mut Fixture, ci: CellId, cj: CellId, sid: u32) -> crate::task::TaskId {
        let mut task = Task::new(
            TaskKind::PairInteraction,
            TaskSubtype::Density,
            Some(ci),
            Some(cj),
        );
        task.flags = sid;
        let tid = fx.sched.push(task);
        fx.space.cell_mut(ci).tasks.density.push(tid);
        tid
    }

    #[test]
    fn pair_with_inactive_foreign_neighbour() {
        let mut fx = empty_fixture(6.0);
        let mut p = Part::at([1.0, 1.0, 1.0], 0.05, 1.0);
        p.time_bin = TimeBin(3);
        p.ti_end = TI;
        fx.space.parts = SharedVec::from_vec(vec![p]);
        fx.space.xparts = SharedVec::from_vec(vec![XPart::default()]);

        let ci = hydro_cell(&mut fx, [0.0; 3], 0, true);
        fx.space.cell_mut(ci).parts = crate::cell::Window { first: 0, count: 1 };
        let cj = hydro_cell(&mut fx, [2.0, 0.0, 0.0], 1, false);
        for kind in [SendKind::Xv, SendKind::Rho, SendKind::Ti] {
            let recv = fx.sched.push(Task::new(
                TaskKind::Recv(kind),
                TaskSubtype::None,
                Some(cj),
                None,
            ));
            fx.space.cell_mut(cj).tasks.recv.push((kind, recv));
            let mut send = Task::new(TaskKind::Send(kind), TaskSubtype::None, Some(ci), None);
            send.rank = 1;
            let send = fx.sched.push(send);
            fx.space.cell_mut(ci).tasks.send.push((kind, 1, send));
        }
        let pair = pair_task(&mut fx, ci, cj, 4);

        let rebuild = unskip_hydro(&fx.ctx(), ci);
        assert!(!rebuild);
        assert!(!fx.sched.task(pair).skipped());

        // sort demand recorded on both sides of the pair's direction
        let a = fx.space.cell(ci);
        let b = fx.space.cell(cj);
        assert_eq!(a.requires_sorts.load(Ordering::Relaxed), 1 << 4);
        assert_eq!(b.requires_sorts.load(Ordering::Relaxed), 1 << 4);
        assert_eq!(a.do_sort.load(Ordering::Relaxed), 1 << 4);
        assert_eq!(b.do_sort.load(Ordering::Relaxed), 1 << 4);
        assert!(!fx.sched.task(a.tasks.sort.unwrap()).skipped());
        assert!(!fx.sched.task(b.tasks.sort.unwrap()).skipped());

        // the local cell is drifted, the foreign one is not
        assert!(a.has_flag(CellFlags::DO_PART_DRIFT));
        assert!(!b.has_flag(CellFlags::DO_PART_DRIFT));
        assert!(!fx.sched.task(a.tasks.drift_part.unwrap()).skipped());

        // local side active: the foreign proxy receives xv, rho and ti,
        // but nothing is sent because the foreign side sleeps
        assert!(!fx.sched.task(b.tasks.recv_for(SendKind::Xv).unwrap()).skipped());
        assert!(!fx.sched.task(b.tasks.recv_for(SendKind::Rho).unwrap()).skipped());
        assert!(!fx.sched.task(b.tasks.recv_for(SendKind::Ti).unwrap()).skipped());
        assert!(fx.sched.task(a.tasks.send_for(SendKind::Xv, 1).unwrap()).skipped());
        assert!(fx.sched.task(a.tasks.send_for(SendKind::Rho, 1).unwrap()).skipped());
        assert!(!fx.sched.task(a.tasks.send_for(SendKind::Ti, 1).unwrap()).skipped());
    }

    #[test]
    fn degraded_pair_requests_rebuild() {
        let mut fx = empty_fixture(6.0);
        let mut p = Part::at([1.0, 1.0, 1.0], 0.05, 1.0);
        p.time_bin = TimeBin(3);
        p.ti_end = TI;
        fx.space.parts = SharedVec::from_vec(vec![p]);
        fx.space.xparts = SharedVec::from_vec(vec![XPart::default()]);

        let ci = hydro_cell(&mut fx, [0.0; 3], 0, true);
        fx.space.cell_mut(ci).parts = crate::cell::Window { first: 0, count: 1 };
        let cj = hydro_cell(&mut fx, [2.0, 0.0, 0.0], 0, false);
        let _pair = pair_task(&mut fx, ci, cj, 4);

        // envelope past the allowed fraction of dmin
        fx.space.cell(ci).dx_max_sort.store(0.5);
        assert!(unskip_hydro(&fx.ctx(), ci));
    }

    fn grav_leaf(fx: &mut Fixture, loc: [f64; 3], gw: crate::cell::Window) -> CellId {
        let cid = fx.space.insert_test_cell(loc, [2.0; 3], 0, None);
        let c = fx.space.cell_mut(cid);
        c.gparts = gw;
        c.ti_grav_end_min.store(TI, Ordering::Relaxed);
        c.super_grav = Some(cid);
        let drift = fx.sched.push(Task::new(
            TaskKind::Drift(ParticleKind::Gravity),
            TaskSubtype::None,
            Some(cid),
            None,
        ));
        fx.space.cell_mut(cid).tasks.drift_gpart = Some(drift);
        cid
    }

    fn mac_fixture(r_max_each: f64) -> (Fixture, CellId, CellId) {
        let mut fx = empty_fixture(40.0);
        fx.space.gparts =
            SharedVec::from_vec(vec![GPart::dark([1.0; 3], 1.0), GPart::dark([11.0, 1.0, 1.0], 1.0)]);
        let ci = grav_leaf(&mut fx, [0.0; 3], crate::cell::Window { first: 0, count: 1 });
        let cj = grav_leaf(
            &mut fx,
            [10.0, 0.0, 0.0],
            crate::cell::Window { first: 1, count: 1 },
        );
        for (cid, com) in [(ci, [1.0, 1.0, 1.0]), (cj, [11.0, 1.0, 1.0])] {
            let m = fx.space.cell_mut(cid).multipole.get_mut();
            m.m = 1.0;
            m.com = com;
            m.r_max = r_max_each;
        }
        (fx, ci, cj)
    }

    #[test]
    fn accepted_pair_needs_no_drifts() {
        // r = 10, r_max_i + r_max_j = 3, theta_crit = 0.5: 9 <= 25
        let (fx, ci, cj) = mac_fixture(1.5);
        activate_subcell_grav(&fx.ctx(), ci, Some(cj));
        assert!(!fx.space.cell(ci).has_flag(CellFlags::DO_GPART_DRIFT));
        assert!(!fx.space.cell(cj).has_flag(CellFlags::DO_GPART_DRIFT));
    }

    #[test]
    fn rejected_leaf_pair_activates_drifts() {
        // r_max_i + r_max_j = 7: 49 > 25, and both cells are leaves
        let (fx, ci, cj) = mac_fixture(3.5);
        activate_subcell_grav(&fx.ctx(), ci, Some(cj));
        assert!(fx.space.cell(ci).has_flag(CellFlags::DO_GPART_DRIFT));
        assert!(fx.space.cell(cj).has_flag(CellFlags::DO_GPART_DRIFT));
        assert!(!fx
            .sched
            .task(fx.space.cell(ci).tasks.drift_gpart.unwrap())
            .skipped());
    }

    #[test]
    fn drift_activation_short_circuits() {
        let (fx, ci, cj) = mac_fixture(3.5);
        let ctx = fx.ctx();
        activate_subcell_grav(&ctx, ci, Some(cj));
        // a second traversal finds the flags set and changes nothing
        activate_subcell_grav(&ctx, ci, Some(cj));
        assert!(fx.space.cell(ci).has_flag(CellFlags::DO_GPART_DRIFT));
    }

    #[test]
    fn super_pointers_anchor_at_task_owners() {
        let mut fx = empty_fixture(8.0);
        let top = hydro_cell(&mut fx, [0.0; 3], 0, true);
        let child = fx.space.insert_test_cell([0.0; 3], [1.0; 3], 1, Some(top));
        let grandchild = fx.space.insert_test_cell([0.0; 3], [0.5; 3], 2, Some(child));
        fx.space.cell_mut(top).progeny[0] = Some(child);
        fx.space.cell_mut(top).split = true;
        fx.space.cell_mut(child).progeny[0] = Some(grandchild);
        fx.space.cell_mut(child).split = true;
        // hydro_cell pre-assigned the super; the pass must re-derive it
        fx.space.cell_mut(top).super_hydro = None;

        set_super_pointers(&mut fx.space);

        assert_eq!(fx.space.cell(top).super_hydro, Some(top));
        assert_eq!(fx.space.cell(child).super_hydro, Some(top));
        assert_eq!(fx.space.cell(grandchild).super_hydro, Some(top));
        // no gravity tasks anywhere: no gravity anchor either
        assert_eq!(fx.space.cell(grandchild).super_grav, None);
    }

    #[test]
    fn sort_request_walks_to_the_anchor() {
        let mut fx = empty_fixture(8.0);
        let top = hydro_cell(&mut fx, [0.0; 3], 0, true);
        let child = fx.space.insert_test_cell([0.0; 3], [1.0; 3], 1, Some(top));
        fx.space.cell_mut(top).progeny[0] = Some(child);
        fx.space.cell_mut(top).split = true;

        cell_activate_sorts(&fx.ctx(), child, 4);

        let c = fx.space.cell(child);
        assert_eq!(c.do_sort.load(Ordering::Relaxed), 1 << 4);
        let anchor = fx.space.cell(top).tasks.sort.unwrap();
        assert!(!fx.sched.task(anchor).skipped());
    }

    #[test]
    fn gravity_pair_exchange_activates_both_directions() {
        let mut fx = empty_fixture(8.0);
        fx.space.gparts = SharedVec::from_vec(vec![
            GPart::dark([1.0; 3], 1.0),
            GPart::dark([3.0, 1.0, 1.0], 1.0),
        ]);
        let ci = grav_leaf(&mut fx, [0.0; 3], crate::cell::Window { first: 0, count: 1 });
        let cj = grav_leaf(
            &mut fx,
            [2.0, 0.0, 0.0],
            crate::cell::Window { first: 1, count: 1 },
        );
        fx.space.cell_mut(cj).nodeid = 1;
        for kind in [SendKind::Grav, SendKind::Ti] {
            let recv = fx.sched.push(Task::new(
                TaskKind::Recv(kind),
                TaskSubtype::None,
                Some(cj),
                None,
            ));
            fx.space.cell_mut(cj).tasks.recv.push((kind, recv));
            let mut send = Task::new(TaskKind::Send(kind), TaskSubtype::None, Some(ci), None);
            send.rank = 1;
            let send = fx.sched.push(send);
            fx.space.cell_mut(ci).tasks.send.push((kind, 1, send));
        }
        let pair = fx.sched.push(Task::new(
            TaskKind::PairInteraction,
            TaskSubtype::Grav,
            Some(ci),
            Some(cj),
        ));
        fx.space.cell_mut(ci).tasks.grav.push(pair);

        unskip_gravity(&fx.ctx(), ci);

        assert!(!fx.sched.task(pair).skipped());
        let a = fx.space.cell(ci);
        let b = fx.space.cell(cj);
        // the local side drifts and sends; the foreign proxy receives
        assert!(a.has_flag(CellFlags::DO_GPART_DRIFT));
        assert!(!b.has_flag(CellFlags::DO_GPART_DRIFT));
        assert!(!fx.sched.task(b.tasks.recv_for(SendKind::Grav).unwrap()).skipped());
        assert!(!fx.sched.task(b.tasks.recv_for(SendKind::Ti).unwrap()).skipped());
        assert!(!fx.sched.task(a.tasks.send_for(SendKind::Grav, 1).unwrap()).skipped());
        assert!(!fx.sched.task(a.tasks.send_for(SendKind::Ti, 1).unwrap()).skipped());
    }
}
