//! Task bodies.
//!
//! Each function here is the body of one task kind; [`execute`] dispatches
//! on the stub. Bodies take their cell locks with `try_lock` semantics and
//! report [`TaskOutcome::Retry`] on contention instead of blocking, per the
//! scheduling contract.

use crate::cell::CellId;
use crate::drift::{drift_gpart_cell, drift_part_cell, DriftContext};
use crate::hydro::{Hydro, HydroEnum, KERNEL_GAMMA};
use crate::integrator::{Integrator, IntegratorEnum};
use crate::lock::{lock_subtree, LockKind};
use crate::multipole::m2l_accept;
use crate::part::ParticleKind;
use crate::scheduler::{Scheduler, TaskOutcome};
use crate::space::Space;
use crate::task::{SendKind, TaskId, TaskKind};
use crate::timeline::{get_time_bin, is_active_bin, IntegerTime, MAX_TIME_BIN, MIN_TIME_BIN};
use crate::transport::{Envelope, Message, Transport};
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-step update counters, folded into the step summary.
#[derive(Debug, Default)]
pub struct StepCounters {
    /// Gas particles assigned a new step.
    pub updated: AtomicU64,
    /// Gravity particles assigned a new step.
    pub g_updated: AtomicU64,
    /// Star particles assigned a new step.
    pub s_updated: AtomicU64,
}

/// Everything a task body needs.
pub struct StepContext<'a> {
    /// The spatial container.
    pub space: &'a Space,
    /// The task arena.
    pub sched: &'a Scheduler,
    /// The integration flavour.
    pub integrator: &'a IntegratorEnum,
    /// The SPH flavour.
    pub hydro: &'a HydroEnum,
    /// The rank fabric.
    pub transport: &'a Transport,
    /// Current integer time.
    pub ti_current: IntegerTime,
    /// Physical length of one integer tick.
    pub time_base: f64,
    /// Courant factor for the time-step criterion.
    pub cfl: f64,
    /// Physical upper bound on any step.
    pub dt_max: f64,
    /// Squared opening angle for the acceptance criterion.
    pub theta_crit_sq: f64,
    /// Plummer softening for direct gravity.
    pub softening: f64,
    /// Update counters.
    pub counters: &'a StepCounters,
}

impl StepContext<'_> {
    fn drift_ctx(&self) -> DriftContext<'_> {
        DriftContext {
            space: self.space,
            integrator: self.integrator,
            hydro: self.hydro,
            ti_current: self.ti_current,
            time_base: self.time_base,
        }
    }
}

/// Runs the task at `tid` to completion, or reports contention.
pub fn execute(ctx: &StepContext, tid: TaskId) -> TaskOutcome {
    let task = ctx.sched.task(tid);
    let ci = task
        .ci
        .unwrap_or_else(|| panic!("task {tid} with no first cell"));
    match task.kind {
        TaskKind::Drift(ParticleKind::Gas) => {
            let Some(_guard) = lock_subtree(ctx.space, ci, LockKind::Part) else {
                return TaskOutcome::Retry;
            };
            drift_part_cell(&ctx.drift_ctx(), ci, false);
            TaskOutcome::Done
        }
        TaskKind::Drift(ParticleKind::Gravity | ParticleKind::Stars) => {
            let Some(_guard) = lock_subtree(ctx.space, ci, LockKind::GPart) else {
                return TaskOutcome::Retry;
            };
            drift_gpart_cell(&ctx.drift_ctx(), ci, false);
            TaskOutcome::Done
        }
        TaskKind::Sort => {
            run_sort(ctx.space, ci);
            TaskOutcome::Done
        }
        TaskKind::SelfInteraction | TaskKind::SubSelf => match task.subtype {
            crate::task::TaskSubtype::Density => run_density_self(ctx, ci),
            crate::task::TaskSubtype::Gradient => run_gradient_self(ctx, ci),
            crate::task::TaskSubtype::Force => run_force_self(ctx, ci),
            crate::task::TaskSubtype::Grav => run_grav_self(ctx, ci),
            crate::task::TaskSubtype::None => panic!("self task without a subtype"),
        },
        TaskKind::PairInteraction | TaskKind::SubPair => {
            let cj = task
                .cj
                .unwrap_or_else(|| panic!("pair task {tid} with no second cell"));
            match task.subtype {
                crate::task::TaskSubtype::Density => run_density_pair(ctx, ci, cj),
                crate::task::TaskSubtype::Gradient => run_gradient_pair(ctx, ci, cj),
                crate::task::TaskSubtype::Force => run_force_pair(ctx, ci, cj),
                crate::task::TaskSubtype::Grav => run_grav_pair(ctx, ci, cj),
                crate::task::TaskSubtype::None => panic!("pair task without a subtype"),
            }
        }
        TaskKind::Ghost => run_ghost(ctx, ci),
        TaskKind::Kick1 | TaskKind::Kick2 => run_kick(ctx, ci),
        TaskKind::Timestep => run_timestep(ctx, ci),
        TaskKind::EndForce => run_end_force(ctx, ci),
        TaskKind::InitGrav => run_init_grav(ctx, ci),
        TaskKind::GravLongRange => run_grav_long_range(ctx, ci),
        TaskKind::GravDown | TaskKind::GravGhost => TaskOutcome::Done,
        TaskKind::Cooling | TaskKind::SourceTerms => TaskOutcome::Done,
        TaskKind::Send(kind) => run_send(ctx, ci, kind, task.rank),
        TaskKind::Recv(kind) => run_recv(ctx, ci, kind, task.rank),
    }
}

/// Rebuilds the flagged directional sorts of `cid` and its descendants.
fn run_sort(space: &Space, cid: CellId) {
    let c = space.cell(cid);
    let mask = c.do_sort.swap(0, Ordering::AcqRel);
    if mask != 0 {
        // only the sort task of this cell touches the cache
        let cache = unsafe { c.sort_cache.get_racy_mut() };
        let parts = unsafe { space.parts.window(c.parts.first, c.parts.count) };
        for sid in 0..crate::sort::NUM_SORT_DIRECTIONS {
            if mask & (1 << sid) != 0 {
                cache.rebuild(sid, c.parts.first, parts);
            }
        }
        c.sorted.fetch_or(mask, Ordering::AcqRel);
    }
    for child in c.progeny.iter().flatten() {
        run_sort(space, *child);
    }
}

fn run_density_self(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    for i in 0..parts.len() {
        if !is_active_bin(parts[i].time_bin, ctx.ti_current) {
            continue;
        }
        let reach2 = (parts[i].h * KERNEL_GAMMA).powi(2);
        for j in 0..parts.len() {
            if i == j {
                continue;
            }
            let r2 = dist2(ctx.space, parts[i].x, parts[j].x);
            if r2 < reach2 {
                let mj = parts[j].mass;
                ctx.hydro.accumulate_density(&mut parts[i], r2, mj);
            }
        }
    }
    TaskOutcome::Done
}

fn run_density_pair(ctx: &StepContext, ci: CellId, cj: CellId) -> TaskOutcome {
    let Some(guards) = lock_pair(ctx.space, ci, cj, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let (wi, wj) = (ctx.space.cell(ci).parts, ctx.space.cell(cj).parts);
    let pi = unsafe { ctx.space.parts.window_mut(wi.first, wi.count) };
    let pj = unsafe { ctx.space.parts.window_mut(wj.first, wj.count) };

    for p in pi.iter_mut() {
        if !is_active_bin(p.time_bin, ctx.ti_current) {
            continue;
        }
        let reach2 = (p.h * KERNEL_GAMMA).powi(2);
        for q in pj.iter() {
            let r2 = dist2(ctx.space, p.x, q.x);
            if r2 < reach2 {
                ctx.hydro.accumulate_density(p, r2, q.mass);
            }
        }
    }
    for q in pj.iter_mut() {
        if !is_active_bin(q.time_bin, ctx.ti_current) {
            continue;
        }
        let reach2 = (q.h * KERNEL_GAMMA).powi(2);
        for p in pi.iter() {
            let r2 = dist2(ctx.space, q.x, p.x);
            if r2 < reach2 {
                ctx.hydro.accumulate_density(q, r2, p.mass);
            }
        }
    }
    drop(guards);
    TaskOutcome::Done
}

fn run_ghost(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    for p in parts.iter_mut() {
        if is_active_bin(p.time_bin, ctx.ti_current) {
            ctx.hydro.convert_after_density(p);
        }
    }
    TaskOutcome::Done
}

fn run_gradient_self(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    for i in 0..parts.len() {
        if !is_active_bin(parts[i].time_bin, ctx.ti_current) {
            continue;
        }
        for j in 0..parts.len() {
            if i != j {
                let (xj, vj, mj) = (parts[j].x, parts[j].v, parts[j].mass);
                accumulate_gradient_contribution(ctx, &mut parts[i], xj, vj, mj);
            }
        }
    }
    TaskOutcome::Done
}

fn run_gradient_pair(ctx: &StepContext, ci: CellId, cj: CellId) -> TaskOutcome {
    let Some(guards) = lock_pair(ctx.space, ci, cj, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let (wi, wj) = (ctx.space.cell(ci).parts, ctx.space.cell(cj).parts);
    let pi = unsafe { ctx.space.parts.window_mut(wi.first, wi.count) };
    let pj = unsafe { ctx.space.parts.window_mut(wj.first, wj.count) };

    for p in pi.iter_mut() {
        if !is_active_bin(p.time_bin, ctx.ti_current) {
            continue;
        }
        for q in pj.iter() {
            accumulate_gradient_contribution(ctx, p, q.x, q.v, q.mass);
        }
    }
    for q in pj.iter_mut() {
        if !is_active_bin(q.time_bin, ctx.ti_current) {
            continue;
        }
        for p in pi.iter() {
            accumulate_gradient_contribution(ctx, q, p.x, p.v, p.mass);
        }
    }
    drop(guards);
    TaskOutcome::Done
}

/// Velocity-divergence contribution on `p` from a neighbour at `x_j`
/// moving with `v_j`.
fn accumulate_gradient_contribution(
    ctx: &StepContext,
    p: &mut crate::part::Part,
    x_j: [f64; 3],
    v_j: [f64; 3],
    mj: f64,
) {
    let dx = ctx.space.periodic_dx(p.x, x_j);
    let r2 = dx.iter().map(|d| d * d).sum::<f64>();
    let reach2 = (p.h * KERNEL_GAMMA).powi(2);
    if r2 >= reach2 || r2 == 0.0 {
        return;
    }
    let dv_dot_dx = (0..3).map(|k| (p.v[k] - v_j[k]) * dx[k]).sum::<f64>();
    ctx.hydro.accumulate_gradient(p, r2.sqrt(), dv_dot_dx, mj);
}

fn run_force_self(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    for i in 0..parts.len() {
        if !is_active_bin(parts[i].time_bin, ctx.ti_current) {
            continue;
        }
        for j in 0..parts.len() {
            if i != j {
                let (pj_x, pj_snapshot) = (parts[j].x, force_source(&parts[j]));
                accumulate_force(ctx, &mut parts[i], pj_x, pj_snapshot);
            }
        }
    }
    TaskOutcome::Done
}

fn run_force_pair(ctx: &StepContext, ci: CellId, cj: CellId) -> TaskOutcome {
    let Some(guards) = lock_pair(ctx.space, ci, cj, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let (wi, wj) = (ctx.space.cell(ci).parts, ctx.space.cell(cj).parts);
    let pi = unsafe { ctx.space.parts.window_mut(wi.first, wi.count) };
    let pj = unsafe { ctx.space.parts.window_mut(wj.first, wj.count) };

    for p in pi.iter_mut() {
        if !is_active_bin(p.time_bin, ctx.ti_current) {
            continue;
        }
        for q in pj.iter() {
            accumulate_force(ctx, p, q.x, force_source(q));
        }
    }
    for q in pj.iter_mut() {
        if !is_active_bin(q.time_bin, ctx.ti_current) {
            continue;
        }
        for p in pi.iter() {
            accumulate_force(ctx, q, p.x, force_source(p));
        }
    }
    drop(guards);
    TaskOutcome::Done
}

/// The per-neighbour quantities the force sum needs: mass and
/// pressure-over-density-squared.
fn force_source(p: &crate::part::Part) -> (f64, f64) {
    let pressure = (crate::hydro::GAMMA - 1.0) * p.rho * p.u;
    let pod2 = if p.rho > 0.0 {
        pressure / (p.rho * p.rho)
    } else {
        0.0
    };
    (p.mass, pod2)
}

/// Standard symmetric SPH pressure-gradient contribution on `p` from a
/// neighbour at `x_j`.
fn accumulate_force(ctx: &StepContext, p: &mut crate::part::Part, x_j: [f64; 3], src: (f64, f64)) {
    let (mj, pod2_j) = src;
    let dx = ctx.space.periodic_dx(p.x, x_j);
    let r2 = dx.iter().map(|d| d * d).sum::<f64>();
    let reach2 = (p.h * KERNEL_GAMMA).powi(2);
    if r2 >= reach2 || r2 == 0.0 {
        return;
    }
    let r = r2.sqrt();
    let dwdr = crate::hydro::kernel_dw_dr(r, p.h);
    let pressure_i = (crate::hydro::GAMMA - 1.0) * p.rho * p.u;
    let pod2_i = if p.rho > 0.0 {
        pressure_i / (p.rho * p.rho)
    } else {
        0.0
    };
    let fac = -mj * (pod2_i + pod2_j) * dwdr / r;
    for k in 0..3 {
        p.a_hydro[k] += fac * dx[k];
    }
}

fn run_end_force(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    for p in parts.iter_mut() {
        if !is_active_bin(p.time_bin, ctx.ti_current) {
            continue;
        }
        if p.gpart != crate::part::NO_LINK {
            // gravity feeds the same kick as the hydro force
            let g = unsafe { ctx.space.gparts.get(p.gpart as usize) };
            for k in 0..3 {
                p.a_hydro[k] += g.a_grav[k];
            }
        }
    }
    TaskOutcome::Done
}

fn run_kick(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_pguard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let Some(_gguard) = lock_subtree(ctx.space, cid, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    let xparts = unsafe { ctx.space.xparts.window_mut(c.parts.first, c.parts.count) };
    for (p, xp) in parts.iter_mut().zip(xparts.iter_mut()) {
        if is_active_bin(p.time_bin, ctx.ti_current) {
            let dt = 0.5 * p.time_bin.interval() as f64 * ctx.time_base;
            ctx.integrator.kick_part(p, xp, dt);
        }
    }
    let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
    for g in gparts.iter_mut() {
        if is_active_bin(g.time_bin, ctx.ti_current) {
            let dt = 0.5 * g.time_bin.interval() as f64 * ctx.time_base;
            ctx.integrator.kick_gpart(g, dt);
        }
    }
    TaskOutcome::Done
}

fn run_timestep(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_pguard) = lock_subtree(ctx.space, cid, LockKind::Part) else {
        return TaskOutcome::Retry;
    };
    let Some(_gguard) = lock_subtree(ctx.space, cid, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);

    let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
    let mut updated = 0;
    for p in parts.iter_mut() {
        if !is_active_bin(p.time_bin, ctx.ti_current) {
            continue;
        }
        let v = p.v.iter().map(|v| v * v).sum::<f64>().sqrt();
        let signal = ctx.hydro.sound_speed(p) + v + 1e-30;
        let dt = (ctx.cfl * p.h * KERNEL_GAMMA / signal).min(ctx.dt_max);
        let bin = aligned_bin(dt, ctx.time_base, ctx.ti_current);
        p.time_bin = bin;
        p.ti_end = ctx.ti_current + bin.interval();
        updated += 1;
        if p.gpart != crate::part::NO_LINK {
            let g = unsafe { ctx.space.gparts.window_mut(p.gpart as usize, 1) };
            g[0].time_bin = bin;
            g[0].ti_end = p.ti_end;
        }
    }
    let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
    let mut g_updated = 0;
    let mut s_updated = 0;
    for g in gparts.iter_mut() {
        if !is_active_bin(g.time_bin, ctx.ti_current) {
            continue;
        }
        match g.link {
            // mirrored from the gas side above
            crate::part::GPartLink::Gas(_) => {}
            // no hydro signal: dark and star particles take the cap
            crate::part::GPartLink::Dark => {
                let bin = aligned_bin(ctx.dt_max, ctx.time_base, ctx.ti_current);
                g.time_bin = bin;
                g.ti_end = ctx.ti_current + bin.interval();
            }
            crate::part::GPartLink::Star(s) => {
                let bin = aligned_bin(ctx.dt_max, ctx.time_base, ctx.ti_current);
                g.time_bin = bin;
                g.ti_end = ctx.ti_current + bin.interval();
                let sp = unsafe { ctx.space.sparts.window_mut(s as usize, 1) };
                sp[0].time_bin = bin;
                s_updated += 1;
            }
        }
        g_updated += 1;
    }

    ctx.counters.updated.fetch_add(updated, Ordering::Relaxed);
    ctx.counters.g_updated.fetch_add(g_updated, Ordering::Relaxed);
    ctx.counters.s_updated.fetch_add(s_updated, Ordering::Relaxed);

    fold_end_times(ctx.space, cid, ctx.ti_current);
    TaskOutcome::Done
}

/// The largest time-bin whose interval both covers at most `dt` and nests
/// at the current time.
fn aligned_bin(dt: f64, time_base: f64, ti_current: IntegerTime) -> crate::timeline::TimeBin {
    let dti = ((dt / time_base) as IntegerTime).max(MIN_TIME_BIN.interval());
    let mut bin = get_time_bin(dti).min(MAX_TIME_BIN);
    while bin > MIN_TIME_BIN && ti_current % bin.interval() != 0 {
        bin = crate::timeline::TimeBin(bin.0 - 1);
    }
    bin
}

/// Recomputes the end-time envelopes of the subtree bottom-up from the
/// particle content.
pub fn fold_end_times(space: &Space, cid: CellId, _ti_current: IntegerTime) {
    let c = space.cell(cid);
    let mut hydro_min = IntegerTime::MAX;
    let mut hydro_max = 0;
    let mut grav_min = IntegerTime::MAX;
    let mut grav_max = 0;
    if c.split {
        for child in c.progeny.iter().flatten() {
            fold_end_times(space, *child, _ti_current);
            let cp = space.cell(*child);
            hydro_min = hydro_min.min(cp.ti_hydro_end_min.load(Ordering::Relaxed));
            hydro_max = hydro_max.max(cp.ti_hydro_end_max.load(Ordering::Relaxed));
            grav_min = grav_min.min(cp.ti_grav_end_min.load(Ordering::Relaxed));
            grav_max = grav_max.max(cp.ti_grav_end_max.load(Ordering::Relaxed));
        }
    } else {
        for i in c.parts.range() {
            let p = unsafe { space.parts.get(i) };
            if p.time_bin.is_awake() {
                hydro_min = hydro_min.min(p.ti_end);
                hydro_max = hydro_max.max(p.ti_end);
            }
        }
        for i in c.gparts.range() {
            let g = unsafe { space.gparts.get(i) };
            if g.time_bin.is_awake() {
                grav_min = grav_min.min(g.ti_end);
                grav_max = grav_max.max(g.ti_end);
            }
        }
    }
    c.ti_hydro_end_min.store(hydro_min, Ordering::Relaxed);
    c.ti_hydro_end_max.store(hydro_max, Ordering::Relaxed);
    c.ti_grav_end_min.store(grav_min, Ordering::Relaxed);
    c.ti_grav_end_max.store(grav_max, Ordering::Relaxed);
}

fn run_init_grav(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
    for g in gparts.iter_mut() {
        if is_active_bin(g.time_bin, ctx.ti_current) {
            g.a_grav = [0.0; 3];
        }
    }
    TaskOutcome::Done
}

fn run_grav_self(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
    for i in 0..gparts.len() {
        if !is_active_bin(gparts[i].time_bin, ctx.ti_current) {
            continue;
        }
        for j in 0..gparts.len() {
            if i != j {
                let (xj, mj) = (gparts[j].x, gparts[j].mass);
                p2p(ctx, &mut gparts[i], xj, mj);
            }
        }
    }
    TaskOutcome::Done
}

fn run_grav_pair(ctx: &StepContext, ci: CellId, cj: CellId) -> TaskOutcome {
    let Some(guards) = lock_pair(ctx.space, ci, cj, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let (wi, wj) = (ctx.space.cell(ci).gparts, ctx.space.cell(cj).gparts);
    let gi = unsafe { ctx.space.gparts.window_mut(wi.first, wi.count) };
    let gj = unsafe { ctx.space.gparts.window_mut(wj.first, wj.count) };
    for g in gi.iter_mut() {
        if !is_active_bin(g.time_bin, ctx.ti_current) {
            continue;
        }
        for h in gj.iter() {
            p2p(ctx, g, h.x, h.mass);
        }
    }
    for h in gj.iter_mut() {
        if !is_active_bin(h.time_bin, ctx.ti_current) {
            continue;
        }
        for g in gi.iter() {
            p2p(ctx, h, g.x, g.mass);
        }
    }
    drop(guards);
    TaskOutcome::Done
}

/// Long-range gravity of `cid`: every non-neighbouring top-level cell acts
/// on it through its multipole, descending the remote hierarchy where the
/// acceptance criterion rejects. Only multipoles are read, so the walk
/// needs no lock on the remote side.
fn run_grav_long_range(ctx: &StepContext, cid: CellId) -> TaskOutcome {
    let Some(_guard) = lock_subtree(ctx.space, cid, LockKind::GPart) else {
        return TaskOutcome::Retry;
    };
    let c = ctx.space.cell(cid);
    let m_i = unsafe { c.multipole.get() }.clone();
    let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };

    for &other in ctx.space.top_cells() {
        if other == cid || top_cells_are_neighbours(ctx.space, cid, other) {
            continue;
        }
        apply_remote_multipole(ctx, &m_i, gparts, other);
    }
    TaskOutcome::Done
}

/// Applies the field of the subtree rooted at `other` to `gparts`,
/// descending while the acceptance criterion rejects. A rejecting leaf
/// still contributes its monopole; below leaf resolution there is nothing
/// finer to open.
fn apply_remote_multipole(
    ctx: &StepContext,
    m_i: &crate::multipole::Multipole,
    gparts: &mut [crate::part::GPart],
    other: CellId,
) {
    let co = ctx.space.cell(other);
    if co.gparts.count == 0 {
        return;
    }
    let m_j = unsafe { co.multipole.get() }.clone();
    let dx = ctx.space.periodic_dx(m_i.com, m_j.com);
    let r2 = dx.iter().map(|d| d * d).sum::<f64>();
    if !m2l_accept(m_i.r_max, m_j.r_max, ctx.theta_crit_sq, r2) && co.split {
        for child in co.progeny.iter().flatten() {
            apply_remote_multipole(ctx, m_i, gparts, *child);
        }
        return;
    }
    for g in gparts.iter_mut() {
        if is_active_bin(g.time_bin, ctx.ti_current) {
            p2p(ctx, g, m_j.com, m_j.m);
        }
    }
}

/// Softened Newtonian acceleration on `g` from a point mass at `x`.
fn p2p(ctx: &StepContext, g: &mut crate::part::GPart, x: [f64; 3], mass: f64) {
    let dx = ctx.space.periodic_dx(x, g.x);
    let r2 = dx.iter().map(|d| d * d).sum::<f64>() + ctx.softening * ctx.softening;
    let inv_r3 = r2.powf(-1.5);
    for k in 0..3 {
        g.a_grav[k] += mass * dx[k] * inv_r3;
    }
}

/// Two top-level cells are neighbours if they differ by at most one cell
/// width per axis, periodically.
fn top_cells_are_neighbours(space: &Space, a: CellId, b: CellId) -> bool {
    let ca = space.cell(a);
    let cb = space.cell(b);
    let dx = space.periodic_dx(ca.loc, cb.loc);
    dx.iter()
        .zip(&ca.width)
        .all(|(d, w)| d.abs() <= w * 1.5)
}

fn run_send(ctx: &StepContext, cid: CellId, kind: SendKind, to: crate::transport::Rank) -> TaskOutcome {
    let c = ctx.space.cell(cid);
    let message = match kind {
        SendKind::Xv | SendKind::Rho | SendKind::Gradient => {
            let parts = unsafe { ctx.space.parts.window(c.parts.first, c.parts.count) };
            let bytes = crate::pack::encode(&parts.to_vec()).expect("encoding a particle payload");
            match kind {
                SendKind::Xv => Message::Xv(bytes),
                SendKind::Rho => Message::Rho(bytes),
                _ => Message::Gradient(bytes),
            }
        }
        SendKind::Ti => {
            let info = crate::pack::pack_step_info(ctx.space, cid);
            Message::Ti(crate::pack::encode(&info).expect("encoding a step-info image"))
        }
        SendKind::Grav => {
            let gparts = unsafe { ctx.space.gparts.window(c.gparts.first, c.gparts.count) };
            Message::Grav(crate::pack::encode(&gparts.to_vec()).expect("encoding a gravity payload"))
        }
    };
    ctx.transport
        .send(to, Envelope { tag: c.tag, message })
        .expect("transport failure is fatal");
    TaskOutcome::Done
}

fn run_recv(ctx: &StepContext, cid: CellId, kind: SendKind, from: crate::transport::Rank) -> TaskOutcome {
    let envelope = ctx.transport.recv(from).expect("transport failure is fatal");
    let c = ctx.space.cell(cid);
    assert_eq!(envelope.tag, c.tag, "mismatched tag on a receive endpoint");
    match (kind, envelope.message) {
        (SendKind::Xv | SendKind::Rho | SendKind::Gradient, Message::Xv(bytes) | Message::Rho(bytes) | Message::Gradient(bytes)) => {
            let incoming: Vec<crate::part::Part> =
                crate::pack::decode(&bytes).expect("decoding a particle payload");
            assert_eq!(incoming.len(), c.parts.count, "payload does not match the proxy window");
            let parts = unsafe { ctx.space.parts.window_mut(c.parts.first, c.parts.count) };
            parts.clone_from_slice(&incoming);
        }
        (SendKind::Ti, Message::Ti(bytes)) => {
            let info: Vec<crate::pack::StepInfo> =
                crate::pack::decode(&bytes).expect("decoding a step-info image");
            crate::pack::unpack_step_info(ctx.space, cid, &info);
        }
        (SendKind::Grav, Message::Grav(bytes)) => {
            let incoming: Vec<crate::part::GPart> =
                crate::pack::decode(&bytes).expect("decoding a gravity payload");
            assert_eq!(incoming.len(), c.gparts.count, "payload does not match the proxy window");
            let gparts = unsafe { ctx.space.gparts.window_mut(c.gparts.first, c.gparts.count) };
            gparts.clone_from_slice(&incoming);
        }
        (kind, message) => panic!("receive endpoint {kind:?} got mismatched payload {message:?}"),
    }
    TaskOutcome::Done
}

/// Locks both cells of a pair, smaller id first; unwinds on any failure.
fn lock_pair<'s>(
    space: &'s Space,
    ci: CellId,
    cj: CellId,
    kind: LockKind,
) -> Option<(crate::lock::SubtreeGuard<'s>, crate::lock::SubtreeGuard<'s>)> {
    let (a, b) = if ci <= cj { (ci, cj) } else { (cj, ci) };
    let ga = lock_subtree(space, a, kind)?;
    let gb = lock_subtree(space, b, kind)?;
    Some((ga, gb))
}

fn dist2(space: &Space, a: [f64; 3], b: [f64; 3]) -> f64 {
    let dx = space.periodic_dx(a, b);
    dx.iter().map(|d| d * d).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::Window;
    use crate::hydro::{HydroEnum, MinimalSph};
    use crate::integrator::{IntegratorEnum, Leapfrog};
    use crate::part::Part;
    use crate::shared::SharedVec;
    use crate::space::SpaceParams;
    use crate::task::{Task, TaskSubtype};
    use crate::timeline::TimeBin;

    fn step_ctx<'a>(
        space: &'a Space,
        sched: &'a Scheduler,
        integrator: &'a IntegratorEnum,
        hydro: &'a HydroEnum,
        transport: &'a Transport,
        counters: &'a StepCounters,
    ) -> StepContext<'a> {
        StepContext {
            space,
            sched,
            integrator,
            hydro,
            transport,
            ti_current: 8,
            time_base: 1e-3,
            cfl: 0.3,
            dt_max: 0.01,
            theta_crit_sq: 0.25,
            softening: 1e-3,
            counters,
        }
    }

    fn one_cell_space(parts: Vec<Part>) -> (Space, crate::cell::CellId) {
        let n = parts.len();
        let mut space = Space::new([8.0; 3], SpaceParams::default());
        space.parts = SharedVec::from_vec(parts);
        space.xparts = SharedVec::from_vec(vec![crate::part::XPart::default(); n]);
        let cid = space.insert_test_cell([0.0; 3], [2.0; 3], 0, None);
        space.cell_mut(cid).parts = Window { first: 0, count: n };
        (space, cid)
    }

    #[test]
    fn xv_payload_crosses_ranks() {
        let (ta, tb) = Transport::local_pair(0, 1);

        let mut p0 = Part::at([0.25, 0.5, 0.75], 0.1, 1.0);
        p0.v = [1.0, -1.0, 0.5];
        let p1 = Part::at([1.5, 1.0, 0.5], 0.1, 2.0);
        let (space_a, ca) = one_cell_space(vec![p0, p1]);

        // the receiving side holds an empty proxy of the same shape
        let (space_b, cb) = one_cell_space(vec![
            Part::at([0.0; 3], 0.0, 0.0),
            Part::at([0.0; 3], 0.0, 0.0),
        ]);

        let mut sched_a = Scheduler::new();
        let mut send = Task::new(TaskKind::Send(SendKind::Xv), TaskSubtype::None, Some(ca), None);
        send.rank = 1;
        let send = sched_a.push(send);
        let mut sched_b = Scheduler::new();
        let mut recv = Task::new(TaskKind::Recv(SendKind::Xv), TaskSubtype::None, Some(cb), None);
        recv.rank = 0;
        let recv = sched_b.push(recv);

        let integrator = IntegratorEnum::from(Leapfrog);
        let hydro = HydroEnum::from(MinimalSph);
        let counters = StepCounters::default();

        let ctx_a = step_ctx(&space_a, &sched_a, &integrator, &hydro, &ta, &counters);
        assert_eq!(execute(&ctx_a, send), TaskOutcome::Done);

        let ctx_b = step_ctx(&space_b, &sched_b, &integrator, &hydro, &tb, &counters);
        assert_eq!(execute(&ctx_b, recv), TaskOutcome::Done);

        let got = unsafe { space_b.parts.get(0) };
        assert_eq!(got.x, [0.25, 0.5, 0.75]);
        assert_eq!(got.v, [1.0, -1.0, 0.5]);
        assert_eq!(unsafe { space_b.parts.get(1) }.mass, 2.0);
    }

    #[test]
    fn step_info_payload_crosses_ranks() {
        let (ta, tb) = Transport::local_pair(0, 1);
        let (space_a, ca) = one_cell_space(vec![Part::at([1.0; 3], 0.1, 1.0)]);
        space_a.cell(ca).ti_hydro_end_min.store(96, Ordering::Relaxed);
        space_a.cell(ca).dx_max_part.store(0.125);
        let (space_b, cb) = one_cell_space(vec![Part::at([0.0; 3], 0.0, 0.0)]);

        let mut sched_a = Scheduler::new();
        let mut send = Task::new(TaskKind::Send(SendKind::Ti), TaskSubtype::None, Some(ca), None);
        send.rank = 1;
        let send = sched_a.push(send);
        let mut sched_b = Scheduler::new();
        let mut recv = Task::new(TaskKind::Recv(SendKind::Ti), TaskSubtype::None, Some(cb), None);
        recv.rank = 0;
        let recv = sched_b.push(recv);

        let integrator = IntegratorEnum::from(Leapfrog);
        let hydro = HydroEnum::from(MinimalSph);
        let counters = StepCounters::default();

        let ctx_a = step_ctx(&space_a, &sched_a, &integrator, &hydro, &ta, &counters);
        assert_eq!(execute(&ctx_a, send), TaskOutcome::Done);
        let ctx_b = step_ctx(&space_b, &sched_b, &integrator, &hydro, &tb, &counters);
        assert_eq!(execute(&ctx_b, recv), TaskOutcome::Done);

        let proxy = space_b.cell(cb);
        assert_eq!(proxy.ti_hydro_end_min.load(Ordering::Relaxed), 96);
        assert_eq!(proxy.dx_max_part.load(), 0.125);
    }

    #[test]
    fn timestep_rebins_stars_and_counts_them() {
        let mut space = Space::new([8.0; 3], SpaceParams::default());
        let mut star = crate::part::SPart::at([1.0; 3], 1.0);
        star.gpart = 0;
        star.time_bin = TimeBin(3);
        space.sparts = SharedVec::from_vec(vec![star]);
        let mut dark = crate::part::GPart::dark([3.0, 1.0, 1.0], 1.0);
        dark.time_bin = TimeBin(3);
        dark.ti_end = 8;
        let mut linked = crate::part::GPart::dark([1.0; 3], 1.0);
        linked.link = crate::part::GPartLink::Star(0);
        linked.time_bin = TimeBin(3);
        linked.ti_end = 8;
        space.gparts = SharedVec::from_vec(vec![linked, dark]);
        let cid = space.insert_test_cell([0.0; 3], [4.0; 3], 0, None);
        space.cell_mut(cid).gparts = Window { first: 0, count: 2 };
        space.cell_mut(cid).sparts = Window { first: 0, count: 1 };

        let mut sched = Scheduler::new();
        let timestep =
            sched.push(Task::new(TaskKind::Timestep, TaskSubtype::None, Some(cid), None));

        let integrator = IntegratorEnum::from(Leapfrog);
        let hydro = HydroEnum::from(MinimalSph);
        let counters = StepCounters::default();
        let transport = Transport::loopback(0);
        let ctx = step_ctx(&space, &sched, &integrator, &hydro, &transport, &counters);
        assert_eq!(execute(&ctx, timestep), TaskOutcome::Done);

        assert_eq!(counters.g_updated.load(Ordering::Relaxed), 2);
        assert_eq!(counters.s_updated.load(Ordering::Relaxed), 1);
        for i in 0..2 {
            let g = unsafe { space.gparts.get(i) };
            assert!(g.ti_end > 8, "gravity particle {i} kept its old step end");
            assert_eq!((g.ti_end - 8) % g.time_bin.interval(), 0);
        }
        // the star record mirrors its gravity particle's new bin
        assert_eq!(
            unsafe { space.sparts.get(0) }.time_bin,
            unsafe { space.gparts.get(0) }.time_bin
        );
        assert_eq!(
            space.cell(cid).ti_grav_end_min.load(Ordering::Relaxed),
            unsafe { space.gparts.get(0) }.ti_end
        );
    }

    #[test]
    fn timestep_assigns_aligned_bins() {
        let mut active = Part::at([1.0; 3], 0.1, 1.0);
        active.u = 1.0;
        active.time_bin = TimeBin(3);
        active.ti_end = 8;
        let (space, cid) = one_cell_space(vec![active]);
        let mut sched = Scheduler::new();
        let timestep = sched.push(Task::new(TaskKind::Timestep, TaskSubtype::None, Some(cid), None));

        let integrator = IntegratorEnum::from(Leapfrog);
        let hydro = HydroEnum::from(MinimalSph);
        let counters = StepCounters::default();
        let transport = Transport::loopback(0);
        let ctx = step_ctx(&space, &sched, &integrator, &hydro, &transport, &counters);
        assert_eq!(execute(&ctx, timestep), TaskOutcome::Done);

        let p = unsafe { space.parts.get(0) };
        assert!(p.time_bin.is_awake());
        assert_eq!((p.ti_end - 8) % p.time_bin.interval(), 0);
        assert!(p.ti_end > 8);
        assert_eq!(counters.updated.load(Ordering::Relaxed), 1);
        // the cell envelope follows the particle
        assert_eq!(
            space.cell(cid).ti_hydro_end_min.load(Ordering::Relaxed),
            p.ti_end
        );
    }
}
