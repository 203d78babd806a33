//! The per-rank engine.
//!
//! Owns the space, the task arena and the policy knobs, and turns them
//! into steps: rebuild when flagged, advance the integer time to the next
//! synchronisation point, activate the task subgraph, launch the worker
//! pool, and fold the outcome into a globally agreed step summary.

use crate::activate::{set_super_pointers, unskip_gravity, unskip_hydro, ActivationContext};
use crate::cell::CellId;
use crate::drift::{drift_gpart_cell, drift_part_cell, DriftContext};
use crate::hydro::{Hydro, HydroEnum, MinimalSph, KERNEL_GAMMA};
use crate::integrator::{IntegratorEnum, Leapfrog};
use crate::part::{GPartLink, ParticleKind};
use crate::reduce::StepSummary;
use crate::runner::{self, StepContext, StepCounters};
use crate::scheduler::Scheduler;
use crate::sort::get_sort_id;
use crate::space::Space;
use crate::task::{Task, TaskId, TaskKind, TaskSubtype};
use crate::timeline::{IntegerTime, MAX_NR_TIMESTEPS};
use crate::transport::{TagCounter, Transport};
use itertools::iproduct;
use std::sync::atomic::Ordering;

/// Engine policy knobs.
#[derive(Clone, Copy, Debug)]
pub struct EngineParams {
    nworkers: usize,
    cfl: f64,
    dt_max: f64,
    t_end: f64,
    theta_crit: f64,
    softening: f64,
    with_hydro: bool,
    with_self_gravity: bool,
    with_gradient: bool,
}

impl Default for EngineParams {
    fn default() -> Self {
        Self {
            nworkers: 4,
            cfl: 0.3,
            dt_max: 0.01,
            t_end: 1.0,
            theta_crit: 0.5,
            softening: 1e-3,
            with_hydro: true,
            with_self_gravity: true,
            with_gradient: false,
        }
    }
}

impl EngineParams {
    /// Returns the worker-pool size.
    #[must_use]
    pub const fn nworkers(&self) -> usize {
        self.nworkers
    }

    /// Returns the Courant factor.
    #[must_use]
    pub const fn cfl(&self) -> f64 {
        self.cfl
    }

    /// Returns the physical upper bound on any step.
    #[must_use]
    pub const fn dt_max(&self) -> f64 {
        self.dt_max
    }

    /// Returns the end time of the run.
    #[must_use]
    pub const fn t_end(&self) -> f64 {
        self.t_end
    }

    /// Returns the opening angle of the acceptance criterion.
    #[must_use]
    pub const fn theta_crit(&self) -> f64 {
        self.theta_crit
    }

    /// Returns the Plummer softening of direct gravity.
    #[must_use]
    pub const fn softening(&self) -> f64 {
        self.softening
    }

    /// Returns whether hydrodynamics is stepped.
    #[must_use]
    pub const fn with_hydro(&self) -> bool {
        self.with_hydro
    }

    /// Returns whether self-gravity is stepped.
    #[must_use]
    pub const fn with_self_gravity(&self) -> bool {
        self.with_self_gravity
    }

    /// Returns whether the extra gradient loop is configured.
    #[must_use]
    pub const fn with_gradient(&self) -> bool {
        self.with_gradient
    }

    /// Sets the worker-pool size.
    pub fn set_nworkers(&mut self, nworkers: usize) {
        assert!(nworkers > 0, "worker pool of size zero");
        self.nworkers = nworkers;
    }

    /// Sets the Courant factor.
    pub fn set_cfl(&mut self, cfl: f64) {
        self.cfl = cfl;
    }

    /// Sets the physical upper bound on any step.
    pub fn set_dt_max(&mut self, dt_max: f64) {
        self.dt_max = dt_max;
    }

    /// Sets the end time of the run.
    pub fn set_t_end(&mut self, t_end: f64) {
        self.t_end = t_end;
    }

    /// Sets the opening angle of the acceptance criterion.
    pub fn set_theta_crit(&mut self, theta_crit: f64) {
        self.theta_crit = theta_crit;
    }

    /// Sets the Plummer softening of direct gravity.
    pub fn set_softening(&mut self, softening: f64) {
        self.softening = softening;
    }

    /// Sets whether hydrodynamics is stepped.
    pub fn set_with_hydro(&mut self, with_hydro: bool) {
        self.with_hydro = with_hydro;
    }

    /// Sets whether self-gravity is stepped.
    pub fn set_with_self_gravity(&mut self, with_self_gravity: bool) {
        self.with_self_gravity = with_self_gravity;
    }

    /// Sets whether the extra gradient loop is configured.
    pub fn set_with_gradient(&mut self, with_gradient: bool) {
        self.with_gradient = with_gradient;
    }
}

/// One rank's engine.
pub struct Engine {
    space: Space,
    sched: Scheduler,
    params: EngineParams,
    integrator: IntegratorEnum,
    hydro: HydroEnum,
    transport: Transport,
    tags: TagCounter,
    ti_current: IntegerTime,
    ti_end_min_global: Option<IntegerTime>,
    rebuild_needed: bool,
    steps_done: u64,
}

impl Engine {
    /// An engine over `space`, exchanging with `transport`'s peers.
    #[must_use]
    pub fn new(space: Space, params: EngineParams, transport: Transport) -> Self {
        Self {
            space,
            sched: Scheduler::new(),
            params,
            integrator: IntegratorEnum::from(Leapfrog),
            hydro: HydroEnum::from(MinimalSph),
            transport,
            tags: TagCounter::new(),
            ti_current: 0,
            ti_end_min_global: None,
            rebuild_needed: false,
            steps_done: 0,
        }
    }

    /// The spatial container.
    #[must_use]
    pub const fn space(&self) -> &Space {
        &self.space
    }

    /// Unique access to the spatial container, between steps.
    pub fn space_mut(&mut self) -> &mut Space {
        &mut self.space
    }

    /// The policy knobs.
    #[must_use]
    pub const fn params(&self) -> &EngineParams {
        &self.params
    }

    /// Current integer time.
    #[must_use]
    pub const fn ti_current(&self) -> IntegerTime {
        self.ti_current
    }

    /// Current physical time.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.ti_current as f64 * self.time_base()
    }

    /// Number of steps taken so far.
    #[must_use]
    pub const fn steps_done(&self) -> u64 {
        self.steps_done
    }

    /// Physical length of one integer tick.
    #[must_use]
    pub fn time_base(&self) -> f64 {
        self.params.t_end / MAX_NR_TIMESTEPS as f64
    }

    /// Builds the tree, assigns every particle its first time-bin and
    /// constructs the task graph. Must be called once before stepping.
    pub fn init(&mut self) {
        let _span = tracing::info_span!("engine_init").entered();
        self.space.rebuild(0);
        for &top in &self.space.top_cells().to_vec() {
            self.space.sanitize(top, false);
        }
        self.assign_initial_bins();
        for &top in &self.space.top_cells().to_vec() {
            runner::fold_end_times(&self.space, top, 0);
        }
        self.construct_tasks();

        // agree on the first synchronisation point
        let (hydro_min, grav_min) = self.local_end_mins();
        let summary = StepSummary {
            ti_hydro_end_min: hydro_min,
            ti_grav_end_min: grav_min,
            ..StepSummary::default()
        };
        let global = self
            .transport
            .allreduce(summary)
            .expect("transport failure is fatal");
        self.ti_end_min_global = Some(global.ti_end_min());
    }

    /// First time-bin assignment, from the same criterion the timestep
    /// task applies.
    fn assign_initial_bins(&mut self) {
        let time_base = self.time_base();
        let cfl = self.params.cfl;
        let dt_max = self.params.dt_max;
        let hydro = self.hydro;

        let parts = self.space.parts.as_mut_slice();
        let mut bins = Vec::with_capacity(parts.len());
        for p in parts.iter_mut() {
            let v = p.v.iter().map(|v| v * v).sum::<f64>().sqrt();
            let signal = hydro.sound_speed(p) + v + 1e-30;
            let dt = (cfl * p.h * KERNEL_GAMMA / signal).min(dt_max);
            let dti = ((dt / time_base) as IntegerTime).max(2);
            let bin = crate::timeline::get_time_bin(dti).min(crate::timeline::MAX_TIME_BIN);
            p.time_bin = bin;
            p.ti_end = bin.interval();
            bins.push((p.gpart, bin, p.ti_end));
        }
        let gparts = self.space.gparts.as_mut_slice();
        for (link, bin, ti_end) in bins {
            if link != crate::part::NO_LINK {
                gparts[link as usize].time_bin = bin;
                gparts[link as usize].ti_end = ti_end;
            }
        }
        // dark and star gparts have no hydro signal; both take the cap
        let dti = ((dt_max / time_base) as IntegerTime).max(2);
        let cap_bin = crate::timeline::get_time_bin(dti).min(crate::timeline::MAX_TIME_BIN);
        let mut star_bins = Vec::new();
        for g in gparts.iter_mut() {
            if !matches!(g.link, GPartLink::Gas(_)) {
                g.time_bin = cap_bin;
                g.ti_end = cap_bin.interval();
                if let GPartLink::Star(s) = g.link {
                    star_bins.push(s);
                }
            }
        }
        let sparts = self.space.sparts.as_mut_slice();
        for s in star_bins {
            sparts[s as usize].time_bin = cap_bin;
        }
    }

    /// Runs one step and returns the globally agreed summary.
    pub fn step(&mut self) -> StepSummary {
        if self.rebuild_needed {
            self.rebuild();
        }

        // advance to the next synchronisation point; every rank follows
        // the agreed global minimum
        let ti_next = self.ti_end_min_global.unwrap_or_else(|| {
            let (hydro, grav) = self.local_end_mins();
            hydro.min(grav)
        });
        assert!(
            ti_next > self.ti_current,
            "no particle has a step ending after {}",
            self.ti_current
        );
        self.ti_current = ti_next;
        let _span =
            tracing::info_span!("step", step = self.steps_done, ti_current = self.ti_current)
                .entered();

        self.sched.reset_all();
        let activation = ActivationContext {
            space: &self.space,
            sched: &self.sched,
            integrator: &self.integrator,
            hydro: &self.hydro,
            ti_current: self.ti_current,
            time_base: self.time_base(),
            rank: self.transport.rank(),
            theta_crit_sq: self.params.theta_crit * self.params.theta_crit,
            with_gradient: self.params.with_gradient,
        };
        let mut rebuild = false;
        for &top in self.space.top_cells() {
            if self.params.with_hydro {
                rebuild |= unskip_hydro(&activation, top);
            }
            if self.params.with_self_gravity {
                unskip_gravity(&activation, top);
            }
        }

        let counters = StepCounters::default();
        let ctx = StepContext {
            space: &self.space,
            sched: &self.sched,
            integrator: &self.integrator,
            hydro: &self.hydro,
            transport: &self.transport,
            ti_current: self.ti_current,
            time_base: self.time_base(),
            cfl: self.params.cfl,
            dt_max: self.params.dt_max,
            theta_crit_sq: self.params.theta_crit * self.params.theta_crit,
            softening: self.params.softening,
            counters: &counters,
        };
        self.sched
            .run(self.params.nworkers, |tid| runner::execute(&ctx, tid));

        let (hydro_min, grav_min) = self.local_end_mins();
        let summary = StepSummary {
            ti_hydro_end_min: hydro_min,
            ti_grav_end_min: grav_min,
            updated: counters.updated.load(Ordering::Relaxed),
            g_updated: counters.g_updated.load(Ordering::Relaxed),
            s_updated: counters.s_updated.load(Ordering::Relaxed),
            rebuild,
        };

        let global = self
            .transport
            .allreduce(summary)
            .expect("transport failure is fatal");
        self.ti_end_min_global = Some(global.ti_end_min());
        self.rebuild_needed = global.rebuild;
        self.steps_done += 1;
        global
    }

    /// The earliest step ends among this rank's particles, per kind.
    fn local_end_mins(&self) -> (IntegerTime, IntegerTime) {
        let mut hydro = IntegerTime::MAX;
        let mut grav = IntegerTime::MAX;
        for &top in self.space.top_cells() {
            let c = self.space.cell(top);
            hydro = hydro.min(c.ti_hydro_end_min.load(Ordering::Relaxed));
            grav = grav.min(c.ti_grav_end_min.load(Ordering::Relaxed));
        }
        (hydro, grav)
    }

    /// Drifts everything to the current time, re-partitions the particles
    /// and reconstructs the task graph.
    fn rebuild(&mut self) {
        tracing::info!(ti_current = self.ti_current, "rebuilding the tree");
        {
            let drift = DriftContext {
                space: &self.space,
                integrator: &self.integrator,
                hydro: &self.hydro,
                ti_current: self.ti_current,
                time_base: self.time_base(),
            };
            for &top in self.space.top_cells() {
                drift_part_cell(&drift, top, true);
                drift_gpart_cell(&drift, top, true);
            }
        }
        self.space.rebuild(self.ti_current);
        for &top in &self.space.top_cells().to_vec() {
            runner::fold_end_times(&self.space, top, self.ti_current);
        }
        self.construct_tasks();
        self.rebuild_needed = false;
    }

    /// Builds the per-step task stubs and their dependency edges for the
    /// current decomposition. All stubs anchor at the top-level cells.
    fn construct_tasks(&mut self) {
        self.sched = Scheduler::new();
        let tops = self.space.top_cells().to_vec();
        let rank = self.transport.rank();

        // per-cell scaffolding
        let mut scaffold: Vec<CellScaffold> = Vec::with_capacity(tops.len());
        for &cid in &tops {
            let tag = self.tags.next_tag();
            {
                let c = self.space.cell_mut(cid);
                c.tag = tag;
                c.nodeid = rank;
            }
            let c = self.space.cell(cid);
            let has_gas = self.params.with_hydro && c.parts.count > 0;
            let has_grav = self.params.with_self_gravity && c.gparts.count > 0;
            let split = c.split;

            let mut sc = CellScaffold::default();
            if has_gas || has_grav {
                sc.kick1 = Some(self.push_cell_task(TaskKind::Kick1, cid));
                sc.kick2 = Some(self.push_cell_task(TaskKind::Kick2, cid));
                sc.timestep = Some(self.push_cell_task(TaskKind::Timestep, cid));
                sc.end_force = Some(self.push_cell_task(TaskKind::EndForce, cid));
                sc.cooling = Some(self.push_cell_task(TaskKind::Cooling, cid));
                sc.sourceterms = Some(self.push_cell_task(TaskKind::SourceTerms, cid));
            }
            if has_gas {
                sc.drift_part = Some(self.push_cell_task(TaskKind::Drift(ParticleKind::Gas), cid));
                sc.sort = Some(self.push_cell_task(TaskKind::Sort, cid));
                sc.ghost = Some(self.push_cell_task(TaskKind::Ghost, cid));
                let self_kind = if split {
                    TaskKind::SubSelf
                } else {
                    TaskKind::SelfInteraction
                };
                sc.density_self = Some(self.push_interaction(self_kind, TaskSubtype::Density, cid, None, 0));
                if self.params.with_gradient {
                    sc.gradient_self =
                        Some(self.push_interaction(self_kind, TaskSubtype::Gradient, cid, None, 0));
                }
                sc.force_self = Some(self.push_interaction(self_kind, TaskSubtype::Force, cid, None, 0));
            }
            if has_grav {
                sc.drift_gpart =
                    Some(self.push_cell_task(TaskKind::Drift(ParticleKind::Gravity), cid));
                sc.init_grav = Some(self.push_cell_task(TaskKind::InitGrav, cid));
                sc.grav_long_range = Some(self.push_cell_task(TaskKind::GravLongRange, cid));
                sc.grav_down = Some(self.push_cell_task(TaskKind::GravDown, cid));
                let self_kind = if split {
                    TaskKind::SubSelf
                } else {
                    TaskKind::SelfInteraction
                };
                sc.grav_self = Some(self.push_interaction(self_kind, TaskSubtype::Grav, cid, None, 0));
            }
            scaffold.push(sc);
        }

        // neighbour pairs over the periodic top grid
        let n = self.space.params().top_grid();
        let mut pairs: Vec<(usize, usize, usize)> = Vec::new();
        for (a, &ca) in tops.iter().enumerate() {
            let (ai, aj, ak) = (a / (n * n), (a / n) % n, a % n);
            for (di, dj, dk) in iproduct!(-1_i64..=1, -1_i64..=1, -1_i64..=1) {
                if (di, dj, dk) == (0, 0, 0) {
                    continue;
                }
                let bi = (ai as i64 + di).rem_euclid(n as i64) as usize;
                let bj = (aj as i64 + dj).rem_euclid(n as i64) as usize;
                let bk = (ak as i64 + dk).rem_euclid(n as i64) as usize;
                let b = bi * n * n + bj * n + bk;
                if a < b {
                    let cb = tops[b];
                    let (sid, _, _) = get_sort_id(
                        self.space.dim,
                        self.space.cell(ca).loc,
                        self.space.cell(cb).loc,
                        self.space.cell(ca).width,
                    );
                    pairs.push((a, b, sid));
                }
            }
        }

        let mut pair_tasks: Vec<PairScaffold> = Vec::new();
        for &(a, b, sid) in &pairs {
            let (ca, cb) = (tops[a], tops[b]);
            let split = self.space.cell(ca).split || self.space.cell(cb).split;
            let pair_kind = if split {
                TaskKind::SubPair
            } else {
                TaskKind::PairInteraction
            };
            let mut ps = PairScaffold { a, b, ..PairScaffold::default() };
            let gas = self.params.with_hydro
                && self.space.cell(ca).parts.count > 0
                && self.space.cell(cb).parts.count > 0;
            if gas {
                ps.density = Some(self.push_interaction(
                    pair_kind,
                    TaskSubtype::Density,
                    ca,
                    Some(cb),
                    u32::try_from(sid).unwrap(),
                ));
                if self.params.with_gradient {
                    ps.gradient = Some(self.push_interaction(
                        pair_kind,
                        TaskSubtype::Gradient,
                        ca,
                        Some(cb),
                        u32::try_from(sid).unwrap(),
                    ));
                }
                ps.force = Some(self.push_interaction(
                    pair_kind,
                    TaskSubtype::Force,
                    ca,
                    Some(cb),
                    u32::try_from(sid).unwrap(),
                ));
            }
            let grav = self.params.with_self_gravity
                && self.space.cell(ca).gparts.count > 0
                && self.space.cell(cb).gparts.count > 0;
            if grav {
                ps.grav = Some(self.push_interaction(
                    pair_kind,
                    TaskSubtype::Grav,
                    ca,
                    Some(cb),
                    0,
                ));
            }
            pair_tasks.push(ps);
        }

        // register the handles on the cells
        for (i, &cid) in tops.iter().enumerate() {
            let sc = &scaffold[i];
            let c = self.space.cell_mut(cid);
            c.tasks = crate::cell::CellTasks::default();
            c.tasks.drift_part = sc.drift_part;
            c.tasks.drift_gpart = sc.drift_gpart;
            c.tasks.sort = sc.sort;
            c.tasks.ghost = sc.ghost;
            c.tasks.kick1 = sc.kick1;
            c.tasks.kick2 = sc.kick2;
            c.tasks.timestep = sc.timestep;
            c.tasks.end_force = sc.end_force;
            c.tasks.cooling = sc.cooling;
            c.tasks.sourceterms = sc.sourceterms;
            c.tasks.init_grav = sc.init_grav;
            c.tasks.grav_down = sc.grav_down;
            c.tasks.grav_long_range = sc.grav_long_range;
            if let Some(t) = sc.density_self {
                c.tasks.density.push(t);
            }
            if let Some(t) = sc.gradient_self {
                c.tasks.gradient.push(t);
            }
            if let Some(t) = sc.force_self {
                c.tasks.force.push(t);
            }
            if let Some(t) = sc.grav_self {
                c.tasks.grav.push(t);
            }
        }
        for ps in &pair_tasks {
            for cell_index in [ps.a, ps.b] {
                let c = self.space.cell_mut(tops[cell_index]);
                if let Some(t) = ps.density {
                    c.tasks.density.push(t);
                }
                if let Some(t) = ps.gradient {
                    c.tasks.gradient.push(t);
                }
                if let Some(t) = ps.force {
                    c.tasks.force.push(t);
                }
                if let Some(t) = ps.grav {
                    c.tasks.grav.push(t);
                }
            }
        }

        self.wire_dependencies(&scaffold, &pair_tasks);
        set_super_pointers(&mut self.space);
    }

    fn push_cell_task(&mut self, kind: TaskKind, cid: CellId) -> TaskId {
        self.sched
            .push(Task::new(kind, TaskSubtype::None, Some(cid), None))
    }

    fn push_interaction(
        &mut self,
        kind: TaskKind,
        subtype: TaskSubtype,
        ci: CellId,
        cj: Option<CellId>,
        flags: u32,
    ) -> TaskId {
        let mut task = Task::new(kind, subtype, Some(ci), cj);
        task.flags = flags;
        self.sched.push(task)
    }

    /// The step-phase ordering: drift before sort before density, ghost
    /// between the loops, forces into the finalisation and kick chain,
    /// gravity from init through down-sweep into the same finalisation.
    fn wire_dependencies(&mut self, scaffold: &[CellScaffold], pairs: &[PairScaffold]) {
        for sc in scaffold {
            if let (Some(d), Some(s)) = (sc.drift_part, sc.sort) {
                self.sched.add_unlock(d, s);
            }
            if let (Some(d), Some(t)) = (sc.drift_part, sc.density_self) {
                self.sched.add_unlock(d, t);
            }
            // the sort reads positions without a lock, so nothing may
            // write the window while it runs
            if let (Some(s), Some(t)) = (sc.sort, sc.density_self) {
                self.sched.add_unlock(s, t);
            }
            if let (Some(t), Some(g)) = (sc.density_self, sc.ghost) {
                self.sched.add_unlock(t, g);
            }
            if let Some(grad) = sc.gradient_self {
                if let Some(g) = sc.ghost {
                    self.sched.add_unlock(g, grad);
                }
                if let Some(f) = sc.force_self {
                    self.sched.add_unlock(grad, f);
                }
            }
            if let (Some(g), Some(f)) = (sc.ghost, sc.force_self) {
                self.sched.add_unlock(g, f);
            }
            if let (Some(f), Some(e)) = (sc.force_self, sc.end_force) {
                self.sched.add_unlock(f, e);
            }
            if let (Some(d), Some(i)) = (sc.drift_gpart, sc.init_grav) {
                self.sched.add_unlock(d, i);
            }
            for grav in [sc.grav_self, sc.grav_long_range] {
                if let (Some(i), Some(t)) = (sc.init_grav, grav) {
                    self.sched.add_unlock(i, t);
                }
                if let (Some(t), Some(down)) = (grav, sc.grav_down) {
                    self.sched.add_unlock(t, down);
                }
            }
            if let (Some(down), Some(e)) = (sc.grav_down, sc.end_force) {
                self.sched.add_unlock(down, e);
            }
            // finalisation chain
            for window in [
                (sc.end_force, sc.cooling),
                (sc.cooling, sc.sourceterms),
                (sc.sourceterms, sc.kick2),
                (sc.kick2, sc.timestep),
                (sc.timestep, sc.kick1),
            ] {
                if let (Some(before), Some(after)) = window {
                    self.sched.add_unlock(before, after);
                }
            }
        }

        for ps in pairs {
            let (sa, sb) = (&scaffold[ps.a], &scaffold[ps.b]);
            if let Some(density) = ps.density {
                for sc in [sa, sb] {
                    if let Some(d) = sc.drift_part {
                        self.sched.add_unlock(d, density);
                    }
                    if let Some(s) = sc.sort {
                        self.sched.add_unlock(s, density);
                    }
                    if let Some(g) = sc.ghost {
                        self.sched.add_unlock(density, g);
                    }
                }
            }
            if let Some(gradient) = ps.gradient {
                for sc in [sa, sb] {
                    if let Some(g) = sc.ghost {
                        self.sched.add_unlock(g, gradient);
                    }
                    if let Some(f) = sc.force_self {
                        self.sched.add_unlock(gradient, f);
                    }
                }
                if let Some(force) = ps.force {
                    self.sched.add_unlock(gradient, force);
                }
            }
            if let Some(force) = ps.force {
                for sc in [sa, sb] {
                    if let Some(g) = sc.ghost {
                        self.sched.add_unlock(g, force);
                    }
                    if let Some(grad) = sc.gradient_self {
                        self.sched.add_unlock(grad, force);
                    }
                    if let Some(e) = sc.end_force {
                        self.sched.add_unlock(force, e);
                    }
                }
            }
            if let Some(grav) = ps.grav {
                for sc in [sa, sb] {
                    if let Some(d) = sc.drift_gpart {
                        self.sched.add_unlock(d, grav);
                    }
                    if let Some(i) = sc.init_grav {
                        self.sched.add_unlock(i, grav);
                    }
                    if let Some(down) = sc.grav_down {
                        self.sched.add_unlock(grav, down);
                    }
                }
            }
        }

    }
}

#[derive(Clone, Copy, Default)]
struct CellScaffold {
    drift_part: Option<TaskId>,
    drift_gpart: Option<TaskId>,
    sort: Option<TaskId>,
    ghost: Option<TaskId>,
    kick1: Option<TaskId>,
    kick2: Option<TaskId>,
    timestep: Option<TaskId>,
    end_force: Option<TaskId>,
    cooling: Option<TaskId>,
    sourceterms: Option<TaskId>,
    init_grav: Option<TaskId>,
    grav_down: Option<TaskId>,
    grav_long_range: Option<TaskId>,
    density_self: Option<TaskId>,
    gradient_self: Option<TaskId>,
    force_self: Option<TaskId>,
    grav_self: Option<TaskId>,
}

#[derive(Clone, Copy, Default)]
struct PairScaffold {
    a: usize,
    b: usize,
    density: Option<TaskId>,
    gradient: Option<TaskId>,
    force: Option<TaskId>,
    grav: Option<TaskId>,
}
