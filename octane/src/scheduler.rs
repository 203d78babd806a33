//! The task scheduler.
//!
//! A fixed pool of OS-thread workers drains a ready queue of task handles.
//! Inter-task ordering comes solely from the dependency edges wired at
//! construction; within a step any topological order is acceptable. A task
//! body that hits lock contention returns [`TaskOutcome::Retry`] and is put
//! back on the queue instead of blocking.

use crate::task::{Task, TaskId, TaskKind};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};

/// What a task body reports back to the scheduler.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TaskOutcome {
    /// The task ran to completion.
    Done,
    /// Transient contention; re-queue and try again later.
    Retry,
}

enum Msg {
    Run(TaskId),
    Stop,
}

/// Owner of the task arena and the worker pool entry point.
#[derive(Default)]
pub struct Scheduler {
    tasks: Vec<Task>,
}

impl Scheduler {
    /// An empty scheduler.
    #[must_use]
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Adds a task stub and returns its handle.
    pub fn push(&mut self, task: Task) -> TaskId {
        let id = TaskId::try_from(self.tasks.len()).expect("task arena exceeds u32 indices");
        self.tasks.push(task);
        id
    }

    /// The task at `id`.
    #[must_use]
    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id as usize]
    }

    /// Number of task stubs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns `true` if no stubs have been constructed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wires the edge "`before` runs before `after`".
    pub fn add_unlock(&mut self, before: TaskId, after: TaskId) {
        assert_ne!(before, after, "task cannot unlock itself");
        self.tasks[before as usize].unlocks.push(after);
    }

    /// Activates the stub at `id`: clears its skip flag.
    pub fn activate(&self, id: TaskId) {
        self.tasks[id as usize].activate();
    }

    /// Activates a send endpoint towards `target`; the stub must be a send.
    pub fn activate_send(&self, id: TaskId, target: crate::transport::Rank) {
        let task = self.task(id);
        assert!(
            matches!(task.kind, TaskKind::Send(_)) && task.rank == target,
            "activate_send on a non-send task or wrong target rank"
        );
        task.activate();
    }

    /// Re-arms every stub for the next step.
    pub fn reset_all(&self) {
        for task in &self.tasks {
            task.reset();
        }
    }

    /// Number of active (non-skipped) stubs.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.tasks.iter().filter(|t| !t.skipped()).count()
    }

    /// Executes every active task on `nworkers` OS threads, honoring the
    /// dependency edges. `execute` is the task body; it must be safe to
    /// call from any worker. Panics in a body abort the run.
    pub fn run<F>(&self, nworkers: usize, execute: F)
    where
        F: Fn(TaskId) -> TaskOutcome + Sync,
    {
        assert!(nworkers > 0, "worker pool of size zero");

        // seed the wait counters over active-to-active edges
        let mut total_active = 0_usize;
        for task in &self.tasks {
            if task.skipped() {
                continue;
            }
            total_active += 1;
            for &dep in &task.unlocks {
                let dep = self.task(dep);
                if !dep.skipped() {
                    dep.inc_wait();
                }
            }
        }
        if total_active == 0 {
            return;
        }

        let (tx, rx): (Sender<Msg>, Receiver<Msg>) = unbounded();
        for (id, task) in self.tasks.iter().enumerate() {
            if !task.skipped() && task.wait_count() == 0 {
                tx.send(Msg::Run(TaskId::try_from(id).unwrap())).unwrap();
            }
        }

        let remaining = AtomicUsize::new(total_active);
        std::thread::scope(|scope| {
            for _ in 0..nworkers {
                let rx = rx.clone();
                let tx = tx.clone();
                let remaining = &remaining;
                let execute = &execute;
                scope.spawn(move || loop {
                    match rx.recv() {
                        Ok(Msg::Run(id)) => match execute(id) {
                            TaskOutcome::Retry => {
                                std::thread::yield_now();
                                tx.send(Msg::Run(id)).unwrap();
                            }
                            TaskOutcome::Done => {
                                for &dep in &self.task(id).unlocks {
                                    let dep_task = self.task(dep);
                                    if !dep_task.skipped() && dep_task.dec_wait() {
                                        tx.send(Msg::Run(dep)).unwrap();
                                    }
                                }
                                if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                                    for _ in 0..nworkers {
                                        tx.send(Msg::Stop).unwrap();
                                    }
                                }
                            }
                        },
                        Ok(Msg::Stop) | Err(_) => break,
                    }
                });
            }
        });
    }
}
