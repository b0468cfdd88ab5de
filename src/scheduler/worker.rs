// Copyright (c) 2025 RustySched Contributors
//
// Worker threads
//
// Each worker is one OS thread bound to one deque and one stable id. The
// main loop drains the worker's own deque from the bottom; when it runs dry
// the worker turns thief and steals from a uniformly random victim's top.
// Stolen subtasks are re-queued on the thief's own deque rather than run
// inline, so the thief stays responsive.

use super::pool::SchedulerCore;
use crate::concurrent::{Backoff, Steal, WorkDeque};
use crate::scheduler::subtask::Subtask;
use rand::Rng;
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

thread_local! {
    /// Identity of the worker running on this thread, if any
    static CURRENT_TID: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Id of the worker bound to the current thread, in O(1)
///
/// `None` on threads the scheduler does not know about.
pub fn current_tid() -> Option<usize> {
    CURRENT_TID.with(|c| c.get())
}

/// Publish the current thread's worker identity. Called once per worker
/// thread before its main loop, and for worker 0 at scheduler construction.
pub(crate) fn register_worker(tid: usize) {
    CURRENT_TID.with(|c| c.set(Some(tid)));
}

/// One worker: a deque, a stable id, and a liveness flag
pub(crate) struct Worker {
    pub(crate) tid: usize,
    pub(crate) deque: WorkDeque<Subtask>,
    /// Set by the worker itself when its main loop exits; thieves may read
    /// a stale value, costing at most one wasted steal attempt
    pub(crate) dead: AtomicBool,
}

impl Worker {
    pub(crate) fn new(tid: usize, deque_capacity: usize) -> Self {
        Self {
            tid,
            deque: WorkDeque::with_capacity(deque_capacity),
            dead: AtomicBool::new(false),
        }
    }
}

/// Main loop for spawned workers (every worker except the submitter's own
/// thread). Runs until shutdown is requested and the own deque is empty.
pub(crate) fn worker_main(core: Arc<SchedulerCore>, tid: usize) {
    register_worker(tid);
    let worker = &core.workers[tid];
    debug!("worker {} online", tid);

    while !core.is_finished(tid) {
        if let Some(subtask) = worker.deque.pop_bottom() {
            // Errors are recorded in the subtask's join state; the worker
            // itself keeps going
            if let Err(err) = subtask.run(tid) {
                trace!("worker {} subtask failed: {}", tid, err);
            }
            continue;
        }
        acquire(&core, tid);
    }

    worker.dead.store(true, Ordering::Release);
    debug_assert!(worker.deque.is_empty());
    core.live_workers.fetch_sub(1, Ordering::AcqRel);
    debug!("worker {} offline", tid);
}

/// Steal phase: repeatedly pick a random other worker and try its deque top
/// until a steal lands or the worker is finished. The catch is pushed onto
/// the thief's own deque and executed by the next main-loop iteration.
fn acquire(core: &SchedulerCore, tid: usize) {
    debug_assert!(core.num_threads() >= 2);

    let mut rng = rand::rng();
    let mut backoff = Backoff::new();
    let me = &core.workers[tid];

    while !core.is_finished(tid) {
        let k = random_other_worker(&mut rng, core.num_threads(), tid);
        let victim = &core.workers[k];
        if victim.dead.load(Ordering::Acquire) {
            continue;
        }

        match victim.deque.steal_top() {
            Steal::Success(mut subtask) => {
                subtask.stolen = true;
                trace!(
                    "worker {} stole subtask {} from worker {}",
                    tid,
                    subtask.id,
                    victim.tid
                );
                me.deque.push_bottom(subtask);
                return;
            }
            Steal::Empty | Steal::Abort => backoff.snooze(),
        }
    }
}

/// Uniformly random worker id other than `my_id`
fn random_other_worker(rng: &mut impl Rng, num_threads: usize, my_id: usize) -> usize {
    let mut k = rng.random_range(0..num_threads - 1);
    if k >= my_id {
        k += 1;
    }
    debug_assert!(k < num_threads);
    debug_assert_ne!(k, my_id);
    k
}
