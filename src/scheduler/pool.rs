// Copyright (c) 2025 RustySched Contributors
//
// Scheduler: worker pool construction, parallel loop submission and join
//
// `execute` partitions a loop's iteration space into at most one subtask per
// worker, pushes them all onto the calling worker's deque, then drains that
// deque while the other workers steal the remainder. The call returns when
// the loop's join counter reaches zero, or immediately with the error of a
// subtask the submitter ran itself.

use super::join::JoinState;
use super::subtask::{LoopTask, SeqTask, Subtask};
use super::worker::{current_tid, register_worker, worker_main, Worker};
use crate::error::{Result, SchedError};
use crate::SchedulerConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use tracing::debug;

/// State shared between the scheduler handle and all worker threads
pub(crate) struct SchedulerCore {
    pub(crate) workers: Box<[Worker]>,
    /// Raised once by shutdown; each worker exits its main loop when this is
    /// set and its own deque is empty
    pub(crate) should_exit: AtomicBool,
    /// Workers whose main loop has not yet exited (the submitting thread,
    /// worker 0, stays counted for the scheduler's lifetime)
    pub(crate) live_workers: AtomicUsize,
}

impl SchedulerCore {
    pub(crate) fn num_threads(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_finished(&self, tid: usize) -> bool {
        self.should_exit.load(Ordering::Acquire) && self.workers[tid].deque.is_empty()
    }
}

/// Iteration-space split for one parallel loop: at most one subtask per
/// worker, with the remainder spread one iteration each over the first
/// subtasks
#[derive(Debug, Clone, Copy)]
pub(crate) struct Partition {
    pub(crate) iter_per_subtask: i64,
    pub(crate) remainder: i64,
    pub(crate) nsubtasks: usize,
}

impl Partition {
    pub(crate) fn plan(iterations: i64, num_threads: usize) -> Self {
        debug_assert!(iterations > 0);
        let w = num_threads as i64;
        let iter_per_subtask = iterations / w;
        let remainder = iterations % w;
        let nsubtasks = if iter_per_subtask == 0 {
            remainder as usize
        } else {
            num_threads
        };
        Self {
            iter_per_subtask,
            remainder,
            nsubtasks,
        }
    }

    /// Length of subtask `id`'s iteration range
    pub(crate) fn len_of(&self, id: usize) -> i64 {
        self.iter_per_subtask + i64::from((id as i64) < self.remainder)
    }
}

/// Internal chunking hint carried on each subtask when the caller gave a
/// granularity; 0 disables the hint
pub(crate) fn chunk_hint(iter_per_subtask: i64, granularity: i64) -> i64 {
    if granularity > 0 {
        (iter_per_subtask / granularity).max(1)
    } else {
        0
    }
}

/// Work-stealing loop scheduler over a fixed pool of worker threads
///
/// The constructing thread acts as worker 0 and is expected to be the one
/// calling [`execute`](Self::execute) (kernels running on any worker thread
/// may also call it, which nests). Submitting from unrelated threads is not
/// supported.
pub struct Scheduler {
    core: Arc<SchedulerCore>,
    handles: Vec<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Create a scheduler and spawn its worker threads
    ///
    /// Workers 1..N run on spawned named threads; the calling thread is
    /// registered as worker 0.
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        let num_threads = if config.num_threads == 0 {
            num_cpus::get()
        } else {
            config.num_threads
        };

        let workers: Box<[Worker]> = (0..num_threads)
            .map(|tid| Worker::new(tid, config.deque_capacity))
            .collect();

        let core = Arc::new(SchedulerCore {
            workers,
            should_exit: AtomicBool::new(false),
            live_workers: AtomicUsize::new(num_threads),
        });

        register_worker(0);

        let mut handles = Vec::with_capacity(num_threads.saturating_sub(1));
        for tid in 1..num_threads {
            let core = Arc::clone(&core);
            let handle = thread::Builder::new()
                .name(format!("sched-worker-{}", tid))
                .spawn(move || worker_main(core, tid))
                .map_err(|e| {
                    SchedError::Internal(format!("Failed to spawn worker thread: {}", e))
                })?;
            handles.push(handle);
        }

        debug!("scheduler online with {} workers", num_threads);
        Ok(Self { core, handles })
    }

    /// Number of workers, fixed at construction
    pub fn num_threads(&self) -> usize {
        self.core.num_threads()
    }

    /// Run a parallel loop to completion
    ///
    /// Partitions `[0, task.iterations)` into at most one subtask per
    /// worker, submits them on the calling worker's deque and joins. Returns
    /// an upper bound on the number of subtasks produced, or the first error
    /// any subtask reported. An error from a subtask the submitter ran
    /// itself returns immediately; siblings still complete on other workers
    /// against the reference-counted join state.
    pub fn execute(&self, task: &LoopTask) -> Result<usize> {
        if task.iterations < 0 {
            return Err(SchedError::InvalidArgument(format!(
                "task {}: negative iteration count",
                task.name
            )));
        }
        if task.granularity < 0 {
            return Err(SchedError::InvalidArgument(format!(
                "task {}: negative granularity",
                task.name
            )));
        }
        if task.iterations == 0 {
            return Ok(0);
        }

        let tid = current_tid().unwrap_or(0);
        let me = &self.core.workers[tid];

        let plan = Partition::plan(task.iterations, self.core.num_threads());
        let chunk = chunk_hint(plan.iter_per_subtask, task.granularity);
        debug!(
            "task {}: {} iterations as {} subtasks on worker {} (chunk hint {})",
            task.name, task.iterations, plan.nsubtasks, tid, chunk
        );

        let join = JoinState::new(plan.nsubtasks);
        let mut start = 0i64;
        for id in 0..plan.nsubtasks {
            let end = start + plan.len_of(id);
            me.deque.push_bottom(Subtask {
                kernel: Arc::clone(&task.kernel),
                start,
                end,
                chunk,
                id,
                join: Arc::clone(&join),
                created_by: tid,
                stolen: false,
            });
            start = end;
        }
        debug_assert_eq!(start, task.iterations);

        // Join loop: serve our own deque while thieves drain the top; once
        // the deque is dry, sleep until the counter hits zero. The submitter
        // never steals.
        loop {
            if join.is_complete() {
                break;
            }
            match me.deque.pop_bottom() {
                Some(subtask) => subtask.run(tid)?,
                None => {
                    join.wait();
                    break;
                }
            }
        }

        match join.first_error() {
            Some(err) => Err(err),
            None => Ok(if task.granularity > 0 {
                // Any worker may subdivide a chunked subtask, so report the
                // safe upper bound
                self.core.num_threads()
            } else {
                plan.nsubtasks
            }),
        }
    }

    /// Run a task sequentially, bypassing the parallel machinery
    pub fn do_task(&self, task: &SeqTask) -> Result<()> {
        debug!("task {}: running sequentially", task.name);
        task.kernel.run(task.iterations, current_tid().unwrap_or(0))
    }

    /// Aggregate counters across all workers
    pub fn stats(&self) -> SchedulerStats {
        let mut stats = SchedulerStats {
            num_threads: self.core.num_threads(),
            live_workers: self.core.live_workers.load(Ordering::Acquire),
            ..SchedulerStats::default()
        };

        for worker in self.core.workers.iter() {
            let d = worker.deque.stats();
            stats.total_pushes += d.push_count;
            stats.total_pops += d.pop_count;
            stats.total_steals += d.steal_count;
            stats.total_steal_attempts += d.steal_attempt_count;
            stats.total_grows += d.grow_count;
        }

        stats
    }

    /// Request shutdown and join all worker threads
    ///
    /// Workers exit once their own deques are empty; any subtasks still
    /// queued elsewhere after a fast-failed loop are drained first by
    /// stealing.
    pub fn shutdown(&mut self) {
        self.core.should_exit.store(true, Ordering::Release);

        while let Some(handle) = self.handles.pop() {
            let _ = handle.join();
        }
        debug!("scheduler offline");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Aggregate counters for a scheduler
#[derive(Debug, Clone, Copy, Default)]
pub struct SchedulerStats {
    pub num_threads: usize,
    pub live_workers: usize,
    pub total_pushes: u64,
    pub total_pops: u64,
    pub total_steals: u64,
    pub total_steal_attempts: u64,
    pub total_grows: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn ranges_of(plan: &Partition) -> Vec<(i64, i64)> {
        let mut out = Vec::with_capacity(plan.nsubtasks);
        let mut start = 0;
        for id in 0..plan.nsubtasks {
            let end = start + plan.len_of(id);
            out.push((start, end));
            start = end;
        }
        out
    }

    #[test]
    fn test_partition_fewer_iterations_than_workers() {
        let plan = Partition::plan(3, 8);
        assert_eq!(plan.iter_per_subtask, 0);
        assert_eq!(plan.remainder, 3);
        assert_eq!(plan.nsubtasks, 3);
        assert_eq!(ranges_of(&plan), vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn test_partition_exact_division() {
        let plan = Partition::plan(100, 4);
        assert_eq!(plan.nsubtasks, 4);
        assert_eq!(ranges_of(&plan), vec![(0, 25), (25, 50), (50, 75), (75, 100)]);
    }

    #[test]
    fn test_partition_uneven() {
        let plan = Partition::plan(103, 4);
        assert_eq!(plan.nsubtasks, 4);
        assert_eq!(ranges_of(&plan), vec![(0, 26), (26, 52), (52, 78), (78, 103)]);
    }

    #[test]
    fn test_partition_single_worker() {
        let plan = Partition::plan(7, 1);
        assert_eq!(plan.nsubtasks, 1);
        assert_eq!(ranges_of(&plan), vec![(0, 7)]);
    }

    #[test]
    fn test_chunk_hint() {
        assert_eq!(chunk_hint(100, 0), 0);
        assert_eq!(chunk_hint(100, 10), 10);
        assert_eq!(chunk_hint(100, 7), 14);
        // Granularity larger than the subtask still yields one chunk
        assert_eq!(chunk_hint(5, 100), 1);
        assert_eq!(chunk_hint(0, 4), 1);
    }

    proptest! {
        /// Ranges are contiguous from zero, pairwise disjoint, non-empty,
        /// and cover the whole iteration space
        #[test]
        fn partition_covers_iteration_space(
            iterations in 1i64..1_000_000,
            num_threads in 1usize..64,
        ) {
            let plan = Partition::plan(iterations, num_threads);
            prop_assert!(plan.nsubtasks >= 1);
            prop_assert!(plan.nsubtasks <= num_threads);

            let ranges = ranges_of(&plan);
            let mut covered = 0;
            for (i, &(start, end)) in ranges.iter().enumerate() {
                prop_assert!(start < end, "subtask {} empty", i);
                prop_assert_eq!(start, covered);
                covered = end;
            }
            prop_assert_eq!(covered, iterations);
        }

        /// Subtask lengths differ by at most one, extras first
        #[test]
        fn partition_is_balanced(
            iterations in 1i64..1_000_000,
            num_threads in 1usize..64,
        ) {
            let plan = Partition::plan(iterations, num_threads);
            for id in 0..plan.nsubtasks {
                let len = plan.len_of(id);
                prop_assert!(len == plan.iter_per_subtask || len == plan.iter_per_subtask + 1);
                if id > 0 {
                    prop_assert!(len <= plan.len_of(id - 1));
                }
            }
        }
    }
}
