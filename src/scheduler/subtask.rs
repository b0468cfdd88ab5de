// Copyright (c) 2025 RustySched Contributors
//
// Subtask: one contiguous chunk of a parallel loop's iteration space,
// scheduled as a single work item. Ownership moves by value through the
// deques, so a subtask runs exactly once and is released by whichever
// worker ran it.

use super::join::JoinState;
use crate::error::Result;
use std::sync::Arc;
use tracing::trace;

/// Kernel of a parallel loop: invoked once per subtask over a half-open
/// iteration range. Implementations must be safe to call concurrently on
/// disjoint ranges; no ordering between subtasks is guaranteed.
pub trait LoopKernel: Send + Sync {
    fn run(&self, start: i64, end: i64, subtask_id: usize) -> Result<()>;
}

impl<F> LoopKernel for F
where
    F: Fn(i64, i64, usize) -> Result<()> + Send + Sync,
{
    fn run(&self, start: i64, end: i64, subtask_id: usize) -> Result<()> {
        self(start, end, subtask_id)
    }
}

/// Kernel of a sequential task: invoked once with the full iteration count
/// and the id of the worker it happens to run on.
pub trait SeqKernel: Send + Sync {
    fn run(&self, iterations: i64, tid: usize) -> Result<()>;
}

impl<F> SeqKernel for F
where
    F: Fn(i64, usize) -> Result<()> + Send + Sync,
{
    fn run(&self, iterations: i64, tid: usize) -> Result<()> {
        self(iterations, tid)
    }
}

/// A parallel loop submitted to [`Scheduler::execute`](super::Scheduler::execute)
pub struct LoopTask {
    /// Per-chunk kernel
    pub kernel: Arc<dyn LoopKernel>,
    /// Total iteration count; the loop covers `[0, iterations)`
    pub iterations: i64,
    /// Granularity hint in iterations; 0 means no chunking hint
    pub granularity: i64,
    /// Diagnostic name
    pub name: String,
}

impl LoopTask {
    pub fn new(
        name: impl Into<String>,
        iterations: i64,
        granularity: i64,
        kernel: Arc<dyn LoopKernel>,
    ) -> Self {
        Self {
            kernel,
            iterations,
            granularity,
            name: name.into(),
        }
    }

    /// Build a task from a closure
    pub fn from_fn<F>(name: impl Into<String>, iterations: i64, granularity: i64, f: F) -> Self
    where
        F: Fn(i64, i64, usize) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, iterations, granularity, Arc::new(f))
    }
}

/// A sequential task bypassing the parallel machinery
pub struct SeqTask {
    pub kernel: Arc<dyn SeqKernel>,
    pub iterations: i64,
    pub name: String,
}

impl SeqTask {
    pub fn new(name: impl Into<String>, iterations: i64, kernel: Arc<dyn SeqKernel>) -> Self {
        Self {
            kernel,
            iterations,
            name: name.into(),
        }
    }

    /// Build a task from a closure
    pub fn from_fn<F>(name: impl Into<String>, iterations: i64, f: F) -> Self
    where
        F: Fn(i64, usize) -> Result<()> + Send + Sync + 'static,
    {
        Self::new(name, iterations, Arc::new(f))
    }
}

/// One unit of work on a deque: a chunk `[start, end)` of its parent loop
pub struct Subtask {
    pub(crate) kernel: Arc<dyn LoopKernel>,
    pub(crate) start: i64,
    pub(crate) end: i64,
    /// Granularity-derived hint; a runner may subdivide further but is not
    /// required to
    pub(crate) chunk: i64,
    pub(crate) id: usize,
    pub(crate) join: Arc<JoinState>,
    /// Diagnostics, not load-bearing
    pub(crate) created_by: usize,
    pub(crate) stolen: bool,
}

impl Subtask {
    /// Stable id within the parent loop
    pub fn id(&self) -> usize {
        self.id
    }

    /// Half-open iteration range
    pub fn range(&self) -> (i64, i64) {
        (self.start, self.end)
    }

    /// Run the kernel over this chunk and report completion to the join
    /// state, error or not. Consumes the subtask; the kernel result is also
    /// handed back so a submitter can fail fast.
    pub(crate) fn run(self, tid: usize) -> Result<()> {
        trace!(
            "worker {} running subtask {} [{}, {}) chunk {} created by {}{}",
            tid,
            self.id,
            self.start,
            self.end,
            self.chunk,
            self.created_by,
            if self.stolen { " (stolen)" } else { "" }
        );

        let result = self.kernel.run(self.start, self.end, self.id);
        self.join.complete(result.as_ref().err().cloned());
        result
    }
}
