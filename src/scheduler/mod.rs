// Copyright (c) 2025 RustySched Contributors
//
// Work-stealing loop scheduler module
//
// A fixed pool of OS worker threads, one Chase-Lev deque per thread. A
// parallel loop is partitioned into subtasks that are pushed onto the
// submitting worker's deque; idle workers steal from random victims while
// the submitter drains its own deque and waits on a shared join state.

pub mod join;
pub mod pool;
pub mod subtask;
pub mod worker;

// Re-export main types
pub use join::JoinState;
pub use pool::{Scheduler, SchedulerStats};
pub use subtask::{LoopKernel, LoopTask, SeqKernel, SeqTask, Subtask};
pub use worker::current_tid;
