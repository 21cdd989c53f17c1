//! The interface to the execution environment
use std::sync::Arc;

use crate::{
    task::TaskId,
    time::{Clock, ManualClock},
    Priority,
};

/// Implemented by an environment the task set runs on.
///
/// Every method except [`Port::clock`] has a default implementation that does
/// nothing, which is appropriate for environments without real-time
/// scheduling.
pub trait Port: Sync {
    type Clock: Clock;

    fn clock(&self) -> &Self::Clock;

    /// Run `f` with the calling thread elevated to the highest available
    /// real-time priority so that execution time measurements aren't
    /// disturbed by preemption.
    fn with_profiling_priority<R>(&self, f: impl FnOnce() -> R) -> R {
        f()
    }

    /// Called on a task's thread before its first job.
    ///
    /// `num_levels` is the number of priority levels in use.
    fn task_started(&self, _task: TaskId, _priority: Priority, _num_levels: usize) {}

    /// Called on a task's thread whenever its effective priority changes.
    fn set_current_priority(&self, _priority: Priority, _num_levels: usize) {}
}

/// A [`Port`] driven by a [`ManualClock`], used for deterministic tests.
#[derive(Debug, Clone, Default)]
pub struct ManualPort {
    clock: Arc<ManualClock>,
}

impl ManualPort {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self { clock }
    }
}

impl Port for ManualPort {
    type Clock = ManualClock;

    fn clock(&self) -> &ManualClock {
        &self.clock
    }
}
