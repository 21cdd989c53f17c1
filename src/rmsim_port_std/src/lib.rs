//! Runs [`rmsim_kernel`] task sets on the host operating system.
//!
//! Each task runs on an ordinary OS thread. When the process has the
//! necessary privileges, the threads are scheduled by the `SCHED_FIFO`
//! real-time policy with priorities reflecting the rate-monotonic order, and
//! a task's thread priority follows its effective priority while it holds
//! resources. Without the privileges, the task set still runs, but the OS
//! scheduler is free to interleave the tasks in any way.
use rmsim_kernel::{port::Port, task::TaskId, Priority};

mod clock;
pub use clock::HostClock;

#[cfg(unix)]
#[path = "sched_unix.rs"]
mod sched;
#[cfg(not(unix))]
#[path = "sched_unsupported.rs"]
mod sched;

/// The [`Port`] implementation for hosted environments.
#[derive(Debug)]
pub struct HostPort {
    clock: HostClock,
    cpu: Option<usize>,
    realtime: bool,
}

impl Default for HostPort {
    fn default() -> Self {
        Self::new()
    }
}

impl HostPort {
    /// Construct a `HostPort`, probing for the privileges required by
    /// real-time scheduling.
    pub fn new() -> Self {
        let realtime = sched::is_privileged();
        if !realtime {
            log::warn!(
                "Not running as superuser. Tasks will run with the default \
                 scheduling policy and timing is not guaranteed."
            );
        }
        Self {
            clock: HostClock::new(),
            cpu: None,
            realtime,
        }
    }

    /// Pin every task thread to the specified CPU.
    pub fn with_cpu(self, cpu: Option<usize>) -> Self {
        Self { cpu, ..self }
    }

    /// Get a flag indicating whether task priorities are applied to the
    /// task threads.
    pub fn is_realtime(&self) -> bool {
        self.realtime
    }

    fn apply_priority(&self, priority: Priority, num_levels: usize) {
        if !self.realtime {
            return;
        }
        let result = sched::priority_range().and_then(|(min, max)| {
            sched::set_current_fifo(os_priority(min, max, priority, num_levels))
        });
        if let Err(e) = result {
            log::warn!("Could not set the thread priority to {}: {}", priority, e);
        }
    }
}

impl Port for HostPort {
    type Clock = HostClock;

    fn clock(&self) -> &HostClock {
        &self.clock
    }

    fn with_profiling_priority<R>(&self, f: impl FnOnce() -> R) -> R {
        if !self.realtime {
            return f();
        }

        let saved = match sched::current() {
            Ok(saved) => saved,
            Err(e) => {
                log::warn!("Could not read the thread's scheduling parameters: {}", e);
                return f();
            }
        };

        if let Err(e) = sched::priority_range().and_then(|(_, max)| sched::set_current_fifo(max)) {
            log::warn!("Profiling without real-time priority: {}", e);
        }

        let result = f();

        if let Err(e) = sched::restore(saved) {
            log::warn!("Could not restore the thread's scheduling parameters: {}", e);
        }
        result
    }

    fn task_started(&self, task: TaskId, priority: Priority, num_levels: usize) {
        if let Some(cpu) = self.cpu {
            match sched::pin_current_to(cpu) {
                Ok(()) => log::trace!("task {} pinned to CPU {}", task, cpu),
                Err(e) => log::warn!("Could not pin task {} to CPU {}: {}", task, cpu, e),
            }
        }
        self.apply_priority(priority, num_levels);
    }

    fn set_current_priority(&self, priority: Priority, num_levels: usize) {
        self.apply_priority(priority, num_levels);
    }
}

/// Map `priority` to an OS priority in `min..=max`, where a larger number is
/// more urgent. The lowest task priority is mapped to `min + 1`, leaving
/// `min` to threads outside the task set. Levels that don't fit are clamped
/// to `max`.
fn os_priority(min: i32, max: i32, priority: Priority, num_levels: usize) -> i32 {
    let levels_below = i32::try_from(priority.levels_below(num_levels)).unwrap_or(i32::MAX);
    min.saturating_add(1).saturating_add(levels_below).min(max)
}
