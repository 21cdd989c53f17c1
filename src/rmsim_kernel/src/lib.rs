//! A simulator for periodic task sets scheduled by the rate-monotonic policy,
//! with shared resources arbitrated by the priority ceiling protocol.
//!
//! The typical flow is:
//!
//!  1. Describe the task set with [`cfg::TaskSetCfg`] and
//!     [`cfg::TaskCfg`].
//!  2. [`cfg::TaskSetCfg::prepare`] validates it, assigns rate-monotonic
//!     priorities, and computes the resource ceilings.
//!  3. [`boot::boot`] measures each task's worst-case execution time, runs the
//!     schedulability analysis, and, if the task set passes, runs every task
//!     on its own thread until completion.
//!
//! The environment (time source, OS thread priorities) is abstracted by
//! [`port::Port`].
#![forbid(unsafe_code)]
use std::fmt;

pub mod analysis;
pub mod boot;
pub mod cfg;
pub mod error;
pub mod mutex;
pub mod port;
pub mod task;
pub mod time;
pub mod wcet;

pub use crate::{
    boot::{boot, AnalysisReport, BootOptions, Reporter, RunReport},
    cfg::{TaskCfg, TaskSetCfg},
    error::{BootError, CfgError, LockError, TaskError, UnlockError},
    mutex::{CeilingSet, CriticalSection, ResourceId},
    port::Port,
    task::{TaskId, TaskReport},
    time::{Clock, Time},
};

/// A task priority. `0` is the highest priority; a larger value means a
/// lower priority.
///
/// `Priority` intentionally doesn't implement `Ord` so that comparisons are
/// always spelled out with [`Priority::is_higher_than`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Default)]
pub struct Priority(pub usize);

impl Priority {
    /// Construct the priority for the `rank`-th entry (0-based) of a list
    /// sorted by urgency.
    #[inline]
    pub const fn from_rank(rank: usize) -> Self {
        Self(rank)
    }

    #[inline]
    pub const fn is_higher_than(self, other: Self) -> bool {
        self.0 < other.0
    }

    /// Return whichever of the two is the higher priority.
    #[inline]
    pub const fn higher(self, other: Self) -> Self {
        if other.is_higher_than(self) {
            other
        } else {
            self
        }
    }

    /// The number of priority levels strictly lower than `self` among
    /// `num_levels` levels. Used to map onto OS priorities, where a larger
    /// number usually means more urgent.
    #[inline]
    pub const fn levels_below(self, num_levels: usize) -> usize {
        num_levels.saturating_sub(self.0 + 1)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_order() {
        assert!(Priority(0).is_higher_than(Priority(1)));
        assert!(!Priority(1).is_higher_than(Priority(1)));
        assert_eq!(Priority(3).higher(Priority(1)), Priority(1));
        assert_eq!(Priority(1).higher(Priority(3)), Priority(1));
        assert_eq!(Priority(0).levels_below(4), 3);
        assert_eq!(Priority(3).levels_below(4), 0);
    }
}
