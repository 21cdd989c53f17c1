//! Error types
use thiserror::Error;

use crate::{mutex::ResourceId, task::TaskId, Priority};

/// Error type for [`CeilingSet::lock`](crate::mutex::CeilingSet::lock).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LockError {
    /// The resource does not exist.
    #[error("resource {0} does not exist")]
    BadId(ResourceId),
    /// The task already holds the resource.
    #[error("task {task} already holds resource {resource}")]
    WouldDeadlock { task: TaskId, resource: ResourceId },
    /// The task's priority is higher than the resource's priority ceiling,
    /// which means the ceiling was computed without taking this task into
    /// account.
    #[error(
        "task {task} (priority {priority}) is not allowed to lock resource \
         {resource} (ceiling {ceiling})"
    )]
    BadParam {
        task: TaskId,
        priority: Priority,
        resource: ResourceId,
        ceiling: Priority,
    },
}

/// Error type for [`CeilingSet::unlock`](crate::mutex::CeilingSet::unlock).
///
/// The resource is released even when an error is returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnlockError {
    /// The lock was taken from a different resource set.
    #[error("task {task} does not own resource {resource} in this set")]
    NotOwner { task: TaskId, resource: ResourceId },
    /// The resource is not the one most recently locked by the task.
    #[error("task {task} released resource {resource} out of order (expected {expected})")]
    BadObjectState {
        task: TaskId,
        resource: ResourceId,
        expected: ResourceId,
    },
}

/// Error returned by a task runner. Both variants indicate a broken resource
/// access discipline, never a timing problem.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("could not lock a resource")]
    Lock(#[from] LockError),
    #[error("could not unlock a resource")]
    Unlock(#[from] UnlockError),
}

/// Error type for [`TaskSetCfg::prepare`](crate::cfg::TaskSetCfg::prepare).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CfgError {
    #[error("the task set is empty")]
    NoTasks,
    #[error("task id {0} is used more than once")]
    DuplicateTaskId(TaskId),
    #[error("task {0} has a zero period")]
    ZeroPeriod(TaskId),
    #[error("resource name '{0}' is used more than once")]
    DuplicateResourceName(String),
    #[error("task {task} refers to resource {resource}, which does not exist")]
    UnknownResource { task: TaskId, resource: ResourceId },
    #[error("task {task} lists resource {resource} more than once")]
    DuplicateResource { task: TaskId, resource: ResourceId },
    #[error(
        "task {task} locks resource {resource} after resource {previous}, \
         violating the global lock order"
    )]
    LockOrder {
        task: TaskId,
        previous: ResourceId,
        resource: ResourceId,
    },
}

/// Error type for [`boot`](crate::boot::boot).
#[derive(Error, Debug)]
pub enum BootError {
    #[error(
        "task set not schedulable (U = {:.6}, Ulub = {:.6})",
        .0.utilization, .0.bound
    )]
    Rejected(Box<crate::analysis::Verdict>),
    #[error("task {task} violated the resource protocol")]
    Task {
        task: TaskId,
        #[source]
        source: TaskError,
    },
    #[error("task {0} panicked")]
    TaskPanicked(TaskId),
    #[error("could not spawn the thread for task {task}")]
    Spawn {
        task: TaskId,
        #[source]
        source: std::io::Error,
    },
}
