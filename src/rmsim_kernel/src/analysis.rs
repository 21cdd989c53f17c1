//! Schedulability analysis for rate-monotonic task sets
//!
//! All functions in this module take the tasks in priority order, the highest
//! priority first.
use std::{fmt, time::Duration};

use crate::{mutex::ResourceId, task::TaskId, Priority};

/// Selects the schedulability test applied by [`analyze`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AnalysisPolicy {
    /// `U = Σ C_i/T_i ≤ n(2^(1/n) − 1)`. Ignores blocking.
    #[default]
    UtilizationBound,
    /// The Liu–Layland bound evaluated per task, including the task's
    /// blocking term.
    BlockingAware,
    /// Exact response-time analysis with blocking, assuming deadlines equal
    /// periods.
    ResponseTime,
}

impl fmt::Display for AnalysisPolicy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::UtilizationBound => "utilization bound",
            Self::BlockingAware => "blocking-aware utilization bound",
            Self::ResponseTime => "response-time analysis",
        })
    }
}

/// The timing parameters of a task, as used by the analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskTiming {
    pub id: TaskId,
    pub period: Duration,
    pub wcet: Duration,
    /// The longest time the task can be blocked by lower-priority tasks.
    pub blocking: Duration,
}

/// The result of evaluating a single task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskVerdict {
    pub id: TaskId,
    /// The utilization checked for this task. For
    /// [`AnalysisPolicy::BlockingAware`], this includes the higher-priority
    /// tasks and the blocking term.
    pub utilization: f64,
    pub bound: f64,
    /// Only computed by [`AnalysisPolicy::ResponseTime`]. `None` if the
    /// response time exceeds the period.
    pub response_time: Option<Duration>,
    pub ok: bool,
}

/// The result of [`analyze`].
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub policy: AnalysisPolicy,
    pub utilization: f64,
    pub bound: f64,
    pub schedulable: bool,
    /// The first task that failed the test.
    pub failed_at: Option<TaskId>,
    /// The evaluated tasks. Evaluation stops at the first failing task, so
    /// this may be shorter than the task set.
    pub rows: Vec<TaskVerdict>,
}

/// The Liu–Layland least upper bound `n(2^(1/n) − 1)` for `n` tasks.
/// `utilization_bound(0)` is `0`.
pub fn utilization_bound(n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let n = n as f64;
    n * (2f64.powf(1.0 / n) - 1.0)
}

/// `c / t`. A zero `t` yields infinity.
pub fn ratio(c: Duration, t: Duration) -> f64 {
    if t.is_zero() {
        f64::INFINITY
    } else {
        c.as_secs_f64() / t.as_secs_f64()
    }
}

/// `Σ C_i/T_i`
pub fn total_utilization(tasks: &[TaskTiming]) -> f64 {
    tasks.iter().map(|t| ratio(t.wcet, t.period)).sum()
}

/// Compute the worst-case response time of `tasks[i]` by fixed-point
/// iteration. Returns `None` if it exceeds the task's period.
pub fn response_time(tasks: &[TaskTiming], i: usize) -> Option<Duration> {
    let task = tasks.get(i)?;
    let higher = &tasks[..i];
    if task.period.is_zero() || higher.iter().any(|t| t.period.is_zero()) {
        return None;
    }

    let base = task.wcet.checked_add(task.blocking)?;
    let mut r = base;
    loop {
        let interference = higher.iter().try_fold(Duration::ZERO, |acc, t| {
            let releases = div_ceil(r, t.period);
            acc.checked_add(t.wcet.checked_mul(u32::try_from(releases).ok()?)?)
        })?;
        let next = base.checked_add(interference)?;

        if next > task.period {
            return None;
        }
        if next == r {
            return Some(r);
        }
        r = next;
    }
}

/// `⌈a / b⌉` in nanoseconds. `b` must not be zero.
fn div_ceil(a: Duration, b: Duration) -> u128 {
    let (a, b) = (a.as_nanos(), b.as_nanos());
    (a + b - 1) / b
}

/// Run the schedulability test selected by `policy`.
///
/// `tasks` must be sorted by priority, the highest first. An empty task set
/// is schedulable.
pub fn analyze(tasks: &[TaskTiming], policy: AnalysisPolicy) -> Verdict {
    match policy {
        AnalysisPolicy::UtilizationBound => {
            let utilization = total_utilization(tasks);
            let bound = utilization_bound(tasks.len());
            let schedulable = utilization <= bound;
            let rows = tasks
                .iter()
                .map(|t| TaskVerdict {
                    id: t.id,
                    utilization: ratio(t.wcet, t.period),
                    bound,
                    response_time: None,
                    ok: schedulable,
                })
                .collect();
            Verdict {
                policy,
                utilization,
                bound,
                schedulable,
                // The test is not attributable to a single task
                failed_at: None,
                rows,
            }
        }

        AnalysisPolicy::BlockingAware => {
            let mut rows = Vec::with_capacity(tasks.len());
            let mut higher_utilization = 0.0;
            for (i, t) in tasks.iter().enumerate() {
                higher_utilization += ratio(t.wcet, t.period);
                let utilization = higher_utilization + ratio(t.blocking, t.period);
                let bound = utilization_bound(i + 1);
                let ok = utilization <= bound;
                log::trace!("task {}: U = {:.6}, Ulub = {:.6}", t.id, utilization, bound);
                rows.push(TaskVerdict {
                    id: t.id,
                    utilization,
                    bound,
                    response_time: None,
                    ok,
                });
                if !ok {
                    break;
                }
            }
            let (utilization, bound) = rows
                .last()
                .map_or((0.0, 0.0), |row| (row.utilization, row.bound));
            Verdict::from_rows(policy, utilization, bound, rows)
        }

        AnalysisPolicy::ResponseTime => {
            let mut rows = Vec::with_capacity(tasks.len());
            for (i, t) in tasks.iter().enumerate() {
                let response_time = response_time(tasks, i);
                let ok = response_time.is_some();
                log::trace!("task {}: R = {:?}, T = {:?}", t.id, response_time, t.period);
                rows.push(TaskVerdict {
                    id: t.id,
                    utilization: ratio(t.wcet, t.period),
                    bound: utilization_bound(tasks.len()),
                    response_time,
                    ok,
                });
                if !ok {
                    break;
                }
            }
            Verdict::from_rows(
                policy,
                total_utilization(tasks),
                utilization_bound(tasks.len()),
                rows,
            )
        }
    }
}

impl Verdict {
    fn from_rows(policy: AnalysisPolicy, utilization: f64, bound: f64, rows: Vec<TaskVerdict>) -> Self {
        let failed_at = rows.iter().find(|row| !row.ok).map(|row| row.id);
        Self {
            policy,
            utilization,
            bound,
            schedulable: failed_at.is_none(),
            failed_at,
            rows,
        }
    }
}

/// A task's critical section, as seen by [`blocking_terms`].
#[derive(Debug, Clone, Copy)]
pub struct SectionInfo<'a> {
    pub priority: Priority,
    pub resources: &'a [ResourceId],
    /// The length of the whole critical section.
    pub length: Duration,
}

/// Compute the blocking term of each task.
///
/// A task can be blocked by a lower-priority task only while the latter holds
/// a resource whose ceiling is equal to or higher than the task's priority.
/// Under the priority ceiling protocol this happens at most once per job, so
/// the blocking term is the longest such critical section.
///
/// `ceilings` is indexed by [`ResourceId`]. The result is in the same order
/// as `sections`.
pub fn blocking_terms(sections: &[SectionInfo<'_>], ceilings: &[Priority]) -> Vec<Duration> {
    sections
        .iter()
        .map(|task| {
            sections
                .iter()
                .filter(|other| task.priority.is_higher_than(other.priority))
                .filter(|other| {
                    other.resources.iter().any(|r| {
                        ceilings
                            .get(r.0)
                            .map_or(false, |&c| !task.priority.is_higher_than(c))
                    })
                })
                .map(|other| other.length)
                .max()
                .unwrap_or(Duration::ZERO)
        })
        .collect()
}
