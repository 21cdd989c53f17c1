//! Bootstrap: profiling, admission, and launch of a task set
use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use crate::{
    analysis::{self, AnalysisPolicy, SectionInfo, TaskTiming, Verdict},
    cfg::PreparedTaskSet,
    error::{BootError, TaskError},
    mutex::CeilingSet,
    port::Port,
    task::{TaskCb, TaskId, TaskReport},
    time::Clock,
    wcet::measure_wcet,
    Priority,
};

/// Options for [`boot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOptions {
    /// The number of times each task's critical section is run to measure its
    /// worst-case execution time.
    pub profile_reps: usize,
    pub policy: AnalysisPolicy,
}

impl Default for BootOptions {
    fn default() -> Self {
        Self {
            profile_reps: 100,
            policy: AnalysisPolicy::default(),
        }
    }
}

/// The analysed parameters of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskAnalysis {
    pub id: TaskId,
    pub priority: Priority,
    pub period: Duration,
    pub wcet: Duration,
    pub blocking: Duration,
}

/// Passed to [`Reporter::analysis`].
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisReport {
    /// Sorted by priority, the highest first.
    pub tasks: Vec<TaskAnalysis>,
    pub verdict: Verdict,
}

/// Passed to [`Reporter::run_finished`] and returned by [`boot`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    /// Sorted by priority, the highest first.
    pub tasks: Vec<TaskReport>,
}

impl RunReport {
    pub fn task(&self, id: TaskId) -> Option<&TaskReport> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn missed_deadlines(&self, id: TaskId) -> Option<u32> {
        self.task(id).map(|t| t.missed_deadlines)
    }

    pub fn total_missed_deadlines(&self) -> u32 {
        self.tasks.iter().map(|t| t.missed_deadlines).sum()
    }
}

/// Receives the progress of [`boot`].
pub trait Reporter {
    /// Called once the analysis is complete, before any task is started.
    fn analysis(&mut self, _report: &AnalysisReport) {}

    /// Called after every task has terminated.
    fn run_finished(&mut self, _report: &RunReport) {}
}

impl Reporter for () {}

/// Profile, analyse, and run a task set.
///
/// Each task's worst-case execution time is measured by running its critical
/// section `opts.profile_reps` times. If the task set passes the analysis
/// selected by `opts.policy`, every task is started on its own thread with a
/// common time reference. `boot` returns when the tasks marked as awaited
/// (or all tasks, if none is marked) have completed their iterations; the
/// other tasks are stopped at the start of their next period.
pub fn boot<T: Send, P: Port>(
    prepared: PreparedTaskSet<T>,
    port: &P,
    reporter: &mut dyn Reporter,
    opts: &BootOptions,
) -> Result<RunReport, BootError> {
    let num_levels = prepared.num_levels();
    let ceilings = prepared.ceilings();
    let (resources, tasks) = prepared.into_parts();
    let set = CeilingSet::new(resources);
    let mut tasks: Vec<TaskCb<T>> = tasks
        .into_iter()
        .map(|t| TaskCb::new(t, num_levels))
        .collect();

    log::info!(
        "profiling {} task(s) ({} repetitions each)",
        tasks.len(),
        opts.profile_reps
    );
    port.with_profiling_priority(|| {
        for task in tasks.iter_mut() {
            let wcet = measure_wcet(port.clock(), opts.profile_reps, || {
                task.execute_section(&set).map(drop)
            })
            .map_err(|source| BootError::Task {
                task: task.id(),
                source,
            })?;
            log::debug!("task {}: WCET = {:?}", task.id(), wcet);
            task.set_wcet(wcet);
        }
        Ok::<_, BootError>(())
    })?;

    let sections: Vec<_> = tasks
        .iter()
        .map(|t| SectionInfo {
            priority: t.priority(),
            resources: t.resources(),
            length: t.wcet(),
        })
        .collect();
    let blocking = analysis::blocking_terms(&sections, &ceilings);

    let report = AnalysisReport {
        tasks: tasks
            .iter()
            .zip(&blocking)
            .map(|(t, &blocking)| TaskAnalysis {
                id: t.id(),
                priority: t.priority(),
                period: t.period(),
                wcet: t.wcet(),
                blocking,
            })
            .collect(),
        verdict: analysis::analyze(
            &tasks
                .iter()
                .zip(&blocking)
                .map(|(t, &blocking)| TaskTiming {
                    id: t.id(),
                    period: t.period(),
                    wcet: t.wcet(),
                    blocking,
                })
                .collect::<Vec<_>>(),
            opts.policy,
        ),
    };
    log::info!(
        "{}: U = {:.6}, Ulub = {:.6}, schedulable = {}",
        report.verdict.policy,
        report.verdict.utilization,
        report.verdict.bound,
        report.verdict.schedulable
    );
    reporter.analysis(&report);

    if !report.verdict.schedulable {
        return Err(BootError::Rejected(Box::new(report.verdict)));
    }

    let reference = port.clock().now();
    for task in tasks.iter_mut() {
        task.arm(reference);
    }
    log::info!("starting {} task(s) at {:?}", tasks.len(), reference);

    let run_report = launch(tasks, port, &set)?;
    reporter.run_finished(&run_report);
    Ok(run_report)
}

fn launch<T: Send, P: Port>(
    tasks: Vec<TaskCb<T>>,
    port: &P,
    set: &CeilingSet<T>,
) -> Result<RunReport, BootError> {
    let stop = AtomicBool::new(false);
    let any_awaited = tasks.iter().any(|t| t.awaited);

    thread::scope(|s| {
        let mut awaited = Vec::new();
        let mut others = Vec::new();
        let mut error = None;

        for task in tasks {
            let id = task.id();
            let is_awaited = task.awaited || !any_awaited;
            let stop = &stop;
            match thread::Builder::new()
                .name(format!("task{}", id))
                .spawn_scoped(s, move || task.run(port, set, stop))
            {
                Ok(handle) if is_awaited => awaited.push((id, handle)),
                Ok(handle) => others.push((id, handle)),
                Err(source) => {
                    log::error!("could not spawn the thread for task {}: {}", id, source);
                    stop.store(true, Ordering::Relaxed);
                    error = Some(BootError::Spawn { task: id, source });
                    break;
                }
            }
        }

        let mut reports = Vec::with_capacity(awaited.len() + others.len());
        for (id, handle) in awaited {
            collect(id, handle.join(), &stop, &mut reports, &mut error);
        }

        log::debug!("awaited tasks are done, stopping the others");
        stop.store(true, Ordering::Relaxed);
        for (id, handle) in others {
            collect(id, handle.join(), &stop, &mut reports, &mut error);
        }

        match error {
            Some(e) => Err(e),
            None => {
                reports.sort_by_key(|r| r.priority.0);
                Ok(RunReport { tasks: reports })
            }
        }
    })
}

fn collect(
    id: TaskId,
    result: thread::Result<Result<TaskReport, TaskError>>,
    stop: &AtomicBool,
    reports: &mut Vec<TaskReport>,
    error: &mut Option<BootError>,
) {
    match result {
        Ok(Ok(report)) => {
            log::debug!(
                "task {} finished: {} job(s), {} deadline miss(es)",
                id,
                report.completed_iterations,
                report.missed_deadlines
            );
            reports.push(report);
        }
        Ok(Err(source)) => {
            log::error!("task {} failed: {}", id, source);
            stop.store(true, Ordering::Relaxed);
            error.get_or_insert(BootError::Task { task: id, source });
        }
        Err(_) => {
            log::error!("task {} panicked", id);
            stop.store(true, Ordering::Relaxed);
            error.get_or_insert(BootError::TaskPanicked(id));
        }
    }
}
