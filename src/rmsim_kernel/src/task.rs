//! Periodic tasks
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    cfg::PreparedTask,
    error::TaskError,
    mutex::{CeilingSet, CriticalSection, Held, ResourceId},
    port::Port,
    time::{Clock, Time},
    Priority,
};

/// Identifies a task. Task ids are assigned by the configuration.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TaskId(pub usize);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A task's identity and base priority, as seen by a [`CeilingSet`].
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TaskRef {
    pub id: TaskId,
    pub priority: Priority,
}

/// The application code executed by a task in each period, inside the
/// critical section protecting the task's resources.
pub type Payload<T> = Arc<dyn Fn(&mut CriticalSection<'_, '_, T>) + Send + Sync>;

/// Task state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSt {
    /// The task's current arrival time has been reached; the next job is
    /// about to start.
    WaitingForArrival,
    /// The task is inside its critical section.
    RunningPayload,
    /// The task is waiting for its next arrival time.
    Sleeping,
    /// The task has completed its iterations or was told to stop.
    Terminated,
}

/// *Task control block* - the state data of a periodic task.
///
/// A `TaskCb` is owned by the thread running the task, so none of its fields
/// need synchronization.
pub struct TaskCb<T> {
    id: TaskId,
    priority: Priority,
    num_levels: usize,
    period: Duration,
    resources: Vec<ResourceId>,
    iterations: usize,
    payload: Option<Payload<T>>,
    pub(crate) awaited: bool,

    wcet: Duration,
    next_arrival: Time,
    missed_deadlines: u32,
    completed: usize,
    max_blocked: Duration,
    st: TaskSt,
}

impl<T> fmt::Debug for TaskCb<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCb")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("period", &self.period)
            .field("resources", &self.resources)
            .field("iterations", &self.iterations)
            .field("wcet", &self.wcet)
            .field("next_arrival", &self.next_arrival)
            .field("missed_deadlines", &self.missed_deadlines)
            .field("st", &self.st)
            .finish_non_exhaustive()
    }
}

/// The outcome of a task's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskReport {
    pub id: TaskId,
    pub priority: Priority,
    pub wcet: Duration,
    pub missed_deadlines: u32,
    pub completed_iterations: usize,
    /// The longest time a single job spent blocked on resources.
    pub max_blocked: Duration,
    /// The arrival time following the last completed job.
    pub next_arrival: Time,
}

impl<T> TaskCb<T> {
    pub fn new(task: PreparedTask<T>, num_levels: usize) -> Self {
        let PreparedTask { cfg, priority } = task;
        Self {
            id: cfg.id,
            priority,
            num_levels,
            period: cfg.period,
            resources: cfg.resources,
            iterations: cfg.iterations,
            payload: cfg.payload,
            awaited: cfg.awaited,
            wcet: Duration::ZERO,
            next_arrival: Time::ZERO,
            missed_deadlines: 0,
            completed: 0,
            max_blocked: Duration::ZERO,
            st: TaskSt::WaitingForArrival,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn resources(&self) -> &[ResourceId] {
        &self.resources
    }

    pub fn wcet(&self) -> Duration {
        self.wcet
    }

    pub fn set_wcet(&mut self, wcet: Duration) {
        self.wcet = wcet;
    }

    pub fn next_arrival(&self) -> Time {
        self.next_arrival
    }

    pub fn missed_deadlines(&self) -> u32 {
        self.missed_deadlines
    }

    pub fn task_ref(&self) -> TaskRef {
        TaskRef {
            id: self.id,
            priority: self.priority,
        }
    }

    /// Set the time origin of the task. The first job is released at
    /// `reference`, the second one a period later.
    pub fn arm(&mut self, reference: Time) {
        self.next_arrival = reference + self.period;
        self.st = TaskSt::WaitingForArrival;
    }

    fn set_st(&mut self, st: TaskSt) {
        log::trace!("task {}: {:?} → {:?}", self.id, self.st, st);
        self.st = st;
    }

    /// Lock the task's resources in order, run the payload, and unlock them
    /// in reverse order. Returns the time spent blocked.
    pub fn execute_section(&self, set: &CeilingSet<T>) -> Result<Duration, TaskError> {
        self.section(set, |_| {})
    }

    /// The critical section shared by profiling and the periodic loop.
    /// `priority_changed` is called with the effective priority once the
    /// resources are held and with the base priority once they are released,
    /// if the two differ.
    fn section(
        &self,
        set: &CeilingSet<T>,
        mut priority_changed: impl FnMut(Priority),
    ) -> Result<Duration, TaskError> {
        let me = self.task_ref();
        let mut held = set.lock_all(me, &self.resources)?;
        let blocked = held.iter().map(Held::blocked_for).sum();

        let effective_priority = set.effective_priority(me);
        let raised = effective_priority != self.priority;
        if raised {
            priority_changed(effective_priority);
        }

        if let Some(payload) = &self.payload {
            payload(&mut CriticalSection::new(self.id, &mut held));
        }

        let result = set.unlock_all(held);
        if raised {
            priority_changed(self.priority);
        }
        result?;
        Ok(blocked)
    }

    fn run_job<P: Port>(&mut self, port: &P, set: &CeilingSet<T>) -> Result<(), TaskError> {
        let num_levels = self.num_levels;
        let blocked = self.section(set, |priority| {
            port.set_current_priority(priority, num_levels)
        })?;
        self.max_blocked = self.max_blocked.max(blocked);
        Ok(())
    }

    /// Run the task's periodic loop on the current thread.
    ///
    /// The loop ends after the configured number of iterations, or at the
    /// start of a period once `stop` is set. A job finishing after the next
    /// arrival time counts as a missed deadline; the loop then carries on
    /// from the already-elapsed arrival time without trying to catch up.
    pub fn run<P: Port>(
        mut self,
        port: &P,
        set: &CeilingSet<T>,
        stop: &AtomicBool,
    ) -> Result<TaskReport, TaskError> {
        let clock = port.clock();
        port.task_started(self.id, self.priority, self.num_levels);
        log::debug!(
            "task {} started (priority {}, period {:?})",
            self.id,
            self.priority,
            self.period
        );

        while self.completed < self.iterations {
            if stop.load(Ordering::Relaxed) {
                log::debug!("task {} stopping after {} job(s)", self.id, self.completed);
                break;
            }

            self.set_st(TaskSt::RunningPayload);
            if let Err(e) = self.run_job(port, set) {
                self.set_st(TaskSt::Terminated);
                return Err(e);
            }

            // The job's deadline is the next arrival time
            let now = clock.now();
            if now > self.next_arrival {
                self.missed_deadlines += 1;
                log::debug!(
                    "task {} missed its deadline by {:?}",
                    self.id,
                    now.saturating_duration_since(self.next_arrival)
                );
            }
            self.completed += 1;

            self.set_st(TaskSt::Sleeping);
            clock.sleep_until(self.next_arrival);
            self.next_arrival += self.period;
            self.set_st(TaskSt::WaitingForArrival);
        }

        self.set_st(TaskSt::Terminated);
        Ok(self.report())
    }

    pub fn report(&self) -> TaskReport {
        TaskReport {
            id: self.id,
            priority: self.priority,
            wcet: self.wcet,
            missed_deadlines: self.missed_deadlines,
            completed_iterations: self.completed,
            max_blocked: self.max_blocked,
            next_arrival: self.next_arrival,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        cfg::{TaskCfg, TaskSetCfg},
        error::LockError,
        mutex::ResourceDef,
        port::ManualPort,
        time::ManualClock,
    };
    use assert_matches::assert_matches;
    use std::sync::{atomic::AtomicUsize, Mutex};

    const PERIOD: Duration = Duration::from_millis(80);

    fn single_task(cfg: TaskCfg<u32>) -> (TaskCb<u32>, CeilingSet<u32>) {
        let mut set_cfg = TaskSetCfg::new();
        set_cfg.resource("R", 0);
        set_cfg.task(cfg);
        let prepared = set_cfg.prepare().unwrap();
        let num_levels = prepared.tasks().len();
        let (resources, mut tasks) = prepared.into_parts();
        let set = CeilingSet::new(resources);
        (TaskCb::new(tasks.remove(0), num_levels), set)
    }

    #[test]
    fn arrivals_do_not_drift() {
        let _ = env_logger::try_init();
        let clock = Arc::new(ManualClock::new(Time::new(1, 999_000_000)));
        let port = ManualPort::new(Arc::clone(&clock));
        let releases = Arc::new(Mutex::new(Vec::new()));

        let payload_clock = Arc::clone(&clock);
        let payload_releases = Arc::clone(&releases);
        let (mut task, set) = single_task(
            TaskCfg::new(1, PERIOD)
                .resources([ResourceId(0)])
                .iterations(50)
                .payload(move |cs| {
                    payload_releases.lock().unwrap().push(payload_clock.now());
                    // Execution time varies between 0 and 79 ms
                    let n = payload_releases.lock().unwrap().len() as u64;
                    payload_clock.advance(Duration::from_millis(n * 37 % 80));
                    *cs.get_mut(ResourceId(0)).unwrap() += 1;
                }),
        );

        let reference = clock.now();
        task.arm(reference);
        let initial = task.next_arrival();
        assert_eq!(initial, reference + PERIOD);

        let report = task.run(&port, &set, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.completed_iterations, 50);
        assert_eq!(report.missed_deadlines, 0);
        assert_eq!(
            report.next_arrival.duration_since_origin(),
            initial.duration_since_origin() + PERIOD * 50
        );

        let releases = releases.lock().unwrap();
        for (k, &t) in releases.iter().enumerate() {
            assert_eq!(t, reference + PERIOD * k as u32, "job {k}");
        }
        assert!(!set.is_locked(ResourceId(0)));
        assert_eq!(set.into_values()[0].1, 50);
    }

    #[test]
    fn each_overrun_counts_once() {
        let clock = Arc::new(ManualClock::default());
        let port = ManualPort::new(Arc::clone(&clock));
        let jobs = Arc::new(AtomicUsize::new(0));

        let payload_clock = Arc::clone(&clock);
        let payload_jobs = Arc::clone(&jobs);
        let (mut task, set) = single_task(TaskCfg::new(1, PERIOD).iterations(12).payload(
            move |_| {
                let k = payload_jobs.fetch_add(1, Ordering::Relaxed);
                if k == 3 || k == 7 || k == 8 {
                    payload_clock.advance(PERIOD * 3 / 2);
                }
            },
        ));
        task.arm(clock.now());

        let report = task.run(&port, &set, &AtomicBool::new(false)).unwrap();
        assert_eq!(jobs.load(Ordering::Relaxed), 12);
        assert_eq!(report.missed_deadlines, 3);
        assert_eq!(report.next_arrival, Time::ZERO + PERIOD * 13);
    }

    #[test]
    fn finishing_exactly_at_deadline_is_not_a_miss() {
        let clock = Arc::new(ManualClock::default());
        let port = ManualPort::new(Arc::clone(&clock));
        let payload_clock = Arc::clone(&clock);
        let (mut task, set) = single_task(
            TaskCfg::new(1, PERIOD)
                .iterations(5)
                .payload(move |_| payload_clock.advance(PERIOD)),
        );
        task.arm(clock.now());

        let report = task.run(&port, &set, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.missed_deadlines, 0);
        assert_eq!(report.completed_iterations, 5);
    }

    #[test]
    fn stop_before_first_job() {
        let port = ManualPort::default();
        let calls = Arc::new(AtomicUsize::new(0));
        let payload_calls = Arc::clone(&calls);
        let (mut task, set) = single_task(TaskCfg::new(1, PERIOD).payload(move |_| {
            payload_calls.fetch_add(1, Ordering::Relaxed);
        }));
        task.arm(Time::ZERO);

        let report = task.run(&port, &set, &AtomicBool::new(true)).unwrap();
        assert_eq!(report.completed_iterations, 0);
        assert_eq!(calls.load(Ordering::Relaxed), 0);
    }

    /// Records the priority changes requested by a task.
    #[derive(Default)]
    struct RecordingPort {
        inner: ManualPort,
        changes: Mutex<Vec<Priority>>,
    }

    impl Port for RecordingPort {
        type Clock = ManualClock;

        fn clock(&self) -> &ManualClock {
            self.inner.clock()
        }

        fn set_current_priority(&self, priority: Priority, _num_levels: usize) {
            self.changes.lock().unwrap().push(priority);
        }
    }

    #[test]
    fn ceiling_is_applied_around_each_job() {
        // Task 2 shares R with the more urgent task 1, so its section runs at
        // task 1's priority
        let mut cfg = TaskSetCfg::new();
        let r = cfg.resource("R", 0u32);
        cfg.task(TaskCfg::new(1, PERIOD).resources([r]))
            .task(
                TaskCfg::<u32>::new(2, PERIOD * 2)
                    .resources([r])
                    .iterations(2)
                    .payload(move |cs| *cs.get_mut(r).unwrap() += 1),
            );
        let prepared = cfg.prepare().unwrap();
        let num_levels = prepared.num_levels();
        let (resources, mut tasks) = prepared.into_parts();
        let set = CeilingSet::new(resources);
        let mut task = TaskCb::new(tasks.remove(1), num_levels);
        assert_eq!(task.priority(), Priority(1));

        // Profiling runs the same section without touching the port
        task.execute_section(&set).unwrap();

        let port = RecordingPort::default();
        task.arm(Time::ZERO);
        let report = task.run(&port, &set, &AtomicBool::new(false)).unwrap();
        assert_eq!(report.completed_iterations, 2);
        assert_eq!(
            *port.changes.lock().unwrap(),
            [Priority(0), Priority(1), Priority(0), Priority(1)]
        );
        assert!(!set.is_locked(r));
        assert_eq!(set.into_values()[0].1, 3);
    }

    #[test]
    fn bad_ceiling_is_reported() {
        let port = ManualPort::default();
        // A hand-built set whose ceiling ignores the task
        let set = CeilingSet::new([ResourceDef {
            name: "R".to_owned(),
            ceiling: Priority(5),
            initial: 0u32,
        }]);
        let mut cfg = TaskSetCfg::new();
        cfg.resource("R", 0u32);
        cfg.task(TaskCfg::new(1, PERIOD).resources([ResourceId(0)]));
        let (_, mut tasks) = cfg.prepare().unwrap().into_parts();
        let mut task = TaskCb::new(tasks.remove(0), 1);
        task.arm(Time::ZERO);

        assert_matches!(
            task.run(&port, &set, &AtomicBool::new(false)),
            Err(TaskError::Lock(LockError::BadParam { .. }))
        );
        assert!(!set.is_locked(ResourceId(0)));
    }
}
