//! Static configuration of a task set
use std::{collections::HashSet, fmt, sync::Arc, time::Duration};

use crate::{
    error::CfgError,
    mutex::{CriticalSection, ResourceDef, ResourceId},
    task::{Payload, TaskId},
    Priority,
};

/// The default number of jobs a task runs.
pub const DEFAULT_ITERATIONS: usize = 100;

struct ResourceCfg<T> {
    name: String,
    initial: T,
}

/// The configuration of a periodic task.
///
/// ```
/// use rmsim_kernel::{cfg::TaskCfg, ResourceId};
/// use std::time::Duration;
///
/// let cfg = TaskCfg::<u32>::new(1, Duration::from_millis(80))
///     .resources([ResourceId(0), ResourceId(2)])
///     .iterations(10)
///     .payload(|cs| {
///         if let Some(x) = cs.get_mut(ResourceId(0)) {
///             *x += 1;
///         }
///     })
///     .awaited(true);
/// assert_eq!(cfg.resource_ids(), [ResourceId(0), ResourceId(2)]);
/// ```
pub struct TaskCfg<T> {
    pub(crate) id: TaskId,
    pub(crate) period: Duration,
    pub(crate) resources: Vec<ResourceId>,
    pub(crate) iterations: usize,
    pub(crate) payload: Option<Payload<T>>,
    pub(crate) awaited: bool,
}

impl<T> fmt::Debug for TaskCfg<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskCfg")
            .field("id", &self.id)
            .field("period", &self.period)
            .field("resources", &self.resources)
            .field("iterations", &self.iterations)
            .field("awaited", &self.awaited)
            .finish_non_exhaustive()
    }
}

impl<T> TaskCfg<T> {
    /// Construct a task that runs [`DEFAULT_ITERATIONS`] jobs of an empty
    /// payload without locking anything.
    pub fn new(id: usize, period: Duration) -> Self {
        Self {
            id: TaskId(id),
            period,
            resources: Vec::new(),
            iterations: DEFAULT_ITERATIONS,
            payload: None,
            awaited: false,
        }
    }

    /// Set the resources locked by each job, in locking order.
    pub fn resources(mut self, ids: impl IntoIterator<Item = ResourceId>) -> Self {
        self.resources = ids.into_iter().collect();
        self
    }

    pub fn iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    /// Set the code executed by each job while the task's resources are
    /// locked.
    pub fn payload(
        mut self,
        payload: impl Fn(&mut CriticalSection<'_, '_, T>) + Send + Sync + 'static,
    ) -> Self {
        self.payload = Some(Arc::new(payload));
        self
    }

    /// Mark the task as one whose completion ends the run.
    pub fn awaited(mut self, awaited: bool) -> Self {
        self.awaited = awaited;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn resource_ids(&self) -> &[ResourceId] {
        &self.resources
    }

    pub fn is_awaited(&self) -> bool {
        self.awaited
    }
}

/// The configuration of a task set: the shared resources and the tasks
/// accessing them.
pub struct TaskSetCfg<T> {
    resources: Vec<ResourceCfg<T>>,
    tasks: Vec<TaskCfg<T>>,
}

impl<T> Default for TaskSetCfg<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for TaskSetCfg<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TaskSetCfg")
            .field(
                "resources",
                &self.resources.iter().map(|r| &r.name).collect::<Vec<_>>(),
            )
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl<T> TaskSetCfg<T> {
    pub const fn new() -> Self {
        Self {
            resources: Vec::new(),
            tasks: Vec::new(),
        }
    }

    /// Define a shared resource. Resources are numbered in the definition
    /// order, which is also the order in which a task must lock them.
    pub fn resource(&mut self, name: impl Into<String>, initial: T) -> ResourceId {
        self.resources.push(ResourceCfg {
            name: name.into(),
            initial,
        });
        ResourceId(self.resources.len() - 1)
    }

    pub fn task(&mut self, task: TaskCfg<T>) -> &mut Self {
        self.tasks.push(task);
        self
    }

    /// Validate the configuration, assign rate-monotonic priorities, and
    /// compute the priority ceiling of each resource.
    pub fn prepare(self) -> Result<PreparedTaskSet<T>, CfgError> {
        self.validate()?;

        let Self { resources, mut tasks } = self;

        // Shorter period = higher priority. Ties are broken by task id.
        tasks.sort_by_key(|t| (t.period, t.id));
        let tasks: Vec<_> = tasks
            .into_iter()
            .enumerate()
            .map(|(rank, cfg)| PreparedTask {
                cfg,
                priority: Priority::from_rank(rank),
            })
            .collect();

        let lowest = Priority::from_rank(tasks.len() - 1);
        let resources = resources
            .into_iter()
            .enumerate()
            .map(|(i, r)| {
                let ceiling = tasks
                    .iter()
                    .filter(|t| t.cfg.resources.contains(&ResourceId(i)))
                    .map(|t| t.priority)
                    .reduce(Priority::higher)
                    .unwrap_or(lowest);
                log::trace!("resource '{}': ceiling {}", r.name, ceiling);
                ResourceDef {
                    name: r.name,
                    ceiling,
                    initial: r.initial,
                }
            })
            .collect();

        Ok(PreparedTaskSet { resources, tasks })
    }

    fn validate(&self) -> Result<(), CfgError> {
        if self.tasks.is_empty() {
            return Err(CfgError::NoTasks);
        }

        let mut names = HashSet::new();
        for r in &self.resources {
            if !names.insert(r.name.as_str()) {
                return Err(CfgError::DuplicateResourceName(r.name.clone()));
            }
        }

        let mut ids = HashSet::new();
        for t in &self.tasks {
            if !ids.insert(t.id) {
                return Err(CfgError::DuplicateTaskId(t.id));
            }
            if t.period.is_zero() {
                return Err(CfgError::ZeroPeriod(t.id));
            }

            let mut seen = HashSet::new();
            let mut previous: Option<ResourceId> = None;
            for &resource in &t.resources {
                if resource.0 >= self.resources.len() {
                    return Err(CfgError::UnknownResource { task: t.id, resource });
                }
                if !seen.insert(resource) {
                    return Err(CfgError::DuplicateResource { task: t.id, resource });
                }
                if let Some(previous) = previous.filter(|&p| p > resource) {
                    return Err(CfgError::LockOrder {
                        task: t.id,
                        previous,
                        resource,
                    });
                }
                previous = Some(resource);
            }
        }

        Ok(())
    }
}

/// A task with its assigned priority.
pub struct PreparedTask<T> {
    pub(crate) cfg: TaskCfg<T>,
    pub(crate) priority: Priority,
}

impl<T> fmt::Debug for PreparedTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PreparedTask")
            .field("cfg", &self.cfg)
            .field("priority", &self.priority)
            .finish()
    }
}

impl<T> PreparedTask<T> {
    pub fn cfg(&self) -> &TaskCfg<T> {
        &self.cfg
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }
}

/// A validated task set, produced by [`TaskSetCfg::prepare`].
///
/// The tasks are sorted by priority, the highest first.
pub struct PreparedTaskSet<T> {
    resources: Vec<ResourceDef<T>>,
    tasks: Vec<PreparedTask<T>>,
}

impl<T> fmt::Debug for PreparedTaskSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PreparedTaskSet")
            .field(
                "ceilings",
                &self
                    .resources
                    .iter()
                    .map(|r| (&r.name, r.ceiling))
                    .collect::<Vec<_>>(),
            )
            .field("tasks", &self.tasks)
            .finish()
    }
}

impl<T> PreparedTaskSet<T> {
    pub fn tasks(&self) -> &[PreparedTask<T>] {
        &self.tasks
    }

    pub fn resources(&self) -> &[ResourceDef<T>] {
        &self.resources
    }

    /// The number of priority levels in use.
    pub fn num_levels(&self) -> usize {
        self.tasks.len()
    }

    /// The ceiling of each resource, indexed by [`ResourceId`].
    pub fn ceilings(&self) -> Vec<Priority> {
        self.resources.iter().map(|r| r.ceiling).collect()
    }

    pub fn priority_of(&self, id: TaskId) -> Option<Priority> {
        self.tasks
            .iter()
            .find(|t| t.cfg.id == id)
            .map(|t| t.priority)
    }

    pub fn into_parts(self) -> (Vec<ResourceDef<T>>, Vec<PreparedTask<T>>) {
        (self.resources, self.tasks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn ms(x: u64) -> Duration {
        Duration::from_millis(x)
    }

    /// Four tasks sharing three channels
    fn sample() -> TaskSetCfg<i32> {
        let mut cfg = TaskSetCfg::new();
        let t1t2 = cfg.resource("T1T2", 0);
        let t2t3 = cfg.resource("T2T3", 0);
        let t1t4 = cfg.resource("T1T4", 0);
        cfg.task(TaskCfg::new(4, ms(200)).resources([t1t4]))
            .task(TaskCfg::new(2, ms(100)).resources([t1t2, t2t3]))
            .task(TaskCfg::new(1, ms(80)).resources([t1t2, t1t4]))
            .task(TaskCfg::new(3, ms(160)).resources([t2t3]));
        cfg
    }

    #[test]
    fn rate_monotonic_priorities() {
        let prepared = sample().prepare().unwrap();
        let order: Vec<_> = prepared.tasks().iter().map(|t| t.cfg().id().0).collect();
        assert_eq!(order, [1, 2, 3, 4]);
        for (rank, t) in prepared.tasks().iter().enumerate() {
            assert_eq!(t.priority(), Priority(rank));
        }
        assert_eq!(prepared.priority_of(TaskId(3)), Some(Priority(2)));
        assert_eq!(prepared.num_levels(), 4);
    }

    #[test]
    fn ties_are_broken_by_id() {
        let mut cfg = TaskSetCfg::<()>::new();
        cfg.task(TaskCfg::new(7, ms(50)))
            .task(TaskCfg::new(3, ms(50)))
            .task(TaskCfg::new(5, ms(10)));
        let prepared = cfg.prepare().unwrap();
        let order: Vec<_> = prepared.tasks().iter().map(|t| t.cfg().id().0).collect();
        assert_eq!(order, [5, 3, 7]);
    }

    #[test]
    fn ceilings() {
        let prepared = sample().prepare().unwrap();
        // T1T2 and T1T4 are locked by task 1, T2T3 by tasks 2 and 3
        assert_eq!(
            prepared.ceilings(),
            [Priority(0), Priority(1), Priority(0)]
        );
    }

    #[test]
    fn unused_resource_gets_lowest_ceiling() {
        let mut cfg = TaskSetCfg::new();
        cfg.resource("unused", 0u8);
        cfg.task(TaskCfg::new(1, ms(10)))
            .task(TaskCfg::new(2, ms(20)));
        assert_eq!(cfg.prepare().unwrap().ceilings(), [Priority(1)]);
    }

    #[test]
    fn empty() {
        let mut cfg = TaskSetCfg::<()>::new();
        cfg.resource("R", ());
        assert_matches!(cfg.prepare(), Err(CfgError::NoTasks));
    }

    #[test]
    fn duplicate_task_id() {
        let mut cfg = TaskSetCfg::<()>::new();
        cfg.task(TaskCfg::new(1, ms(10))).task(TaskCfg::new(1, ms(20)));
        assert_matches!(cfg.prepare(), Err(CfgError::DuplicateTaskId(TaskId(1))));
    }

    #[test]
    fn zero_period() {
        let mut cfg = TaskSetCfg::<()>::new();
        cfg.task(TaskCfg::new(2, Duration::ZERO));
        assert_matches!(cfg.prepare(), Err(CfgError::ZeroPeriod(TaskId(2))));
    }

    #[test]
    fn duplicate_resource_name() {
        let mut cfg = TaskSetCfg::new();
        cfg.resource("R", 0);
        cfg.resource("R", 1);
        cfg.task(TaskCfg::new(1, ms(10)));
        assert_matches!(cfg.prepare(), Err(CfgError::DuplicateResourceName(name)) if name == "R");
    }

    #[test]
    fn unknown_resource() {
        let mut cfg = TaskSetCfg::new();
        cfg.resource("R", 0);
        cfg.task(TaskCfg::new(1, ms(10)).resources([ResourceId(1)]));
        assert_matches!(
            cfg.prepare(),
            Err(CfgError::UnknownResource {
                task: TaskId(1),
                resource: ResourceId(1)
            })
        );
    }

    #[test]
    fn lock_order() {
        let mut cfg = TaskSetCfg::new();
        let a = cfg.resource("A", 0);
        let b = cfg.resource("B", 0);
        cfg.task(TaskCfg::new(1, ms(10)).resources([b, a]));
        assert_matches!(
            cfg.prepare(),
            Err(CfgError::LockOrder {
                task: TaskId(1),
                previous: ResourceId(1),
                resource: ResourceId(0),
            })
        );
    }

    #[test]
    fn duplicate_resource() {
        let mut cfg = TaskSetCfg::new();
        let a = cfg.resource("A", 0);
        let b = cfg.resource("B", 0);
        cfg.task(TaskCfg::new(1, ms(10)).resources([a, b, a]));
        assert_matches!(
            cfg.prepare(),
            Err(CfgError::DuplicateResource {
                task: TaskId(1),
                resource: ResourceId(0),
            })
        );
    }
}
