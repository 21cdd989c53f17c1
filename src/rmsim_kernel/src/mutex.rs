//! Resources protected by the priority ceiling protocol
//!
//! A [`CeilingSet`] owns every shared value of a task set. Each value sits
//! behind its own lock, and each lock has a static *priority ceiling*: the
//! highest priority among the tasks that will ever lock it.
//!
//! A request from task `τ` for resource `R` is granted only if
//!
//!  - `R` is free, and
//!  - the priority of `τ` is strictly higher than the ceiling of every
//!    resource currently held by other tasks, and
//!  - no waiting task with a higher priority than `τ` would be granted its
//!    own request right now.
//!
//! The second rule is what bounds priority inversion to a single critical
//! section and makes circular waits impossible. The third rule emulates a
//! uniprocessor dispatcher, which would never let a lower-priority task run
//! while a higher-priority one is ready.
//!
//! While holding resources, a task's *effective priority* is raised to the
//! highest ceiling among them (the "priority protect" behaviour).
use std::{
    collections::HashMap,
    fmt,
    ops,
    sync::{Condvar, Mutex, MutexGuard, TryLockError},
    time::{Duration, Instant},
};

use crate::{
    error::{LockError, UnlockError},
    task::{TaskId, TaskRef},
    Priority,
};

/// Identifies a resource in a [`CeilingSet`]. Resources are numbered in their
/// declaration order, which is also the global lock order.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ResourceId(pub usize);

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The definition of a resource given to [`CeilingSet::new`].
#[derive(Debug, Clone)]
pub struct ResourceDef<T> {
    pub name: String,
    pub ceiling: Priority,
    pub initial: T,
}

/// *Resource control block* - the static part of a resource.
struct ResourceCb<T> {
    name: String,
    ceiling: Priority,
    value: Mutex<T>,
}

#[derive(Debug, Clone, Copy)]
struct Waiter {
    task: TaskRef,
    resource: ResourceId,
}

/// The dynamic part of all resources, guarded by `CeilingSet::state`.
#[derive(Debug, Default)]
struct SetState {
    /// The current holder of each resource.
    owners: Vec<Option<TaskRef>>,
    /// The resources held by each task, in the order they were locked.
    held: HashMap<TaskId, Vec<ResourceId>>,
    /// Tasks currently blocked in `lock`.
    waiters: Vec<Waiter>,
}

/// A set of mutually exclusive resources arbitrated by the priority ceiling
/// protocol.
pub struct CeilingSet<T> {
    resources: Box<[ResourceCb<T>]>,
    state: Mutex<SetState>,
    released: Condvar,
}

impl<T> fmt::Debug for CeilingSet<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CeilingSet")
            .field(
                "resources",
                &self
                    .resources
                    .iter()
                    .map(|cb| (&cb.name, cb.ceiling))
                    .collect::<Vec<_>>(),
            )
            .field("state", &*self.state())
            .finish()
    }
}

impl<T> CeilingSet<T> {
    pub fn new(defs: impl IntoIterator<Item = ResourceDef<T>>) -> Self {
        let resources: Box<[_]> = defs
            .into_iter()
            .map(|def| ResourceCb {
                name: def.name,
                ceiling: def.ceiling,
                value: Mutex::new(def.initial),
            })
            .collect();

        let state = SetState {
            owners: vec![None; resources.len()],
            ..SetState::default()
        };

        Self {
            resources,
            state: Mutex::new(state),
            released: Condvar::new(),
        }
    }

    /// The number of resources in the set.
    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn ceiling(&self, id: ResourceId) -> Option<Priority> {
        self.resources.get(id.0).map(|cb| cb.ceiling)
    }

    /// Get the task currently holding the resource.
    pub fn holder(&self, id: ResourceId) -> Option<TaskId> {
        self.state()
            .owners
            .get(id.0)
            .copied()
            .flatten()
            .map(|task| task.id)
    }

    pub fn is_locked(&self, id: ResourceId) -> bool {
        self.holder(id).is_some()
    }

    /// Get the task's priority with the ceilings of the resources it holds
    /// taken into account.
    pub fn effective_priority(&self, task: TaskRef) -> Priority {
        let st = self.state();
        st.held
            .get(&task.id)
            .into_iter()
            .flatten()
            .map(|id| self.resources[id.0].ceiling)
            .fold(task.priority, Priority::higher)
    }

    /// Consume the set and return the final values in declaration order.
    pub fn into_values(self) -> Vec<(String, T)> {
        self.resources
            .into_vec()
            .into_iter()
            .map(|cb| {
                let value = cb.value.into_inner().unwrap_or_else(|e| e.into_inner());
                (cb.name, value)
            })
            .collect()
    }

    fn state(&self) -> MutexGuard<'_, SetState> {
        // `SetState` is only modified in small sections that don't call user
        // code, so a poisoned lock can't be observed in an inconsistent state
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Find the task whose lock prevents `task` from acquiring `id` under the
    /// ceiling rule.
    fn blocker(&self, st: &SetState, task: TaskRef, id: ResourceId) -> Option<TaskRef> {
        if let Some(owner) = st.owners[id.0] {
            return Some(owner);
        }

        st.owners
            .iter()
            .zip(self.resources.iter())
            .filter_map(|(owner, cb)| owner.filter(|o| o.id != task.id).map(|o| (o, cb.ceiling)))
            .find(|&(_, ceiling)| !task.priority.is_higher_than(ceiling))
            .map(|(owner, _)| owner)
    }

    /// Check if the request can be granted now. Returns the reason it can't.
    fn poll_core(&self, st: &SetState, task: TaskRef, id: ResourceId) -> Result<(), TaskRef> {
        if let Some(blocker) = self.blocker(st, task, id) {
            return Err(blocker);
        }

        // Yield to a more urgent waiter that could proceed right away
        match st.waiters.iter().find(|w| {
            w.task.id != task.id
                && w.task.priority.is_higher_than(task.priority)
                && self.blocker(st, w.task, w.resource).is_none()
        }) {
            Some(w) => Err(w.task),
            None => Ok(()),
        }
    }

    /// Lock the resource `id` on behalf of `task`, blocking until the priority
    /// ceiling protocol allows it.
    pub fn lock(&self, task: TaskRef, id: ResourceId) -> Result<Held<'_, T>, LockError> {
        let cb = self.resources.get(id.0).ok_or(LockError::BadId(id))?;
        let mut st = self.state();

        if st.owners[id.0].map(|o| o.id) == Some(task.id) {
            return Err(LockError::WouldDeadlock { task: task.id, resource: id });
        }

        if task.priority.is_higher_than(cb.ceiling) {
            return Err(LockError::BadParam {
                task: task.id,
                priority: task.priority,
                resource: id,
                ceiling: cb.ceiling,
            });
        }

        let mut blocked_since = None;
        while let Err(blocker) = self.poll_core(&st, task, id) {
            if blocked_since.is_none() {
                log::trace!(
                    "task {} blocked on '{}' by task {}",
                    task.id,
                    cb.name,
                    blocker.id
                );
                blocked_since = Some(Instant::now());
                st.waiters.push(Waiter { task, resource: id });
            }
            st = self.released.wait(st).unwrap_or_else(|e| e.into_inner());
        }

        let blocked_for = match blocked_since {
            Some(since) => {
                st.waiters.retain(|w| w.task.id != task.id);
                since.elapsed()
            }
            None => Duration::ZERO,
        };

        st.owners[id.0] = Some(task);
        st.held.entry(task.id).or_default().push(id);

        // Leaving the wait queue may make a lower-priority waiter eligible
        let wake_others = !st.waiters.is_empty();
        drop(st);
        if wake_others {
            self.released.notify_all();
        }

        log::trace!(
            "task {} locked '{}' (blocked for {:?})",
            task.id,
            cb.name,
            blocked_for
        );

        let value = match cb.value.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                unreachable!("mutual exclusion violated on '{}'", cb.name)
            }
        };

        Ok(Held {
            value,
            lease: Lease {
                set: self,
                task,
                id,
                blocked_for,
                active: true,
            },
        })
    }

    /// Lock all `ids` in the given order. On failure, the locks taken so far
    /// are released in reverse order.
    pub fn lock_all(&self, task: TaskRef, ids: &[ResourceId]) -> Result<Vec<Held<'_, T>>, LockError> {
        let mut held = Vec::with_capacity(ids.len());
        for &id in ids {
            match self.lock(task, id) {
                Ok(h) => held.push(h),
                Err(e) => {
                    // The held locks were acquired in order, so releasing
                    // them in reverse can't fail
                    let _ = self.unlock_all(held);
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Release the resource. Never blocks.
    ///
    /// Resources must be released in the reverse order of locking. The
    /// resource is released even if an error is returned.
    pub fn unlock(&self, held: Held<'_, T>) -> Result<(), UnlockError> {
        let Held { value, mut lease } = held;

        if !std::ptr::eq(lease.set, self) {
            // Dropping `lease` releases the resource in its own set, which
            // must happen after the value is unlocked
            drop(value);
            return Err(UnlockError::NotOwner {
                task: lease.task.id,
                resource: lease.id,
            });
        }

        let mut st = self.state();
        let expected = st.held.get(&lease.task.id).and_then(|h| h.last()).copied();
        let result = match expected {
            Some(expected) if expected != lease.id => Err(UnlockError::BadObjectState {
                task: lease.task.id,
                resource: lease.id,
                expected,
            }),
            _ => Ok(()),
        };

        // The value must be unlocked before the resource becomes available
        drop(value);
        self.release_core(&mut st, lease.task, lease.id);
        lease.active = false;
        drop(st);
        self.released.notify_all();

        log::trace!(
            "task {} unlocked '{}'",
            lease.task.id,
            self.resources[lease.id.0].name
        );

        result
    }

    /// Release `held` in reverse order. All resources are released even if an
    /// error occurs; the first error is returned.
    pub fn unlock_all(&self, held: Vec<Held<'_, T>>) -> Result<(), UnlockError> {
        let mut result = Ok(());
        for h in held.into_iter().rev() {
            let r = self.unlock(h);
            if result.is_ok() {
                result = r;
            }
        }
        result
    }

    fn release_core(&self, st: &mut SetState, task: TaskRef, id: ResourceId) {
        st.owners[id.0] = None;
        if let Some(stack) = st.held.get_mut(&task.id) {
            if let Some(i) = stack.iter().rposition(|&x| x == id) {
                stack.remove(i);
            }
            if stack.is_empty() {
                st.held.remove(&task.id);
            }
        }
    }
}

/// A lock held on a resource of a [`CeilingSet`]. Gives access to the value.
///
/// Release it with [`CeilingSet::unlock`]. A `Held` that is dropped instead
/// (e.g., during unwinding) releases the resource with a warning.
pub struct Held<'a, T> {
    // Dropped before `lease`
    value: MutexGuard<'a, T>,
    lease: Lease<'a, T>,
}

struct Lease<'a, T> {
    set: &'a CeilingSet<T>,
    task: TaskRef,
    id: ResourceId,
    blocked_for: Duration,
    active: bool,
}

impl<T> Drop for Lease<'_, T> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        log::warn!(
            "task {} abandoned resource '{}'",
            self.task.id,
            self.set.resources[self.id.0].name
        );
        let mut st = self.set.state();
        self.set.release_core(&mut st, self.task, self.id);
        drop(st);
        self.set.released.notify_all();
    }
}

impl<T> Held<'_, T> {
    pub fn id(&self) -> ResourceId {
        self.lease.id
    }

    /// The time the owning task spent blocked before the lock was granted.
    pub fn blocked_for(&self) -> Duration {
        self.lease.blocked_for
    }
}

impl<T> ops::Deref for Held<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> ops::DerefMut for Held<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for Held<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Held")
            .field("id", &self.lease.id)
            .field("task", &self.lease.task.id)
            .field("value", &*self.value)
            .finish()
    }
}

/// The view a payload gets of the resources its task holds.
pub struct CriticalSection<'s, 'a, T> {
    task: TaskId,
    held: &'s mut [Held<'a, T>],
}

impl<'s, 'a, T> CriticalSection<'s, 'a, T> {
    pub fn new(task: TaskId, held: &'s mut [Held<'a, T>]) -> Self {
        Self { task, held }
    }

    /// The task executing this critical section.
    pub fn task(&self) -> TaskId {
        self.task
    }

    /// The resources held, in locking order.
    pub fn resources(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.held.iter().map(Held::id)
    }

    /// Read a held resource. Returns `None` if the task doesn't hold it.
    pub fn get(&self, id: ResourceId) -> Option<&T> {
        self.held.iter().find(|h| h.id() == id).map(|h| &**h)
    }

    /// Modify a held resource. Returns `None` if the task doesn't hold it.
    pub fn get_mut(&mut self, id: ResourceId) -> Option<&mut T> {
        self.held.iter_mut().find(|h| h.id() == id).map(|h| &mut **h)
    }
}
