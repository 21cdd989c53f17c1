//! Toy payloads that pass pseudo-random values between tasks
use rmsim_kernel::{CriticalSection, ResourceId};
use std::{
    hash::Hasher,
    sync::atomic::{AtomicU64, Ordering},
    time::{Duration, Instant},
};
use wyhash::WyHash;

/// Reads some of the locked resources, writes a value in `0..10` to others,
/// and optionally burns or sleeps for a while to stretch the critical
/// section.
#[derive(Debug)]
pub struct ToyPayload {
    task: usize,
    reads: Vec<(String, ResourceId)>,
    writes: Vec<(String, ResourceId)>,
    spin: Duration,
    sleep: Duration,
    jobs: AtomicU64,
}

impl ToyPayload {
    pub fn new(
        task: usize,
        reads: Vec<(String, ResourceId)>,
        writes: Vec<(String, ResourceId)>,
        spin: Duration,
        sleep: Duration,
    ) -> Self {
        Self {
            task,
            reads,
            writes,
            spin,
            sleep,
            jobs: AtomicU64::new(0),
        }
    }

    fn next_value(&self) -> i32 {
        let mut hasher = WyHash::with_seed(self.task as u64);
        hasher.write_u64(self.jobs.fetch_add(1, Ordering::Relaxed));
        (hasher.finish() % 10) as i32
    }

    pub fn run(&self, cs: &mut CriticalSection<'_, '_, i32>) {
        for (name, id) in &self.reads {
            if let Some(value) = cs.get(*id) {
                log::debug!("task {}: read {} from {}", self.task, value, name);
            }
        }

        for (name, id) in &self.writes {
            let value = self.next_value();
            if let Some(slot) = cs.get_mut(*id) {
                *slot = value;
                log::debug!("task {}: wrote {} to {}", self.task, value, name);
            }
        }

        if !self.spin.is_zero() {
            let start = Instant::now();
            while start.elapsed() < self.spin {
                std::hint::spin_loop();
            }
        }

        if !self.sleep.is_zero() {
            std::thread::sleep(self.sleep);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rmsim_kernel::{
        mutex::{CeilingSet, ResourceDef},
        task::TaskRef,
        Priority, TaskId,
    };

    fn channels() -> CeilingSet<i32> {
        CeilingSet::new(["A", "B"].map(|name| ResourceDef {
            name: name.to_owned(),
            ceiling: Priority(0),
            initial: -1,
        }))
    }

    fn job(set: &CeilingSet<i32>, payload: &ToyPayload) {
        let me = TaskRef {
            id: TaskId(1),
            priority: Priority(0),
        };
        let mut held = set.lock_all(me, &[ResourceId(0), ResourceId(1)]).unwrap();
        payload.run(&mut CriticalSection::new(me.id, &mut held));
        set.unlock_all(held).unwrap();
    }

    #[test]
    fn writes_values_below_ten() {
        let set = channels();
        let payload = ToyPayload::new(
            1,
            vec![("A".to_owned(), ResourceId(0))],
            vec![("B".to_owned(), ResourceId(1))],
            Duration::ZERO,
            Duration::ZERO,
        );

        let mut seen = [false; 10];
        for _ in 0..200 {
            job(&set, &payload);
            let values = channels_snapshot(&set);
            // Only written channels change
            assert_eq!(values[0], -1);
            assert!((0..10).contains(&values[1]), "{:?}", values);
            seen[values[1] as usize] = true;
        }
        // Not a constant
        assert!(seen.iter().filter(|&&x| x).count() > 1);
    }

    fn channels_snapshot(set: &CeilingSet<i32>) -> [i32; 2] {
        let me = TaskRef {
            id: TaskId(99),
            priority: Priority(0),
        };
        let held = set.lock_all(me, &[ResourceId(0), ResourceId(1)]).unwrap();
        let values = [*held[0], *held[1]];
        set.unlock_all(held).unwrap();
        values
    }

    #[test]
    fn spin_stretches_the_section() {
        let set = channels();
        let payload = ToyPayload::new(
            1,
            Vec::new(),
            Vec::new(),
            Duration::from_millis(5),
            Duration::from_millis(5),
        );
        let start = Instant::now();
        job(&set, &payload);
        assert!(start.elapsed() >= Duration::from_millis(10));
    }
}
