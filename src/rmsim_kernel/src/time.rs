//! Absolute timestamps and the clock abstraction
use core::{fmt, ops};
use std::{sync::Mutex, time::Duration};

const NANOS_PER_SEC: u32 = 1_000_000_000;

/// An absolute timestamp measured by a [`Clock`].
///
/// The origin is clock-defined. `Time` is made of whole seconds and a
/// sub-second nanosecond part, which is always kept below one second.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Time {
    secs: u64,
    nanos: u32,
}

impl Time {
    /// Zero (the origin).
    pub const ZERO: Self = Self { secs: 0, nanos: 0 };

    /// The largest representable timestamp.
    pub const MAX: Self = Self {
        secs: u64::MAX,
        nanos: NANOS_PER_SEC - 1,
    };

    /// Construct a `Time` from seconds and nanoseconds. Excess nanoseconds are
    /// carried into the seconds part.
    #[inline]
    pub const fn new(secs: u64, nanos: u32) -> Self {
        Self::ZERO
            .add_duration(Duration::from_secs(secs))
            .add_duration(Duration::from_nanos(nanos as u64))
    }

    /// Construct a `Time` located `duration` after the origin.
    #[inline]
    pub const fn from_duration_since_origin(duration: Duration) -> Self {
        Self::ZERO.add_duration(duration)
    }

    /// Construct a `Time` from the specified number of milliseconds.
    #[inline]
    pub const fn from_millis(millis: u64) -> Self {
        Self::from_duration_since_origin(Duration::from_millis(millis))
    }

    /// The whole seconds part.
    #[inline]
    pub const fn secs(self) -> u64 {
        self.secs
    }

    /// The sub-second part in nanoseconds.
    #[inline]
    pub const fn subsec_nanos(self) -> u32 {
        self.nanos
    }

    /// Get the time span between [`Self::ZERO`] and this `Time`.
    #[inline]
    pub const fn duration_since_origin(self) -> Duration {
        Duration::new(self.secs, self.nanos)
    }

    /// Advance the time by `duration`, carrying nanosecond overflow into the
    /// seconds part. Saturates at [`Self::MAX`].
    #[inline]
    pub const fn add_duration(self, duration: Duration) -> Self {
        let (mut secs, overflow) = self.secs.overflowing_add(duration.as_secs());
        if overflow {
            return Self::MAX;
        }

        // Both operands are below `NANOS_PER_SEC`, so this can't overflow
        let mut nanos = self.nanos + duration.subsec_nanos();
        if nanos >= NANOS_PER_SEC {
            nanos -= NANOS_PER_SEC;
            secs = match secs.checked_add(1) {
                Some(x) => x,
                None => return Self::MAX,
            };
        }

        Self { secs, nanos }
    }

    /// Get the time span from `earlier` to `self`, or zero if `earlier` is
    /// later than `self`.
    #[inline]
    pub fn saturating_duration_since(self, earlier: Self) -> Duration {
        self.duration_since_origin()
            .saturating_sub(earlier.duration_since_origin())
    }
}

impl fmt::Debug for Time {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.duration_since_origin().fmt(f)
    }
}

impl ops::Add<Duration> for Time {
    type Output = Self;

    /// Advance the time by `duration` and return the result.
    #[inline]
    fn add(self, rhs: Duration) -> Self::Output {
        self.add_duration(rhs)
    }
}

impl ops::AddAssign<Duration> for Time {
    #[inline]
    fn add_assign(&mut self, rhs: Duration) {
        *self = *self + rhs;
    }
}

/// A monotonic clock supporting absolute sleeps.
pub trait Clock: Sync {
    /// Get the current time.
    fn now(&self) -> Time;

    /// Block the calling thread until the clock reaches `deadline`.
    ///
    /// Returns immediately if `deadline` is already in the past.
    fn sleep_until(&self, deadline: Time);
}

impl<C: Clock + ?Sized> Clock for &C {
    #[inline]
    fn now(&self) -> Time {
        (**self).now()
    }

    #[inline]
    fn sleep_until(&self, deadline: Time) {
        (**self).sleep_until(deadline)
    }
}

/// A virtual [`Clock`] that only moves when told to.
///
/// `sleep_until` jumps straight to the deadline, so a periodic loop driven by
/// this clock runs at full speed while observing exactly the timestamps a real
/// clock would produce. Code under test can call [`ManualClock::advance`] to
/// model execution time.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<Time>,
}

impl ManualClock {
    pub fn new(start: Time) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `duration`.
    pub fn advance(&self, duration: Duration) {
        let mut now = self.lock();
        *now += duration;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Time> {
        // The guarded value is a plain timestamp; a panic elsewhere can't
        // leave it half-updated
        self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Time {
        *self.lock()
    }

    fn sleep_until(&self, deadline: Time) {
        let mut now = self.lock();
        if deadline > *now {
            log::trace!("ManualClock: {:?} → {:?}", *now, deadline);
            *now = deadline;
        }
    }
}
