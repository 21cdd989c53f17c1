//! The host's monotonic clock
use rmsim_kernel::time::{Clock, Time};

/// A [`Clock`] backed by the host's monotonic clock.
///
/// On Linux, this is `CLOCK_MONOTONIC`, and [`Clock::sleep_until`] sleeps
/// until an absolute instant with `clock_nanosleep(TIMER_ABSTIME)`, so that
/// a late wake-up doesn't shift the following arrivals. Elsewhere, it falls
/// back to [`std::time::Instant`].
#[derive(Debug, Clone, Copy, Default)]
pub struct HostClock {
    _private: (),
}

impl HostClock {
    pub const fn new() -> Self {
        Self { _private: () }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
impl Clock for HostClock {
    fn now(&self) -> Time {
        // Safety: `timespec` is a plain C struct
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        // Safety: `ts` is valid for writes
        if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) } != 0 {
            panic!("clock_gettime failed: {}", errno::errno());
        }
        Time::new(ts.tv_sec as u64, ts.tv_nsec as u32)
    }

    fn sleep_until(&self, deadline: Time) {
        // Safety: `timespec` is a plain C struct
        let mut ts: libc::timespec = unsafe { std::mem::zeroed() };
        ts.tv_sec = deadline.secs().min(libc::time_t::MAX as u64) as libc::time_t;
        ts.tv_nsec = deadline.subsec_nanos() as _;

        loop {
            // Safety: `ts` is valid for reads. The remaining time is only
            // written for relative sleeps.
            match unsafe {
                libc::clock_nanosleep(
                    libc::CLOCK_MONOTONIC,
                    libc::TIMER_ABSTIME,
                    &ts,
                    std::ptr::null_mut(),
                )
            } {
                0 => break,
                libc::EINTR => {
                    // Interrupted by a signal handler. The deadline is
                    // absolute, so just try again.
                    continue;
                }
                e => panic!("clock_nanosleep failed: {}", errno::Errno(e)),
            }
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
impl Clock for HostClock {
    fn now(&self) -> Time {
        Time::from_duration_since_origin(origin().elapsed())
    }

    fn sleep_until(&self, deadline: Time) {
        let remaining = deadline.saturating_duration_since(self.now());
        if !remaining.is_zero() {
            std::thread::sleep(remaining);
        }
    }
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn origin() -> std::time::Instant {
    static ORIGIN: std::sync::OnceLock<std::time::Instant> = std::sync::OnceLock::new();
    *ORIGIN.get_or_init(std::time::Instant::now)
}
