//! Worst-case execution time measurement
use std::time::Duration;

use crate::time::Clock;

/// Run `job` `reps` times back to back and return the longest observed
/// execution time.
///
/// Every sample counts: a single slow run caused by, e.g., a cache miss or
/// an interrupt is exactly the kind of event the bound has to cover.
///
/// Stops at the first error returned by `job`.
pub fn measure_wcet<C, E>(
    clock: &C,
    reps: usize,
    mut job: impl FnMut() -> Result<(), E>,
) -> Result<Duration, E>
where
    C: Clock + ?Sized,
{
    let mut wcet = Duration::ZERO;
    for _ in 0..reps {
        let start = clock.now();
        job()?;
        wcet = wcet.max(clock.now().saturating_duration_since(start));
    }
    Ok(wcet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::{ManualClock, Time};
    use std::convert::Infallible;

    #[test]
    fn outlier_is_kept() {
        let clock = ManualClock::new(Time::from_millis(10));
        let mut samples = [1u64, 5, 2, 40, 3].into_iter();
        let wcet = measure_wcet(&clock, 5, || {
            clock.advance(Duration::from_micros(samples.next().unwrap()));
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(wcet, Duration::from_micros(40));
    }

    #[test]
    fn zero_reps() {
        let clock = ManualClock::default();
        let mut calls = 0;
        let wcet = measure_wcet(&clock, 0, || {
            calls += 1;
            Ok::<_, Infallible>(())
        })
        .unwrap();
        assert_eq!(wcet, Duration::ZERO);
        assert_eq!(calls, 0);
    }

    #[test]
    fn error_stops_measurement() {
        let clock = ManualClock::default();
        let mut calls = 0;
        let result = measure_wcet(&clock, 10, || {
            calls += 1;
            if calls == 3 {
                Err("boom")
            } else {
                Ok(())
            }
        });
        assert_eq!(result, Err("boom"));
        assert_eq!(calls, 3);
    }
}
