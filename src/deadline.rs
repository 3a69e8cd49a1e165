// Vibration Node: Blocking Operations With Explicit Deadlines
//
// Wi-Fi association, SNTP sync and the broker connect all share one shape:
// kick the operation off, then poll a readiness check until it holds or the
// deadline passes.  None of them can be cancelled mid-flight; a timeout sends
// the cycle to the failure path.

use std::time::Duration;

use thiserror::Error;

use crate::clock::Timebase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("timed out after {0:?}")]
pub struct TimedOut(pub Duration);

/// Absolute monotonic deadline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    start_us: i64,
    expires_us: i64,
}

impl Deadline {
    pub fn after<T: Timebase + ?Sized>(time: &T, timeout: Duration) -> Self {
        let start_us = time.monotonic_us();
        let timeout_us = i64::try_from(timeout.as_micros()).unwrap_or(i64::MAX);
        Self {
            start_us,
            expires_us: start_us.saturating_add(timeout_us),
        }
    }

    pub fn expired<T: Timebase + ?Sized>(&self, time: &T) -> bool {
        time.monotonic_us() >= self.expires_us
    }

    pub fn elapsed<T: Timebase + ?Sized>(&self, time: &T) -> Duration {
        let us = time.monotonic_us().saturating_sub(self.start_us).max(0);
        Duration::from_micros(us as u64)
    }
}

/// Poll `ready` every `poll` until it returns `true` or `timeout` elapses.
/// Returns how long the wait took.
pub fn wait_until<T, F>(time: &T, timeout: Duration, poll: Duration, mut ready: F) -> Result<Duration, TimedOut>
where
    T: Timebase + ?Sized,
    F: FnMut() -> bool,
{
    let deadline = Deadline::after(time, timeout);
    loop {
        if ready() {
            return Ok(deadline.elapsed(time));
        }
        if deadline.expired(time) {
            return Err(TimedOut(timeout));
        }
        time.delay(poll);
    }
}

/// Like [`wait_until`] but for attempts that can report a hard error
/// (e.g. a connect call that returns `Err`).  Errors are logged and retried
/// until the deadline.
pub fn retry_until<T, F, E>(time: &T, timeout: Duration, poll: Duration, mut attempt: F) -> Result<Duration, TimedOut>
where
    T: Timebase + ?Sized,
    F: FnMut() -> Result<bool, E>,
    E: std::fmt::Display,
{
    wait_until(time, timeout, poll, || match attempt() {
        Ok(done) => done,
        Err(e) => {
            log::debug!("attempt failed: {}", e);
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    /// Clock that only advances when delayed.
    #[derive(Default)]
    struct StepClock {
        now_us: Cell<i64>,
        delays: Cell<u32>,
    }

    impl Timebase for StepClock {
        fn monotonic_us(&self) -> i64 {
            self.now_us.get()
        }

        fn epoch_us(&self) -> u64 {
            0
        }

        fn delay(&self, duration: Duration) {
            self.delays.set(self.delays.get() + 1);
            self.now_us.set(self.now_us.get() + duration.as_micros() as i64);
        }
    }

    #[test]
    fn returns_as_soon_as_ready() {
        let clock = StepClock::default();
        let mut polls = 0;
        let waited = wait_until(&clock, Duration::from_secs(1), Duration::from_millis(250), || {
            polls += 1;
            polls == 3
        })
        .unwrap();
        assert_eq!(waited, Duration::from_millis(500));
        assert_eq!(clock.delays.get(), 2);
    }

    #[test]
    fn times_out_at_the_deadline() {
        let clock = StepClock::default();
        let err = wait_until(&clock, Duration::from_secs(1), Duration::from_millis(250), || false)
            .unwrap_err();
        assert_eq!(err, TimedOut(Duration::from_secs(1)));
        assert_eq!(clock.monotonic_us(), 1_000_000);
    }

    #[test]
    fn retry_swallows_attempt_errors() {
        let clock = StepClock::default();
        let mut attempts = 0;
        let result = retry_until(&clock, Duration::from_secs(5), Duration::from_secs(1), || {
            attempts += 1;
            if attempts < 3 {
                Err("refused")
            } else {
                Ok(true)
            }
        });
        assert_eq!(result, Ok(Duration::from_secs(2)));
    }
}
