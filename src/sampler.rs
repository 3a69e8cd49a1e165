// Vibration Node: Fixed-Rate Sampler
//
// Reads the accelerometer `n` times at `fs_hz`.  Sample `i` is scheduled at
// `t0 + i * period`, computed from the absolute index, so per-sample overhead
// never accumulates across up to 2000 iterations; jitter stays bounded by the
// polling granularity.
//
// While this runs nothing else does: no network I/O, no encoding.  The poller
// owns the CPU for the whole window.

use std::time::Duration;

use thiserror::Error;

use crate::clock::{capture_epoch, Timebase};
use crate::config::{MAX_SAMPLES, MIN_SAMPLES};
use crate::drivers::Accelerometer;
use crate::error::FirmwareError;
use crate::session::{AcquisitionSession, IntervalSeries, Waveform};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquisitionError {
    #[error("need at least 2 samples, got {n}")]
    TooFewSamples { n: usize },
    #[error("at most 2000 samples fit the buffers, got {n}")]
    TooManySamples { n: usize },
    #[error("sample rate must be non-zero")]
    ZeroRate,
    #[error("axis sequences differ in length")]
    AxisLengthMismatch,
    #[error("{samples} samples but {intervals} intervals")]
    IntervalCountMismatch { samples: usize, intervals: usize },
}

// ---------------------------------------------------------------------------
// Target-time poller
// ---------------------------------------------------------------------------

/// Busy-waits on the monotonic clock until a target instant.
///
/// Deliberately not a blocking sleep: a scheduler wake-up costs far more than
/// the sample period allows, so the caller trades exclusive CPU ownership for
/// bounded jitter.  `granularity` is the pause between clock reads.
pub struct TargetPoller<'t, T: Timebase + ?Sized> {
    time: &'t T,
    granularity: Duration,
}

impl<'t, T: Timebase + ?Sized> TargetPoller<'t, T> {
    pub fn new(time: &'t T, granularity: Duration) -> Self {
        Self { time, granularity }
    }

    /// Returns once `monotonic >= target_us`.
    pub fn wait_for(&self, target_us: i64) {
        while self.time.monotonic_us() < target_us {
            self.time.delay(self.granularity);
        }
    }
}

// ---------------------------------------------------------------------------
// Acquisition
// ---------------------------------------------------------------------------

pub struct FixedRateSampler<'t, T: Timebase + ?Sized> {
    time: &'t T,
    poller: TargetPoller<'t, T>,
}

impl<'t, T: Timebase + ?Sized> FixedRateSampler<'t, T> {
    pub fn new(time: &'t T, granularity: Duration) -> Self {
        Self {
            time,
            poller: TargetPoller::new(time, granularity),
        }
    }

    /// Capture `n` samples at `fs_hz`.
    ///
    /// Arguments are checked before the clock or any buffer is touched.  A
    /// sensor read failure aborts the acquisition.
    pub fn acquire<A: Accelerometer + ?Sized>(
        &self,
        sensor: &mut A,
        n: u16,
        fs_hz: u16,
    ) -> Result<AcquisitionSession, FirmwareError> {
        if n < MIN_SAMPLES {
            return Err(AcquisitionError::TooFewSamples { n: n.into() }.into());
        }
        if n > MAX_SAMPLES {
            return Err(AcquisitionError::TooManySamples { n: n.into() }.into());
        }
        if fs_hz == 0 {
            return Err(AcquisitionError::ZeroRate.into());
        }

        let n = usize::from(n);
        let period_us = i64::from(1_000_000 / u32::from(fs_hz));
        let mut waveform = Waveform::with_capacity(n);
        let mut intervals = IntervalSeries::with_capacity(n - 1);

        let epoch_us0 = capture_epoch(self.time);
        let t0 = self.time.monotonic_us();
        let mut last = t0;

        for i in 0..n {
            if i > 0 {
                self.poller.wait_for(t0 + i as i64 * period_us);
            }

            let now = self.time.monotonic_us();
            if i > 0 {
                intervals.push_elapsed(now - last);
            }
            last = now;

            waveform.push(sensor.read()?);
        }

        Ok(AcquisitionSession::from_parts(epoch_us0, fs_hz, waveform, intervals)?)
    }
}

/// Convenience wrapper: acquire with a one-off sampler.
pub fn acquire<T, A>(
    time: &T,
    sensor: &mut A,
    n: u16,
    fs_hz: u16,
    granularity: Duration,
) -> Result<AcquisitionSession, FirmwareError>
where
    T: Timebase + ?Sized,
    A: Accelerometer + ?Sized,
{
    FixedRateSampler::new(time, granularity).acquire(sensor, n, fs_hz)
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::collections::VecDeque;

    use super::*;
    use crate::drivers::SensorError;
    use crate::session::Acceleration;

    /// Monotonic readings come from a script; delays are free.
    struct ScriptedClock {
        readings: RefCell<VecDeque<i64>>,
        epoch_reads: Cell<u32>,
    }

    impl ScriptedClock {
        fn new(readings: &[i64]) -> Self {
            Self {
                readings: RefCell::new(readings.iter().copied().collect()),
                epoch_reads: Cell::new(0),
            }
        }
    }

    impl Timebase for ScriptedClock {
        fn monotonic_us(&self) -> i64 {
            self.readings.borrow_mut().pop_front().expect("script exhausted")
        }

        fn epoch_us(&self) -> u64 {
            self.epoch_reads.set(self.epoch_reads.get() + 1);
            1_700_000_000_000_000
        }

        fn delay(&self, _: Duration) {}
    }

    struct CountingSensor {
        reads: usize,
        fail_at: Option<usize>,
    }

    impl Accelerometer for CountingSensor {
        fn read(&mut self) -> Result<Acceleration, SensorError> {
            if self.fail_at == Some(self.reads) {
                return Err(SensorError::new("bus timeout"));
            }
            self.reads += 1;
            Ok(Acceleration::new(0.0, 0.0, 9.80665))
        }
    }

    fn sensor() -> CountingSensor {
        CountingSensor { reads: 0, fail_at: None }
    }

    #[test]
    fn rejects_single_sample_before_touching_anything() {
        let clock = ScriptedClock::new(&[]);
        let mut s = sensor();
        let err = acquire(&clock, &mut s, 1, 100, Duration::from_micros(50)).unwrap_err();
        assert!(matches!(
            err,
            FirmwareError::Acquisition(AcquisitionError::TooFewSamples { n: 1 })
        ));
        assert_eq!(clock.epoch_reads.get(), 0);
        assert_eq!(s.reads, 0);
    }

    #[test]
    fn rejects_zero_rate_and_oversized_requests() {
        let clock = ScriptedClock::new(&[]);
        let mut s = sensor();
        assert!(matches!(
            acquire(&clock, &mut s, 10, 0, Duration::from_micros(50)),
            Err(FirmwareError::Acquisition(AcquisitionError::ZeroRate))
        ));
        assert!(matches!(
            acquire(&clock, &mut s, 2001, 100, Duration::from_micros(50)),
            Err(FirmwareError::Acquisition(AcquisitionError::TooManySamples { n: 2001 }))
        ));
    }

    #[test]
    fn clock_regression_clamps_to_zero_and_stall_saturates() {
        // period = 1000 us
        // t0=0, stamp 0 | i=1: poll 1000, stamp 1500 | i=2: poll 2000, stamp 1200
        // (regression) | i=3: poll 3000, stamp 200_000 (stall)
        let clock = ScriptedClock::new(&[0, 0, 1000, 1500, 2000, 1200, 3000, 200_000]);
        let mut s = sensor();
        let session = acquire(&clock, &mut s, 4, 1000, Duration::from_micros(50)).unwrap();

        assert_eq!(session.intervals().as_slice(), &[1500, 0, 65535]);
        assert_eq!(session.intervals().sum_us(), 67_035);
        assert_eq!(session.waveform().len(), 4);
        assert_eq!(clock.epoch_reads.get(), 1);
    }

    #[test]
    fn targets_come_from_t0_not_the_previous_sample() {
        // Sample 1 lands late (1700); sample 2 still targets t0 + 2 * period.
        let clock = ScriptedClock::new(&[0, 0, 1700, 1700, 1999, 2000, 2000]);
        let mut s = sensor();
        let session = acquire(&clock, &mut s, 3, 1000, Duration::from_micros(50)).unwrap();
        assert_eq!(session.intervals().as_slice(), &[1700, 300]);
    }

    #[test]
    fn sensor_failure_aborts_acquisition() {
        let clock = ScriptedClock::new(&[0, 0, 1000, 1000]);
        let mut s = CountingSensor { reads: 0, fail_at: Some(1) };
        let err = acquire(&clock, &mut s, 3, 1000, Duration::from_micros(50)).unwrap_err();
        assert!(matches!(err, FirmwareError::Sensor(_)));
    }
}
