// Vibration Node: Clock Reconciler
//
// Two clocks are in play during a cycle: the monotonic timer (interval
// timing, immune to SNTP steps) and the synchronised wall clock (absolute
// timestamps).  The wall clock is read exactly once before sampling; every
// absolute timestamp in the published metadata derives from that one value.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::session::IntervalSeries;

/// Time sources the pipeline consumes.
pub trait Timebase {
    /// Monotonic microseconds since boot.
    fn monotonic_us(&self) -> i64;

    /// Wall clock, microseconds since the Unix epoch.
    fn epoch_us(&self) -> u64;

    /// Block the caller for roughly `duration`.  Sub-millisecond delays busy
    /// wait on the device.
    fn delay(&self, duration: Duration);
}

impl<T: Timebase + ?Sized> Timebase for &T {
    fn monotonic_us(&self) -> i64 {
        (**self).monotonic_us()
    }

    fn epoch_us(&self) -> u64 {
        (**self).epoch_us()
    }

    fn delay(&self, duration: Duration) {
        (**self).delay(duration)
    }
}

/// Read the wall clock once, immediately before sampling starts.
pub fn capture_epoch<T: Timebase + ?Sized>(time: &T) -> u64 {
    time.epoch_us()
}

/// Whole seconds of a captured epoch, as carried in the `epoch_s` field.
pub fn epoch_seconds(epoch_us: u64) -> u32 {
    (epoch_us / 1_000_000) as u32
}

/// `YYYY-MM-DDTHH:MM:SS.ffffffZ` (UTC), or `None` past the representable
/// calendar range.
pub fn try_format_iso8601_us(epoch_us: u64) -> Option<String> {
    let instant: DateTime<Utc> = i64::try_from(epoch_us)
        .ok()
        .and_then(DateTime::<Utc>::from_timestamp_micros)?;
    Some(instant.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string())
}

/// Render a captured epoch for the `iso` field.  An unrepresentable epoch
/// is logged and rendered as the Unix epoch.
pub fn format_iso8601_us(epoch_us: u64) -> String {
    try_format_iso8601_us(epoch_us).unwrap_or_else(|| {
        log::warn!("Epoch {} us is outside the calendar range; iso falls back to 1970", epoch_us);
        DateTime::<Utc>::default().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
    })
}

/// Wall-clock "now" minus `epoch_us0 + sum(intervals)`.  Positive means the
/// wall clock ran ahead of the monotonic reference.  Diagnostic only.
pub fn cross_check_drift<T: Timebase + ?Sized>(time: &T, epoch_us0: u64, interval_sum_us: u64) -> i64 {
    let now = time.epoch_us();
    let estimate = epoch_us0.saturating_add(interval_sum_us);
    (i128::from(now) - i128::from(estimate)).clamp(i128::from(i64::MIN), i128::from(i64::MAX)) as i64
}

// ---------------------------------------------------------------------------
// Interval statistics (post-acquisition validation)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntervalStats {
    pub min_us: u16,
    pub max_us: u16,
    pub mean_us: f64,
    pub target_us: u32,
    pub saturated: usize,
    /// Sum of the measured deltas.
    pub duration_us: u64,
    /// `(n - 1) * target`.
    pub expected_us: u64,
}

impl IntervalStats {
    pub fn from_series(series: &IntervalSeries, fs_hz: u16) -> Self {
        let target_us = if fs_hz == 0 { 0 } else { 1_000_000 / u32::from(fs_hz) };
        let deltas = series.as_slice();
        let count = deltas.len();
        let mean_us = if count == 0 {
            0.0
        } else {
            series.sum_us() as f64 / count as f64
        };
        Self {
            min_us: deltas.iter().copied().min().unwrap_or(0),
            max_us: deltas.iter().copied().max().unwrap_or(0),
            mean_us,
            target_us,
            saturated: series.saturated_count(),
            duration_us: series.sum_us(),
            expected_us: count as u64 * u64::from(target_us),
        }
    }

    pub fn log(&self) {
        log::info!(
            "dt stats: min={} us, max={} us, mean={:.2} us, target={} us, sat={}",
            self.min_us,
            self.max_us,
            self.mean_us,
            self.target_us,
            self.saturated
        );
        log::info!(
            "duration_est = {:.3} ms (expected {:.3} ms)",
            self.duration_us as f64 / 1000.0,
            self.expected_us as f64 / 1000.0
        );
        if self.saturated > 0 {
            log::warn!("{} interval(s) saturated at 65535 us (measurement stall)", self.saturated);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    struct FixedWall(Cell<u64>);

    impl Timebase for FixedWall {
        fn monotonic_us(&self) -> i64 {
            0
        }

        fn epoch_us(&self) -> u64 {
            self.0.get()
        }

        fn delay(&self, _: Duration) {}
    }

    #[test]
    fn iso_formatting_keeps_microseconds() {
        assert_eq!(format_iso8601_us(0), "1970-01-01T00:00:00.000000Z");
        assert_eq!(
            format_iso8601_us(1_700_000_000_123_456),
            "2023-11-14T22:13:20.123456Z"
        );
        assert_eq!(
            format_iso8601_us(1_709_251_199_000_001),
            "2024-02-29T23:59:59.000001Z"
        );
    }

    #[test]
    fn unrepresentable_epoch_is_reported() {
        assert_eq!(try_format_iso8601_us(u64::MAX), None);
        assert_eq!(try_format_iso8601_us(9_000_000_000_000_000_000), None);
        assert_eq!(format_iso8601_us(u64::MAX), "1970-01-01T00:00:00.000000Z");
        assert!(try_format_iso8601_us(1_700_000_000_000_000).is_some());
    }

    #[test]
    fn epoch_seconds_truncates() {
        assert_eq!(epoch_seconds(1_700_000_000_999_999), 1_700_000_000);
    }

    #[test]
    fn drift_is_signed() {
        let wall = FixedWall(Cell::new(1_000_500));
        assert_eq!(cross_check_drift(&wall, 1_000_000, 400), 100);
        wall.0.set(1_000_300);
        assert_eq!(cross_check_drift(&wall, 1_000_000, 400), -100);
    }

    #[test]
    fn capture_reads_the_wall_clock_once() {
        let wall = FixedWall(Cell::new(42));
        assert_eq!(capture_epoch(&wall), 42);
    }

    #[test]
    fn stats_summarise_series() {
        let series = IntervalSeries::from_deltas(vec![990, 1010, 1000, 65535]);
        let stats = IntervalStats::from_series(&series, 1000);
        assert_eq!(stats.min_us, 990);
        assert_eq!(stats.max_us, 65535);
        assert_eq!(stats.target_us, 1000);
        assert_eq!(stats.saturated, 1);
        assert_eq!(stats.duration_us, 68_535);
        assert_eq!(stats.expected_us, 4000);
        assert!((stats.mean_us - 17_133.75).abs() < 1e-9);
    }
}
