// Vibration Node: Per-Cycle Data Model
//
// Everything here lives for exactly one wake cycle and is dropped (or simply
// lost to deep sleep) afterwards.

use std::fmt;

use crate::config::{MAX_SAMPLES, MIN_SAMPLES};
use crate::sampler::AcquisitionError;

/// Standard gravity, m/s^2 per g.
pub const STANDARD_GRAVITY: f64 = 9.80665;

/// Interval value that marks a measurement stall rather than a real gap.
pub const INTERVAL_SATURATED_US: u16 = u16::MAX;

// ---------------------------------------------------------------------------
// Sensor sample (3-axis accelerometer reading)
// ---------------------------------------------------------------------------
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Acceleration {
    /// m/s^2
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Acceleration {
    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }
}

/// Convert m/s^2 to milli-g, rounded and saturated to the `i16` range.
pub fn mps2_to_mg(a_mps2: f32) -> i16 {
    let mg = (f64::from(a_mps2) / STANDARD_GRAVITY) * 1000.0;
    if mg.is_nan() {
        return 0;
    }
    mg.round().clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

/// Convert milli-g back to m/s^2.
pub fn mg_to_mps2(mg: i16) -> f64 {
    (f64::from(mg) / 1000.0) * STANDARD_GRAVITY
}

// ---------------------------------------------------------------------------
// Waveform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
}

/// Three parallel milli-g sequences of identical length.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Waveform {
    ax_mg: Vec<i16>,
    ay_mg: Vec<i16>,
    az_mg: Vec<i16>,
}

impl Waveform {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            ax_mg: Vec::with_capacity(n),
            ay_mg: Vec::with_capacity(n),
            az_mg: Vec::with_capacity(n),
        }
    }

    /// Build from existing axis data; the three axes must have equal length.
    pub fn from_axes(ax_mg: Vec<i16>, ay_mg: Vec<i16>, az_mg: Vec<i16>) -> Result<Self, AcquisitionError> {
        if ax_mg.len() != ay_mg.len() || ax_mg.len() != az_mg.len() {
            return Err(AcquisitionError::AxisLengthMismatch);
        }
        Ok(Self { ax_mg, ay_mg, az_mg })
    }

    /// Append one reading, converting m/s^2 to milli-g.
    pub fn push(&mut self, sample: Acceleration) {
        self.ax_mg.push(mps2_to_mg(sample.x));
        self.ay_mg.push(mps2_to_mg(sample.y));
        self.az_mg.push(mps2_to_mg(sample.z));
    }

    pub fn len(&self) -> usize {
        self.ax_mg.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ax_mg.is_empty()
    }

    pub fn axis(&self, axis: Axis) -> &[i16] {
        match axis {
            Axis::X => &self.ax_mg,
            Axis::Y => &self.ay_mg,
            Axis::Z => &self.az_mg,
        }
    }

    /// Iterate over `(ax, ay, az)` triples.
    pub fn samples(&self) -> impl Iterator<Item = (i16, i16, i16)> + '_ {
        self.ax_mg
            .iter()
            .zip(&self.ay_mg)
            .zip(&self.az_mg)
            .map(|((&x, &y), &z)| (x, y, z))
    }
}

// ---------------------------------------------------------------------------
// Inter-sample intervals
// ---------------------------------------------------------------------------

/// Microsecond deltas between consecutive samples, with their running sum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSeries {
    deltas_us: Vec<u16>,
    sum_us: u64,
}

impl IntervalSeries {
    pub fn with_capacity(n: usize) -> Self {
        Self {
            deltas_us: Vec::with_capacity(n),
            sum_us: 0,
        }
    }

    pub fn from_deltas(deltas_us: Vec<u16>) -> Self {
        let sum_us = deltas_us.iter().map(|&d| u64::from(d)).sum();
        Self { deltas_us, sum_us }
    }

    /// Record an elapsed monotonic delta.  Negative deltas (clock anomaly)
    /// become 0; anything above the 16-bit ceiling saturates.
    pub fn push_elapsed(&mut self, elapsed_us: i64) -> u16 {
        let clamped = elapsed_us.clamp(0, i64::from(INTERVAL_SATURATED_US)) as u16;
        self.deltas_us.push(clamped);
        self.sum_us += u64::from(clamped);
        clamped
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.deltas_us
    }

    pub fn len(&self) -> usize {
        self.deltas_us.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deltas_us.is_empty()
    }

    /// Sum of the recorded (clamped) deltas.
    pub fn sum_us(&self) -> u64 {
        self.sum_us
    }

    pub fn saturated_count(&self) -> usize {
        self.deltas_us
            .iter()
            .filter(|&&d| d == INTERVAL_SATURATED_US)
            .count()
    }
}

// ---------------------------------------------------------------------------
// Session identity
// ---------------------------------------------------------------------------

/// `"{device}-{low 32 bits of epoch_us0}"`, shared by every message of a cycle.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionId(String);

impl SessionId {
    pub fn derive(device_id: &str, epoch_us0: u64) -> Self {
        let low = (epoch_us0 & 0xFFFF_FFFF) as u32;
        Self(format!("{}-{}", device_id, low))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Acquisition session
// ---------------------------------------------------------------------------

/// One captured event: start instant, format and the owned buffers.
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionSession {
    epoch_us0: u64,
    fs_hz: u16,
    waveform: Waveform,
    intervals: IntervalSeries,
}

impl AcquisitionSession {
    /// Assemble a session, enforcing `n ∈ [2, 2000]` and `intervals == n - 1`.
    pub fn from_parts(
        epoch_us0: u64,
        fs_hz: u16,
        waveform: Waveform,
        intervals: IntervalSeries,
    ) -> Result<Self, AcquisitionError> {
        let n = waveform.len();
        if n < usize::from(MIN_SAMPLES) {
            return Err(AcquisitionError::TooFewSamples { n });
        }
        if n > usize::from(MAX_SAMPLES) {
            return Err(AcquisitionError::TooManySamples { n });
        }
        if intervals.len() != n - 1 {
            return Err(AcquisitionError::IntervalCountMismatch {
                samples: n,
                intervals: intervals.len(),
            });
        }
        Ok(Self {
            epoch_us0,
            fs_hz,
            waveform,
            intervals,
        })
    }

    pub fn epoch_us0(&self) -> u64 {
        self.epoch_us0
    }

    pub fn n(&self) -> u16 {
        // bounded by MAX_SAMPLES in from_parts
        self.waveform.len() as u16
    }

    pub fn fs_hz(&self) -> u16 {
        self.fs_hz
    }

    pub fn waveform(&self) -> &Waveform {
        &self.waveform
    }

    pub fn intervals(&self) -> &IntervalSeries {
        &self.intervals
    }

    pub fn session_id(&self, device_id: &str) -> SessionId {
        SessionId::derive(device_id, self.epoch_us0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mg_conversion_rounds_and_saturates() {
        assert_eq!(mps2_to_mg(9.80665), 1000);
        assert_eq!(mps2_to_mg(-9.80665), -1000);
        assert_eq!(mps2_to_mg(15.0), 1530);
        assert_eq!(mps2_to_mg(0.0), 0);
        assert_eq!(mps2_to_mg(1000.0), i16::MAX);
        assert_eq!(mps2_to_mg(-1000.0), i16::MIN);
        assert_eq!(mps2_to_mg(f32::NAN), 0);
    }

    #[test]
    fn interval_push_clamps_both_ends() {
        let mut series = IntervalSeries::with_capacity(3);
        assert_eq!(series.push_elapsed(-42), 0);
        assert_eq!(series.push_elapsed(1000), 1000);
        assert_eq!(series.push_elapsed(250_000), INTERVAL_SATURATED_US);
        assert_eq!(series.as_slice(), &[0, 1000, 65535]);
        assert_eq!(series.sum_us(), 66_535);
        assert_eq!(series.saturated_count(), 1);
    }

    #[test]
    fn session_id_uses_low_32_bits_of_epoch() {
        let epoch = 0x0006_1A2B_3C4D_5E6F_u64;
        let id = SessionId::derive("node-7", epoch);
        assert_eq!(id.as_str(), format!("node-7-{}", 0x3C4D_5E6F_u32));
    }

    #[test]
    fn session_rejects_inconsistent_parts() {
        let one = Waveform::from_axes(vec![0], vec![0], vec![0]).unwrap();
        assert!(matches!(
            AcquisitionSession::from_parts(0, 100, one, IntervalSeries::default()),
            Err(AcquisitionError::TooFewSamples { n: 1 })
        ));

        let two = Waveform::from_axes(vec![0, 1], vec![0, 1], vec![0, 1]).unwrap();
        assert!(matches!(
            AcquisitionSession::from_parts(0, 100, two, IntervalSeries::default()),
            Err(AcquisitionError::IntervalCountMismatch { samples: 2, intervals: 0 })
        ));

        assert!(matches!(
            Waveform::from_axes(vec![0, 1], vec![0], vec![0, 1]),
            Err(AcquisitionError::AxisLengthMismatch)
        ));
    }
}
