// Vibration Node: Significance Gate
//
// RMS of the per-sample 3-axis vector norm, in m/s^2.  Below the configured
// threshold the cycle goes straight to sleep without publishing anything.

use crate::session::{mg_to_mps2, Waveform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    Publish,
    Suppress,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateOutcome {
    pub rms: f64,
    pub threshold: f64,
    pub decision: GateDecision,
}

/// Root-mean-square magnitude in m/s^2.  Accumulates in `f64` so 2000
/// squared terms lose no precision.  An empty waveform yields 0.
pub fn magnitude_rms(waveform: &Waveform) -> f64 {
    if waveform.is_empty() {
        return 0.0;
    }
    let sum_sq: f64 = waveform
        .samples()
        .map(|(x, y, z)| {
            let (ax, ay, az) = (mg_to_mps2(x), mg_to_mps2(y), mg_to_mps2(z));
            ax * ax + ay * ay + az * az
        })
        .sum();
    (sum_sq / waveform.len() as f64).sqrt()
}

/// Stateless threshold check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SignificanceGate {
    threshold: f64,
}

impl SignificanceGate {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn decide(&self, rms: f64) -> GateDecision {
        if rms < self.threshold {
            GateDecision::Suppress
        } else {
            GateDecision::Publish
        }
    }

    pub fn evaluate(&self, waveform: &Waveform) -> GateOutcome {
        let rms = magnitude_rms(waveform);
        GateOutcome {
            rms,
            threshold: self.threshold,
            decision: self.decide(rms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Acceleration;

    fn constant(n: usize, sample: Acceleration) -> Waveform {
        let mut w = Waveform::with_capacity(n);
        for _ in 0..n {
            w.push(sample);
        }
        w
    }

    #[test]
    fn one_g_at_rest_is_standard_gravity() {
        for n in [2, 4, 500, 2000] {
            let w = constant(n, Acceleration::new(0.0, 0.0, 9.80665));
            assert!((magnitude_rms(&w) - 9.80665).abs() < 1e-3, "n={n}");
        }
    }

    #[test]
    fn rms_combines_all_axes() {
        // 3-4-5 triangle in g
        let w = Waveform::from_axes(vec![3000, 3000], vec![4000, 4000], vec![0, 0]).unwrap();
        assert!((magnitude_rms(&w) - 5.0 * 9.80665).abs() < 1e-9);

        let w = Waveform::from_axes(vec![1000, 0], vec![0, 0], vec![0, 0]).unwrap();
        assert!((magnitude_rms(&w) - 9.80665 / 2f64.sqrt()).abs() < 1e-9);
    }

    #[test]
    fn gate_is_pure() {
        let w = Waveform::from_axes(vec![12, -400, 977], vec![5, 3, -2], vec![1001, 990, 1020]).unwrap();
        let gate = SignificanceGate::new(10.78);
        assert_eq!(gate.evaluate(&w), gate.evaluate(&w));
        assert_eq!(magnitude_rms(&w).to_bits(), magnitude_rms(&w).to_bits());
    }

    #[test]
    fn threshold_is_inclusive_for_publish() {
        let gate = SignificanceGate::new(10.78);
        assert_eq!(gate.decide(10.779), GateDecision::Suppress);
        assert_eq!(gate.decide(10.78), GateDecision::Publish);
        assert_eq!(gate.decide(15.0), GateDecision::Publish);
    }

    #[test]
    fn empty_waveform_is_quiet() {
        assert_eq!(magnitude_rms(&Waveform::default()), 0.0);
    }
}
