// Vibration Node: Wake-Cycle State Machine
//
// One wake cycle, start to finish:
//
//   Init -> ConfigReady -> Connected -> TimeSynced -> TransportReady
//        -> SensorReady -> Acquiring -> Gated -> Publishing  -> Sleeping
//                                            \-> SleepDirect -/
//
// Any setup step, Acquiring or Gated may instead end in Failed(code).  The
// cycle never loops back into Acquiring; the next measurement is the next
// wake-up.
//
// Hardware and network collaborators come in through `Platform`, so the same
// cycle drives the device and the host simulation.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::clock::{cross_check_drift, IntervalStats, Timebase};
use crate::config::Config;
use crate::drivers::Accelerometer;
use crate::error::{FailureCode, FirmwareError};
use crate::gate::{GateDecision, GateOutcome, SignificanceGate};
use crate::publish::{self, PublishReport, PublishTiming, Transport};
use crate::sampler::FixedRateSampler;
use crate::session::SessionId;

const HISTORY_CAPACITY: usize = 16;

// ---------------------------------------------------------------------------
// States & transitions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleState {
    Init,
    ConfigReady,
    Connected,
    TimeSynced,
    TransportReady,
    SensorReady,
    Acquiring,
    Gated,
    Publishing,
    SleepDirect,
    Sleeping,
    Failed(FailureCode),
}

impl CycleState {
    pub fn can_transition_to(self, next: CycleState) -> bool {
        use CycleState::*;
        match (self, next) {
            (Init, ConfigReady)
            | (ConfigReady, Connected)
            | (Connected, TimeSynced)
            | (TimeSynced, TransportReady)
            | (TransportReady, SensorReady)
            | (SensorReady, Acquiring)
            | (Acquiring, Gated)
            | (Gated, Publishing)
            | (Gated, SleepDirect)
            | (Publishing, Sleeping)
            | (SleepDirect, Sleeping) => true,
            (
                Init | ConfigReady | Connected | TimeSynced | TransportReady | SensorReady | Acquiring | Gated,
                Failed(_),
            ) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, CycleState::Sleeping | CycleState::Failed(_))
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed(code) => write!(f, "Failed({})", code.blinks()),
            other => write!(f, "{:?}", other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal cycle transition {from} -> {to}")]
pub struct TransitionError {
    pub from: CycleState,
    pub to: CycleState,
}

/// Current state plus the path taken to reach it.
#[derive(Debug, Clone)]
pub struct CycleTracker {
    state: CycleState,
    history: heapless::Vec<CycleState, HISTORY_CAPACITY>,
}

impl Default for CycleTracker {
    fn default() -> Self {
        let mut history = heapless::Vec::new();
        // capacity is well above the longest legal path
        let _ = history.push(CycleState::Init);
        Self {
            state: CycleState::Init,
            history,
        }
    }
}

impl CycleTracker {
    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn history(&self) -> &[CycleState] {
        &self.history
    }

    pub fn advance(&mut self, next: CycleState) -> Result<(), TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                from: self.state,
                to: next,
            });
        }
        log::debug!("cycle: {} -> {}", self.state, next);
        self.state = next;
        let _ = self.history.push(next);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// What the status LED should be showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indication {
    /// Solid green through setup and measurement.
    Working,
    /// Below threshold: short yellow blinks, nothing sent.
    Suppressed,
    /// About to publish: green blinks.
    Publishing,
    Off,
}

/// Everything the cycle needs from the outside world.  Setup methods block
/// up to their configured deadline and report failure as `FirmwareError`.
pub trait Platform {
    type Sensor: Accelerometer;
    type Transport: Transport;
    type Time: Timebase;

    fn load_config(&mut self) -> Result<Config, FirmwareError>;

    /// Join the network; returns the station IP as text.
    fn connect_network(&mut self, config: &Config) -> Result<String, FirmwareError>;

    /// Block until the wall clock is synchronised.
    fn sync_time(&mut self, config: &Config) -> Result<(), FirmwareError>;

    fn connect_transport(&mut self, config: &Config) -> Result<Self::Transport, FirmwareError>;

    fn init_sensor(&mut self, config: &Config) -> Result<Self::Sensor, FirmwareError>;

    fn timebase(&self) -> &Self::Time;

    fn indicate(&mut self, indication: Indication);
}

// ---------------------------------------------------------------------------
// The cycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct CycleSummary {
    pub session_id: SessionId,
    pub gate: GateOutcome,
    /// `None` when the gate suppressed publishing.
    pub report: Option<PublishReport>,
}

#[derive(Debug)]
pub enum CycleEnd {
    Sleep { duration: Duration, summary: CycleSummary },
    Fail { code: FailureCode, error: FirmwareError },
}

pub struct Cycle {
    tracker: CycleTracker,
    timing: PublishTiming,
}

impl Default for Cycle {
    fn default() -> Self {
        Self::new(PublishTiming::default())
    }
}

impl Cycle {
    pub fn new(timing: PublishTiming) -> Self {
        Self {
            tracker: CycleTracker::default(),
            timing,
        }
    }

    pub fn state(&self) -> CycleState {
        self.tracker.state()
    }

    pub fn history(&self) -> &[CycleState] {
        self.tracker.history()
    }

    /// Run one wake cycle to its terminal state.
    pub fn run<P: Platform>(&mut self, platform: &mut P) -> CycleEnd {
        match self.execute(platform) {
            Ok((duration, summary)) => CycleEnd::Sleep { duration, summary },
            Err(error) => {
                let code = error.failure_code();
                log::error!("Cycle failed in {}: {} -> {}", self.state(), error, code);
                if let Err(e) = self.tracker.advance(CycleState::Failed(code)) {
                    log::error!("{}", e);
                }
                CycleEnd::Fail { code, error }
            }
        }
    }

    fn enter(&mut self, next: CycleState) -> Result<(), FirmwareError> {
        Ok(self.tracker.advance(next)?)
    }

    fn execute<P: Platform>(&mut self, platform: &mut P) -> Result<(Duration, CycleSummary), FirmwareError> {
        platform.indicate(Indication::Working);

        let config = platform.load_config()?;
        log::info!(
            "Config: dev={} n={} fs={} Hz threshold={:.3} sleep={:?}",
            config.client_id,
            config.acquisition.n_samples,
            config.acquisition.fs_hz,
            config.acquisition.rms_threshold,
            config.sleep
        );
        self.enter(CycleState::ConfigReady)?;

        let ip = platform.connect_network(&config)?;
        log::info!("Network up, ip={}", ip);
        self.enter(CycleState::Connected)?;

        platform.sync_time(&config)?;
        // failing to sync is fatal, so anything published carries ntp=1
        let ntp_ok = true;
        log::info!("Time synced, epoch_us={}", platform.timebase().epoch_us());
        self.enter(CycleState::TimeSynced)?;

        let mut transport = platform.connect_transport(&config)?;
        log::info!("Broker connected");
        self.enter(CycleState::TransportReady)?;

        let mut sensor = platform.init_sensor(&config)?;
        log::info!("Sensor ready");
        self.enter(CycleState::SensorReady)?;

        self.enter(CycleState::Acquiring)?;
        let acq = &config.acquisition;
        let session = {
            let time = platform.timebase();
            let session = FixedRateSampler::new(time, acq.poll_granularity).acquire(
                &mut sensor,
                acq.n_samples,
                acq.fs_hz,
            )?;
            IntervalStats::from_series(session.intervals(), session.fs_hz()).log();
            let drift_us = cross_check_drift(time, session.epoch_us0(), session.intervals().sum_us());
            log::info!("End check: wall clock minus t0+sum(dt) = {} us", drift_us);
            session
        };
        drop(sensor);
        self.enter(CycleState::Gated)?;

        let gate = SignificanceGate::new(acq.rms_threshold).evaluate(session.waveform());
        log::info!(
            "RMS |a| = {:.3} m/s^2 (threshold {:.3}) -> {:?}",
            gate.rms,
            gate.threshold,
            gate.decision
        );

        let session_id = session.session_id(&config.client_id);
        let report = match gate.decision {
            GateDecision::Suppress => {
                platform.indicate(Indication::Suppressed);
                self.enter(CycleState::SleepDirect)?;
                None
            }
            GateDecision::Publish => {
                let frames = publish::plan_frames(&session, &config.client_id, &ip, ntp_ok)?;
                platform.indicate(Indication::Publishing);
                self.enter(CycleState::Publishing)?;
                log::info!("Publishing {} message(s) for {}", frames.len(), session_id);
                Some(publish::send_frames(&frames, &mut transport, &self.timing))
            }
        };

        drop(transport);
        platform.indicate(Indication::Off);
        self.enter(CycleState::Sleeping)?;
        log::info!("Sleeping {:?}", config.sleep);

        Ok((
            config.sleep,
            CycleSummary {
                session_id,
                gate,
                report,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CycleState::*;

    #[test]
    fn happy_paths_are_legal() {
        let mut t = CycleTracker::default();
        for s in [ConfigReady, Connected, TimeSynced, TransportReady, SensorReady, Acquiring, Gated, Publishing, Sleeping] {
            t.advance(s).unwrap();
        }
        assert_eq!(t.history().len(), 10);
        assert!(t.state().is_terminal());

        let mut t = CycleTracker::default();
        for s in [ConfigReady, Connected, TimeSynced, TransportReady, SensorReady, Acquiring, Gated, SleepDirect, Sleeping] {
            t.advance(s).unwrap();
        }
    }

    #[test]
    fn no_reentry_into_acquiring() {
        assert!(!Gated.can_transition_to(Acquiring));
        assert!(!Publishing.can_transition_to(Acquiring));
        assert!(!Sleeping.can_transition_to(Init));
        assert!(!SensorReady.can_transition_to(Gated));
    }

    #[test]
    fn failure_reachable_from_setup_and_measurement_only() {
        let failed = Failed(FailureCode::Network);
        for s in [Init, ConfigReady, Connected, TimeSynced, TransportReady, SensorReady, Acquiring, Gated] {
            assert!(s.can_transition_to(failed), "{s}");
        }
        for s in [Publishing, SleepDirect, Sleeping, failed] {
            assert!(!s.can_transition_to(failed), "{s}");
        }
    }

    #[test]
    fn illegal_transition_is_reported() {
        let mut t = CycleTracker::default();
        let err = t.advance(Acquiring).unwrap_err();
        assert_eq!(err, TransitionError { from: Init, to: Acquiring });
        assert_eq!(t.state(), Init);
        assert_eq!(err.to_string(), "illegal cycle transition Init -> Acquiring");
    }
}
