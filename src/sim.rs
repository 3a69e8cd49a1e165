// Vibration Node: Host Simulation
//
// Simulated collaborators for running whole wake cycles off-device: a
// virtual clock that only moves when something waits or works, a scripted
// accelerometer, and a transport that records every frame.  Used by the
// host binary and the integration tests.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use crate::clock::Timebase;
use crate::codec::{self, DecodeError, Message};
use crate::config::Config;
use crate::drivers::{Accelerometer, SensorError};
use crate::error::{FirmwareError, TransportStage};
use crate::machine::{Indication, Platform};
use crate::publish::Transport;
use crate::session::Acceleration;

/// 2024-01-01T00:00:00Z
pub const DEFAULT_EPOCH_US: u64 = 1_704_067_200_000_000;

const NETWORK_JOIN: Duration = Duration::from_millis(1200);
const TIME_SYNC: Duration = Duration::from_millis(300);
const BROKER_HANDSHAKE: Duration = Duration::from_millis(800);

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Virtual time.  `delay` advances it instantly; the wall clock can run
/// fast or slow relative to the monotonic one by `skew_ppm`.
#[derive(Debug)]
pub struct SimTime {
    now_us: Cell<i64>,
    epoch_base_us: u64,
    skew_ppm: i64,
}

impl SimTime {
    pub fn new(epoch_base_us: u64) -> Self {
        Self {
            now_us: Cell::new(0),
            epoch_base_us,
            skew_ppm: 0,
        }
    }

    pub fn with_skew_ppm(mut self, skew_ppm: i64) -> Self {
        self.skew_ppm = skew_ppm;
        self
    }

    pub fn advance(&self, by: Duration) {
        let us = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.now_us.set(self.now_us.get().saturating_add(us));
    }
}

impl Default for SimTime {
    fn default() -> Self {
        Self::new(DEFAULT_EPOCH_US)
    }
}

impl Timebase for SimTime {
    fn monotonic_us(&self) -> i64 {
        self.now_us.get()
    }

    fn epoch_us(&self) -> u64 {
        let now = self.now_us.get();
        let skewed = now + now * self.skew_ppm / 1_000_000;
        self.epoch_base_us.saturating_add_signed(skewed)
    }

    fn delay(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ---------------------------------------------------------------------------
// Accelerometer
// ---------------------------------------------------------------------------

/// Replays `pattern` cyclically.  Each read costs `read_cost` of virtual
/// time, like an I2C transfer would.
pub struct SimAccelerometer {
    time: Rc<SimTime>,
    pattern: Vec<Acceleration>,
    read_cost: Duration,
    reads: usize,
    fail_at: Option<usize>,
}

impl SimAccelerometer {
    pub fn new(time: Rc<SimTime>, pattern: Vec<Acceleration>, read_cost: Duration) -> Self {
        Self {
            time,
            pattern,
            read_cost,
            reads: 0,
            fail_at: None,
        }
    }

    /// The read with this 0-based index returns an error.
    pub fn failing_at(mut self, read: usize) -> Self {
        self.fail_at = Some(read);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads
    }
}

impl Accelerometer for SimAccelerometer {
    fn read(&mut self) -> Result<Acceleration, SensorError> {
        self.time.advance(self.read_cost);
        if self.fail_at == Some(self.reads) {
            return Err(SensorError::new(format!("read {} not acknowledged", self.reads)));
        }
        let sample = match self.pattern.len() {
            0 => Acceleration::default(),
            len => self.pattern[self.reads % len],
        };
        self.reads += 1;
        Ok(sample)
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

pub type FrameLog = Rc<RefCell<Vec<Vec<u8>>>>;

/// Appends every published frame to a shared log.  Frames whose index is in
/// `refuse` are logged but reported as not published.
pub struct RecordingTransport {
    time: Rc<SimTime>,
    log: FrameLog,
    refuse: Vec<usize>,
}

impl RecordingTransport {
    pub fn new(time: Rc<SimTime>, log: FrameLog) -> Self {
        Self {
            time,
            log,
            refuse: Vec::new(),
        }
    }

    pub fn refusing(mut self, indexes: impl IntoIterator<Item = usize>) -> Self {
        self.refuse.extend(indexes);
        self
    }
}

impl Transport for RecordingTransport {
    fn publish(&mut self, frame: &[u8]) -> bool {
        let mut log = self.log.borrow_mut();
        let index = log.len();
        log.push(frame.to_vec());
        !self.refuse.contains(&index)
    }

    fn pump(&mut self, window: Duration) {
        self.time.advance(window);
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

/// Setup step to break.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimFailure {
    Network,
    TimeSync,
    Broker,
    SensorInit,
    /// The n-th sensor read (0-based) fails mid-acquisition.
    SensorRead(usize),
}

pub struct SimPlatform {
    config_json: String,
    time: Rc<SimTime>,
    pattern: Vec<Acceleration>,
    read_cost: Duration,
    failure: Option<SimFailure>,
    refuse: Vec<usize>,
    sent: FrameLog,
    indications: Vec<Indication>,
}

impl SimPlatform {
    pub fn new(config_json: impl Into<String>) -> Self {
        Self {
            config_json: config_json.into(),
            time: Rc::new(SimTime::default()),
            pattern: vec![Acceleration::new(0.0, 0.0, 9.80665)],
            read_cost: Duration::from_micros(120),
            failure: None,
            refuse: Vec::new(),
            sent: FrameLog::default(),
            indications: Vec::new(),
        }
    }

    pub fn with_time(mut self, time: SimTime) -> Self {
        self.time = Rc::new(time);
        self
    }

    /// Constant acceleration in m/s^2.
    pub fn with_motion(self, sample: Acceleration) -> Self {
        self.with_pattern(vec![sample])
    }

    pub fn with_pattern(mut self, pattern: Vec<Acceleration>) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn with_read_cost(mut self, read_cost: Duration) -> Self {
        self.read_cost = read_cost;
        self
    }

    pub fn failing(mut self, failure: SimFailure) -> Self {
        self.failure = Some(failure);
        self
    }

    /// Publishes with these 0-based indexes are refused by the transport.
    pub fn refusing(mut self, indexes: impl IntoIterator<Item = usize>) -> Self {
        self.refuse.extend(indexes);
        self
    }

    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.borrow().clone()
    }

    pub fn decoded(&self) -> Result<Vec<Message>, DecodeError> {
        self.sent.borrow().iter().map(|frame| codec::decode(frame)).collect()
    }

    pub fn indications(&self) -> &[Indication] {
        &self.indications
    }

    fn fails(&self, failure: SimFailure) -> bool {
        self.failure == Some(failure)
    }
}

impl Platform for SimPlatform {
    type Sensor = SimAccelerometer;
    type Transport = RecordingTransport;
    type Time = SimTime;

    fn load_config(&mut self) -> Result<Config, FirmwareError> {
        Ok(Config::from_json(&self.config_json)?)
    }

    fn connect_network(&mut self, _config: &Config) -> Result<String, FirmwareError> {
        if self.fails(SimFailure::Network) {
            self.time.advance(Duration::from_millis(crate::config::WIFI_CONNECT_TIMEOUT_MS));
            return Err(FirmwareError::transport(TransportStage::Network, "association timed out"));
        }
        self.time.advance(NETWORK_JOIN);
        Ok("192.168.4.23".to_string())
    }

    fn sync_time(&mut self, config: &Config) -> Result<(), FirmwareError> {
        if self.fails(SimFailure::TimeSync) {
            self.time.advance(config.ntp_timeout);
            return Err(FirmwareError::transport(
                TransportStage::TimeSync,
                format!("no reply from {} within {:?}", config.ntp_servers[0], config.ntp_timeout),
            ));
        }
        self.time.advance(TIME_SYNC);
        Ok(())
    }

    fn connect_transport(&mut self, config: &Config) -> Result<RecordingTransport, FirmwareError> {
        if self.fails(SimFailure::Broker) {
            return Err(FirmwareError::transport(
                TransportStage::Broker,
                format!("{}:{} refused the TLS handshake", config.mqtt.host, config.mqtt.port),
            ));
        }
        self.time.advance(BROKER_HANDSHAKE);
        Ok(RecordingTransport::new(self.time.clone(), self.sent.clone()).refusing(self.refuse.iter().copied()))
    }

    fn init_sensor(&mut self, config: &Config) -> Result<SimAccelerometer, FirmwareError> {
        if self.fails(SimFailure::SensorInit) {
            return Err(SensorError::new(format!("no device at 0x{:02X}", config.i2c_addr)).into());
        }
        let sensor = SimAccelerometer::new(self.time.clone(), self.pattern.clone(), self.read_cost);
        Ok(match self.failure {
            Some(SimFailure::SensorRead(read)) => sensor.failing_at(read),
            _ => sensor,
        })
    }

    fn timebase(&self) -> &SimTime {
        &self.time
    }

    fn indicate(&mut self, indication: Indication) {
        self.indications.push(indication);
    }
}
