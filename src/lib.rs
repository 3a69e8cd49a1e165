// Vibration Node: Acquisition & Publish Pipeline
//
// One wake cycle: bring the link up, sample the LIS331HH at a fixed rate,
// gate on RMS magnitude, publish the waveform as CBOR frames over MQTT, then
// deep sleep.  Everything that touches ESP-IDF lives behind the
// `target_os = "espidf"` modules; the pipeline itself builds and tests on the
// host against the `sim` collaborators.

pub mod clock;
pub mod codec;
pub mod config;
pub mod deadline;
pub mod drivers;
pub mod error;
pub mod gate;
pub mod machine;
pub mod publish;
pub mod sampler;
pub mod session;
pub mod sim;

#[cfg(target_os = "espidf")]
pub mod net;
#[cfg(target_os = "espidf")]
pub mod platform;
#[cfg(target_os = "espidf")]
pub mod power;
#[cfg(target_os = "espidf")]
pub mod storage;

pub use error::{FailureCode, FirmwareError};
