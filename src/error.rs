// Vibration Node: Error Taxonomy
//
// Every variant is fatal to the current wake cycle.  Each maps to a distinct
// red blink count on the status LED before the device cold-restarts.

use std::fmt;

use thiserror::Error;

use crate::codec::EncodingError;
use crate::config::ConfigError;
use crate::drivers::SensorError;
use crate::machine::TransitionError;
use crate::sampler::AcquisitionError;

/// Which external collaborator failed to come up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStage {
    Network,
    TimeSync,
    Broker,
}

impl fmt::Display for TransportStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network => f.write_str("wifi"),
            Self::TimeSync => f.write_str("ntp"),
            Self::Broker => f.write_str("mqtt"),
        }
    }
}

#[derive(Debug, Error)]
pub enum FirmwareError {
    #[error("configuration: {0}")]
    Configuration(#[from] ConfigError),
    #[error("{stage} transport: {detail}")]
    Transport { stage: TransportStage, detail: String },
    #[error(transparent)]
    Sensor(#[from] SensorError),
    #[error("acquisition: {0}")]
    Acquisition(#[from] AcquisitionError),
    #[error("encoding: {0}")]
    Encoding(#[from] EncodingError),
    /// Cycle sequencing bug; reported with the acquisition code.
    #[error(transparent)]
    Sequence(#[from] TransitionError),
}

impl FirmwareError {
    pub fn transport(stage: TransportStage, detail: impl fmt::Display) -> Self {
        Self::Transport {
            stage,
            detail: detail.to_string(),
        }
    }

    pub fn failure_code(&self) -> FailureCode {
        match self {
            Self::Transport { stage: TransportStage::Network, .. } => FailureCode::Network,
            Self::Transport { stage: TransportStage::TimeSync, .. } => FailureCode::TimeSync,
            Self::Transport { stage: TransportStage::Broker, .. } => FailureCode::Broker,
            Self::Sensor(_) => FailureCode::Sensor,
            Self::Configuration(_) => FailureCode::Configuration,
            Self::Acquisition(_) | Self::Sequence(_) => FailureCode::Acquisition,
            Self::Encoding(_) => FailureCode::Encoding,
        }
    }
}

/// Externally visible failure signal: the number of red blinks per cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureCode {
    Network,
    TimeSync,
    Broker,
    Sensor,
    Configuration,
    Acquisition,
    Encoding,
}

impl FailureCode {
    pub const fn blinks(self) -> u8 {
        match self {
            Self::Network => 1,
            Self::TimeSync => 2,
            Self::Broker => 3,
            Self::Sensor => 4,
            Self::Configuration => 5,
            Self::Acquisition => 6,
            Self::Encoding => 7,
        }
    }
}

impl fmt::Display for FailureCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({} blinks)", self, self.blinks())
    }
}
