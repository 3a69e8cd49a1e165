// Vibration Node: Peripheral Drivers
//
// The accelerometer seam is shared with the host.  Register math and LED
// patterns build everywhere; the bus and RMT handles only exist on the
// device.

use thiserror::Error;

use crate::session::Acceleration;

pub mod lis331hh;
pub mod status_led;

/// Device not responding, or a bus transfer failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("sensor: {0}")]
pub struct SensorError(String);

impl SensorError {
    pub fn new(detail: impl Into<String>) -> Self {
        Self(detail.into())
    }
}

/// One calibrated 3-axis reading per call, in m/s^2.
pub trait Accelerometer {
    fn read(&mut self) -> Result<Acceleration, SensorError>;
}

impl<A: Accelerometer + ?Sized> Accelerometer for &mut A {
    fn read(&mut self) -> Result<Acceleration, SensorError> {
        (**self).read()
    }
}
