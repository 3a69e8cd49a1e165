// Vibration Node: LIS331HH Accelerometer Driver
//
// Register-level driver over I2C.  The register arithmetic is plain Rust and
// builds everywhere; only the bus handle is device-specific.
//
// Output is 12-bit, left-justified in a little-endian i16 per axis.

use crate::config::AccelRange;
use crate::session::{Acceleration, STANDARD_GRAVITY};

/// CTRL_REG1: normal power mode, X/Y/Z enabled.  Data rate goes in DR[4:3].
const CTRL1_NORMAL_XYZ: u8 = 0b0010_0111;
/// CTRL_REG4: block data update.  Full scale goes in FS[5:4].
const CTRL4_BDU: u8 = 0b1000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataRate {
    Hz50,
    Hz100,
    Hz400,
    Hz1000,
}

impl DataRate {
    /// Fastest output rate not above what the sampler asks for, floor 50 Hz.
    pub fn for_sample_rate(fs_hz: u16) -> Self {
        match fs_hz {
            1000.. => Self::Hz1000,
            400..=999 => Self::Hz400,
            100..=399 => Self::Hz100,
            _ => Self::Hz50,
        }
    }

    const fn dr_bits(self) -> u8 {
        match self {
            Self::Hz50 => 0b00,
            Self::Hz100 => 0b01,
            Self::Hz400 => 0b10,
            Self::Hz1000 => 0b11,
        }
    }

    pub const fn hz(self) -> u16 {
        match self {
            Self::Hz50 => 50,
            Self::Hz100 => 100,
            Self::Hz400 => 400,
            Self::Hz1000 => 1000,
        }
    }
}

pub fn ctrl_reg1(rate: DataRate) -> u8 {
    CTRL1_NORMAL_XYZ | (rate.dr_bits() << 3)
}

pub fn ctrl_reg4(range: AccelRange) -> u8 {
    let fs = match range {
        AccelRange::G6 => 0b00,
        AccelRange::G12 => 0b01,
        AccelRange::G24 => 0b11,
    };
    CTRL4_BDU | (fs << 4)
}

/// Sensitivity in mg per 12-bit digit.
pub fn mg_per_digit(range: AccelRange) -> f32 {
    match range {
        AccelRange::G6 => 3.0,
        AccelRange::G12 => 6.0,
        AccelRange::G24 => 12.0,
    }
}

/// Six output bytes (X_L, X_H, Y_L, Y_H, Z_L, Z_H) to m/s^2.
pub fn convert(raw: &[u8; 6], range: AccelRange) -> Acceleration {
    let scale = mg_per_digit(range) / 1000.0 * STANDARD_GRAVITY as f32;
    let axis = |lo: u8, hi: u8| f32::from(i16::from_le_bytes([lo, hi]) >> 4) * scale;
    Acceleration::new(axis(raw[0], raw[1]), axis(raw[2], raw[3]), axis(raw[4], raw[5]))
}

#[cfg(target_os = "espidf")]
pub use device::Lis331hh;

#[cfg(target_os = "espidf")]
mod device {
    use esp_idf_hal::i2c::I2cDriver;

    use super::*;
    use crate::config::I2C_TIMEOUT_TICKS;
    use crate::drivers::{Accelerometer, SensorError};

    const REG_WHO_AM_I: u8 = 0x0F;
    const REG_CTRL_REG1: u8 = 0x20;
    const REG_CTRL_REG4: u8 = 0x23;
    const REG_OUT_X_L: u8 = 0x28;
    const WHO_AM_I_EXPECTED: u8 = 0x32;

    /// Sub-address MSB: auto-increment across the six output registers.
    const AUTO_INCREMENT: u8 = 0x80;

    pub struct Lis331hh {
        i2c: I2cDriver<'static>,
        addr: u8,
        range: AccelRange,
    }

    impl Lis331hh {
        /// Probe WHO_AM_I, then set data rate and full scale.
        pub fn new(i2c: I2cDriver<'static>, addr: u8, range: AccelRange, fs_hz: u16) -> Result<Self, SensorError> {
            let mut dev = Self { i2c, addr, range };

            let mut id = [0u8; 1];
            dev.i2c
                .write_read(addr, &[REG_WHO_AM_I], &mut id, I2C_TIMEOUT_TICKS)
                .map_err(|e| SensorError::new(format!("no ack at 0x{:02X}: {}", addr, e)))?;
            if id[0] != WHO_AM_I_EXPECTED {
                return Err(SensorError::new(format!(
                    "WHO_AM_I=0x{:02X} at 0x{:02X}, expected 0x{:02X}",
                    id[0], addr, WHO_AM_I_EXPECTED
                )));
            }

            let rate = DataRate::for_sample_rate(fs_hz);
            dev.write_reg(REG_CTRL_REG1, ctrl_reg1(rate))?;
            dev.write_reg(REG_CTRL_REG4, ctrl_reg4(range))?;

            log::info!("LIS331HH at 0x{:02X}: ±{} g, ODR {} Hz", addr, range.as_g(), rate.hz());
            Ok(dev)
        }

        fn write_reg(&mut self, reg: u8, value: u8) -> Result<(), SensorError> {
            self.i2c
                .write(self.addr, &[reg, value], I2C_TIMEOUT_TICKS)
                .map_err(|e| SensorError::new(format!("write 0x{:02X}: {}", reg, e)))
        }
    }

    impl Accelerometer for Lis331hh {
        fn read(&mut self) -> Result<Acceleration, SensorError> {
            let mut raw = [0u8; 6];
            self.i2c
                .write_read(self.addr, &[REG_OUT_X_L | AUTO_INCREMENT], &mut raw, I2C_TIMEOUT_TICKS)
                .map_err(|e| SensorError::new(format!("burst read: {}", e)))?;
            Ok(convert(&raw, self.range))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_rate_never_exceeds_request() {
        assert_eq!(DataRate::for_sample_rate(50), DataRate::Hz50);
        assert_eq!(DataRate::for_sample_rate(99), DataRate::Hz50);
        assert_eq!(DataRate::for_sample_rate(100), DataRate::Hz100);
        assert_eq!(DataRate::for_sample_rate(500), DataRate::Hz400);
        assert_eq!(DataRate::for_sample_rate(2000), DataRate::Hz1000);
    }

    #[test]
    fn control_register_values() {
        assert_eq!(ctrl_reg1(DataRate::Hz50), 0x27);
        assert_eq!(ctrl_reg1(DataRate::Hz1000), 0x3F);
        assert_eq!(ctrl_reg4(AccelRange::G6), 0x80);
        assert_eq!(ctrl_reg4(AccelRange::G12), 0x90);
        assert_eq!(ctrl_reg4(AccelRange::G24), 0xB0);
    }

    #[test]
    fn conversion_drops_the_low_nibble_and_scales() {
        // +1000 digits on Z at ±6 g = 3000 mg; -1 digit on X
        let z = (1000i16 << 4).to_le_bytes();
        let x = (-1i16 << 4).to_le_bytes();
        let raw = [x[0], x[1], 0x0F, 0x00, z[0], z[1]];
        let a = convert(&raw, AccelRange::G6);
        assert!((a.z - 3.0 * 9.80665).abs() < 1e-3);
        assert!((a.x + 0.003 * 9.80665).abs() < 1e-5);
        assert_eq!(a.y, 0.0);
    }
}
