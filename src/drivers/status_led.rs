// Vibration Node: NeoPixel Status LED
//
// Single WS2812 pixel driven by the RMT peripheral.  All patterns block the
// calling thread.

use std::time::Duration;

use crate::config::{BLINK_OFF_MS, BLINK_ON_MS, FAILURE_CYCLE_MS, FAILURE_SIGNAL_MS};
use crate::error::FailureCode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl Rgb {
    pub const OFF: Rgb = Rgb::new(0, 0, 0);
    pub const GREEN: Rgb = Rgb::new(0, 255, 0);
    pub const RED: Rgb = Rgb::new(255, 0, 0);
    pub const YELLOW: Rgb = Rgb::new(255, 255, 0);

    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }
}

/// One blink pattern: `times` flashes of `color`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Blink {
    pub color: Rgb,
    pub times: u8,
    pub on: Duration,
    pub off: Duration,
}

impl Blink {
    pub const SUPPRESSED: Blink = Blink {
        color: Rgb::YELLOW,
        times: 3,
        on: Duration::from_millis(400),
        off: Duration::from_millis(400),
    };

    pub const PUBLISHING: Blink = Blink {
        color: Rgb::GREEN,
        times: 5,
        on: Duration::from_millis(350),
        off: Duration::from_millis(350),
    };

    pub const fn failure(code: FailureCode) -> Blink {
        Blink {
            color: Rgb::RED,
            times: code.blinks(),
            on: Duration::from_millis(BLINK_ON_MS),
            off: Duration::from_millis(BLINK_OFF_MS),
        }
    }
}

/// Number of blink bursts shown before the restart.
pub const fn failure_bursts() -> u64 {
    FAILURE_SIGNAL_MS / FAILURE_CYCLE_MS
}

/// 24-bit word in wire order (G, R, B), each channel scaled by `brightness`.
pub fn grb_word(color: Rgb, brightness: u8) -> u32 {
    let scale = |c: u8| (u32::from(c) * (u32::from(brightness) + 1)) >> 8;
    (scale(color.g) << 16) | (scale(color.r) << 8) | scale(color.b)
}

#[cfg(target_os = "espidf")]
pub use device::StatusLed;

#[cfg(target_os = "espidf")]
mod device {
    use std::thread;
    use std::time::{Duration, Instant};

    use esp_idf_hal::gpio::{AnyOutputPin, Output, OutputPin, PinDriver};
    use esp_idf_hal::peripheral::Peripheral;
    use esp_idf_hal::rmt::config::TransmitConfig;
    use esp_idf_hal::rmt::{FixedLengthSignal, PinState, Pulse, RmtChannel, TxRmtDriver};
    use esp_idf_sys::EspError;

    use super::*;
    use crate::config::LED_BRIGHTNESS;

    pub struct StatusLed {
        tx: TxRmtDriver<'static>,
        // held high for as long as the LED is in use
        _power: PinDriver<'static, AnyOutputPin, Output>,
        bits: [(Pulse, Pulse); 2],
    }

    impl StatusLed {
        pub fn new<C: RmtChannel>(
            channel: impl Peripheral<P = C> + 'static,
            data_pin: impl Peripheral<P = impl OutputPin> + 'static,
            power_pin: AnyOutputPin,
        ) -> anyhow::Result<Self> {
            let mut power = PinDriver::output(power_pin)?;
            power.set_high()?;

            let config = TransmitConfig::new().clock_divider(1);
            let tx = TxRmtDriver::new(channel, data_pin, &config)?;

            let ticks_hz = tx.counter_clock()?;
            let pulse = |state, ns| Pulse::new_with_duration(ticks_hz, state, &Duration::from_nanos(ns));
            let zero = (pulse(PinState::High, 350)?, pulse(PinState::Low, 800)?);
            let one = (pulse(PinState::High, 700)?, pulse(PinState::Low, 600)?);

            let mut led = Self {
                tx,
                _power: power,
                bits: [zero, one],
            };
            led.set(Rgb::OFF)?;
            Ok(led)
        }

        pub fn set(&mut self, color: Rgb) -> Result<(), EspError> {
            let word = grb_word(color, LED_BRIGHTNESS);
            let mut signal = FixedLengthSignal::<24>::new();
            for i in 0..24 {
                let bit = (word >> (23 - i)) & 1;
                signal.set(i, &self.bits[bit as usize])?;
            }
            self.tx.start_blocking(&signal)
        }

        pub fn blink(&mut self, pattern: Blink) -> Result<(), EspError> {
            for _ in 0..pattern.times {
                self.set(pattern.color)?;
                thread::sleep(pattern.on);
                self.set(Rgb::OFF)?;
                thread::sleep(pattern.off);
            }
            Ok(())
        }

        /// Red blink bursts, one every cycle, for the whole signal window.
        pub fn signal_failure(&mut self, code: FailureCode) {
            let cycle = Duration::from_millis(FAILURE_CYCLE_MS);
            for _ in 0..failure_bursts() {
                let started = Instant::now();
                if let Err(e) = self.blink(Blink::failure(code)) {
                    log::warn!("LED error: {}", e);
                }
                if let Some(rest) = cycle.checked_sub(started.elapsed()) {
                    thread::sleep(rest);
                }
            }
            let _ = self.set(Rgb::OFF);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_order_is_grb() {
        assert_eq!(grb_word(Rgb::new(0x12, 0x34, 0x56), 255), 0x34_12_56);
    }

    #[test]
    fn brightness_scales_every_channel() {
        assert_eq!(grb_word(Rgb::YELLOW, 40), 0x28_28_00);
        assert_eq!(grb_word(Rgb::GREEN, 0), 0);
    }

    #[test]
    fn failure_pattern_matches_the_code() {
        assert_eq!(Blink::failure(FailureCode::Broker).times, 3);
        assert_eq!(Blink::failure(FailureCode::Encoding).color, Rgb::RED);
        assert_eq!(failure_bursts(), 5);
    }
}
