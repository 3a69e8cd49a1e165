// Vibration Node: ESP32 Platform
//
// Binds the wake cycle to real hardware: SPIFFS config, Wi-Fi, SNTP, MQTT,
// the LIS331HH on I2C0 and the NeoPixel.  Peripherals are handed out once;
// a cycle runs exactly once per boot.

use std::net::Ipv4Addr;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use esp_idf_hal::delay::Ets;
use esp_idf_hal::gpio::{Gpio3, Gpio4};
use esp_idf_hal::i2c::{I2cConfig, I2cDriver, I2C0};
use esp_idf_hal::modem::Modem;
use esp_idf_hal::prelude::*;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::sntp::EspSntp;
use esp_idf_svc::wifi::EspWifi;

use crate::clock::Timebase;
use crate::config::{Config, ConfigError, CONFIG_FILE, I2C_BAUDRATE_HZ};
use crate::drivers::lis331hh::Lis331hh;
use crate::drivers::status_led::{Blink, Rgb, StatusLed};
use crate::error::FirmwareError;
use crate::machine::{Indication, Platform};
use crate::net::mqtt::{self, MqttTransport};
use crate::net::{sntp, wifi};
use crate::storage;

// ---------------------------------------------------------------------------
// Timebase
// ---------------------------------------------------------------------------

/// Monotonic: esp_timer since boot.  Wall: the SNTP-disciplined system clock.
pub struct EspTimebase;

impl Timebase for EspTimebase {
    fn monotonic_us(&self) -> i64 {
        unsafe { esp_idf_sys::esp_timer_get_time() }
    }

    fn epoch_us(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }

    fn delay(&self, duration: Duration) {
        // sub-millisecond waits spin; FreeRTOS ticks are far too coarse
        if duration < Duration::from_millis(1) {
            Ets::delay_us(duration.as_micros() as u32);
        } else {
            thread::sleep(duration);
        }
    }
}

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

pub struct I2cPins {
    pub i2c: I2C0,
    pub sda: Gpio3,
    pub scl: Gpio4,
}

pub struct EspPlatform {
    time: EspTimebase,
    led: StatusLed,
    modem: Option<Modem>,
    sysloop: EspSystemEventLoop,
    nvs: Option<EspDefaultNvsPartition>,
    i2c: Option<I2cPins>,
    ca_pem: Option<&'static [u8]>,
    wifi: Option<EspWifi<'static>>,
    sntp: Option<EspSntp<'static>>,
}

impl EspPlatform {
    pub fn new(
        modem: Modem,
        i2c: I2cPins,
        sysloop: EspSystemEventLoop,
        nvs: EspDefaultNvsPartition,
        led: StatusLed,
    ) -> Self {
        Self {
            time: EspTimebase,
            led,
            modem: Some(modem),
            sysloop,
            nvs: Some(nvs),
            i2c: Some(i2c),
            ca_pem: None,
            wifi: None,
            sntp: None,
        }
    }

    /// Tear down SNTP and Wi-Fi, keeping only the LED for the final pattern.
    pub fn shutdown(mut self) -> StatusLed {
        drop(self.sntp.take());
        if let Some(mut wifi) = self.wifi.take() {
            if let Err(e) = wifi.disconnect() {
                log::debug!("Wi-Fi disconnect: {}", e);
            }
        }
        self.led
    }
}

fn taken(what: &str) -> FirmwareError {
    ConfigError::Storage(format!("{} already in use", what)).into()
}

impl Platform for EspPlatform {
    type Sensor = Lis331hh;
    type Transport = MqttTransport;
    type Time = EspTimebase;

    fn load_config(&mut self) -> Result<Config, FirmwareError> {
        storage::mount()?;
        let config = Config::from_json(&storage::read_text(CONFIG_FILE)?)?;
        self.ca_pem = Some(storage::read_ca(&config.ca_path)?);
        Ok(config)
    }

    fn connect_network(&mut self, config: &Config) -> Result<String, FirmwareError> {
        let modem = self.modem.take().ok_or_else(|| taken("modem"))?;
        let nvs = self.nvs.take().ok_or_else(|| taken("nvs"))?;
        let (wifi, ip): (_, Ipv4Addr) = wifi::connect(
            &self.time,
            modem,
            self.sysloop.clone(),
            nvs,
            &config.wifi_ssid,
            &config.wifi_password,
        )?;
        self.wifi = Some(wifi);
        Ok(ip.to_string())
    }

    fn sync_time(&mut self, config: &Config) -> Result<(), FirmwareError> {
        let sntp = sntp::sync(&self.time, &config.ntp_servers, config.ntp_timeout)?;
        self.sntp = Some(sntp);
        Ok(())
    }

    fn connect_transport(&mut self, config: &Config) -> Result<MqttTransport, FirmwareError> {
        let ca = self.ca_pem.ok_or_else(|| taken("CA"))?;
        mqtt::connect(&self.time, &config.client_id, &config.mqtt, ca)
    }

    fn init_sensor(&mut self, config: &Config) -> Result<Lis331hh, FirmwareError> {
        let pins = self.i2c.take().ok_or_else(|| taken("I2C0"))?;
        let i2c_config = I2cConfig::new().baudrate(I2C_BAUDRATE_HZ.Hz());
        let i2c = I2cDriver::new(pins.i2c, pins.sda, pins.scl, &i2c_config)
            .map_err(|e| crate::drivers::SensorError::new(format!("I2C0: {}", e)))?;
        Ok(Lis331hh::new(
            i2c,
            config.i2c_addr,
            config.range,
            config.acquisition.fs_hz,
        )?)
    }

    fn timebase(&self) -> &EspTimebase {
        &self.time
    }

    fn indicate(&mut self, indication: Indication) {
        let result = match indication {
            Indication::Working => self.led.set(Rgb::GREEN),
            Indication::Suppressed => self.led.blink(Blink::SUPPRESSED),
            Indication::Publishing => self.led.blink(Blink::PUBLISHING),
            Indication::Off => self.led.set(Rgb::OFF),
        };
        if let Err(e) = result {
            log::warn!("LED error: {}", e);
        }
    }
}
