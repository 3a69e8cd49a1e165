// Vibration Node: Hardware & System Configuration
// Target: Adafruit Feather ESP32-S3 + LIS331HH breakout (I2C)

use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

// ---------------------------------------------------------------------------
// GPIO Pin Definitions (Feather ESP32-S3 pinout)
// ---------------------------------------------------------------------------
pub const PIN_I2C_SDA: i32 = 3;
pub const PIN_I2C_SCL: i32 = 4;
pub const PIN_NEOPIXEL: i32 = 33;
pub const PIN_NEOPIXEL_POWER: i32 = 21; // must be driven HIGH for the pixel to light

// ---------------------------------------------------------------------------
// I2C Bus
// ---------------------------------------------------------------------------
pub const I2C_BAUDRATE_HZ: u32 = 400_000;
pub const I2C_TIMEOUT_TICKS: u32 = 1000; // FreeRTOS ticks

// ---------------------------------------------------------------------------
// Acquisition limits
// ---------------------------------------------------------------------------
pub const MIN_SAMPLES: u16 = 2;
pub const MAX_SAMPLES: u16 = 2000;
pub const MIN_FS_HZ: u16 = 50;
pub const MAX_FS_HZ: u16 = 2000;
pub const DEFAULT_POLL_GRANULARITY_US: u32 = 50;
pub const MAX_POLL_GRANULARITY_US: u32 = 1000;
pub const MAX_RMS_THRESHOLD: f64 = 50.0; // m/s^2, sanity ceiling

// ---------------------------------------------------------------------------
// Wire frames (bytes)
// ---------------------------------------------------------------------------
pub const META_CAPACITY: usize = 512;
pub const BLOB_CAPACITY: usize = 1400;
/// Upper bound on one blob payload.  Even, so a 16-bit sample never straddles
/// two parts.  Very long device ids shrink the usable room further, see
/// `codec::max_part_bytes`.
pub const MAX_BLOB_PART_BYTES: usize = 1280;

// ---------------------------------------------------------------------------
// Timing (milliseconds)
// ---------------------------------------------------------------------------
pub const WIFI_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const MQTT_CONNECT_TIMEOUT_MS: u64 = 20_000;
pub const CONNECT_POLL_MS: u64 = 250;
pub const PUBLISH_FLUSH_MS: u64 = 200;          // pump after every publish
pub const PUBLISH_GAP_MS: u64 = 3000;           // between consecutive blobs
pub const FINAL_FLUSH_MS: u64 = 3000;           // before sleep
pub const FAILURE_SIGNAL_MS: u64 = 15_000;      // red blink pattern, then restart
pub const FAILURE_CYCLE_MS: u64 = 3000;
pub const BLINK_ON_MS: u64 = 200;
pub const BLINK_OFF_MS: u64 = 200;

/// Wall clock is considered synchronised once it is past 2020-01-01.
pub const MIN_SYNCED_EPOCH_S: u64 = 1_577_836_800;

// ---------------------------------------------------------------------------
// Status LED
// ---------------------------------------------------------------------------
pub const LED_BRIGHTNESS: u8 = 40;

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------
pub const SPIFFS_BASE_PATH: &str = "/spiffs";
pub const CONFIG_FILE: &str = "/config.json";

// ---------------------------------------------------------------------------
// Runtime configuration defaults
// ---------------------------------------------------------------------------
const DEFAULT_CLIENT_ID: &str = "esp32s3-lis331-01";
const DEFAULT_MQTT_PORT: u16 = 8883;
const DEFAULT_MQTT_TOPIC: &str = "dimitri_esp32";
const DEFAULT_CA_PATH: &str = "/ca.pem";
const DEFAULT_I2C_ADDR: u8 = 0x18;
const DEFAULT_NTP_SERVERS: [&str; 3] = ["pool.ntp.org", "time.nist.gov", "time.google.com"];
const DEFAULT_NTP_TIMEOUT_S: u64 = 15;
const DEFAULT_SAMPLES: u16 = 500;
const DEFAULT_FS_HZ: u16 = 1000;
const DEFAULT_RMS_THRESHOLD: f64 = 10.78;
const DEFAULT_SLEEP_S: u64 = 300;

/// Problems that cannot be clamped away.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config.json parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("`{field}` is not a valid number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },
    #[error("config storage unavailable: {0}")]
    Storage(String),
}

// ---------------------------------------------------------------------------
// Raw (as stored) configuration: every field optional
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub device: RawDevice,
    pub wifi: RawWifi,
    pub mqtt: RawMqtt,
    pub tls: RawTls,
    pub sensor: RawSensor,
    pub ntp: RawNtp,
    pub acq: RawAcquisition,
    pub sleep: RawSleep,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDevice {
    pub client_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawWifi {
    pub ssid: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawMqtt {
    pub host: Option<String>,
    pub port: Option<u64>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub topic: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTls {
    pub ca_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSensor {
    pub i2c_addr: Option<NumberOrText>,
    pub range_g: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawNtp {
    pub server1: Option<String>,
    pub server2: Option<String>,
    pub server3: Option<String>,
    pub timeout_s: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawAcquisition {
    pub n_samples: Option<u64>,
    pub fs_hz: Option<u64>,
    pub mag_rms_threshold: Option<f64>,
    pub poll_us: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawSleep {
    pub seconds: Option<u64>,
}

/// The I2C address is accepted as `24` or `"0x18"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum NumberOrText {
    Number(u64),
    Text(String),
}

impl NumberOrText {
    fn parse(&self, field: &'static str) -> Result<u64, ConfigError> {
        match self {
            Self::Number(v) => Ok(*v),
            Self::Text(text) => {
                let t = text.trim();
                let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
                    Some(hex) => u64::from_str_radix(hex, 16),
                    None => t.parse::<u64>(),
                };
                parsed.map_err(|_| ConfigError::InvalidNumber {
                    field,
                    value: text.clone(),
                })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Validated configuration
// ---------------------------------------------------------------------------

/// LIS331HH full-scale range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccelRange {
    G6,
    G12,
    G24,
}

impl AccelRange {
    pub fn from_g(g: u64) -> Option<Self> {
        match g {
            6 => Some(Self::G6),
            12 => Some(Self::G12),
            24 => Some(Self::G24),
            _ => None,
        }
    }

    pub fn as_g(self) -> u8 {
        match self {
            Self::G6 => 6,
            Self::G12 => 12,
            Self::G24 => 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub topic: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionConfig {
    pub n_samples: u16,
    pub fs_hz: u16,
    /// m/s^2; `rms < threshold` suppresses the publish.
    pub rms_threshold: f64,
    pub poll_granularity: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub client_id: String,
    pub wifi_ssid: String,
    pub wifi_password: String,
    pub mqtt: MqttConfig,
    pub ca_path: String,
    pub i2c_addr: u8,
    pub range: AccelRange,
    pub ntp_servers: [String; 3],
    pub ntp_timeout: Duration,
    pub acquisition: AcquisitionConfig,
    pub sleep: Duration,
}

impl Config {
    /// Parse `config.json` contents and validate them.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_json::from_str(text)?;
        Self::from_raw(raw)
    }

    /// Single defaulting/validation pass: fills defaults, clamps out-of-range
    /// values (logging each clamp) and rejects missing required fields.
    pub fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let wifi_ssid = required(raw.wifi.ssid, "wifi.ssid")?;
        let mqtt_host = required(raw.mqtt.host, "mqtt.host")?;

        let port = clamp_u64("mqtt.port", raw.mqtt.port, DEFAULT_MQTT_PORT.into(), 1, 65_535);

        let i2c_addr = match raw.sensor.i2c_addr {
            Some(value) => clamp_u64("sensor.i2c_addr", Some(value.parse("sensor.i2c_addr")?), 0, 0, 0x7F),
            None => DEFAULT_I2C_ADDR.into(),
        };

        let range = match raw.sensor.range_g {
            None => AccelRange::G24,
            Some(g) => AccelRange::from_g(g).unwrap_or_else(|| {
                log::warn!("sensor.range_g={} not one of 6/12/24, using 24", g);
                AccelRange::G24
            }),
        };

        let ntp_timeout_s = clamp_u64("ntp.timeout_s", raw.ntp.timeout_s, DEFAULT_NTP_TIMEOUT_S, 3, 60);

        let n_samples = clamp_u64(
            "acq.n_samples",
            raw.acq.n_samples,
            DEFAULT_SAMPLES.into(),
            MIN_SAMPLES.into(),
            MAX_SAMPLES.into(),
        );
        let fs_hz = clamp_u64(
            "acq.fs_hz",
            raw.acq.fs_hz,
            DEFAULT_FS_HZ.into(),
            MIN_FS_HZ.into(),
            MAX_FS_HZ.into(),
        );
        let poll_us = clamp_u64(
            "acq.poll_us",
            raw.acq.poll_us,
            DEFAULT_POLL_GRANULARITY_US.into(),
            1,
            MAX_POLL_GRANULARITY_US.into(),
        );

        let mut rms_threshold = raw.acq.mag_rms_threshold.unwrap_or(DEFAULT_RMS_THRESHOLD);
        if !rms_threshold.is_finite() {
            log::warn!("acq.mag_rms_threshold is not finite, using {}", DEFAULT_RMS_THRESHOLD);
            rms_threshold = DEFAULT_RMS_THRESHOLD;
        } else if !(0.0..=MAX_RMS_THRESHOLD).contains(&rms_threshold) {
            let clamped = rms_threshold.clamp(0.0, MAX_RMS_THRESHOLD);
            log::warn!("acq.mag_rms_threshold={} clamped to {}", rms_threshold, clamped);
            rms_threshold = clamped;
        }

        let sleep_s = clamp_u64("sleep.seconds", raw.sleep.seconds, DEFAULT_SLEEP_S, 5, 86_400);

        Ok(Self {
            client_id: non_empty_or(raw.device.client_id, DEFAULT_CLIENT_ID),
            wifi_ssid,
            wifi_password: raw.wifi.password.unwrap_or_default(),
            mqtt: MqttConfig {
                host: mqtt_host,
                port: port as u16,
                username: raw.mqtt.username.unwrap_or_default(),
                password: raw.mqtt.password.unwrap_or_default(),
                topic: non_empty_or(raw.mqtt.topic, DEFAULT_MQTT_TOPIC),
            },
            ca_path: non_empty_or(raw.tls.ca_path, DEFAULT_CA_PATH),
            i2c_addr: i2c_addr as u8,
            range,
            ntp_servers: [
                non_empty_or(raw.ntp.server1, DEFAULT_NTP_SERVERS[0]),
                non_empty_or(raw.ntp.server2, DEFAULT_NTP_SERVERS[1]),
                non_empty_or(raw.ntp.server3, DEFAULT_NTP_SERVERS[2]),
            ],
            ntp_timeout: Duration::from_secs(ntp_timeout_s),
            acquisition: AcquisitionConfig {
                n_samples: n_samples as u16,
                fs_hz: fs_hz as u16,
                rms_threshold,
                poll_granularity: Duration::from_micros(poll_us),
            },
            sleep: Duration::from_secs(sleep_s),
        })
    }
}

fn required(value: Option<String>, field: &'static str) -> Result<String, ConfigError> {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(ConfigError::MissingField(field)),
    }
}

fn non_empty_or(value: Option<String>, default: &str) -> String {
    match value.map(|v| v.trim().to_string()) {
        Some(v) if !v.is_empty() => v,
        _ => default.to_string(),
    }
}

fn clamp_u64(field: &str, value: Option<u64>, default: u64, min: u64, max: u64) -> u64 {
    let Some(v) = value else {
        return default;
    };
    let clamped = v.clamp(min, max);
    if clamped != v {
        log::warn!("{}={} out of range [{}, {}], clamped to {}", field, v, min, max, clamped);
    }
    clamped
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"{"wifi":{"ssid":"lab"},"mqtt":{"host":"broker.local"}}"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = Config::from_json(MINIMAL).unwrap();
        assert_eq!(cfg.client_id, "esp32s3-lis331-01");
        assert_eq!(cfg.mqtt.port, 8883);
        assert_eq!(cfg.mqtt.topic, "dimitri_esp32");
        assert_eq!(cfg.ca_path, "/ca.pem");
        assert_eq!(cfg.i2c_addr, 0x18);
        assert_eq!(cfg.range, AccelRange::G24);
        assert_eq!(cfg.ntp_servers[0], "pool.ntp.org");
        assert_eq!(cfg.ntp_timeout, Duration::from_secs(15));
        assert_eq!(cfg.acquisition.n_samples, 500);
        assert_eq!(cfg.acquisition.fs_hz, 1000);
        assert!((cfg.acquisition.rms_threshold - 10.78).abs() < 1e-9);
        assert_eq!(cfg.acquisition.poll_granularity, Duration::from_micros(50));
        assert_eq!(cfg.sleep, Duration::from_secs(300));
    }

    #[test]
    fn missing_ssid_or_host_is_fatal() {
        let err = Config::from_json(r#"{"mqtt":{"host":"b"}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("wifi.ssid")));

        let err = Config::from_json(r#"{"wifi":{"ssid":"lab"},"mqtt":{"host":"  "}}"#).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField("mqtt.host")));
    }

    #[test]
    fn out_of_range_values_are_clamped() {
        let cfg = Config::from_json(
            r#"{
                "wifi": {"ssid": "lab"},
                "mqtt": {"host": "b", "port": 0},
                "sensor": {"i2c_addr": 300, "range_g": 8},
                "ntp": {"timeout_s": 1},
                "acq": {"n_samples": 9000, "fs_hz": 10, "mag_rms_threshold": 80.0, "poll_us": 0},
                "sleep": {"seconds": 1}
            }"#,
        )
        .unwrap();

        assert_eq!(cfg.mqtt.port, 1);
        assert_eq!(cfg.i2c_addr, 0x7F);
        assert_eq!(cfg.range, AccelRange::G24);
        assert_eq!(cfg.ntp_timeout, Duration::from_secs(3));
        assert_eq!(cfg.acquisition.n_samples, MAX_SAMPLES);
        assert_eq!(cfg.acquisition.fs_hz, MIN_FS_HZ);
        assert_eq!(cfg.acquisition.rms_threshold, MAX_RMS_THRESHOLD);
        assert_eq!(cfg.acquisition.poll_granularity, Duration::from_micros(1));
        assert_eq!(cfg.sleep, Duration::from_secs(5));
    }

    #[test]
    fn i2c_address_accepts_hex_text() {
        let cfg = Config::from_json(
            r#"{"wifi":{"ssid":"lab"},"mqtt":{"host":"b"},"sensor":{"i2c_addr":"0x19","range_g":12}}"#,
        )
        .unwrap();
        assert_eq!(cfg.i2c_addr, 0x19);
        assert_eq!(cfg.range, AccelRange::G12);

        let err = Config::from_json(
            r#"{"wifi":{"ssid":"lab"},"mqtt":{"host":"b"},"sensor":{"i2c_addr":"zz"}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { field: "sensor.i2c_addr", .. }));
    }

    #[test]
    fn malformed_json_is_a_parse_error() {
        assert!(matches!(Config::from_json("{"), Err(ConfigError::Parse(_))));
    }
}
