// Vibration Node: Firmware Entry Point
//
// Boot sequence (every wake-up is a fresh boot):
//   1. Status LED on, config and CA from SPIFFS.
//   2. Wi-Fi, SNTP, MQTT/TLS, LIS331HH.
//   3. Acquire N samples at fs, gate on RMS magnitude.
//   4. Publish meta + dt/x/y/z, or skip when quiet.
//   5. Deep sleep for `sleep.seconds`.
//
// Any failure blinks its code in red for 15 s, then restarts.
//
// Built for the host, the same cycle runs once against simulated hardware
// and prints the decoded messages.

#[cfg(target_os = "espidf")]
fn main() -> anyhow::Result<()> {
    use esp_idf_hal::gpio::OutputPin;
    use esp_idf_hal::prelude::*;
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;

    use vibration_node::config::{PIN_I2C_SCL, PIN_I2C_SDA, PIN_NEOPIXEL};
    use vibration_node::drivers::status_led::StatusLed;
    use vibration_node::machine::{Cycle, CycleEnd};
    use vibration_node::platform::{EspPlatform, I2cPins};
    use vibration_node::power;

    // Link esp-idf-sys runtime patches and initialise logging.
    esp_idf_svc::sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    log::info!("Vibration node starting…");

    // ---- Peripherals ------------------------------------------------------
    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let nvs = EspDefaultNvsPartition::take()?;

    let led = StatusLed::new(
        peripherals.rmt.channel0,
        peripherals.pins.gpio33,
        peripherals.pins.gpio21.downgrade_output(),
    )?;
    log::info!(
        "NeoPixel on GPIO{}, LIS331HH on SDA=GPIO{} SCL=GPIO{}",
        PIN_NEOPIXEL,
        PIN_I2C_SDA,
        PIN_I2C_SCL
    );

    let i2c = I2cPins {
        i2c: peripherals.i2c0,
        sda: peripherals.pins.gpio3,
        scl: peripherals.pins.gpio4,
    };
    let mut platform = EspPlatform::new(peripherals.modem, i2c, sysloop, nvs, led);

    // ---- One wake cycle ---------------------------------------------------
    let mut cycle = Cycle::default();
    let end = cycle.run(&mut platform);
    let mut led = platform.shutdown();

    match end {
        CycleEnd::Sleep { duration, summary } => {
            match &summary.report {
                Some(report) => log::info!(
                    "{}: published {}/{} message(s)",
                    summary.session_id,
                    report.published(),
                    report.attempted()
                ),
                None => log::info!("{}: quiet, nothing published", summary.session_id),
            }
            power::deep_sleep(duration)
        }
        CycleEnd::Fail { code, error } => {
            log::error!("Wake cycle failed: {} ({})", error, code);
            led.signal_failure(code);
            power::restart()
        }
    }
}

#[cfg(not(target_os = "espidf"))]
fn main() -> anyhow::Result<()> {
    use anyhow::Context;

    use vibration_node::codec::{unpack_i16_le, unpack_u16_le, BlobKind, Message};
    use vibration_node::machine::{Cycle, CycleEnd};
    use vibration_node::publish::PublishTiming;
    use vibration_node::session::Acceleration;
    use vibration_node::sim::SimPlatform;

    const DEMO_CONFIG: &str = r#"{
        "device": { "client_id": "sim-node-01" },
        "wifi":   { "ssid": "bench", "password": "bench-pass" },
        "mqtt":   { "host": "broker.local" },
        "acq":    { "n_samples": 200, "fs_hz": 1000 }
    }"#;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => std::fs::read_to_string(&path).with_context(|| format!("reading {}", path))?,
        None => DEMO_CONFIG.to_string(),
    };
    let peak: f32 = match args.next() {
        Some(text) => text.parse().with_context(|| format!("peak m/s^2: {:?}", text))?,
        None => 15.0,
    };

    // gravity on Z plus a 50 Hz rattle on X
    let pattern = (0..20)
        .map(|i| {
            let phase = i as f32 / 20.0 * std::f32::consts::TAU;
            Acceleration::new(peak * phase.sin(), 0.3, 9.80665)
        })
        .collect();
    let mut platform = SimPlatform::new(config).with_pattern(pattern);

    let end = Cycle::new(PublishTiming::default()).run(&mut platform);
    match end {
        CycleEnd::Sleep { duration, summary } => {
            log::info!(
                "{}: rms {:.3} m/s^2, would sleep {:?}",
                summary.session_id,
                summary.gate.rms,
                duration
            );
        }
        CycleEnd::Fail { code, error } => {
            log::error!("cycle failed: {} ({})", error, code);
            std::process::exit(i32::from(code.blinks()));
        }
    }

    for message in platform.decoded()? {
        match message {
            Message::Meta(meta) => println!(
                "meta  id={} dev={} ip={} ntp={} iso={} n={} fs={}",
                meta.id, meta.dev, meta.ip, meta.ntp as u8, meta.iso, meta.n, meta.fs
            ),
            Message::Blob(blob) if blob.kind == BlobKind::Dt => {
                let dt = unpack_u16_le(&blob.payload)?;
                let mean = dt.iter().map(|&d| u64::from(d)).sum::<u64>() as f64 / dt.len().max(1) as f64;
                println!("dt    part {}/{} {} intervals, mean {:.1} us", blob.idx + 1, blob.parts, dt.len(), mean);
            }
            Message::Blob(blob) => {
                let a = unpack_i16_le(&blob.payload)?;
                let (lo, hi) = a.iter().fold((i16::MAX, i16::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
                println!(
                    "{:<5} part {}/{} {} samples, {}..{} mg",
                    blob.kind.type_tag(),
                    blob.idx + 1,
                    blob.parts,
                    a.len(),
                    lo,
                    hi
                );
            }
        }
    }
    Ok(())
}
