// Vibration Node: MQTT over TLS
//
// QoS 0, never retained, one topic for everything.  The client runs its own
// task, so pumping is just giving it time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use esp_idf_svc::mqtt::client::{EspMqttClient, EventPayload, MqttClientConfiguration, QoS};
use esp_idf_svc::tls::X509;

use crate::clock::Timebase;
use crate::config::{MqttConfig, CONNECT_POLL_MS, MQTT_CONNECT_TIMEOUT_MS};
use crate::deadline::wait_until;
use crate::error::{FirmwareError, TransportStage};
use crate::publish::Transport;

fn mqtt_err(detail: impl std::fmt::Display) -> FirmwareError {
    FirmwareError::transport(TransportStage::Broker, detail)
}

pub struct MqttTransport {
    client: EspMqttClient<'static>,
    topic: String,
    connected: Arc<AtomicBool>,
}

/// Connect to `mqtts://host:port`, verifying the broker against `ca_pem`
/// (NUL-terminated, kept for the life of the program).
pub fn connect<T: Timebase + ?Sized>(
    time: &T,
    client_id: &str,
    mqtt: &MqttConfig,
    ca_pem: &'static [u8],
) -> Result<MqttTransport, FirmwareError> {
    let url = format!("mqtts://{}:{}", mqtt.host, mqtt.port);
    let conf = MqttClientConfiguration {
        client_id: Some(client_id),
        username: (!mqtt.username.is_empty()).then_some(mqtt.username.as_str()),
        password: (!mqtt.password.is_empty()).then_some(mqtt.password.as_str()),
        server_certificate: Some(X509::pem_until_nul(ca_pem)),
        ..Default::default()
    };

    let connected = Arc::new(AtomicBool::new(false));
    let flag = connected.clone();
    let client = EspMqttClient::new_cb(&url, &conf, move |event| match event.payload() {
        EventPayload::Connected(_) => flag.store(true, Ordering::SeqCst),
        EventPayload::Disconnected => flag.store(false, Ordering::SeqCst),
        EventPayload::Error(e) => log::warn!("MQTT: {:?}", e),
        _ => {}
    })
    .map_err(mqtt_err)?;
    log::info!("MQTT: connecting to {} as {}", url, client_id);

    let waited = wait_until(
        time,
        Duration::from_millis(MQTT_CONNECT_TIMEOUT_MS),
        Duration::from_millis(CONNECT_POLL_MS),
        || connected.load(Ordering::SeqCst),
    )
    .map_err(mqtt_err)?;
    log::info!("MQTT: connected after {:?}", waited);

    Ok(MqttTransport {
        client,
        topic: mqtt.topic.clone(),
        connected,
    })
}

impl Transport for MqttTransport {
    fn publish(&mut self, frame: &[u8]) -> bool {
        if !self.connected.load(Ordering::SeqCst) {
            log::warn!("MQTT: not connected, dropping {} bytes", frame.len());
            return false;
        }
        match self.client.publish(&self.topic, QoS::AtMostOnce, false, frame) {
            Ok(_) => true,
            Err(e) => {
                log::warn!("MQTT: publish to {} failed: {}", self.topic, e);
                false
            }
        }
    }

    fn pump(&mut self, window: Duration) {
        thread::sleep(window);
    }
}
