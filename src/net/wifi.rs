// Vibration Node: Wi-Fi Station

use std::net::Ipv4Addr;
use std::time::Duration;

use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::nvs::EspDefaultNvsPartition;
use esp_idf_svc::wifi::{AuthMethod, ClientConfiguration, Configuration, EspWifi};

use crate::clock::Timebase;
use crate::config::{CONNECT_POLL_MS, WIFI_CONNECT_TIMEOUT_MS};
use crate::deadline::retry_until;
use crate::error::{FirmwareError, TransportStage};

fn wifi_err(detail: impl std::fmt::Display) -> FirmwareError {
    FirmwareError::transport(TransportStage::Network, detail)
}

/// Associate with `ssid` and wait for DHCP.  Returns the driver (dropping it
/// takes the link down) and the station address.
pub fn connect<T: Timebase + ?Sized>(
    time: &T,
    modem: Modem,
    sysloop: EspSystemEventLoop,
    nvs: EspDefaultNvsPartition,
    ssid: &str,
    password: &str,
) -> Result<(EspWifi<'static>, Ipv4Addr), FirmwareError> {
    let mut wifi = EspWifi::new(modem, sysloop, Some(nvs)).map_err(wifi_err)?;

    let auth_method = if password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: ssid.try_into().map_err(|_| wifi_err("ssid longer than 32 bytes"))?,
        password: password
            .try_into()
            .map_err(|_| wifi_err("password longer than 64 bytes"))?,
        auth_method,
        ..Default::default()
    }))
    .map_err(wifi_err)?;

    wifi.start().map_err(wifi_err)?;
    wifi.connect().map_err(wifi_err)?;
    log::info!("Wi-Fi: joining \"{}\"", ssid);

    let waited = retry_until(
        time,
        Duration::from_millis(WIFI_CONNECT_TIMEOUT_MS),
        Duration::from_millis(CONNECT_POLL_MS),
        || wifi.is_up(),
    )
    .map_err(wifi_err)?;

    let ip = wifi.sta_netif().get_ip_info().map_err(wifi_err)?.ip;
    log::info!("Wi-Fi: up after {:?}, ip={}", waited, ip);
    Ok((wifi, ip))
}
