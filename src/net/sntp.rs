// Vibration Node: SNTP Time Sync

use std::time::Duration;

use esp_idf_svc::sntp::{EspSntp, SntpConf, SyncStatus};

use crate::clock::Timebase;
use crate::config::{CONNECT_POLL_MS, MIN_SYNCED_EPOCH_S};
use crate::deadline::wait_until;
use crate::error::{FirmwareError, TransportStage};

/// Start SNTP against `servers` and block until the wall clock is set.
/// The returned service must stay alive while the clock is in use.
pub fn sync<T: Timebase + ?Sized>(
    time: &T,
    servers: &[String],
    timeout: Duration,
) -> Result<EspSntp<'static>, FirmwareError> {
    let mut conf = SntpConf::default();
    // the IDF build may be configured with fewer server slots than we have names
    for (slot, server) in conf.servers.iter_mut().zip(servers) {
        *slot = server.as_str();
    }

    let sntp = EspSntp::new(&conf).map_err(|e| FirmwareError::transport(TransportStage::TimeSync, e))?;
    log::info!("SNTP: syncing via {}", servers.join(", "));

    let waited = wait_until(time, timeout, Duration::from_millis(CONNECT_POLL_MS), || {
        sntp.get_sync_status() == SyncStatus::Completed && time.epoch_us() / 1_000_000 >= MIN_SYNCED_EPOCH_S
    })
    .map_err(|e| FirmwareError::transport(TransportStage::TimeSync, e))?;

    log::info!("SNTP: synced after {:?}", waited);
    Ok(sntp)
}
