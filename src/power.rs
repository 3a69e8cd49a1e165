// Vibration Node: Sleep & Restart

use std::time::Duration;

/// Arm the RTC timer and enter deep sleep.  The next wake-up is a fresh boot.
pub fn deep_sleep(duration: Duration) -> ! {
    log::info!("Entering deep sleep for {:?}", duration);
    let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
    unsafe {
        esp_idf_sys::esp_sleep_enable_timer_wakeup(micros);
        esp_idf_sys::esp_deep_sleep_start();
    }
}

pub fn restart() -> ! {
    log::warn!("Restarting");
    unsafe { esp_idf_sys::esp_restart() }
}
