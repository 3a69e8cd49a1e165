// Vibration Node: SPIFFS Storage
//
// Holds config.json and the broker CA certificate.  Mounted read-only in
// practice; nothing here ever writes.
//
// The partition must hold a SPIFFS image.  A LittleFS image does not mount
// and the cycle fails with the configuration code.

use std::fs;

use crate::config::{ConfigError, SPIFFS_BASE_PATH};

pub fn mount() -> Result<(), ConfigError> {
    let conf = esp_idf_sys::esp_vfs_spiffs_conf_t {
        base_path: c"/spiffs".as_ptr(),
        partition_label: std::ptr::null(),
        max_files: 4,
        format_if_mount_failed: false,
    };
    // SAFETY: `conf` only points at static strings and is copied by the VFS.
    esp_idf_sys::esp!(unsafe { esp_idf_sys::esp_vfs_spiffs_register(&conf) })
        .map_err(|e| ConfigError::Storage(format!("mount {}: {}", SPIFFS_BASE_PATH, e)))?;
    log::info!("SPIFFS mounted at {}", SPIFFS_BASE_PATH);
    Ok(())
}

fn path(name: &str) -> String {
    format!("{}/{}", SPIFFS_BASE_PATH, name.trim_start_matches('/'))
}

pub fn read_text(name: &str) -> Result<String, ConfigError> {
    let path = path(name);
    fs::read_to_string(&path).map_err(|e| ConfigError::Storage(format!("{}: {}", path, e)))
}

/// PEM bytes with a trailing NUL, leaked so the TLS stack can keep a
/// pointer to them for the rest of the run.
pub fn read_ca(name: &str) -> Result<&'static [u8], ConfigError> {
    let path = path(name);
    let mut pem = fs::read(&path).map_err(|e| ConfigError::Storage(format!("{}: {}", path, e)))?;
    if pem.is_empty() {
        return Err(ConfigError::Storage(format!("{}: empty", path)));
    }
    if pem.last() != Some(&0) {
        pem.push(0);
    }
    log::info!("CA loaded from {} ({} bytes)", path, pem.len() - 1);
    Ok(Box::leak(pem.into_boxed_slice()))
}
