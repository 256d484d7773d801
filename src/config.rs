//! Controller construction-time configuration.
//!
//! Mirrors the values a real NVMe controller's vendor would bake into
//! silicon: queue depth limits, the timeout unit, supported memory page
//! sizes, and the identify-time strings. Everything here is set once at
//! construction and is never mutated by command processing (it backs
//! `CAP`, which is read-only from the host).

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Default register-watcher tick interval, in milliseconds.
pub const DEFAULT_T_REG_MS: u64 = 10;
/// Default doorbell/command-watcher tick interval, in milliseconds.
pub const DEFAULT_T_DB_MS: u64 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Maximum queue entries supported (CAP.MQES, 0-based).
    pub max_queue_entries: u16,
    /// CAP.TO, in 500ms units.
    pub timeout_500ms_units: u8,
    /// CAP.DSTRD, doorbell stride.
    pub doorbell_stride: u8,
    /// CAP.MPSMIN/MPSMAX, as a power-of-two-page exponent offset from 12.
    pub mpsmin: u8,
    pub mpsmax: u8,
    /// Maximum number of namespaces reported by NN.
    pub max_namespaces: u32,
    /// Maximum number of I/O queue pairs the doorbell array is sized for,
    /// in addition to the admin pair.
    pub max_io_queues: u16,
    /// Size, in bytes, of the first (and only, by default) namespace's media.
    pub namespace_size_bytes: u64,
    pub model_number: String,
    pub serial_number: String,
    pub firmware_revision: String,
    pub register_watcher_interval_ms: u64,
    pub doorbell_watcher_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_queue_entries: 4095,
            timeout_500ms_units: 30,
            doorbell_stride: 0,
            mpsmin: 0,
            mpsmax: 4,
            max_namespaces: 1,
            max_io_queues: 15,
            namespace_size_bytes: 64 * 1024 * 1024,
            model_number: "cNVMe Model Number".to_string(),
            serial_number: "cNVMe Serial Number".to_string(),
            firmware_revision: "00000001".to_string(),
            register_watcher_interval_ms: DEFAULT_T_REG_MS,
            doorbell_watcher_interval_ms: DEFAULT_T_DB_MS,
        }
    }
}

impl ControllerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        let config = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let contents = serde_yaml::to_string(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_sane() {
        let cfg = ControllerConfig::default();
        assert!(cfg.max_queue_entries > 0);
        assert!(cfg.mpsmax >= cfg.mpsmin);
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = ControllerConfig::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cnvme.yaml");
        cfg.save(&path).unwrap();
        let loaded = ControllerConfig::load(&path).unwrap();
        assert_eq!(loaded.model_number, cfg.model_number);
        assert_eq!(loaded.namespace_size_bytes, cfg.namespace_size_bytes);
    }
}
