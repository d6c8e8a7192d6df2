//! GAP subsystem configuration.
//!
//! All timers are single-shot and expressed in milliseconds; scan parameters are
//! in controller units of 0.625 ms.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Fast advertising period before falling back to the slow interval
pub const DEFAULT_FAST_ADV_TIMEOUT_MS: u64 = 30_000;
/// Maximum time spent in limited discoverable mode
pub const DEFAULT_LIMITED_DISC_TIMEOUT_MS: u64 = 180_000;
/// Periodic sync establishment timeout
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;
/// Remote name read timeout
pub const DEFAULT_REMOTE_NAME_TIMEOUT_MS: u64 = 30_000;
/// Inquiry database capacity
pub const DEFAULT_INQUIRY_DB_SIZE: usize = 40;
/// Periodic sync / transfer table size
pub const DEFAULT_MAX_SYNC_TRANSACTIONS: usize = 16;
/// Default observe scan interval and window (11.25 ms)
pub const DEFAULT_DISC_SCAN_INTERVAL: u16 = 0x12;
pub const DEFAULT_DISC_SCAN_WINDOW: u16 = 0x12;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),
    #[error("Failed to read configuration: {0}")]
    Io(String),
    #[error("Failed to parse configuration: {0}")]
    Parse(String),
}

/// Local privacy mode used when choosing the own address type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivacyMode {
    #[default]
    None,
    /// Host-based resolution only
    Privacy11,
    /// Controller-based resolution
    Privacy12,
    /// Controller-based resolution with host fallback
    Mixed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    pub fast_adv_timeout_ms: u64,
    pub limited_disc_timeout_ms: u64,
    pub sync_timeout_ms: u64,
    pub remote_name_timeout_ms: u64,
    pub inquiry_db_size: usize,
    pub max_sync_transactions: usize,
    pub privacy: PrivacyMode,
    /// Observe scan interval used when none was configured
    pub disc_scan_interval: u16,
    /// Observe scan window used when none was configured
    pub disc_scan_window: u16,
    /// Ask the controller to filter duplicate advertising reports
    pub filter_duplicates: bool,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            fast_adv_timeout_ms: DEFAULT_FAST_ADV_TIMEOUT_MS,
            limited_disc_timeout_ms: DEFAULT_LIMITED_DISC_TIMEOUT_MS,
            sync_timeout_ms: DEFAULT_SYNC_TIMEOUT_MS,
            remote_name_timeout_ms: DEFAULT_REMOTE_NAME_TIMEOUT_MS,
            inquiry_db_size: DEFAULT_INQUIRY_DB_SIZE,
            max_sync_transactions: DEFAULT_MAX_SYNC_TRANSACTIONS,
            privacy: PrivacyMode::None,
            disc_scan_interval: DEFAULT_DISC_SCAN_INTERVAL,
            disc_scan_window: DEFAULT_DISC_SCAN_WINDOW,
            filter_duplicates: false,
        }
    }
}

impl GapConfig {
    /// Load a JSON configuration file; missing fields take their defaults
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: GapConfig =
            serde_json::from_str(&raw).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_privacy(mut self, privacy: PrivacyMode) -> Self {
        self.privacy = privacy;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.inquiry_db_size == 0 {
            return Err(ConfigError::Invalid("inquiry_db_size must be > 0".to_string()));
        }
        if self.max_sync_transactions == 0 {
            return Err(ConfigError::Invalid(
                "max_sync_transactions must be > 0".to_string(),
            ));
        }
        if self.disc_scan_window > self.disc_scan_interval {
            return Err(ConfigError::Invalid(
                "Scan window must be <= scan interval".to_string(),
            ));
        }
        if self.disc_scan_interval < 0x0004 || self.disc_scan_window < 0x0004 {
            return Err(ConfigError::Invalid(
                "Scan interval and window must be >= 0x0004".to_string(),
            ));
        }
        for (name, value) in [
            ("fast_adv_timeout_ms", self.fast_adv_timeout_ms),
            ("limited_disc_timeout_ms", self.limited_disc_timeout_ms),
            ("sync_timeout_ms", self.sync_timeout_ms),
            ("remote_name_timeout_ms", self.remote_name_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{name} must be > 0")));
            }
        }
        Ok(())
    }

    pub fn fast_adv_timeout(&self) -> Duration {
        Duration::from_millis(self.fast_adv_timeout_ms)
    }

    pub fn limited_disc_timeout(&self) -> Duration {
        Duration::from_millis(self.limited_disc_timeout_ms)
    }

    pub fn sync_timeout(&self) -> Duration {
        Duration::from_millis(self.sync_timeout_ms)
    }

    pub fn remote_name_timeout(&self) -> Duration {
        Duration::from_millis(self.remote_name_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = GapConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.inquiry_db_size, 40);
        assert_eq!(config.max_sync_transactions, 16);
        assert_eq!(config.sync_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn test_window_larger_than_interval_rejected() {
        let config = GapConfig {
            disc_scan_interval: 0x10,
            disc_scan_window: 0x20,
            ..GapConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_timer_rejected() {
        let config = GapConfig {
            sync_timeout_ms: 0,
            ..GapConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: GapConfig =
            serde_json::from_str(r#"{"privacy": "mixed", "inquiry_db_size": 8}"#).expect("parse");
        assert_eq!(config.privacy, PrivacyMode::Mixed);
        assert_eq!(config.inquiry_db_size, 8);
        assert_eq!(config.fast_adv_timeout_ms, DEFAULT_FAST_ADV_TIMEOUT_MS);
    }
}
