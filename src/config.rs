//! Engine configuration.
//!
//! All values have working defaults; use the `with_*` methods to adjust them.

use std::collections::HashSet;
use std::time::Duration;

use crate::ble::adapter::ScanMode;
use crate::device::{DeviceFamily, ProximityThresholds};

/// Scan orchestrator settings.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanConfig {
    /// Sightings weaker than this (dBm) count as absent.
    pub rssi_floor: i16,
    /// Families of interest.
    pub families: HashSet<DeviceFamily>,
    /// How long a device stays ranged without a sighting in foreground mode.
    pub stale_timeout_foreground: Duration,
    /// How long a device stays ranged without a sighting in background mode.
    pub stale_timeout_background: Duration,
    /// How often the ranged set is checked for stale devices.
    pub sweep_interval: Duration,
    /// Background mode: how long the radio listens per cycle.
    pub background_listen_window: Duration,
    /// Background mode: how long the radio sleeps per cycle.
    pub background_sleep_window: Duration,
    /// Proximity bucket cutoffs.
    pub proximity: ProximityThresholds,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rssi_floor: -95,
            families: DeviceFamily::ALL.into_iter().collect(),
            stale_timeout_foreground: Duration::from_secs(10),
            stale_timeout_background: Duration::from_secs(45),
            sweep_interval: Duration::from_secs(1),
            background_listen_window: Duration::from_secs(5),
            background_sleep_window: Duration::from_secs(25),
            proximity: ProximityThresholds::default(),
        }
    }
}

impl ScanConfig {
    /// Staleness window for a scanning mode.
    pub fn stale_timeout(&self, mode: ScanMode) -> Duration {
        match mode {
            ScanMode::Foreground => self.stale_timeout_foreground,
            ScanMode::Background => self.stale_timeout_background,
        }
    }
}

/// Command queue settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CommandConfig {
    /// Time allowed to establish a link.
    pub connection_timeout: Duration,
    /// Time allowed for each GATT operation.
    pub operation_timeout: Duration,
    /// How long an idle link is kept before disconnecting.
    pub idle_disconnect: Duration,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(3),
            idle_disconnect: Duration::from_secs(5),
        }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EngineConfig {
    /// Scan orchestrator settings.
    pub scan: ScanConfig,
    /// Command queue settings.
    pub command: CommandConfig,
}

impl EngineConfig {
    /// Set the signal strength floor.
    pub fn with_rssi_floor(mut self, rssi_floor: i16) -> Self {
        self.scan.rssi_floor = rssi_floor;
        self
    }

    /// Set the families of interest.
    pub fn with_families(mut self, families: impl IntoIterator<Item = DeviceFamily>) -> Self {
        self.scan.families = families.into_iter().collect();
        self
    }

    /// Set the foreground and background staleness windows.
    pub fn with_stale_timeouts(mut self, foreground: Duration, background: Duration) -> Self {
        self.scan.stale_timeout_foreground = foreground;
        self.scan.stale_timeout_background = background;
        self
    }

    /// Set the background duty cycle.
    pub fn with_background_duty_cycle(mut self, listen: Duration, sleep: Duration) -> Self {
        self.scan.background_listen_window = listen;
        self.scan.background_sleep_window = sleep;
        self
    }

    /// Set the proximity cutoffs.
    pub fn with_proximity(mut self, thresholds: ProximityThresholds) -> Self {
        self.scan.proximity = thresholds;
        self
    }

    /// Set the connection timeout.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.command.connection_timeout = timeout;
        self
    }

    /// Set the per-operation timeout.
    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.command.operation_timeout = timeout;
        self
    }

    /// Set the idle-disconnect grace period.
    pub fn with_idle_disconnect(mut self, grace: Duration) -> Self {
        self.command.idle_disconnect = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.scan.rssi_floor, -95);
        assert_eq!(config.scan.families.len(), DeviceFamily::ALL.len());
        assert_eq!(config.command.connection_timeout, Duration::from_secs(5));
        assert_eq!(config.command.idle_disconnect, Duration::from_secs(5));
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::default()
            .with_rssi_floor(-80)
            .with_families([DeviceFamily::Xy4])
            .with_operation_timeout(Duration::from_secs(1));
        assert_eq!(config.scan.rssi_floor, -80);
        assert!(config.scan.families.contains(&DeviceFamily::Xy4));
        assert!(!config.scan.families.contains(&DeviceFamily::Xy3));
        assert_eq!(config.command.operation_timeout, Duration::from_secs(1));
    }

    #[test]
    fn test_stale_timeout_by_mode() {
        let config = ScanConfig::default();
        assert_eq!(
            config.stale_timeout(ScanMode::Foreground),
            Duration::from_secs(10)
        );
        assert_eq!(
            config.stale_timeout(ScanMode::Background),
            Duration::from_secs(45)
        );
    }
}
