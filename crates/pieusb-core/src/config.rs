//! TOML configuration for a scan.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::device::{SupportedDevice, supported_devices};
use crate::engine::{EngineTiming, millis};
use crate::options::{CalibrationConfig, DiagnosticsConfig, ScanOptions, ScanSettings};
use crate::postprocess::PostprocessConfig;

/// Which scanner to open.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Restrict to this USB vendor id.
    pub vendor_id: Option<u16>,
    /// Restrict to this USB product id.
    pub product_id: Option<u16>,
    /// Scanners to accept besides the built-in list.
    pub extra: Vec<SupportedDevice>,
}

impl DeviceConfig {
    /// Supported devices, narrowed to the configured ids.
    pub fn candidates(&self) -> Vec<SupportedDevice> {
        supported_devices(&self.extra)
            .into_iter()
            .filter(|d| self.vendor_id.is_none_or(|v| v == d.vendor_id))
            .filter(|d| self.product_id.is_none_or(|p| p == d.product_id))
            .collect()
    }
}

/// Every delay the driver sleeps or waits for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    #[serde(with = "millis")]
    pub command_timeout: Duration,
    #[serde(with = "millis")]
    pub busy_retry: Duration,
    #[serde(with = "millis")]
    pub ieee_settle: Duration,
    /// Pause between readiness polls.
    #[serde(with = "millis")]
    pub ready_poll: Duration,
    /// Give up waiting for readiness after this long.
    #[serde(with = "millis")]
    pub ready_deadline: Duration,
    /// Pause when the lamp is still warming up at start.
    #[serde(with = "millis")]
    pub warm_up_delay: Duration,
    /// Pause between start attempts while the device warms up.
    #[serde(with = "millis")]
    pub start_retry: Duration,
    /// Pause after the last line was read.
    #[serde(with = "millis")]
    pub settle_delay: Duration,
}

impl Default for TimingConfig {
    fn default() -> Self {
        let engine = EngineTiming::default();
        Self {
            command_timeout: engine.command_timeout,
            busy_retry: engine.busy_retry,
            ieee_settle: engine.ieee_settle,
            ready_poll: Duration::from_secs(2),
            ready_deadline: Duration::from_secs(120),
            warm_up_delay: Duration::from_secs(5),
            start_retry: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
        }
    }
}

impl TimingConfig {
    /// No delays; waits give up after half a second.
    pub fn immediate() -> Self {
        let engine = EngineTiming::immediate();
        Self {
            command_timeout: engine.command_timeout,
            busy_retry: engine.busy_retry,
            ieee_settle: engine.ieee_settle,
            ready_poll: Duration::ZERO,
            ready_deadline: Duration::from_millis(500),
            warm_up_delay: Duration::ZERO,
            start_retry: Duration::ZERO,
            settle_delay: Duration::ZERO,
        }
    }

    pub fn engine(&self) -> EngineTiming {
        EngineTiming {
            command_timeout: self.command_timeout,
            busy_retry: self.busy_retry,
            ieee_settle: self.ieee_settle,
        }
    }
}

/// Complete scan configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub device: DeviceConfig,
    pub scan: ScanSettings,
    pub calibration: CalibrationConfig,
    pub postprocess: PostprocessConfig,
    pub timing: TimingConfig,
    pub diagnostics: DiagnosticsConfig,
}

impl ScanConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ScanConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// The option store for a session.
    pub fn options(&self) -> ScanOptions {
        ScanOptions {
            scan: self.scan.clone(),
            calibration: self.calibration,
            postprocess: self.postprocess.clone(),
            diagnostics: self.diagnostics.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::{CalibrationMode, GainAdjust};
    use crate::options::ScanMode;
    use crate::postprocess::CropMode;
    use crate::protocol::constants::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("scan.toml");

        let mut config = ScanConfig::default();
        config.scan.mode = ScanMode::Rgbi;
        config.scan.resolution = 3600;
        config.calibration.mode = CalibrationMode::Options;
        config.calibration.gain_adjust = GainAdjust::X24;
        config.calibration.manual.gain = [10, 20, 30, 40];
        config.postprocess.clean_image = true;
        config.postprocess.crop = CropMode::Outside;
        config.postprocess.seed = Some(7);
        config.timing.ready_poll = Duration::from_millis(250);
        config.diagnostics.dump_dir = Some(dir.path().to_path_buf());
        config.save_to_file(&path).unwrap();

        let loaded = ScanConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: ScanConfig = toml::from_str(
            r#"
            [scan]
            mode = "gray"
            bit_depth = 16

            [calibration]
            gain_adjust = "1.2"

            [timing]
            ready_deadline = 1000
            "#,
        )
        .unwrap();
        assert_eq!(config.scan.mode, ScanMode::Gray);
        assert_eq!(config.scan.bit_depth, 16);
        assert_eq!(config.scan.threshold, 50.0);
        assert_eq!(config.calibration.gain_adjust, GainAdjust::X12);
        assert_eq!(config.calibration.mode, CalibrationMode::Default);
        assert_eq!(config.timing.ready_deadline, Duration::from_secs(1));
        assert_eq!(config.timing.ready_poll, Duration::from_secs(2));
        assert!(config.postprocess.correct_shading);
    }

    #[test]
    fn test_device_candidates() {
        let mut device = DeviceConfig::default();
        assert_eq!(device.candidates().len(), 3);

        device.product_id = Some(PRODUCT_ID_6000);
        let candidates = device.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].model, MODEL_REFLECTA_6000);
    }

    #[test]
    fn test_missing_file_is_error() {
        let dir = tempdir().unwrap();
        assert!(ScanConfig::load_from_file(dir.path().join("absent.toml")).is_err());
    }
}
