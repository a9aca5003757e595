//! Gain, offset and exposure handling: the analog gain table, calibration
//! sources and the statistics kept from a preview scan.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::buffer::{Color, SampleBuffer};
use crate::ir::{IrError, NormHistogram, PlaneGeometry};
use crate::protocol::constants::{
    DEFAULT_DOUBLE_TIMES, DEFAULT_EXPOSURE, DEFAULT_EXTRA_ENTRIES, DEFAULT_GAIN, DEFAULT_LIGHT,
    DEFAULT_OFFSET, PASS_B, PASS_COLOR, PASS_G, PASS_IR, PASS_R, PASS_RGBI,
};
use crate::protocol::records::Settings;

/// Amplification at gain settings 0, 5, 10, ... 60.
pub const GAIN_TABLE: [f64; 13] = [
    1.000, 1.075, 1.154, 1.251, 1.362, 1.491, 1.653, 1.858, 2.115, 2.458, 2.935, 3.638, 4.627,
];

pub const GAIN_SETTING_MAX: u8 = 63;

/// Cap on the gain increase derived from a preview.
const PREVIEW_MAX_GAIN_INCREASE: f64 = 3.0;

/// Amplification of a gain setting, interpolated from [`GAIN_TABLE`].
pub fn gain(setting: u8) -> f64 {
    let s = setting as usize;
    let t = &GAIN_TABLE;
    if s >= 60 {
        return (s as f64 - 55.0) * (t[12] - t[11]) / 5.0 + t[11];
    }
    let k = s / 5;
    (s - 5 * k) as f64 * (t[k + 1] - t[k]) / 5.0 + t[k]
}

/// Gain setting closest to an amplification; inverse of [`gain`].
pub fn gain_setting(amplification: f64) -> u8 {
    let t = &GAIN_TABLE;
    if amplification < 1.0 {
        return 0;
    }
    if amplification >= t[12] {
        let m = 60.0 + ((amplification - t[12]) / (t[12] - t[11]) * 5.0).round();
        return m.min(GAIN_SETTING_MAX as f64) as u8;
    }
    (0..12)
        .find(|&k| t[k] <= amplification && amplification < t[k + 1])
        .map_or(0, |k| {
            5 * k as u8 + ((amplification - t[k]) / (t[k + 1] - t[k]) * 5.0).round() as u8
        })
}

/// Raise the signal of `channel` by `increase`, splitting it between gain
/// (by the square root) and exposure time (by the remainder).
pub fn update_gain(settings: &mut Settings, channel: usize, increase: f64) {
    let g = gain(settings.gain[channel]);
    settings.gain[channel] = gain_setting(g * increase.sqrt());
    let exposure =
        (g / gain(settings.gain[channel]) * increase * settings.exposure_time[channel] as f64).round();
    settings.exposure_time[channel] = exposure.clamp(0.0, u16::MAX as f64) as u16;
    debug!(
        channel,
        increase,
        gain = settings.gain[channel],
        exposure = settings.exposure_time[channel],
        "Gain updated"
    );
}

/// Channels affected by gain adjustment for a pass selection.
pub fn adjusted_channels(passes: u8) -> &'static [usize] {
    match passes {
        PASS_RGBI | PASS_COLOR => &[0, 1, 2],
        PASS_IR => &[3],
        PASS_B => &[2],
        PASS_G => &[1],
        PASS_R => &[0],
        _ => &[],
    }
}

/// Where gain, offset and exposure come from before a scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CalibrationMode {
    /// Fixed defaults.
    #[default]
    Default,
    /// The device's own calibration, read back from the device.
    Auto,
    /// Derived from the last preview; falls back to `Auto` without one.
    Preview,
    /// Explicit values from the configuration.
    Options,
}

impl fmt::Display for CalibrationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CalibrationMode::Default => write!(f, "default values"),
            CalibrationMode::Auto => write!(f, "from internal test"),
            CalibrationMode::Preview => write!(f, "from preview"),
            CalibrationMode::Options => write!(f, "from options"),
        }
    }
}

/// Extra gain applied after calibration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum GainAdjust {
    #[serde(rename = "0.3")]
    X03,
    #[serde(rename = "0.5")]
    X05,
    #[default]
    #[serde(rename = "0.8")]
    X08,
    #[serde(rename = "1.0")]
    X10,
    #[serde(rename = "1.2")]
    X12,
    #[serde(rename = "1.6")]
    X16,
    #[serde(rename = "1.9")]
    X19,
    #[serde(rename = "2.4")]
    X24,
    #[serde(rename = "3.0")]
    X30,
}

impl GainAdjust {
    pub fn factor(self) -> f64 {
        match self {
            GainAdjust::X03 => 0.3,
            GainAdjust::X05 => 0.5,
            GainAdjust::X08 => 0.8,
            GainAdjust::X10 => 1.0,
            GainAdjust::X12 => 1.2,
            GainAdjust::X16 => 1.6,
            GainAdjust::X19 => 1.9,
            GainAdjust::X24 => 2.4,
            GainAdjust::X30 => 3.0,
        }
    }
}

impl fmt::Display for GainAdjust {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "* {:.1}", self.factor())
    }
}

/// Explicit calibration values used by [`CalibrationMode::Options`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManualCalibration {
    /// Exposure time per channel R, G, B, I.
    pub exposure: [u16; 4],
    pub offset: [u8; 4],
    pub gain: [u8; 4],
    pub light: u8,
    pub double_times: u8,
}

impl Default for ManualCalibration {
    fn default() -> Self {
        Self {
            exposure: [DEFAULT_EXPOSURE; 4],
            offset: [DEFAULT_OFFSET; 4],
            gain: [DEFAULT_GAIN; 4],
            light: DEFAULT_LIGHT,
            double_times: DEFAULT_DOUBLE_TIMES,
        }
    }
}

/// Reset exposure, offset, gain and lamp values to the defaults.
/// Saturation levels are kept.
pub fn apply_defaults(settings: &mut Settings) {
    settings.exposure_time = [DEFAULT_EXPOSURE; 4];
    settings.offset = [DEFAULT_OFFSET; 4];
    settings.gain = [DEFAULT_GAIN; 4];
    settings.light = DEFAULT_LIGHT;
    settings.extra_entries = DEFAULT_EXTRA_ENTRIES;
    settings.double_times = DEFAULT_DOUBLE_TIMES;
}

pub fn apply_manual(settings: &mut Settings, manual: &ManualCalibration) {
    settings.exposure_time = manual.exposure;
    settings.offset = manual.offset;
    settings.gain = manual.gain;
    settings.light = manual.light;
    settings.extra_entries = DEFAULT_EXTRA_ENTRIES;
    settings.double_times = manual.double_times;
}

/// Apply [`GainAdjust`] to the channels of the pass selection. Infrared is
/// left alone in colour modes.
pub fn apply_gain_adjust(settings: &mut Settings, adjust: GainAdjust, passes: u8) {
    for &c in adjusted_channels(passes) {
        update_gain(settings, c, adjust.factor());
    }
}

/// What a preview scan tells about the next scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PreviewStats {
    pub exposure: [u16; 4],
    pub gain: [u8; 4],
    pub offset: [u8; 4],
    /// Last histogram bin below 1% cumulative, per R, G, B, I.
    pub lower_bound: [usize; 4],
    /// Last histogram bin below 99% cumulative, per R, G, B, I.
    pub upper_bound: [usize; 4],
}

impl PreviewStats {
    /// Analyze every plane of a finished preview. Channels without a plane
    /// keep zero bounds.
    pub fn analyze(buffer: &SampleBuffer, settings: &Settings) -> Result<Self, IrError> {
        let mut stats = PreviewStats {
            exposure: settings.exposure_time,
            gain: settings.gain,
            offset: settings.offset,
            ..Default::default()
        };
        let geometry = PlaneGeometry::new(buffer.width(), buffer.height(), buffer.depth());
        for (k, color) in Color::ALL.into_iter().enumerate() {
            let Some(plane) = buffer.plane(color) else {
                continue;
            };
            let histogram = NormHistogram::from_plane(&geometry, plane)?;
            let (lower, upper) = histogram.bounds(0.01, 0.99);
            stats.lower_bound[k] = lower;
            stats.upper_bound[k] = upper;
            info!(color = %color, lower, upper, "Preview 1%-99% levels");
        }
        Ok(stats)
    }

    /// Gain increase that brings the brightest preview levels of the
    /// channels up to saturation, at most [`PREVIEW_MAX_GAIN_INCREASE`].
    pub fn gain_increase(&self, settings: &Settings, channels: &[usize]) -> f64 {
        channels
            .iter()
            .filter(|&&c| c < settings.saturation_level.len())
            .map(|&c| {
                let saturation = settings.saturation_level[c] as f64 / 65536.0;
                let level = self.upper_bound[c] as f64 / 256.0;
                saturation / level
            })
            .fold(PREVIEW_MAX_GAIN_INCREASE, f64::min)
    }

    /// Raise the visible channels by the common [`gain_increase`](Self::gain_increase).
    pub fn apply(&self, settings: &mut Settings, passes: u8) {
        let channels: &[usize] = match passes {
            PASS_IR => &[],
            other => adjusted_channels(other),
        };
        if channels.is_empty() {
            return;
        }
        let increase = self.gain_increase(settings, channels);
        debug!(increase, passes, "Gain increase from preview");
        for &c in channels {
            update_gain(settings, c, increase);
        }
    }
}
