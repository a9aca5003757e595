//! Scan options: typed settings plus a tagged get/set interface keyed by
//! [`OptionId`].

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::buffer::ColorMask;
use crate::calibration::{CalibrationMode, GainAdjust, ManualCalibration};
use crate::device::DeviceDefinition;
use crate::postprocess::{CropMode, PostprocessConfig};
use crate::protocol::constants::*;
use crate::protocol::{Mode, ScanFrame, ScanParameters};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OptionError {
    #[error("Option {option} expects a {expected} value, got {actual}")]
    KindMismatch {
        option: OptionId,
        expected: OptionKind,
        actual: OptionKind,
    },

    #[error("Invalid value for {option}: {value}")]
    InvalidValue { option: OptionId, value: String },

    #[error("Unknown option: {0}")]
    UnknownOption(String),

    #[error("{first} ({first_mm:.1} mm) is bigger than {second} ({second_mm:.1} mm)")]
    Geometry {
        first: OptionId,
        first_mm: f64,
        second: OptionId,
        second_mm: f64,
    },

    #[error("Unsupported bit depth: {0}")]
    UnsupportedDepth(u8),

    #[error("Invalid bit depth: {0}")]
    InvalidDepth(u8),
}

/// Value kinds an option can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Int,
    Fixed,
    Str,
    Bool,
    WordArray,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionKind::Int => write!(f, "integer"),
            OptionKind::Fixed => write!(f, "fixed-point"),
            OptionKind::Str => write!(f, "string"),
            OptionKind::Bool => write!(f, "boolean"),
            OptionKind::WordArray => write!(f, "word array"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Int(i32),
    Fixed(f64),
    Str(String),
    Bool(bool),
    WordArray(Vec<i32>),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Fixed(_) => OptionKind::Fixed,
            OptionValue::Str(_) => OptionKind::Str,
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::WordArray(_) => OptionKind::WordArray,
        }
    }

    /// Parse text as a value of `kind`. Word arrays are comma separated.
    pub fn parse(kind: OptionKind, text: &str) -> Option<Self> {
        let text = text.trim();
        match kind {
            OptionKind::Int => text.parse().ok().map(OptionValue::Int),
            OptionKind::Fixed => text.parse().ok().map(OptionValue::Fixed),
            OptionKind::Str => Some(OptionValue::Str(text.to_string())),
            OptionKind::Bool => match text.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(OptionValue::Bool(true)),
                "0" | "false" | "no" | "off" => Some(OptionValue::Bool(false)),
                _ => None,
            },
            OptionKind::WordArray => text
                .split(',')
                .map(|w| w.trim().parse().ok())
                .collect::<Option<Vec<i32>>>()
                .map(OptionValue::WordArray),
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Int(v) => write!(f, "{v}"),
            OptionValue::Fixed(v) => write!(f, "{v:.1}"),
            OptionValue::Str(v) => write!(f, "{v}"),
            OptionValue::Bool(v) => write!(f, "{v}"),
            OptionValue::WordArray(v) => {
                let words: Vec<String> = v.iter().map(|w| w.to_string()).collect();
                write!(f, "{}", words.join(","))
            }
        }
    }
}

/// Every scan option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptionId {
    Mode,
    BitDepth,
    Resolution,
    HalftonePattern,
    Threshold,
    Sharpen,
    ShadingAnalysis,
    FastInfrared,
    AdvanceSlide,
    CalibrationMode,
    GainAdjust,
    TlX,
    TlY,
    BrX,
    BrY,
    Preview,
    CorrectShading,
    CorrectInfrared,
    CleanImage,
    SmoothImage,
    CropImage,
    SaveShadingData,
    SaveCcdMask,
    Light,
    DoubleTimes,
    Exposure,
    Gain,
    Offset,
}

impl OptionId {
    pub const ALL: [OptionId; 28] = [
        OptionId::Mode,
        OptionId::BitDepth,
        OptionId::Resolution,
        OptionId::HalftonePattern,
        OptionId::Threshold,
        OptionId::Sharpen,
        OptionId::ShadingAnalysis,
        OptionId::FastInfrared,
        OptionId::AdvanceSlide,
        OptionId::CalibrationMode,
        OptionId::GainAdjust,
        OptionId::TlX,
        OptionId::TlY,
        OptionId::BrX,
        OptionId::BrY,
        OptionId::Preview,
        OptionId::CorrectShading,
        OptionId::CorrectInfrared,
        OptionId::CleanImage,
        OptionId::SmoothImage,
        OptionId::CropImage,
        OptionId::SaveShadingData,
        OptionId::SaveCcdMask,
        OptionId::Light,
        OptionId::DoubleTimes,
        OptionId::Exposure,
        OptionId::Gain,
        OptionId::Offset,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OptionId::Mode => "mode",
            OptionId::BitDepth => "depth",
            OptionId::Resolution => "resolution",
            OptionId::HalftonePattern => "halftone-pattern",
            OptionId::Threshold => "threshold",
            OptionId::Sharpen => "sharpen",
            OptionId::ShadingAnalysis => "shading-analysis",
            OptionId::FastInfrared => "fast-infrared",
            OptionId::AdvanceSlide => "advance-slide",
            OptionId::CalibrationMode => "calibration",
            OptionId::GainAdjust => "gain-adjust",
            OptionId::TlX => "tl-x",
            OptionId::TlY => "tl-y",
            OptionId::BrX => "br-x",
            OptionId::BrY => "br-y",
            OptionId::Preview => "preview",
            OptionId::CorrectShading => "correct-shading",
            OptionId::CorrectInfrared => "correct-infrared",
            OptionId::CleanImage => "clean-image",
            OptionId::SmoothImage => "smooth-image",
            OptionId::CropImage => "crop-image",
            OptionId::SaveShadingData => "save-shading-data",
            OptionId::SaveCcdMask => "save-ccdmask",
            OptionId::Light => "light",
            OptionId::DoubleTimes => "double-times",
            OptionId::Exposure => "exposure-time",
            OptionId::Gain => "gain",
            OptionId::Offset => "offset",
        }
    }

    pub fn kind(self) -> OptionKind {
        match self {
            OptionId::Mode | OptionId::CalibrationMode | OptionId::GainAdjust | OptionId::CropImage => {
                OptionKind::Str
            }
            OptionId::BitDepth
            | OptionId::Resolution
            | OptionId::HalftonePattern
            | OptionId::SmoothImage
            | OptionId::Light
            | OptionId::DoubleTimes => OptionKind::Int,
            OptionId::Threshold | OptionId::TlX | OptionId::TlY | OptionId::BrX | OptionId::BrY => {
                OptionKind::Fixed
            }
            OptionId::Sharpen
            | OptionId::ShadingAnalysis
            | OptionId::FastInfrared
            | OptionId::AdvanceSlide
            | OptionId::Preview
            | OptionId::CorrectShading
            | OptionId::CorrectInfrared
            | OptionId::CleanImage
            | OptionId::SaveShadingData
            | OptionId::SaveCcdMask => OptionKind::Bool,
            OptionId::Exposure | OptionId::Gain | OptionId::Offset => OptionKind::WordArray,
        }
    }
}

impl fmt::Display for OptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for OptionId {
    type Err = OptionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptionId::ALL
            .into_iter()
            .find(|id| id.name() == s)
            .ok_or_else(|| OptionError::UnknownOption(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanMode {
    Lineart,
    Halftone,
    Gray,
    #[default]
    Color,
    Rgbi,
}

impl ScanMode {
    pub const ALL: [ScanMode; 5] = [
        ScanMode::Lineart,
        ScanMode::Halftone,
        ScanMode::Gray,
        ScanMode::Color,
        ScanMode::Rgbi,
    ];

    pub fn is_binary(self) -> bool {
        matches!(self, ScanMode::Lineart | ScanMode::Halftone)
    }
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Lineart => write!(f, "Lineart"),
            ScanMode::Halftone => write!(f, "Halftone"),
            ScanMode::Gray => write!(f, "Gray"),
            ScanMode::Color => write!(f, "Color"),
            ScanMode::Rgbi => write!(f, "RGBI"),
        }
    }
}

impl FromStr for ScanMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ScanMode::ALL
            .into_iter()
            .find(|m| m.to_string().eq_ignore_ascii_case(s))
            .ok_or(())
    }
}

/// Scan area in millimetres. A zero bottom-right coordinate means the
/// edge of the scan bed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameMm {
    pub tl_x: f64,
    pub tl_y: f64,
    pub br_x: f64,
    pub br_y: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanSettings {
    pub mode: ScanMode,
    pub bit_depth: u8,
    /// Dots per inch; 0 selects the device's preview resolution.
    pub resolution: u16,
    pub frame: FrameMm,
    pub preview: bool,
    pub sharpen: bool,
    pub fast_infrared: bool,
    pub shading_analysis: bool,
    pub advance_slide: bool,
    /// Lineart threshold in percent.
    pub threshold: f64,
    pub halftone_pattern: u8,
}

impl Default for ScanSettings {
    fn default() -> Self {
        Self {
            mode: ScanMode::Color,
            bit_depth: 8,
            resolution: 0,
            frame: FrameMm::default(),
            preview: false,
            sharpen: false,
            fast_infrared: false,
            shading_analysis: false,
            advance_slide: false,
            threshold: 50.0,
            halftone_pattern: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub mode: CalibrationMode,
    pub gain_adjust: GainAdjust,
    pub manual: ManualCalibration,
}

/// Offline copies of the CCD mask and raw shading data.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    pub dump_dir: Option<PathBuf>,
    pub save_shading: bool,
    pub save_ccd_mask: bool,
}

/// Image layout a scan delivers to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Gray,
    Rgb,
    Rgbi,
}

impl FrameFormat {
    pub fn colors(self) -> usize {
        match self {
            FrameFormat::Gray => 1,
            FrameFormat::Rgb => 3,
            FrameFormat::Rgbi => 4,
        }
    }
}

/// Output geometry of a pending or running scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageParameters {
    pub format: FrameFormat,
    pub depth: u8,
    pub pixels_per_line: usize,
    pub lines: usize,
    pub bytes_per_line: usize,
    pub last_frame: bool,
}

impl ImageParameters {
    /// Parameters reported by the device once scanning.
    pub fn from_device(params: &ScanParameters, format: FrameFormat, depth: u8) -> Self {
        let bytes = params.bytes as usize;
        let bytes_per_line = match format {
            FrameFormat::Gray => bytes / 3,
            FrameFormat::Rgbi => 4 * bytes,
            FrameFormat::Rgb => 3 * bytes,
        };
        Self {
            format,
            depth,
            pixels_per_line: params.width as usize,
            lines: params.lines as usize,
            bytes_per_line,
            last_frame: true,
        }
    }

    pub fn colors(&self) -> usize {
        self.format.colors()
    }
}

/// All options of one scan.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScanOptions {
    pub scan: ScanSettings,
    pub calibration: CalibrationConfig,
    pub postprocess: PostprocessConfig,
    pub diagnostics: DiagnosticsConfig,
}

fn word_array<T: Copy + Into<i32>>(values: &[T]) -> OptionValue {
    OptionValue::WordArray(values.iter().map(|&v| v.into()).collect())
}

fn to_words<T: TryFrom<i32> + Copy, const N: usize>(
    id: OptionId,
    words: &[i32],
) -> Result<[T; N], OptionError> {
    let invalid = || OptionError::InvalidValue {
        option: id,
        value: OptionValue::WordArray(words.to_vec()).to_string(),
    };
    if words.len() != N {
        return Err(invalid());
    }
    let mut out = Vec::with_capacity(N);
    for &w in words {
        out.push(T::try_from(w).map_err(|_| invalid())?);
    }
    out.try_into().map_err(|_| invalid())
}

impl ScanOptions {
    /// Current value of `id`.
    pub fn get(&self, id: OptionId) -> OptionValue {
        let s = &self.scan;
        let c = &self.calibration;
        let p = &self.postprocess;
        match id {
            OptionId::Mode => OptionValue::Str(s.mode.to_string()),
            OptionId::BitDepth => OptionValue::Int(s.bit_depth as i32),
            OptionId::Resolution => OptionValue::Int(s.resolution as i32),
            OptionId::HalftonePattern => OptionValue::Int(s.halftone_pattern as i32),
            OptionId::Threshold => OptionValue::Fixed(s.threshold),
            OptionId::Sharpen => OptionValue::Bool(s.sharpen),
            OptionId::ShadingAnalysis => OptionValue::Bool(s.shading_analysis),
            OptionId::FastInfrared => OptionValue::Bool(s.fast_infrared),
            OptionId::AdvanceSlide => OptionValue::Bool(s.advance_slide),
            OptionId::CalibrationMode => OptionValue::Str(serde_name(&c.mode)),
            OptionId::GainAdjust => OptionValue::Str(serde_name(&c.gain_adjust)),
            OptionId::TlX => OptionValue::Fixed(s.frame.tl_x),
            OptionId::TlY => OptionValue::Fixed(s.frame.tl_y),
            OptionId::BrX => OptionValue::Fixed(s.frame.br_x),
            OptionId::BrY => OptionValue::Fixed(s.frame.br_y),
            OptionId::Preview => OptionValue::Bool(s.preview),
            OptionId::CorrectShading => OptionValue::Bool(p.correct_shading),
            OptionId::CorrectInfrared => OptionValue::Bool(p.correct_infrared),
            OptionId::CleanImage => OptionValue::Bool(p.clean_image),
            OptionId::SmoothImage => OptionValue::Int(p.smoothing as i32),
            OptionId::CropImage => OptionValue::Str(serde_name(&p.crop)),
            OptionId::SaveShadingData => OptionValue::Bool(self.diagnostics.save_shading),
            OptionId::SaveCcdMask => OptionValue::Bool(self.diagnostics.save_ccd_mask),
            OptionId::Light => OptionValue::Int(c.manual.light as i32),
            OptionId::DoubleTimes => OptionValue::Int(c.manual.double_times as i32),
            OptionId::Exposure => word_array(&c.manual.exposure),
            OptionId::Gain => word_array(&c.manual.gain),
            OptionId::Offset => word_array(&c.manual.offset),
        }
    }

    /// Replace the value of `id`. The value kind must match the option.
    pub fn set(&mut self, id: OptionId, value: OptionValue) -> Result<(), OptionError> {
        if value.kind() != id.kind() {
            return Err(OptionError::KindMismatch {
                option: id,
                expected: id.kind(),
                actual: value.kind(),
            });
        }
        let invalid = |value: &OptionValue| OptionError::InvalidValue {
            option: id,
            value: value.to_string(),
        };
        let s = &mut self.scan;
        let c = &mut self.calibration;
        let p = &mut self.postprocess;
        match (id, &value) {
            (OptionId::Mode, OptionValue::Str(v)) => {
                s.mode = v.parse().map_err(|_| invalid(&value))?;
            }
            (OptionId::BitDepth, OptionValue::Int(v)) => {
                s.bit_depth = u8::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::Resolution, OptionValue::Int(v)) => {
                s.resolution = u16::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::HalftonePattern, OptionValue::Int(v)) => {
                s.halftone_pattern = u8::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::Threshold, OptionValue::Fixed(v)) => {
                if !(0.0..=100.0).contains(v) {
                    return Err(invalid(&value));
                }
                s.threshold = *v;
            }
            (OptionId::Sharpen, OptionValue::Bool(v)) => s.sharpen = *v,
            (OptionId::ShadingAnalysis, OptionValue::Bool(v)) => s.shading_analysis = *v,
            (OptionId::FastInfrared, OptionValue::Bool(v)) => s.fast_infrared = *v,
            (OptionId::AdvanceSlide, OptionValue::Bool(v)) => s.advance_slide = *v,
            (OptionId::CalibrationMode, OptionValue::Str(v)) => {
                c.mode = from_serde_name(v).ok_or_else(|| invalid(&value))?;
            }
            (OptionId::GainAdjust, OptionValue::Str(v)) => {
                c.gain_adjust = from_serde_name(v).ok_or_else(|| invalid(&value))?;
            }
            (OptionId::TlX, OptionValue::Fixed(v)) => s.frame.tl_x = non_negative(*v, || invalid(&value))?,
            (OptionId::TlY, OptionValue::Fixed(v)) => s.frame.tl_y = non_negative(*v, || invalid(&value))?,
            (OptionId::BrX, OptionValue::Fixed(v)) => s.frame.br_x = non_negative(*v, || invalid(&value))?,
            (OptionId::BrY, OptionValue::Fixed(v)) => s.frame.br_y = non_negative(*v, || invalid(&value))?,
            (OptionId::Preview, OptionValue::Bool(v)) => s.preview = *v,
            (OptionId::CorrectShading, OptionValue::Bool(v)) => p.correct_shading = *v,
            (OptionId::CorrectInfrared, OptionValue::Bool(v)) => p.correct_infrared = *v,
            (OptionId::CleanImage, OptionValue::Bool(v)) => p.clean_image = *v,
            (OptionId::SmoothImage, OptionValue::Int(v)) => {
                p.smoothing = u8::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::CropImage, OptionValue::Str(v)) => {
                p.crop = from_serde_name::<CropMode>(v).ok_or_else(|| invalid(&value))?;
            }
            (OptionId::SaveShadingData, OptionValue::Bool(v)) => self.diagnostics.save_shading = *v,
            (OptionId::SaveCcdMask, OptionValue::Bool(v)) => self.diagnostics.save_ccd_mask = *v,
            (OptionId::Light, OptionValue::Int(v)) => {
                c.manual.light = u8::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::DoubleTimes, OptionValue::Int(v)) => {
                c.manual.double_times = u8::try_from(*v).map_err(|_| invalid(&value))?;
            }
            (OptionId::Exposure, OptionValue::WordArray(v)) => c.manual.exposure = to_words(id, v)?,
            (OptionId::Gain, OptionValue::WordArray(v)) => {
                let gain: [u8; 4] = to_words(id, v)?;
                if gain.iter().any(|&g| g > crate::calibration::GAIN_SETTING_MAX) {
                    return Err(invalid(&value));
                }
                c.manual.gain = gain;
            }
            (OptionId::Offset, OptionValue::WordArray(v)) => c.manual.offset = to_words(id, v)?,
            _ => {
                return Err(OptionError::KindMismatch {
                    option: id,
                    expected: id.kind(),
                    actual: value.kind(),
                });
            }
        }
        Ok(())
    }

    /// Parse `name=value` and set it.
    pub fn set_from_str(&mut self, assignment: &str) -> Result<OptionId, OptionError> {
        let (name, text) = assignment
            .split_once('=')
            .ok_or_else(|| OptionError::UnknownOption(assignment.to_string()))?;
        let id: OptionId = name.trim().parse()?;
        let value = OptionValue::parse(id.kind(), text).ok_or_else(|| OptionError::InvalidValue {
            option: id,
            value: text.to_string(),
        })?;
        self.set(id, value)?;
        Ok(id)
    }

    /// Fill in device dependent defaults: the preview resolution when no
    /// resolution is set and the full bed for a zero bottom-right corner.
    pub fn resolve(&mut self, device: &DeviceDefinition) {
        if self.scan.resolution == 0 {
            self.scan.resolution = device.fast_preview_resolution;
        }
        let max_dpi = device.max_dpi();
        if max_dpi > 0 && self.scan.resolution > max_dpi {
            warn!(
                resolution = self.scan.resolution,
                max_dpi, "Resolution above device maximum, clamping"
            );
            self.scan.resolution = max_dpi;
        }
        if self.scan.frame.br_x == 0.0 {
            self.scan.frame.br_x = device.bed_width_mm();
        }
        if self.scan.frame.br_y == 0.0 {
            self.scan.frame.br_y = device.bed_height_mm();
        }
    }

    pub fn effective_resolution(&self, device: &DeviceDefinition) -> u16 {
        if self.scan.preview || self.scan.resolution == 0 {
            device.fast_preview_resolution
        } else {
            self.scan.resolution
        }
    }

    /// Bits per sample the scan is performed at.
    pub fn effective_depth(&self) -> Result<u8, OptionError> {
        let depth = self.scan.bit_depth;
        match depth {
            1 | 8 | 16 => {}
            4 | 10 | 12 => return Err(OptionError::UnsupportedDepth(depth)),
            other => return Err(OptionError::InvalidDepth(other)),
        }
        Ok(if self.scan.mode.is_binary() {
            1
        } else if depth == 1 {
            8
        } else {
            depth
        })
    }

    /// Whether the scan acquires an infrared plane.
    pub fn scans_infrared(&self) -> bool {
        !self.scan.preview
            && (self.scan.mode == ScanMode::Rgbi
                || (self.scan.mode == ScanMode::Color && self.postprocess.clean_image))
    }

    /// Colour planes the device delivers.
    pub fn color_mask(&self) -> ColorMask {
        if self.scan.preview {
            ColorMask::RGB
        } else {
            match self.scan.mode {
                ScanMode::Lineart | ScanMode::Halftone | ScanMode::Gray => ColorMask::GREEN,
                ScanMode::Color if self.postprocess.clean_image => ColorMask::RGBI,
                ScanMode::Color => ColorMask::RGB,
                ScanMode::Rgbi => ColorMask::RGBI,
            }
        }
    }

    /// Layout handed to the caller. Colour with image cleaning drops the
    /// infrared plane before delivery.
    pub fn frame_format(&self) -> FrameFormat {
        if self.scan.preview {
            return FrameFormat::Rgb;
        }
        match self.scan.mode {
            ScanMode::Lineart | ScanMode::Halftone | ScanMode::Gray => FrameFormat::Gray,
            ScanMode::Color => FrameFormat::Rgb,
            ScanMode::Rgbi => FrameFormat::Rgbi,
        }
    }

    /// MODE SELECT block for these options.
    pub fn mode_block(&self, device: &DeviceDefinition) -> Result<Mode, OptionError> {
        let depth = self.effective_depth()?;
        let preview = self.scan.preview;
        let (passes, color_format) = if preview {
            (PASS_COLOR, FORMAT_INDEX)
        } else {
            match self.scan.mode {
                ScanMode::Lineart | ScanMode::Halftone | ScanMode::Gray => (PASS_G, FORMAT_PIXEL),
                ScanMode::Rgbi => (PASS_RGBI, FORMAT_INDEX),
                ScanMode::Color if self.postprocess.clean_image => (PASS_RGBI, FORMAT_INDEX),
                ScanMode::Color => (PASS_COLOR, FORMAT_INDEX),
            }
        };
        Ok(Mode {
            resolution: self.effective_resolution(device),
            passes,
            color_depth: depth,
            color_format,
            byte_order: 1,
            sharpen: self.scan.sharpen && !preview,
            skip_shading_analysis: !self.scan.shading_analysis,
            fast_infrared: self.scan.fast_infrared && !preview,
            halftone_pattern: 0,
            line_threshold: (self.scan.threshold / 100.0 * 255.0) as u8,
        })
    }

    /// Scan frame in device units.
    pub fn frame(&self, device: &DeviceDefinition) -> ScanFrame {
        let dpmm = device.maximum_resolution as f64 / MM_PER_INCH;
        let f = &self.scan.frame;
        let br_x = if f.br_x == 0.0 { device.bed_width_mm() } else { f.br_x };
        let br_y = if f.br_y == 0.0 { device.bed_height_mm() } else { f.br_y };
        ScanFrame {
            index: SCAN_FRAME_INDEX,
            x0: (f.tl_x * dpmm).round() as u16,
            y0: (f.tl_y * dpmm).round() as u16,
            x1: (br_x * dpmm).round() as u16,
            y1: (br_y * dpmm).round() as u16,
        }
    }

    /// Output parameters estimated before the device reports them.
    pub fn estimate_parameters(&self, device: &DeviceDefinition) -> Result<ImageParameters, OptionError> {
        let resolution = self.effective_resolution(device) as f64;
        let f = &self.scan.frame;
        let br_x = if f.br_x == 0.0 { device.bed_width_mm() } else { f.br_x };
        let br_y = if f.br_y == 0.0 { device.bed_height_mm() } else { f.br_y };
        let pixels_per_line = ((br_x - f.tl_x).max(0.0) / MM_PER_INCH * resolution) as usize;
        let lines = ((br_y - f.tl_y).max(0.0) / MM_PER_INCH * resolution) as usize;
        let format = self.frame_format();
        let depth = self.effective_depth()?;
        let colors = format.colors();
        let bytes_per_line = match depth {
            1 => colors * pixels_per_line.div_ceil(8),
            2..=8 => colors * pixels_per_line,
            _ => 2 * colors * pixels_per_line,
        };
        Ok(ImageParameters {
            format,
            depth,
            pixels_per_line,
            lines,
            bytes_per_line,
            last_frame: true,
        })
    }

    /// Options the chosen mode does not use, with the reason.
    pub fn ignored_options(&self) -> Vec<(OptionId, &'static str)> {
        let s = &self.scan;
        let p = &self.postprocess;
        let mut ignored = Vec::new();
        let mut check = |cond: bool, id: OptionId, why: &'static str| {
            if cond {
                ignored.push((id, why));
            }
        };
        if s.preview {
            let why = "ignored during preview";
            check(s.resolution != 0, OptionId::Resolution, why);
            check(s.sharpen, OptionId::Sharpen, why);
            check(s.fast_infrared, OptionId::FastInfrared, why);
            check(p.correct_infrared, OptionId::CorrectInfrared, why);
            check(p.clean_image, OptionId::CleanImage, why);
            check(p.smoothing != 0, OptionId::SmoothImage, why);
            check(p.crop != CropMode::None, OptionId::CropImage, why);
            return ignored;
        }
        match s.mode {
            ScanMode::Lineart | ScanMode::Halftone => {
                check(s.bit_depth != 1, OptionId::BitDepth, "ignored, will use 1");
                let why = "irrelevant in binary modes";
                check(s.fast_infrared, OptionId::FastInfrared, why);
                check(p.correct_infrared, OptionId::CorrectInfrared, why);
                check(p.clean_image, OptionId::CleanImage, why);
                check(p.smoothing != 0, OptionId::SmoothImage, why);
                check(p.crop != CropMode::None, OptionId::CropImage, why);
            }
            ScanMode::Gray => {
                check(s.bit_depth == 1, OptionId::BitDepth, "ignored, will use 8");
                let why = "irrelevant without infrared";
                check(s.fast_infrared, OptionId::FastInfrared, why);
                check(p.correct_infrared, OptionId::CorrectInfrared, why);
                check(p.clean_image, OptionId::CleanImage, why);
                check(p.crop != CropMode::None, OptionId::CropImage, why);
            }
            ScanMode::Color => {
                check(s.bit_depth == 1, OptionId::BitDepth, "ignored, will use 8");
                check(
                    p.correct_infrared && !p.clean_image,
                    OptionId::CorrectInfrared,
                    "irrelevant without infrared",
                );
                check(
                    p.crop != CropMode::None && !p.clean_image,
                    OptionId::CropImage,
                    "requires image cleaning",
                );
            }
            ScanMode::Rgbi => {
                check(s.bit_depth == 1, OptionId::BitDepth, "ignored, will use 8");
                check(
                    p.crop != CropMode::None && !p.clean_image,
                    OptionId::CropImage,
                    "requires image cleaning",
                );
            }
        }
        ignored
    }

    /// Reject inconsistent geometry and log options the mode ignores.
    pub fn analyse(&self, device: &DeviceDefinition) -> Result<(), OptionError> {
        let f = &self.scan.frame;
        let br_x = if f.br_x == 0.0 { device.bed_width_mm() } else { f.br_x };
        let br_y = if f.br_y == 0.0 { device.bed_height_mm() } else { f.br_y };
        if f.tl_x > br_x {
            return Err(OptionError::Geometry {
                first: OptionId::TlX,
                first_mm: f.tl_x,
                second: OptionId::BrX,
                second_mm: br_x,
            });
        }
        if f.tl_y > br_y {
            return Err(OptionError::Geometry {
                first: OptionId::TlY,
                first_mm: f.tl_y,
                second: OptionId::BrY,
                second_mm: br_y,
            });
        }
        for (id, why) in self.ignored_options() {
            info!(option = %id, value = %self.get(id), mode = %self.scan.mode, "Option {}", why);
        }
        Ok(())
    }
}

fn non_negative(v: f64, err: impl FnOnce() -> OptionError) -> Result<f64, OptionError> {
    if v.is_finite() && v >= 0.0 { Ok(v) } else { Err(err()) }
}

/// Name a unit enum variant by its serde representation.
fn serde_name<T: Serialize>(value: &T) -> String {
    toml::Value::try_from(value)
        .ok()
        .and_then(|v| v.as_str().map(str::to_string))
        .unwrap_or_default()
}

fn from_serde_name<T: for<'de> Deserialize<'de>>(name: &str) -> Option<T> {
    T::deserialize(toml::Value::String(name.to_string())).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ScannerProperties;

    fn device() -> DeviceDefinition {
        let props = ScannerProperties {
            max_resolution_x: 3600,
            max_resolution_y: 2,
            max_scan_width: 3600,
            max_scan_height: 3600,
            preview_scan_resolution: 300,
            ..Default::default()
        };
        DeviceDefinition::from_inquiry(&props, PIE_VENDOR_ID, PRODUCT_ID_7200)
    }

    #[test]
    fn test_get_set_every_option() {
        let mut opts = ScanOptions::default();
        for id in OptionId::ALL {
            let value = opts.get(id);
            assert_eq!(value.kind(), id.kind(), "{id}");
            opts.set(id, value.clone()).unwrap();
            assert_eq!(opts.get(id), value, "{id}");
        }
    }

    #[test]
    fn test_kind_mismatch() {
        let mut opts = ScanOptions::default();
        let err = opts.set(OptionId::Preview, OptionValue::Int(1)).unwrap_err();
        assert!(matches!(err, OptionError::KindMismatch { option: OptionId::Preview, .. }));
    }

    #[test]
    fn test_set_from_str() {
        let mut opts = ScanOptions::default();
        opts.set_from_str("mode=rgbi").unwrap();
        opts.set_from_str("calibration=preview").unwrap();
        opts.set_from_str("gain-adjust=1.6").unwrap();
        opts.set_from_str("crop-image=inside").unwrap();
        opts.set_from_str("exposure-time=100, 200,300,400").unwrap();
        opts.set_from_str("clean-image=yes").unwrap();
        assert_eq!(opts.scan.mode, ScanMode::Rgbi);
        assert_eq!(opts.calibration.mode, CalibrationMode::Preview);
        assert_eq!(opts.calibration.gain_adjust, GainAdjust::X16);
        assert_eq!(opts.postprocess.crop, CropMode::Inside);
        assert_eq!(opts.calibration.manual.exposure, [100, 200, 300, 400]);
        assert!(opts.postprocess.clean_image);

        assert!(matches!(opts.set_from_str("bogus=1"), Err(OptionError::UnknownOption(_))));
        assert!(opts.set_from_str("gain=1,2,3").is_err());
        assert!(opts.set_from_str("gain=1,2,3,64").is_err());
        assert!(opts.set_from_str("mode=sepia").is_err());
        assert!(opts.set_from_str("tl-x=-1").is_err());
    }

    #[test]
    fn test_mode_block_mapping() {
        let dev = device();
        let mut opts = ScanOptions::default();
        opts.scan.resolution = 1200;
        opts.scan.sharpen = true;

        let mode = opts.mode_block(&dev).unwrap();
        assert_eq!((mode.passes, mode.color_format), (PASS_COLOR, FORMAT_INDEX));
        assert_eq!(mode.resolution, 1200);
        assert!(mode.sharpen);
        assert!(mode.skip_shading_analysis);

        opts.postprocess.clean_image = true;
        assert_eq!(opts.mode_block(&dev).unwrap().passes, PASS_RGBI);
        assert_eq!(opts.color_mask(), ColorMask::RGBI);
        assert_eq!(opts.frame_format(), FrameFormat::Rgb);

        opts.scan.mode = ScanMode::Lineart;
        opts.scan.threshold = 50.0;
        let mode = opts.mode_block(&dev).unwrap();
        assert_eq!((mode.passes, mode.color_format, mode.color_depth), (PASS_G, FORMAT_PIXEL, 1));
        assert_eq!(mode.line_threshold, 127);

        opts.scan.mode = ScanMode::Gray;
        opts.scan.preview = true;
        let mode = opts.mode_block(&dev).unwrap();
        assert_eq!((mode.passes, mode.color_format), (PASS_COLOR, FORMAT_INDEX));
        assert_eq!(mode.resolution, 300);
        assert!(!mode.sharpen);
    }

    #[test]
    fn test_depth_validation() {
        let dev = device();
        let mut opts = ScanOptions::default();
        for depth in [4, 10, 12] {
            opts.scan.bit_depth = depth;
            assert_eq!(opts.mode_block(&dev), Err(OptionError::UnsupportedDepth(depth)));
        }
        opts.scan.bit_depth = 3;
        assert_eq!(opts.effective_depth(), Err(OptionError::InvalidDepth(3)));
        opts.scan.bit_depth = 1;
        assert_eq!(opts.effective_depth(), Ok(8));
        opts.scan.mode = ScanMode::Halftone;
        opts.scan.bit_depth = 16;
        assert_eq!(opts.effective_depth(), Ok(1));
    }

    #[test]
    fn test_frame_in_device_units() {
        let dev = device();
        let mut opts = ScanOptions::default();
        opts.scan.frame = FrameMm {
            tl_x: 2.54,
            tl_y: 0.0,
            br_x: 12.7,
            br_y: 0.0,
        };
        let frame = opts.frame(&dev);
        assert_eq!(frame.index, SCAN_FRAME_INDEX);
        assert_eq!(frame.x0, 360);
        assert_eq!(frame.x1, 1800);
        assert_eq!(frame.y1, 3600);
    }

    #[test]
    fn test_analyse_rejects_inverted_frame() {
        let dev = device();
        let mut opts = ScanOptions::default();
        opts.scan.frame = FrameMm {
            tl_x: 10.0,
            tl_y: 0.0,
            br_x: 5.0,
            br_y: 5.0,
        };
        assert!(matches!(
            opts.analyse(&dev),
            Err(OptionError::Geometry { first: OptionId::TlX, .. })
        ));
        opts.scan.frame.br_x = 0.0;
        opts.scan.frame.tl_y = 6.0;
        assert!(matches!(
            opts.analyse(&dev),
            Err(OptionError::Geometry { first: OptionId::TlY, .. })
        ));
    }

    #[test]
    fn test_ignored_options() {
        let mut opts = ScanOptions::default();
        opts.scan.mode = ScanMode::Lineart;
        opts.postprocess.clean_image = true;
        let ignored: Vec<OptionId> = opts.ignored_options().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ignored, vec![OptionId::BitDepth, OptionId::CleanImage]);

        opts.scan.mode = ScanMode::Rgbi;
        assert!(opts.ignored_options().is_empty());
    }

    #[test]
    fn test_estimated_parameters() {
        let dev = device();
        let mut opts = ScanOptions::default();
        opts.scan.resolution = 300;
        opts.scan.frame = FrameMm {
            tl_x: 0.0,
            tl_y: 0.0,
            br_x: 25.4,
            br_y: 12.7,
        };
        let params = opts.estimate_parameters(&dev).unwrap();
        assert_eq!(params.pixels_per_line, 300);
        assert_eq!(params.lines, 150);
        assert_eq!(params.bytes_per_line, 900);

        opts.scan.mode = ScanMode::Lineart;
        let params = opts.estimate_parameters(&dev).unwrap();
        assert_eq!(params.depth, 1);
        assert_eq!(params.bytes_per_line, 38);

        opts.scan.mode = ScanMode::Rgbi;
        opts.scan.bit_depth = 16;
        let params = opts.estimate_parameters(&dev).unwrap();
        assert_eq!(params.bytes_per_line, 2 * 4 * 300);
    }

    #[test]
    fn test_device_parameters() {
        let params = ScanParameters {
            width: 100,
            lines: 50,
            bytes: 100,
            ..Default::default()
        };
        assert_eq!(ImageParameters::from_device(&params, FrameFormat::Rgb, 8).bytes_per_line, 300);
        assert_eq!(ImageParameters::from_device(&params, FrameFormat::Rgbi, 8).bytes_per_line, 400);
        assert_eq!(ImageParameters::from_device(&params, FrameFormat::Gray, 8).bytes_per_line, 33);
    }

    #[test]
    fn test_resolve_fills_defaults() {
        let dev = device();
        let mut opts = ScanOptions::default();
        opts.resolve(&dev);
        assert_eq!(opts.scan.resolution, 300);
        assert!((opts.scan.frame.br_x - 25.4).abs() < 1e-9);
        assert!((opts.scan.frame.br_y - 25.4).abs() < 1e-9);
    }
}
