//! Typed payloads exchanged with the scanner.
//!
//! All multi-byte fields are little-endian. Decoders take the raw bytes the
//! engine returned; encoders produce the exact data-out payload.

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FrameError {
    #[error("Buffer too small: expected {expected}, got {actual}")]
    BufferTooSmall { expected: usize, actual: usize },
    #[error("Unsupported color depth: {0} bits")]
    UnsupportedDepth(u8),
    #[error("Unknown depth code: 0x{0:02X}")]
    UnknownDepthCode(u8),
}

fn ensure_len(data: &[u8], expected: usize) -> Result<(), FrameError> {
    if data.len() < expected {
        return Err(FrameError::BufferTooSmall {
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

/// Fixed-width, space or NUL padded string field.
fn fixed_string(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_matches(|c: char| c == '\0' || c.is_whitespace())
        .to_string()
}

/// INQUIRY response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScannerProperties {
    pub device_type: u8,
    pub additional_length: u8,
    pub vendor: String,
    pub product: String,
    pub product_revision: String,
    pub max_resolution_x: u16,
    pub max_resolution_y: u16,
    pub max_scan_width: u16,
    pub max_scan_height: u16,
    pub filters: u8,
    pub color_depths: u8,
    pub color_format: u8,
    pub image_format: u8,
    pub scan_capability: u8,
    pub optional_devices: u8,
    pub enhancements: u8,
    pub gamma_bits: u8,
    pub last_filter: u8,
    pub preview_scan_resolution: u16,
    pub firmware_version: String,
    pub halftones: u8,
    pub minimum_highlight: u8,
    pub maximum_shadow: u8,
    pub calibration_equation: u8,
    pub maximum_exposure: u16,
    pub minimum_exposure: u16,
    pub x0: u16,
    pub y0: u16,
    pub x1: u16,
    pub y1: u16,
    pub model: u16,
    pub production: String,
    pub timestamp: String,
    pub signature: String,
}

impl ScannerProperties {
    pub const SIZE: usize = 256;
    /// Bytes covered by the decoded fields.
    const DECODED_LEN: usize = 184;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, Self::DECODED_LEN)?;
        let u16_at = |off: usize| LittleEndian::read_u16(&data[off..]);
        let signature: Vec<u8> = data[144..184]
            .iter()
            .map(|&b| if b == b'\n' || b == b'\r' { b' ' } else { b })
            .collect();

        Ok(Self {
            device_type: data[0],
            additional_length: data[4],
            vendor: fixed_string(&data[8..16]),
            product: fixed_string(&data[16..32]),
            product_revision: fixed_string(&data[32..36]),
            max_resolution_x: u16_at(36),
            max_resolution_y: u16_at(38),
            max_scan_width: u16_at(40),
            max_scan_height: u16_at(42),
            filters: data[44],
            color_depths: data[45],
            color_format: data[46],
            image_format: data[48],
            scan_capability: data[49],
            optional_devices: data[50],
            enhancements: data[51],
            gamma_bits: data[52],
            last_filter: data[53],
            preview_scan_resolution: u16_at(54),
            firmware_version: fixed_string(&data[96..100]),
            halftones: data[100],
            minimum_highlight: data[101],
            maximum_shadow: data[102],
            calibration_equation: data[103],
            maximum_exposure: u16_at(104),
            minimum_exposure: u16_at(106),
            x0: u16_at(108),
            y0: u16_at(110),
            x1: u16_at(112),
            y1: u16_at(114),
            model: u16_at(116),
            production: fixed_string(&data[120..124]),
            timestamp: fixed_string(&data[124..144]),
            signature: fixed_string(&signature),
        })
    }
}

/// Scan frame rectangle in device units.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanFrame {
    pub index: u8,
    pub x0: u16,
    pub y0: u16,
    pub x1: u16,
    pub y1: u16,
}

impl ScanFrame {
    pub const READ_SIZE: usize = 256;
    pub const WRITE_SIZE: usize = 14;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, Self::WRITE_SIZE)?;
        Ok(Self {
            index: data[4],
            x0: LittleEndian::read_u16(&data[6..]),
            y0: LittleEndian::read_u16(&data[8..]),
            x1: LittleEndian::read_u16(&data[10..]),
            y1: LittleEndian::read_u16(&data[12..]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::WRITE_SIZE];
        LittleEndian::write_u16(&mut buf[0..], WRITE_SCAN_FRAME as u16);
        LittleEndian::write_u16(&mut buf[2..], (Self::WRITE_SIZE - 4) as u16);
        LittleEndian::write_u16(&mut buf[4..], self.index as u16);
        LittleEndian::write_u16(&mut buf[6..], self.x0);
        LittleEndian::write_u16(&mut buf[8..], self.y0);
        LittleEndian::write_u16(&mut buf[10..], self.x1);
        LittleEndian::write_u16(&mut buf[12..], self.y1);
        buf
    }

    pub fn width(&self) -> u16 {
        self.x1.saturating_sub(self.x0)
    }

    pub fn height(&self) -> u16 {
        self.y1.saturating_sub(self.y0)
    }
}

/// Halftone pattern summary as reported by the device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HalftonePattern {
    pub index: u8,
    pub width: u8,
    pub height: u8,
    pub description: String,
}

impl HalftonePattern {
    pub const READ_SIZE: usize = 256;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 8)?;
        let pattern_size = LittleEndian::read_u16(&data[2..]) as usize;
        let start = 4 + pattern_size;
        let end = start + 16;
        ensure_len(data, end)?;
        Ok(Self {
            index: data[4] & 0x7F,
            width: data[6],
            height: data[7],
            description: fixed_string(&data[start..end]),
        })
    }
}

/// Encode a 6-byte "prepare read" request for a WRITE sub-code.
pub fn prepare_read(code: u8, index: u8) -> Vec<u8> {
    let mut buf = vec![0u8; SCSI_COMMAND_LEN];
    buf[0] = code | WRITE_PREPARE_READ;
    buf[4] = index;
    buf
}

/// Encode the per-filter WRITE used by exposure and highlight/shadow.
pub fn filter_setting(code: u8, filter: u16, value: u16) -> Vec<u8> {
    let mut buf = vec![0u8; 8];
    LittleEndian::write_u16(&mut buf[0..], code as u16);
    LittleEndian::write_u16(&mut buf[2..], 4);
    LittleEndian::write_u16(&mut buf[4..], filter);
    LittleEndian::write_u16(&mut buf[6..], value);
    buf
}

/// Encode the vendor command 0x17.
pub fn cmd_17(value: u16) -> Vec<u8> {
    let mut buf = vec![0u8; SCSI_COMMAND_LEN];
    LittleEndian::write_u16(&mut buf[0..], WRITE_CMD_17 as u16);
    LittleEndian::write_u16(&mut buf[2..], 2);
    LittleEndian::write_u16(&mut buf[4..], value);
    buf
}

/// One entry of the shading geometry table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadingParameters {
    pub kind: u8,
    pub send_bits: u8,
    pub receive_bits: u8,
    pub n_lines: u8,
    pub pixels_per_line: u16,
}

impl ShadingParameters {
    pub const READ_SIZE: usize = 32;

    /// Decode the table; entries that would run past the buffer are dropped.
    pub fn table_from_bytes(data: &[u8]) -> Result<Vec<Self>, FrameError> {
        ensure_len(data, 8)?;
        let count = data[4] as usize;
        let entry_size = data[5] as usize;
        let mut entries = Vec::with_capacity(count);
        for k in 0..count {
            let off = 8 + entry_size * k;
            if off + 6 > data.len() {
                break;
            }
            entries.push(Self {
                kind: data[off],
                send_bits: data[off + 1],
                receive_bits: data[off + 2],
                n_lines: data[off + 3],
                pixels_per_line: LittleEndian::read_u16(&data[off + 4..]),
            });
        }
        Ok(entries)
    }
}

/// Transfer parameters reported once scanning has started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanParameters {
    pub width: u16,
    pub lines: u16,
    pub bytes: u16,
    pub filter_offset1: u8,
    pub filter_offset2: u8,
    pub period: u32,
    pub scsi_transfer_rate: u16,
    pub available_lines: u16,
}

impl ScanParameters {
    pub const SIZE: usize = 18;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 16)?;
        Ok(Self {
            width: LittleEndian::read_u16(&data[0..]),
            lines: LittleEndian::read_u16(&data[2..]),
            bytes: LittleEndian::read_u16(&data[4..]),
            filter_offset1: data[6],
            filter_offset2: data[7],
            period: LittleEndian::read_u32(&data[8..]),
            scsi_transfer_rate: LittleEndian::read_u16(&data[12..]),
            available_lines: LittleEndian::read_u16(&data[14..]),
        })
    }
}

/// Map a bit depth to the MODE SELECT depth code.
pub fn depth_code(bits: u8) -> Result<u8, FrameError> {
    match bits {
        16 => Ok(0x20),
        12 => Ok(0x10),
        10 => Ok(0x08),
        8 => Ok(0x04),
        4 => Ok(0x02),
        1 => Ok(0x01),
        other => Err(FrameError::UnsupportedDepth(other)),
    }
}

/// Map a MODE SENSE depth code back to bits.
pub fn depth_from_code(code: u8) -> Result<u8, FrameError> {
    match code {
        0x20 => Ok(16),
        0x10 => Ok(12),
        0x08 => Ok(10),
        0x04 => Ok(8),
        0x02 => Ok(4),
        0x01 => Ok(1),
        other => Err(FrameError::UnknownDepthCode(other)),
    }
}

/// MODE SELECT / MODE SENSE block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mode {
    pub resolution: u16,
    pub passes: u8,
    /// Bits per sample.
    pub color_depth: u8,
    pub color_format: u8,
    pub byte_order: u8,
    pub sharpen: bool,
    pub skip_shading_analysis: bool,
    pub fast_infrared: bool,
    pub halftone_pattern: u8,
    pub line_threshold: u8,
}

impl Default for Mode {
    fn default() -> Self {
        Self {
            resolution: 0,
            passes: PASS_COLOR,
            color_depth: 8,
            color_format: FORMAT_INDEX,
            byte_order: 1,
            sharpen: false,
            skip_shading_analysis: true,
            fast_infrared: false,
            halftone_pattern: 0,
            line_threshold: 127,
        }
    }
}

impl Mode {
    pub const SIZE: usize = 16;

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let mut buf = vec![0u8; Self::SIZE];
        buf[1] = (Self::SIZE - 1) as u8;
        LittleEndian::write_u16(&mut buf[2..], self.resolution);
        buf[4] = self.passes;
        buf[5] = depth_code(self.color_depth)?;
        buf[6] = self.color_format;
        buf[8] = self.byte_order;
        let mut quality = 0u8;
        if self.sharpen {
            quality |= QUALITY_SHARPEN;
        }
        if self.skip_shading_analysis {
            quality |= QUALITY_SKIP_SHADING;
        }
        if self.fast_infrared {
            quality |= QUALITY_FAST_INFRARED;
        }
        buf[9] = quality;
        buf[12] = self.halftone_pattern;
        buf[13] = self.line_threshold;
        buf[14] = 0x10;
        Ok(buf)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 14)?;
        let quality = data[9];
        Ok(Self {
            resolution: LittleEndian::read_u16(&data[2..]),
            passes: data[4],
            color_depth: depth_from_code(data[5])?,
            color_format: data[6],
            byte_order: data[8],
            sharpen: quality & QUALITY_SHARPEN != 0,
            skip_shading_analysis: quality & QUALITY_SKIP_SHADING != 0,
            fast_infrared: quality & QUALITY_FAST_INFRARED != 0,
            halftone_pattern: data[12],
            line_threshold: data[13],
        })
    }
}

/// Gain, offset and exposure per channel (R, G, B, I).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settings {
    pub saturation_level: [u16; 3],
    pub exposure_time: [u16; 4],
    pub offset: [u8; 4],
    pub gain: [u8; 4],
    pub light: u8,
    pub extra_entries: u8,
    pub double_times: u8,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            saturation_level: [0; 3],
            exposure_time: [DEFAULT_EXPOSURE; 4],
            offset: [DEFAULT_OFFSET; 4],
            gain: [DEFAULT_GAIN; 4],
            light: DEFAULT_LIGHT,
            extra_entries: DEFAULT_EXTRA_ENTRIES,
            double_times: DEFAULT_DOUBLE_TIMES,
        }
    }
}

impl Settings {
    pub const READ_SIZE: usize = 103;
    pub const WRITE_SIZE: usize = 29;

    /// Decode READ GAIN OFFSET. Fields the device does not report keep `base`.
    pub fn from_bytes(data: &[u8], base: &Settings) -> Result<Self, FrameError> {
        ensure_len(data, Self::READ_SIZE)?;
        let mut s = *base;
        for k in 0..3 {
            s.saturation_level[k] = LittleEndian::read_u16(&data[54 + 2 * k..]);
            s.exposure_time[k] = LittleEndian::read_u16(&data[60 + 2 * k..]);
            s.offset[k] = data[66 + k];
            s.gain[k] = data[72 + k];
        }
        s.light = data[75];
        s.exposure_time[3] = LittleEndian::read_u16(&data[98..]);
        s.offset[3] = data[100];
        s.gain[3] = data[102];
        Ok(s)
    }

    /// Encode WRITE GAIN OFFSET.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0u8; Self::WRITE_SIZE];
        for k in 0..3 {
            LittleEndian::write_u16(&mut buf[2 * k..], self.exposure_time[k]);
            buf[6 + k] = self.offset[k];
            buf[12 + k] = self.gain[k];
        }
        buf[15] = self.light;
        buf[16] = self.extra_entries;
        buf[17] = self.double_times;
        LittleEndian::write_u16(&mut buf[18..], self.exposure_time[3]);
        buf[20] = self.offset[3];
        buf[22] = self.gain[3];
        buf
    }
}

/// READ STATE response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScannerState {
    pub button_pushed: bool,
    pub warming_up: bool,
    pub scanning: bool,
}

impl ScannerState {
    pub const SIZE: usize = 12;

    pub fn from_bytes(data: &[u8]) -> Result<Self, FrameError> {
        ensure_len(data, 7)?;
        Ok(Self {
            button_pushed: data[0] != 0,
            warming_up: data[5] != 0,
            scanning: data[6] != 0,
        })
    }
}

/// SET SCAN HEAD payload. Mode 2 has no known encoding.
pub fn scan_head(mode: u8, steps: u16) -> Option<Vec<u8>> {
    let mut buf = vec![0u8; 4];
    match mode {
        1 => buf[0] = 2,
        3 => buf[0] = 8,
        4 | 5 => {
            buf[0] = if mode == 4 { 0 } else { 1 };
            BigEndian::write_u16(&mut buf[2..], steps);
        }
        _ => return None,
    }
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inquiry_decode_trims_strings() {
        let mut data = vec![0u8; ScannerProperties::SIZE];
        data[8..16].copy_from_slice(b"PIE     ");
        data[16..32].copy_from_slice(b"SF Scanner      ");
        data[32..36].copy_from_slice(b"1.70");
        LittleEndian::write_u16(&mut data[36..], 7200);
        LittleEndian::write_u16(&mut data[38..], 7200);
        LittleEndian::write_u16(&mut data[54..], 300);
        LittleEndian::write_u16(&mut data[104..], 1000);
        LittleEndian::write_u16(&mut data[116..], 0x36);
        data[144..150].copy_from_slice(b"a\nb\rc ");

        let props = ScannerProperties::from_bytes(&data).unwrap();
        assert_eq!(props.vendor, "PIE");
        assert_eq!(props.product, "SF Scanner");
        assert_eq!(props.product_revision, "1.70");
        assert_eq!(props.max_resolution_x, 7200);
        assert_eq!(props.preview_scan_resolution, 300);
        assert_eq!(props.model, 0x36);
        assert_eq!(props.signature, "a b c");
    }

    #[test]
    fn test_inquiry_too_short() {
        let err = ScannerProperties::from_bytes(&[0u8; 20]).unwrap_err();
        assert_eq!(
            err,
            FrameError::BufferTooSmall {
                expected: 184,
                actual: 20
            }
        );
    }

    #[test]
    fn test_scan_frame_encoding() {
        let frame = ScanFrame {
            index: SCAN_FRAME_INDEX,
            x0: 0x0102,
            y0: 3,
            x1: 100,
            y1: 200,
        };
        let bytes = frame.to_bytes();
        assert_eq!(&bytes[0..6], &[0x12, 0, 10, 0, 0x80, 0]);
        assert_eq!(&bytes[6..8], &[0x02, 0x01]);
        assert_eq!(frame.width(), 98);
    }

    #[test]
    fn test_mode_encoding_layout() {
        let mode = Mode {
            resolution: 1000,
            passes: PASS_COLOR,
            color_depth: 8,
            color_format: FORMAT_INDEX,
            byte_order: 1,
            sharpen: true,
            skip_shading_analysis: false,
            fast_infrared: false,
            halftone_pattern: 0,
            line_threshold: 0x7F,
        };
        let bytes = mode.to_bytes().unwrap();
        assert_eq!(
            bytes,
            vec![
                0x00, 0x0F, 0xE8, 0x03, 0x80, 0x04, 0x04, 0x00, 0x01, 0x02, 0, 0, 0, 0x7F, 0x10,
                0
            ]
        );
    }

    #[test]
    fn test_mode_sense_masks_quality_bits() {
        let mut bytes = Mode::default().to_bytes().unwrap();
        bytes[9] = QUALITY_FAST_INFRARED;
        let mode = Mode::from_bytes(&bytes).unwrap();
        assert!(mode.fast_infrared);
        assert!(!mode.sharpen);
        assert!(!mode.skip_shading_analysis);
    }

    #[test]
    fn test_unsupported_depth_rejected() {
        let mode = Mode {
            color_depth: 7,
            ..Default::default()
        };
        assert_eq!(mode.to_bytes(), Err(FrameError::UnsupportedDepth(7)));
    }

    #[test]
    fn test_shading_table_decode() {
        let data = [
            0x95, 0x00, 0x1C, 0x00, 0x04, 0x06, 0x04, 0x00, 0x00, 0x10, 0x10, 0x14, 0x1A, 0x1D,
            0x08, 0x10, 0x10, 0x14, 0x1A, 0x1D, 0x10, 0x10, 0x10, 0x14, 0x1A, 0x1D, 0x20, 0x10,
            0x10, 0x14, 0x1A, 0x1D,
        ];
        let table = ShadingParameters::table_from_bytes(&data).unwrap();
        assert_eq!(table.len(), 4);
        assert_eq!(table[0].n_lines, 0x14);
        assert_eq!(table[0].pixels_per_line, 0x1D1A);
        assert_eq!(table[3].kind, 0x20);
    }

    #[test]
    fn test_settings_write_layout() {
        let settings = Settings::default();
        let bytes = settings.to_bytes();
        assert_eq!(bytes.len(), 29);
        assert_eq!(LittleEndian::read_u16(&bytes[0..]), DEFAULT_EXPOSURE);
        assert_eq!(bytes[12], DEFAULT_GAIN);
        assert_eq!(bytes[15], DEFAULT_LIGHT);
        assert_eq!(bytes[16], DEFAULT_EXTRA_ENTRIES);
        assert_eq!(LittleEndian::read_u16(&bytes[18..]), DEFAULT_EXPOSURE);
        assert_eq!(bytes[22], DEFAULT_GAIN);
    }

    #[test]
    fn test_settings_read_layout() {
        let mut data = vec![0u8; Settings::READ_SIZE];
        LittleEndian::write_u16(&mut data[54..], 0xA9);
        LittleEndian::write_u16(&mut data[60..], 0x1004);
        data[66] = 0x53;
        data[72] = 0x2E;
        data[75] = 5;
        LittleEndian::write_u16(&mut data[98..], 0x1004);
        data[100] = 0x4F;
        data[102] = 0x2C;
        let s = Settings::from_bytes(&data, &Settings::default()).unwrap();
        assert_eq!(s.saturation_level[0], 0xA9);
        assert_eq!(s.exposure_time[0], 0x1004);
        assert_eq!(s.offset[0], 0x53);
        assert_eq!(s.gain[0], 0x2E);
        assert_eq!(s.light, 5);
        assert_eq!(s.gain[3], 0x2C);
        assert_eq!(s.extra_entries, DEFAULT_EXTRA_ENTRIES);
    }

    #[test]
    fn test_scan_head_modes() {
        assert_eq!(scan_head(1, 0), Some(vec![2, 0, 0, 0]));
        assert_eq!(scan_head(2, 0), None);
        assert_eq!(scan_head(3, 0), Some(vec![8, 0, 0, 0]));
        assert_eq!(scan_head(5, 0x0102), Some(vec![1, 0, 1, 2]));
    }

    #[test]
    fn test_halftone_pattern_decode() {
        let mut data = vec![0u8; HalftonePattern::READ_SIZE];
        LittleEndian::write_u16(&mut data[2..], 8);
        data[4] = 0x83;
        data[6] = 4;
        data[7] = 2;
        data[12..20].copy_from_slice(b"Dither44");
        let p = HalftonePattern::from_bytes(&data).unwrap();
        assert_eq!(p.index, 3);
        assert_eq!((p.width, p.height), (4, 2));
        assert_eq!(p.description, "Dither44");
    }
}
