//! Shading calibration: per-pixel reference levels from the calibration
//! strip and multiplicative correction of acquired planes.

use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::{Color, SampleBuffer};
use crate::protocol::constants::{
    CCD_PIXEL_USED, FORMAT_INDEX, FORMAT_PIXEL, SHADING_CHANNELS,
};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ShadingError {
    #[error("Shading not implemented for color format 0x{0:02X}")]
    UnsupportedFormat(u8),

    #[error("Shading geometry has no lines")]
    NoLines,

    #[error("Shading data too short: expected {expected}, got {actual}")]
    TooShort { expected: usize, actual: usize },
}

/// Layout of the raw calibration strip as sent by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShadingLayout {
    /// Lines to read, all channels included.
    pub lines: usize,
    /// Bytes per line, tag bytes included.
    pub line_bytes: usize,
}

impl ShadingLayout {
    pub fn new(width: usize, n_lines: usize, color_format: u8) -> Result<Self, ShadingError> {
        if n_lines < 1 {
            return Err(ShadingError::NoLines);
        }
        let line_bytes = match color_format {
            FORMAT_PIXEL => 2 * width,
            FORMAT_INDEX => 2 * width + 2,
            other => return Err(ShadingError::UnsupportedFormat(other)),
        };
        Ok(Self {
            lines: n_lines * SHADING_CHANNELS,
            line_bytes,
        })
    }

    pub fn total_bytes(&self) -> usize {
        self.lines * self.line_bytes
    }
}

/// Per-channel, per-pixel reference levels of the calibration strip.
#[derive(Debug, Clone, PartialEq)]
pub struct ShadingReference {
    width: usize,
    lines: usize,
    reference: [Vec<u32>; SHADING_CHANNELS],
    mean: [u32; SHADING_CHANNELS],
    max: [u32; SHADING_CHANNELS],
}

fn channel(color: Color) -> usize {
    match color {
        Color::Red => 0,
        Color::Green => 1,
        Color::Blue => 2,
        Color::Infrared => 3,
    }
}

impl ShadingReference {
    /// Reduce `n_lines` calibration lines of `width` 16-bit samples per channel.
    ///
    /// Pixel format interleaves the four channels per pixel; index format
    /// prefixes each single-channel line with a tag byte and one pad byte.
    /// Lines with an unknown tag are skipped.
    pub fn calculate(
        raw: &[u8],
        width: usize,
        n_lines: usize,
        color_format: u8,
    ) -> Result<Self, ShadingError> {
        let layout = ShadingLayout::new(width, n_lines, color_format)?;
        if raw.len() < layout.total_bytes() {
            return Err(ShadingError::TooShort {
                expected: layout.total_bytes(),
                actual: raw.len(),
            });
        }

        let mut sums: [Vec<u64>; SHADING_CHANNELS] = std::array::from_fn(|_| vec![0; width]);
        let mut max = [0u32; SHADING_CHANNELS];
        let sample = |off: usize| u16::from_le_bytes([raw[off], raw[off + 1]]) as u32;

        match color_format {
            FORMAT_PIXEL => {
                for line in 0..n_lines {
                    for m in 0..width {
                        for (ci, sum) in sums.iter_mut().enumerate() {
                            let off = ((line * width + m) * SHADING_CHANNELS + ci) * 2;
                            let val = sample(off);
                            sum[m] += val as u64;
                            max[ci] = max[ci].max(val);
                        }
                    }
                }
            }
            _ => {
                for line in raw.chunks_exact(layout.line_bytes).take(layout.lines) {
                    let Some(color) = Color::from_tag(line[0]) else {
                        continue;
                    };
                    let ci = channel(color);
                    for m in 0..width {
                        let val = u16::from_le_bytes([line[2 + 2 * m], line[3 + 2 * m]]) as u32;
                        sums[ci][m] += val as u64;
                        max[ci] = max[ci].max(val);
                    }
                }
            }
        }

        let reference: [Vec<u32>; SHADING_CHANNELS] = std::array::from_fn(|ci| {
            sums[ci]
                .iter()
                .map(|&s| (s as f64 / n_lines as f64).round() as u32)
                .collect()
        });
        let mean: [u32; SHADING_CHANNELS] = std::array::from_fn(|ci| {
            let total: u64 = reference[ci].iter().map(|&r| r as u64).sum();
            (total as f64 / width.max(1) as f64).round() as u32
        });
        debug!(?mean, ?max, width, n_lines, "Shading reference calculated");

        Ok(Self {
            width,
            lines: n_lines,
            reference,
            mean,
            max,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn lines(&self) -> usize {
        self.lines
    }

    pub fn reference(&self, color: Color) -> &[u32] {
        &self.reference[channel(color)]
    }

    pub fn mean(&self, color: Color) -> u32 {
        self.mean[channel(color)]
    }

    pub fn max(&self, color: Color) -> u32 {
        self.max[channel(color)]
    }

    /// Apply `v' = round(mean / ref[p] * v)` to every plane of `buffer`.
    ///
    /// Image column `j` maps to the `j`-th used entry of `ccd_mask`. Columns
    /// past the used entries, and reference levels of zero, are left as is.
    pub fn correct(&self, buffer: &mut SampleBuffer, ccd_mask: &[u8]) {
        let width = buffer.width();
        let height = buffer.height();
        let limit = ((1u32 << buffer.depth()) - 1) as f64;
        let locations: Vec<usize> = ccd_mask
            .iter()
            .enumerate()
            .filter(|(_, m)| **m == CCD_PIXEL_USED)
            .map(|(i, _)| i)
            .take(width)
            .collect();
        if locations.len() < width {
            warn!(
                used = locations.len(),
                width, "CCD mask covers fewer pixels than the image"
            );
        }

        let colors: Vec<Color> = buffer.plane_colors().to_vec();
        for color in colors {
            let mean = self.mean(color) as f64;
            let reference = &self.reference[channel(color)];
            let Some(plane) = buffer.plane_mut(color) else {
                continue;
            };
            // Channel, then line, then pixel: the reference row stays hot.
            for row in plane.chunks_exact_mut(width).take(height) {
                for (j, v) in row.iter_mut().enumerate().take(locations.len()) {
                    let r = reference.get(locations[j]).copied().unwrap_or(0);
                    if r == 0 {
                        continue;
                    }
                    let corrected = (mean / r as f64 * *v as f64).round();
                    *v = corrected.min(limit) as u16;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ColorMask;

    fn indexed_strip(width: usize, n_lines: usize, value: impl Fn(usize, usize) -> u16) -> Vec<u8> {
        let mut raw = Vec::new();
        for _ in 0..n_lines {
            for tag in [b'R', b'G', b'B', b'I'] {
                raw.push(tag);
                raw.push(0);
                for m in 0..width {
                    raw.extend_from_slice(&value(tag as usize, m).to_le_bytes());
                }
            }
        }
        raw
    }

    #[test]
    fn test_layout_per_format() {
        assert_eq!(
            ShadingLayout::new(10, 5, FORMAT_INDEX).unwrap(),
            ShadingLayout {
                lines: 20,
                line_bytes: 22
            }
        );
        assert_eq!(ShadingLayout::new(10, 5, FORMAT_PIXEL).unwrap().line_bytes, 20);
        assert_eq!(
            ShadingLayout::new(10, 0, FORMAT_PIXEL),
            Err(ShadingError::NoLines)
        );
        assert_eq!(
            ShadingLayout::new(10, 5, 0x02),
            Err(ShadingError::UnsupportedFormat(0x02))
        );
    }

    #[test]
    fn test_indexed_reference_and_mean() {
        let raw = indexed_strip(2, 3, |_, m| if m == 0 { 100 } else { 300 });
        let shading = ShadingReference::calculate(&raw, 2, 3, FORMAT_INDEX).unwrap();
        assert_eq!(shading.reference(Color::Red), &[100, 300]);
        assert_eq!(shading.mean(Color::Infrared), 200);
        assert_eq!(shading.max(Color::Green), 300);
    }

    #[test]
    fn test_pixel_format_channels_interleaved() {
        let mut raw = Vec::new();
        for _line in 0..2 {
            for _m in 0..2 {
                for v in [10u16, 20, 30, 40] {
                    raw.extend_from_slice(&v.to_le_bytes());
                }
            }
        }
        let shading = ShadingReference::calculate(&raw, 2, 2, FORMAT_PIXEL).unwrap();
        assert_eq!(shading.reference(Color::Blue), &[30, 30]);
        assert_eq!(shading.mean(Color::Infrared), 40);
    }

    #[test]
    fn test_unknown_tag_lines_are_ignored() {
        let mut raw = indexed_strip(1, 1, |_, _| 50);
        raw[0] = b'X';
        let shading = ShadingReference::calculate(&raw, 1, 1, FORMAT_INDEX).unwrap();
        assert_eq!(shading.reference(Color::Red), &[0]);
        assert_eq!(shading.reference(Color::Green), &[50]);
    }

    #[test]
    fn test_uniform_correction_is_identity() {
        let raw = indexed_strip(4, 4, |_, _| 1000);
        let shading = ShadingReference::calculate(&raw, 4, 4, FORMAT_INDEX).unwrap();
        let mut buffer = SampleBuffer::new(4, 2, ColorMask::RGB, 8).unwrap();
        for tag in [b'R', b'G', b'B'] {
            buffer.put_indexed_line(tag, &[10, 20, 30, 40]).unwrap();
            buffer.put_indexed_line(tag, &[50, 60, 70, 80]).unwrap();
        }
        let before = buffer.plane(Color::Green).unwrap().to_vec();
        shading.correct(&mut buffer, &[0, 0, 0, 0]);
        assert_eq!(buffer.plane(Color::Green).unwrap(), before.as_slice());
    }

    #[test]
    fn test_correction_follows_ccd_mask() {
        let raw = indexed_strip(4, 1, |_, m| [999, 100, 999, 300][m]);
        let shading = ShadingReference::calculate(&raw, 4, 1, FORMAT_INDEX).unwrap();
        assert_eq!(shading.mean(Color::Red), 600);

        let mut buffer = SampleBuffer::new(2, 1, ColorMask::RED, 16).unwrap();
        buffer
            .put_single_color_line(Color::Red, &[100, 0, 100, 0])
            .unwrap();
        shading.correct(&mut buffer, &[0x70, 0x00, 0x70, 0x00]);
        assert_eq!(buffer.plane(Color::Red).unwrap(), &[600, 200]);
    }

    #[test]
    fn test_correction_clamps_to_depth() {
        let raw = indexed_strip(2, 1, |_, m| [10, 1000][m]);
        let shading = ShadingReference::calculate(&raw, 2, 1, FORMAT_INDEX).unwrap();
        let mut buffer = SampleBuffer::new(2, 1, ColorMask::RED, 8).unwrap();
        buffer.put_single_color_line(Color::Red, &[200, 200]).unwrap();
        shading.correct(&mut buffer, &[0, 0]);
        assert_eq!(buffer.plane(Color::Red).unwrap()[0], 255);
    }
}
