//! Sample buffer: colour planes of 16-bit slots filled line by line and
//! drained as an interleaved byte stream at any read granularity.

use std::fmt;

use thiserror::Error;
use tracing::{debug, trace};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum BufferError {
    #[error("Invalid buffer geometry: {width}x{height}, {colors} colors")]
    InvalidGeometry {
        width: usize,
        height: usize,
        colors: usize,
    },

    #[error("Unsupported sample depth: {0} bits")]
    UnsupportedDepth(u8),

    #[error("Unknown color tag: 0x{0:02X}")]
    UnknownColor(u8),

    #[error("Color {0} is not part of this buffer")]
    ColorNotPresent(Color),

    #[error("Line size mismatch: expected {expected}, got {actual}")]
    LineSize { expected: usize, actual: usize },

    #[error("Color plane {0} is already full")]
    PlaneFull(Color),

    #[error("Out of memory allocating {bytes} bytes")]
    OutOfMemory { bytes: usize },
}

/// One colour channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Color {
    Red,
    Green,
    Blue,
    Infrared,
}

impl Color {
    /// Channel order used for planes and full-colour lines.
    pub const ALL: [Color; 4] = [Color::Red, Color::Green, Color::Blue, Color::Infrared];

    /// Map the tag byte that prefixes indexed lines.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            b'R' => Some(Color::Red),
            b'G' => Some(Color::Green),
            b'B' => Some(Color::Blue),
            b'I' => Some(Color::Infrared),
            _ => None,
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Color::Red => b'R',
            Color::Green => b'G',
            Color::Blue => b'B',
            Color::Infrared => b'I',
        }
    }

    pub fn bit(self) -> u8 {
        match self {
            Color::Red => ColorMask::RED.0,
            Color::Green => ColorMask::GREEN.0,
            Color::Blue => ColorMask::BLUE.0,
            Color::Infrared => ColorMask::INFRARED.0,
        }
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag() as char)
    }
}

/// Set of colours held by a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ColorMask(pub u8);

impl ColorMask {
    pub const RED: ColorMask = ColorMask(0x01);
    pub const GREEN: ColorMask = ColorMask(0x02);
    pub const BLUE: ColorMask = ColorMask(0x04);
    pub const INFRARED: ColorMask = ColorMask(0x08);
    pub const RGB: ColorMask = ColorMask(0x07);
    pub const RGBI: ColorMask = ColorMask(0x0F);

    pub fn contains(self, color: Color) -> bool {
        self.0 & color.bit() != 0
    }

    pub fn count(self) -> usize {
        (self.0 & 0x0F).count_ones() as usize
    }

    /// Present colours in channel order.
    pub fn colors(self) -> impl Iterator<Item = Color> {
        Color::ALL.into_iter().filter(move |c| self.contains(*c))
    }

    pub fn without(self, color: Color) -> ColorMask {
        ColorMask(self.0 & !color.bit())
    }
}

/// Position of the next byte handed out by [`SampleBuffer::get`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ReadCursor {
    plane: usize,
    line: usize,
    pixel: usize,
    /// Low (0) or high (1) byte of a 16-bit sample.
    byte: usize,
}

/// Image store of `colors` planes × `height` lines × `width` samples.
pub struct SampleBuffer {
    width: usize,
    height: usize,
    depth: u8,
    mask: ColorMask,
    planes: Vec<Color>,
    packing_density: usize,
    packet_size_bytes: usize,
    line_size_bytes: usize,
    image_size_bytes: usize,
    data: Vec<u16>,
    write_lines: Vec<usize>,
    cursor: ReadCursor,
    bytes_read: usize,
    bytes_written: usize,
    bytes_unread: usize,
}

impl fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("depth", &self.depth)
            .field("mask", &self.mask)
            .field("image_size_bytes", &self.image_size_bytes)
            .field("bytes_read", &self.bytes_read)
            .field("bytes_written", &self.bytes_written)
            .field("bytes_unread", &self.bytes_unread)
            .finish()
    }
}

impl SampleBuffer {
    /// Allocate a zeroed buffer. Depth must be 1..=16.
    pub fn new(
        width: usize,
        height: usize,
        mask: ColorMask,
        depth: u8,
    ) -> Result<Self, BufferError> {
        let colors = mask.count();
        if width == 0 || height == 0 || colors == 0 {
            return Err(BufferError::InvalidGeometry {
                width,
                height,
                colors,
            });
        }
        if !(1..=16).contains(&depth) {
            return Err(BufferError::UnsupportedDepth(depth));
        }

        let packing_density = if depth == 1 { 8 } else { 1 };
        let packet_size_bytes = (depth as usize * packing_density).div_ceil(8);
        let line_size_packets = width.div_ceil(packing_density);
        let line_size_bytes = line_size_packets * packet_size_bytes;
        let image_size_bytes = colors * height * line_size_bytes;

        let samples = width * height * colors;
        let mut data = Vec::new();
        data.try_reserve_exact(samples)
            .map_err(|_| BufferError::OutOfMemory {
                bytes: samples * std::mem::size_of::<u16>(),
            })?;
        data.resize(samples, 0);

        debug!(
            width,
            height,
            colors,
            depth,
            image_size_bytes,
            "Sample buffer created"
        );

        Ok(Self {
            width,
            height,
            depth,
            mask,
            planes: mask.colors().collect(),
            packing_density,
            packet_size_bytes,
            line_size_bytes,
            image_size_bytes,
            data,
            write_lines: vec![0; colors],
            cursor: ReadCursor::default(),
            bytes_read: 0,
            bytes_written: 0,
            bytes_unread: 0,
        })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn color_mask(&self) -> ColorMask {
        self.mask
    }

    pub fn colors(&self) -> usize {
        self.planes.len()
    }

    pub fn packing_density(&self) -> usize {
        self.packing_density
    }

    pub fn packet_size_bytes(&self) -> usize {
        self.packet_size_bytes
    }

    /// Bytes in one single-colour input line.
    pub fn line_size_bytes(&self) -> usize {
        self.line_size_bytes
    }

    /// Total bytes [`get`](Self::get) will ever return.
    pub fn image_size_bytes(&self) -> usize {
        self.image_size_bytes
    }

    pub fn bytes_read(&self) -> usize {
        self.bytes_read
    }

    pub fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    pub fn bytes_unread(&self) -> usize {
        self.bytes_unread
    }

    /// Lines written so far into the plane of `color`.
    pub fn lines_written(&self, color: Color) -> Option<usize> {
        self.plane_index(color).map(|p| self.write_lines[p])
    }

    /// True once every plane has all its lines.
    pub fn is_filled(&self) -> bool {
        self.write_lines.iter().all(|&l| l >= self.height)
    }

    pub fn plane_index(&self, color: Color) -> Option<usize> {
        self.planes.iter().position(|&c| c == color)
    }

    /// Colours in plane order.
    pub fn plane_colors(&self) -> &[Color] {
        &self.planes
    }

    fn plane_len(&self) -> usize {
        self.width * self.height
    }

    pub fn plane(&self, color: Color) -> Option<&[u16]> {
        let n = self.plane_len();
        self.plane_index(color).map(|p| &self.data[p * n..(p + 1) * n])
    }

    pub fn plane_mut(&mut self, color: Color) -> Option<&mut [u16]> {
        let n = self.plane_len();
        self.plane_index(color)
            .map(move |p| &mut self.data[p * n..(p + 1) * n])
    }

    /// All planes in plane order.
    pub fn planes_mut(&mut self) -> Vec<&mut [u16]> {
        let n = self.plane_len();
        self.data.chunks_mut(n).collect()
    }

    /// Decode one input line into plane samples.
    fn unpack(&self, line: &[u8], out: &mut [u16]) {
        match (self.depth, self.packet_size_bytes) {
            (1, _) => {
                for (i, slot) in out.iter_mut().enumerate() {
                    let byte = line[i / 8];
                    *slot = ((byte >> (7 - (i % 8))) & 1) as u16;
                }
            }
            (8, _) => {
                for (slot, &b) in out.iter_mut().zip(line) {
                    *slot = b as u16;
                }
            }
            (d, 1) => {
                for (slot, &b) in out.iter_mut().zip(line) {
                    *slot = (b >> (8 - d)) as u16;
                }
            }
            _ => {
                for (slot, pair) in out.iter_mut().zip(line.chunks_exact(2)) {
                    *slot = u16::from_le_bytes([pair[0], pair[1]]);
                }
            }
        }
    }

    /// Store a line holding samples of a single colour.
    pub fn put_single_color_line(&mut self, color: Color, line: &[u8]) -> Result<(), BufferError> {
        let plane = self
            .plane_index(color)
            .ok_or(BufferError::ColorNotPresent(color))?;
        if line.len() != self.line_size_bytes {
            return Err(BufferError::LineSize {
                expected: self.line_size_bytes,
                actual: line.len(),
            });
        }
        let row = self.write_lines[plane];
        if row >= self.height {
            return Err(BufferError::PlaneFull(color));
        }

        let start = plane * self.plane_len() + row * self.width;
        let mut samples = vec![0u16; self.width];
        self.unpack(line, &mut samples);
        self.data[start..start + self.width].copy_from_slice(&samples);

        self.write_lines[plane] += 1;
        self.bytes_written += line.len();
        self.bytes_unread += line.len();
        trace!(color = %color, row, "Single color line stored");
        Ok(())
    }

    /// Store a line prefixed by its colour tag byte.
    pub fn put_indexed_line(&mut self, tag: u8, line: &[u8]) -> Result<(), BufferError> {
        let color = Color::from_tag(tag).ok_or(BufferError::UnknownColor(tag))?;
        self.put_single_color_line(color, line)
    }

    /// Store a line of pixel-interleaved samples for every plane.
    pub fn put_full_color_line(&mut self, line: &[u8]) -> Result<(), BufferError> {
        let colors = self.colors();
        let expected = self.line_size_bytes * colors;
        if line.len() != expected {
            return Err(BufferError::LineSize {
                expected,
                actual: line.len(),
            });
        }
        if let Some(p) = self.write_lines.iter().position(|&l| l >= self.height) {
            return Err(BufferError::PlaneFull(self.planes[p]));
        }

        // De-interleave packets per colour, then unpack each plane line
        let packet = self.packet_size_bytes;
        let mut plane_line = vec![0u8; self.line_size_bytes];
        let mut samples = vec![0u16; self.width];
        for p in 0..colors {
            for (k, dst) in plane_line.chunks_exact_mut(packet).enumerate() {
                let src = (k * colors + p) * packet;
                dst.copy_from_slice(&line[src..src + packet]);
            }
            self.unpack(&plane_line, &mut samples);
            let start = p * self.plane_len() + self.write_lines[p] * self.width;
            self.data[start..start + self.width].copy_from_slice(&samples);
            self.write_lines[p] += 1;
        }

        self.bytes_written += line.len();
        self.bytes_unread += line.len();
        Ok(())
    }

    fn sample_at(&self, plane: usize, line: usize, pixel: usize) -> u16 {
        self.data[plane * self.plane_len() + line * self.width + pixel]
    }

    fn advance(&mut self, increment: usize) {
        if self.cursor.byte == 0 && self.packet_size_bytes == 2 {
            self.cursor.byte = 1;
            return;
        }
        self.cursor.byte = 0;
        self.cursor.plane += 1;
        if self.cursor.plane == self.colors() {
            self.cursor.plane = 0;
            self.cursor.pixel += increment;
            if self.cursor.pixel >= self.width {
                self.cursor.pixel = 0;
                self.cursor.line += 1;
            }
        }
    }

    /// Return up to `max_len` bytes in interleaved pixel order.
    ///
    /// Only rows present in every plane are handed out, and never more than
    /// [`image_size_bytes`](Self::image_size_bytes) in total. An exhausted
    /// buffer, or one whose next row is still missing a colour, returns an
    /// empty vector.
    pub fn get(&mut self, max_len: usize) -> Vec<u8> {
        let complete_rows = self.write_lines.iter().copied().min().unwrap_or(0);
        let readable = complete_rows * self.colors() * self.line_size_bytes;
        let n = max_len
            .min(self.bytes_unread)
            .min(readable.saturating_sub(self.bytes_read))
            .min(self.image_size_bytes - self.bytes_read);
        let mut out = Vec::with_capacity(n);

        while out.len() < n {
            let ReadCursor {
                plane,
                line,
                pixel,
                byte,
            } = self.cursor;
            if self.packing_density == 8 {
                let n_bits = (self.width - pixel).min(8);
                let mut val = 0u8;
                for i in 0..n_bits {
                    if self.sample_at(plane, line, pixel + i) > 0 {
                        val |= 0x80 >> i;
                    }
                }
                out.push(val);
                self.advance(n_bits);
            } else if self.packet_size_bytes == 2 {
                let bytes = self.sample_at(plane, line, pixel).to_le_bytes();
                out.push(bytes[byte]);
                self.advance(1);
            } else {
                out.push((self.sample_at(plane, line, pixel) & 0xFF) as u8);
                self.advance(1);
            }
        }

        self.bytes_read += out.len();
        self.bytes_unread -= out.len();
        out
    }

    /// Remove the plane of `color`, shrinking the output image accordingly.
    /// Reading restarts from the first byte.
    pub fn drop_color(&mut self, color: Color) -> Result<(), BufferError> {
        let plane = self
            .plane_index(color)
            .ok_or(BufferError::ColorNotPresent(color))?;
        if self.planes.len() == 1 {
            return Err(BufferError::InvalidGeometry {
                width: self.width,
                height: self.height,
                colors: 0,
            });
        }
        let n = self.plane_len();
        let old_colors = self.colors();
        self.data.drain(plane * n..(plane + 1) * n);
        self.planes.remove(plane);
        self.write_lines.remove(plane);
        self.mask = self.mask.without(color);

        let colors = self.colors();
        self.image_size_bytes = colors * self.height * self.line_size_bytes;
        self.bytes_written = self.bytes_written * colors / old_colors;
        self.cursor = ReadCursor::default();
        self.bytes_read = 0;
        self.bytes_unread = self.bytes_written;
        debug!(color = %color, colors, "Color plane dropped");
        Ok(())
    }
}
