//! Command frame: the fixed 6-byte header plus an optional data phase.

use super::constants::{SCSI_COMMAND_LEN, opcode_name};

/// Direction and size of the data that follows a command header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataPhase {
    /// No data.
    None,
    /// Bytes written to the device after the header.
    Out(Vec<u8>),
    /// Number of bytes the device will make available for reading.
    In(usize),
}

/// A single command sent through the bridge.
///
/// Header layout: `[opcode, 0, 0, size_hi, size_lo, 0]`. The size field is
/// big-endian; for most commands it carries the data length, for line reads
/// it carries the line count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFrame {
    opcode: u8,
    size: u16,
    data: DataPhase,
}

impl CommandFrame {
    /// Command without data; `size` still lands in the header.
    pub fn new(opcode: u8, size: u16) -> Self {
        Self {
            opcode,
            size,
            data: DataPhase::None,
        }
    }

    /// Command followed by `payload`. The header size equals the payload length.
    pub fn write(opcode: u8, payload: Vec<u8>) -> Self {
        Self {
            opcode,
            size: payload.len() as u16,
            data: DataPhase::Out(payload),
        }
    }

    /// Command that reads `len` bytes. The header size equals `len`.
    pub fn read(opcode: u8, len: usize) -> Self {
        Self::read_with_size(opcode, len as u16, len)
    }

    /// Command that reads `len` bytes with an explicit header size field.
    pub fn read_with_size(opcode: u8, size: u16, len: usize) -> Self {
        Self {
            opcode,
            size,
            data: DataPhase::In(len),
        }
    }

    pub fn opcode(&self) -> u8 {
        self.opcode
    }

    pub fn name(&self) -> &'static str {
        opcode_name(self.opcode)
    }

    pub fn size(&self) -> u16 {
        self.size
    }

    pub fn data(&self) -> &DataPhase {
        &self.data
    }

    /// Serialized header.
    pub fn header(&self) -> [u8; SCSI_COMMAND_LEN] {
        let [hi, lo] = self.size.to_be_bytes();
        [self.opcode, 0, 0, hi, lo, 0]
    }

    /// Bytes to write after the header, if any.
    pub fn payload(&self) -> &[u8] {
        match &self.data {
            DataPhase::Out(bytes) => bytes,
            _ => &[],
        }
    }

    /// Bytes expected back from the device.
    pub fn read_len(&self) -> usize {
        match self.data {
            DataPhase::In(len) => len,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::*;

    #[test]
    fn test_header_size_is_big_endian() {
        let frame = CommandFrame::read(SCSI_INQUIRY, 0x0100);
        assert_eq!(frame.header(), [0x12, 0, 0, 0x01, 0x00, 0]);
        assert_eq!(frame.read_len(), 256);
    }

    #[test]
    fn test_write_frame_carries_payload_length() {
        let frame = CommandFrame::write(SCSI_SLIDE, vec![SLIDE_NEXT, 1, 0, 0]);
        assert_eq!(frame.header(), [0xD1, 0, 0, 0, 4, 0]);
        assert_eq!(frame.payload(), &[0x04, 0x01, 0, 0]);
        assert_eq!(frame.read_len(), 0);
    }

    #[test]
    fn test_line_read_uses_line_count_in_header() {
        let frame = CommandFrame::read_with_size(SCSI_READ, 255, 255 * 302);
        assert_eq!(frame.header(), [0x08, 0, 0, 0, 255, 0]);
        assert_eq!(frame.read_len(), 255 * 302);
        assert_eq!(frame.name(), "Read");
    }
}
