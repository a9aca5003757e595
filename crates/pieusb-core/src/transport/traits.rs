//! USB Transport layer abstraction.
//!
//! Defines the `UsbTransport` trait for the control/bulk channel of the
//! scanner bridge, allowing different implementations (nusb, mock, etc.).

use thiserror::Error;

use crate::protocol::constants::{PORT_SCSI_STATUS, REQUEST_REGISTER};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Device not found: VID={vid:04X} PID={pid:04X}")]
    DeviceNotFound { vid: u16, pid: u16 },

    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Endpoint not found: type={ep_type}, direction={direction}")]
    EndpointNotFound { ep_type: String, direction: String },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Bulk read failed: {0}")]
    ReadFailed(String),

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Abstract USB transport interface.
///
/// The bridge is driven through vendor control transfers addressing
/// single-byte registers, plus one bulk IN endpoint for data.
///
/// This trait enables:
/// - Production implementation using nusb
/// - Mock implementation for unit testing
pub trait UsbTransport: Send + Sync {
    /// Vendor control OUT transfer to the device.
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError>;

    /// Vendor control IN transfer from the device.
    fn control_in(&self, request: u8, value: u16, len: usize) -> Result<Vec<u8>, TransportError>;

    /// Read up to `max_len` bytes from the bulk IN endpoint.
    fn bulk_read(&self, max_len: usize) -> Result<Vec<u8>, TransportError>;

    /// Write one byte to a bridge register.
    fn write_register(&self, port: u16, value: u8) -> Result<(), TransportError> {
        self.control_out(REQUEST_REGISTER, port, &[value])
    }

    /// Read the status register.
    fn read_status(&self) -> Result<u8, TransportError> {
        let bytes = self.control_in(REQUEST_REGISTER, PORT_SCSI_STATUS, 1)?;
        bytes
            .first()
            .copied()
            .ok_or_else(|| TransportError::ReadFailed("Empty status response".into()))
    }

    /// Check if device is still connected.
    fn is_connected(&self) -> bool;

    /// Get the current VID.
    fn vendor_id(&self) -> u16;

    /// Get the current PID.
    fn product_id(&self) -> u16;
}
