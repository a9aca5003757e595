//! nusb-based USB transport implementation.

use std::io::Read;
use std::time::Duration;

use nusb::transfer::{Bulk, ControlIn, ControlOut, ControlType, In, Recipient};
use nusb::{Interface, MaybeFuture, list_devices};
use tracing::{debug, info, instrument, trace};

use super::traits::{TransportError, UsbTransport};
use crate::device::SupportedDevice;

/// Timeout for a single control transfer.
const CONTROL_TIMEOUT: Duration = Duration::from_secs(5);

/// nusb-based USB transport.
pub struct NusbTransport {
    interface: Interface,
    in_endpoint: u8,
    vid: u16,
    pid: u16,
}

impl NusbTransport {
    /// Open the first attached device matching one of `supported`.
    #[instrument(level = "info", skip(supported))]
    pub fn open(supported: &[SupportedDevice]) -> Result<Self, TransportError> {
        let devices = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        for device_info in devices {
            if supported.iter().any(|d| {
                d.vendor_id == device_info.vendor_id() && d.product_id == device_info.product_id()
            }) {
                return Self::open_device_info(device_info);
            }
        }

        let (vid, pid) = supported
            .first()
            .map(|d| (d.vendor_id, d.product_id))
            .unwrap_or_default();
        Err(TransportError::DeviceNotFound { vid, pid })
    }

    /// Open a device with specific VID/PID.
    #[instrument(level = "info", fields(vid = format!("{:04X}", vid), pid = format!("{:04X}", pid)))]
    pub fn open_with_ids(vid: u16, pid: u16) -> Result<Self, TransportError> {
        let device_info = list_devices()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?
            .find(|d| d.vendor_id() == vid && d.product_id() == pid)
            .ok_or(TransportError::DeviceNotFound { vid, pid })?;

        Self::open_device_info(device_info)
    }

    fn open_device_info(device_info: nusb::DeviceInfo) -> Result<Self, TransportError> {
        let vid = device_info.vendor_id();
        let pid = device_info.product_id();

        info!(
            vendor_id = %format!("{:04X}", vid),
            product_id = %format!("{:04X}", pid),
            "Found scanner"
        );

        let device = device_info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;

        let interface =
            device
                .claim_interface(0)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: 0,
                    message: e.to_string(),
                })?;

        // The bridge exposes a single bulk IN endpoint for scan data
        let mut in_endpoint: u8 = 0;
        for config in device.configurations() {
            for iface in config.interfaces() {
                if iface.interface_number() != 0 {
                    continue;
                }
                for alt in iface.alt_settings() {
                    for ep in alt.endpoints() {
                        if ep.transfer_type() == nusb::descriptors::TransferType::Bulk
                            && ep.direction() == nusb::transfer::Direction::In
                        {
                            in_endpoint = ep.address();
                        }
                    }
                }
            }
        }

        if in_endpoint == 0 {
            return Err(TransportError::EndpointNotFound {
                ep_type: "Bulk".into(),
                direction: "In".into(),
            });
        }

        info!(
            in_ep = %format!("0x{:02X}", in_endpoint),
            "Scanner opened successfully"
        );

        Ok(Self {
            interface,
            in_endpoint,
            vid,
            pid,
        })
    }
}

impl UsbTransport for NusbTransport {
    fn control_out(&self, request: u8, value: u16, data: &[u8]) -> Result<(), TransportError> {
        trace!(request, value = %format!("0x{:04X}", value), len = data.len(), "Control out");
        self.interface
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: 0,
                    data,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))
    }

    fn control_in(&self, request: u8, value: u16, len: usize) -> Result<Vec<u8>, TransportError> {
        let data = self
            .interface
            .control_in(
                ControlIn {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request,
                    value,
                    index: 0,
                    length: len as u16,
                },
                CONTROL_TIMEOUT,
            )
            .wait()
            .map_err(|e| TransportError::ControlFailed(e.to_string()))?;
        trace!(request, value = %format!("0x{:04X}", value), data = ?data, "Control in");
        Ok(data)
    }

    #[instrument(skip(self), fields(max_len))]
    fn bulk_read(&self, max_len: usize) -> Result<Vec<u8>, TransportError> {
        let ep = self
            .interface
            .endpoint::<Bulk, In>(self.in_endpoint)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(max_len.max(512));
        let mut buf = vec![0u8; max_len];
        let mut filled = 0;
        while filled < max_len {
            let n = reader
                .read(&mut buf[filled..])
                .map_err(|e| TransportError::ReadFailed(e.to_string()))?;
            if n == 0 {
                break;
            }
            filled += n;
        }

        buf.truncate(filled);
        debug!(bytes_read = filled, "Bulk read complete");
        Ok(buf)
    }

    fn is_connected(&self) -> bool {
        // nusb has no liveness query; failures surface on the next transfer.
        true
    }

    fn vendor_id(&self) -> u16 {
        self.vid
    }

    fn product_id(&self) -> u16 {
        self.pid
    }
}
