//! Supported scanners and the device definition derived from INQUIRY.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::protocol::constants::*;
use crate::protocol::ScannerProperties;

/// One USB id / INQUIRY model combination this driver talks to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportedDevice {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Model number reported by INQUIRY.
    pub model: u8,
}

impl SupportedDevice {
    pub const fn new(vendor_id: u16, product_id: u16, model: u8) -> Self {
        Self {
            vendor_id,
            product_id,
            model,
        }
    }

    pub fn matches(&self, vendor_id: u16, product_id: u16, model: u16) -> bool {
        self.vendor_id == vendor_id && self.product_id == product_id && self.model as u16 == model
    }
}

/// Reflecta CrystalScan 7200, ProScan 7200 and 6000 Multiple Slide Scanner.
pub const DEFAULT_DEVICES: [SupportedDevice; 3] = [
    SupportedDevice::new(PIE_VENDOR_ID, PRODUCT_ID_7200, MODEL_CRYSTALSCAN_7200),
    SupportedDevice::new(PIE_VENDOR_ID, PRODUCT_ID_7200, MODEL_PROSCAN_7200),
    SupportedDevice::new(PIE_VENDOR_ID, PRODUCT_ID_6000, MODEL_REFLECTA_6000),
];

/// Built-in devices followed by `extra`, without duplicates.
pub fn supported_devices(extra: &[SupportedDevice]) -> Vec<SupportedDevice> {
    let mut list = DEFAULT_DEVICES.to_vec();
    for device in extra {
        if !list.contains(device) {
            list.push(device.clone());
        }
    }
    list
}

/// Capabilities and geometry of an opened scanner.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceDefinition {
    pub vendor: String,
    pub product: String,
    pub revision: String,
    pub vendor_id: u16,
    pub product_id: u16,
    pub model: u16,
    /// Resolution the frame coordinates are expressed in.
    pub maximum_resolution: u16,
    pub maximum_resolution_x: u16,
    pub maximum_resolution_y: u16,
    /// Scan bed size in inches.
    pub scan_bed_width: f64,
    pub scan_bed_height: f64,
    pub slide_top_left_x: u16,
    pub slide_top_left_y: u16,
    /// Slide size in inches.
    pub slide_width: f64,
    pub slide_height: f64,
    pub halftone_patterns: u8,
    pub color_filters: u8,
    pub color_depths: u8,
    pub color_formats: u8,
    pub image_formats: u8,
    pub scan_capabilities: u8,
    pub optional_devices: u8,
    pub enhancements: u8,
    pub gamma_bits: u8,
    pub fast_preview_resolution: u16,
    pub minimum_highlight: u8,
    pub maximum_shadow: u8,
    pub calibration_equation: u8,
    pub minimum_exposure: u32,
    pub maximum_exposure: u32,
    pub firmware_version: String,
    pub production: String,
    pub timestamp: String,
    pub signature: String,
}

impl DeviceDefinition {
    pub fn from_inquiry(props: &ScannerProperties, vendor_id: u16, product_id: u16) -> Self {
        let (maximum_resolution, res_x, res_y) = if props.max_resolution_y < 256 {
            // y is a multiplier of x
            let res = props.max_resolution_x.saturating_mul(props.max_resolution_y);
            (props.max_resolution_x, res, res)
        } else {
            (
                props.max_resolution_x.min(props.max_resolution_y),
                props.max_resolution_x,
                props.max_resolution_y,
            )
        };
        let per_inch = |units: u16| {
            if maximum_resolution == 0 {
                0.0
            } else {
                units as f64 / maximum_resolution as f64
            }
        };

        let definition = Self {
            vendor: props.vendor.clone(),
            product: props.product.clone(),
            revision: props.product_revision.clone(),
            vendor_id,
            product_id,
            model: props.model,
            maximum_resolution,
            maximum_resolution_x: res_x,
            maximum_resolution_y: res_y,
            scan_bed_width: per_inch(props.max_scan_width),
            scan_bed_height: per_inch(props.max_scan_height),
            slide_top_left_x: props.x0,
            slide_top_left_y: props.y0,
            slide_width: per_inch(props.x1.saturating_sub(props.x0)),
            slide_height: per_inch(props.y1.saturating_sub(props.y0)),
            halftone_patterns: props.halftones & 0x0F,
            color_filters: props.filters,
            color_depths: props.color_depths,
            color_formats: props.color_format,
            image_formats: props.image_format,
            scan_capabilities: props.scan_capability,
            optional_devices: props.optional_devices,
            enhancements: props.enhancements,
            gamma_bits: props.gamma_bits,
            fast_preview_resolution: props.preview_scan_resolution,
            minimum_highlight: props.minimum_highlight,
            maximum_shadow: props.maximum_shadow,
            calibration_equation: props.calibration_equation,
            minimum_exposure: props.minimum_exposure as u32,
            // The default exposure lies above the reported maximum otherwise.
            maximum_exposure: props.maximum_exposure as u32 * 4,
            firmware_version: props.firmware_version.clone(),
            production: props.production.clone(),
            timestamp: props.timestamp.clone(),
            signature: props.signature.clone(),
        };
        debug!(?definition, "Device definition");
        info!(
            vendor = %definition.vendor,
            product = %definition.product,
            revision = %definition.revision,
            model = %format!("0x{:02X}", definition.model),
            resolution = definition.maximum_resolution,
            "Scanner identified"
        );
        definition
    }

    /// Scan bed width in millimetres.
    pub fn bed_width_mm(&self) -> f64 {
        self.scan_bed_width * MM_PER_INCH
    }

    /// Scan bed height in millimetres.
    pub fn bed_height_mm(&self) -> f64 {
        self.scan_bed_height * MM_PER_INCH
    }

    /// Highest resolution a caller may request.
    pub fn max_dpi(&self) -> u16 {
        self.maximum_resolution_x.max(self.maximum_resolution_y)
    }
}
