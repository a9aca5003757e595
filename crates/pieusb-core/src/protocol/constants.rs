//! Protocol constants for the PIE/Reflecta USB-to-SCSI bridge.
//!
//! Register ports, status codes and opcodes as used by the scanner firmware.

// ============================================================================
// Device Identification
// ============================================================================

/// Vendor ID shared by all supported bridges (Genesys Logic).
pub const PIE_VENDOR_ID: u16 = 0x05E3;

/// Product ID of the CrystalScan/ProScan 7200 bridge.
pub const PRODUCT_ID_7200: u16 = 0x0145;
/// Product ID of the Reflecta 6000 multiple slide scanner bridge.
pub const PRODUCT_ID_6000: u16 = 0x0142;

/// INQUIRY model byte of the CrystalScan 7200.
pub const MODEL_CRYSTALSCAN_7200: u8 = 0x30;
/// INQUIRY model byte of the ProScan 7200.
pub const MODEL_PROSCAN_7200: u8 = 0x36;
/// INQUIRY model byte of the Reflecta 6000.
pub const MODEL_REFLECTA_6000: u8 = 0x3A;

// ============================================================================
// Control transfer requests and ports
// ============================================================================

/// Single-byte register access.
pub const REQUEST_REGISTER: u8 = 0x0C;
/// Buffer (bulk size) preamble.
pub const REQUEST_BUFFER: u8 = 0x04;

pub const PORT_SCSI_SIZE: u16 = 0x0082;
pub const PORT_SCSI_STATUS: u16 = 0x0084;
pub const PORT_SCSI_CMD: u16 = 0x0085;
/// IEEE1284 parallel control lines.
pub const PORT_PAR_CTRL: u16 = 0x0087;
/// IEEE1284 parallel data lines.
pub const PORT_PAR_DATA: u16 = 0x0088;

pub const C1284_NSTROBE: u8 = 0x01;
pub const C1284_NINIT: u8 = 0x04;

/// Bridge select sequence written before every IEEE1284 command byte.
pub const IEEE1284_PREAMBLE: [u8; 7] = [0xFF, 0xAA, 0x55, 0x00, 0xFF, 0x87, 0x78];

pub const IEEE1284_ADDR: u8 = 0x00;
pub const IEEE1284_RESET: u8 = 0x30;
pub const IEEE1284_SCSI: u8 = 0xE0;

// ============================================================================
// Size Constants
// ============================================================================

/// Length of a command header.
pub const SCSI_COMMAND_LEN: usize = 6;
/// Largest part announced with a single size preamble.
pub const MAX_BULK_PART: usize = 0x0100_0000;
/// Largest single bulk IN transfer.
pub const MAX_BULK_CHUNK: usize = 0x4000;
/// Length of REQUEST SENSE data.
pub const SENSE_LEN: usize = 14;
/// Most lines requested in one READ.
pub const MAX_LINES_PER_READ: usize = 255;
/// Number of shading channels reported by the device.
pub const SHADING_CHANNELS: usize = 4;
/// Calibration lines pulled in the first burst.
pub const SHADING_FIRST_BURST: usize = 4;

pub const MM_PER_INCH: f64 = 25.4;

// ============================================================================
// USB status register values
// ============================================================================

pub const USB_STATUS_OK: u8 = 0x00;
pub const USB_STATUS_READ: u8 = 0x01;
pub const USB_STATUS_CHECK: u8 = 0x02;
pub const USB_STATUS_BUSY: u8 = 0x03;
pub const USB_STATUS_AGAIN: u8 = 0x08;
pub const USB_STATUS_FAIL: u8 = 0x88;
pub const USB_STATUS_ERROR: u8 = 0xFF;

// ============================================================================
// Opcodes
// ============================================================================

pub const SCSI_TEST_UNIT_READY: u8 = 0x00;
pub const SCSI_REQUEST_SENSE: u8 = 0x03;
pub const SCSI_READ: u8 = 0x08;
pub const SCSI_WRITE: u8 = 0x0A;
pub const SCSI_PARAM: u8 = 0x0F;
pub const SCSI_INQUIRY: u8 = 0x12;
pub const SCSI_MODE_SELECT: u8 = 0x15;
pub const SCSI_COPY: u8 = 0x18;
pub const SCSI_MODE_SENSE: u8 = 0x1A;
pub const SCSI_SCAN: u8 = 0x1B;
pub const SCSI_SLIDE: u8 = 0xD1;
pub const SCSI_SET_SCAN_HEAD: u8 = 0xD2;
pub const SCSI_READ_GAIN_OFFSET: u8 = 0xD7;
pub const SCSI_WRITE_GAIN_OFFSET: u8 = 0xDC;
pub const SCSI_READ_STATE: u8 = 0xDD;

/// Human readable opcode name for logging.
pub fn opcode_name(opcode: u8) -> &'static str {
    match opcode {
        SCSI_TEST_UNIT_READY => "Test Unit Ready",
        0x01 => "Calibrate",
        SCSI_REQUEST_SENSE => "Request Sense",
        0x04 => "Format",
        SCSI_READ => "Read",
        SCSI_WRITE => "Write",
        SCSI_PARAM => "Get Param",
        0x10 => "Mark",
        0x11 => "Space",
        SCSI_INQUIRY => "Inquiry",
        SCSI_MODE_SELECT => "Mode Select",
        0x16 => "Reserve Unit",
        SCSI_COPY => "Copy",
        SCSI_MODE_SENSE => "Mode Sense",
        SCSI_SCAN => "Scan",
        0x1D => "Diagnose",
        0xA8 => "Read Extended",
        SCSI_SLIDE => "Slide",
        SCSI_SET_SCAN_HEAD => "Set Scan Head",
        SCSI_READ_GAIN_OFFSET => "Read Gain Offset",
        SCSI_WRITE_GAIN_OFFSET => "Write Gain Offset",
        SCSI_READ_STATE => "Read State",
        _ => "**unknown**",
    }
}

// ============================================================================
// WRITE sub-codes (bit 7 set = prepare data for a following READ)
// ============================================================================

pub const WRITE_PREPARE_READ: u8 = 0x80;
pub const WRITE_HALFTONE: u8 = 0x11;
pub const WRITE_SCAN_FRAME: u8 = 0x12;
pub const WRITE_EXPOSURE: u8 = 0x13;
pub const WRITE_HIGHLIGHT_SHADOW: u8 = 0x14;
pub const WRITE_CALIBRATION_INFO: u8 = 0x15;
pub const WRITE_CMD_17: u8 = 0x17;

/// Index used for the active scan frame.
pub const SCAN_FRAME_INDEX: u8 = 0x80;

// ============================================================================
// Slide actions
// ============================================================================

pub const SLIDE_NEXT: u8 = 0x04;
pub const SLIDE_PREV: u8 = 0x05;
pub const SLIDE_LAMP_ON: u8 = 0x10;
pub const SLIDE_RELOAD: u8 = 0x40;

// ============================================================================
// Mode fields
// ============================================================================

pub const PASS_RGBI: u8 = 0x90;
pub const PASS_COLOR: u8 = 0x80;
pub const PASS_IR: u8 = 0x10;
pub const PASS_B: u8 = 0x08;
pub const PASS_G: u8 = 0x04;
pub const PASS_R: u8 = 0x02;
pub const PASS_NEUTRAL: u8 = 0x01;

pub const FORMAT_INDEX: u8 = 0x04;
pub const FORMAT_LINE: u8 = 0x02;
pub const FORMAT_PIXEL: u8 = 0x01;

pub const QUALITY_SHARPEN: u8 = 0x02;
pub const QUALITY_SKIP_SHADING: u8 = 0x08;
pub const QUALITY_FAST_INFRARED: u8 = 0x80;

/// Exposure and highlight/shadow filter selectors.
pub const FILTER_RED: u16 = 2;
pub const FILTER_GREEN: u16 = 4;
pub const FILTER_BLUE: u16 = 8;

// ============================================================================
// Defaults
// ============================================================================

pub const DEFAULT_GAIN: u8 = 19;
pub const DEFAULT_EXPOSURE: u16 = 2937;
pub const DEFAULT_OFFSET: u8 = 0;
pub const DEFAULT_LIGHT: u8 = 4;
pub const DEFAULT_EXTRA_ENTRIES: u8 = 1;
pub const DEFAULT_DOUBLE_TIMES: u8 = 0;
/// Value pushed for every filter in exposure and highlight/shadow defaults.
pub const DEFAULT_FILTER_SETTING: u16 = 100;

/// CCD mask entry for a usable sensor pixel.
pub const CCD_PIXEL_USED: u8 = 0x00;
/// CCD mask entry for an unused sensor pixel.
pub const CCD_PIXEL_UNUSED: u8 = 0x70;
