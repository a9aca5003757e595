//! Command outcomes and sense data decoding.

use std::fmt;

use super::constants::SENSE_LEN;

/// Result of a command round trip, as seen by callers of the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Good,
    DeviceBusy,
    /// CHECK CONDITION whose sense data has no more specific meaning.
    CheckCondition(SenseInfo),
    IoError,
    Unsupported,
    Invalid,
    Cancelled,
    WarmingUp,
    MustCalibrate,
    HardwareLocked,
}

impl CommandOutcome {
    pub fn is_good(&self) -> bool {
        matches!(self, CommandOutcome::Good)
    }

    /// Convert to a `Result`, keeping the outcome as the error.
    pub fn into_result(self) -> Result<(), CommandOutcome> {
        match self {
            CommandOutcome::Good => Ok(()),
            other => Err(other),
        }
    }
}

impl fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandOutcome::Good => write!(f, "Good"),
            CommandOutcome::DeviceBusy => write!(f, "Device busy"),
            CommandOutcome::CheckCondition(sense) => write!(f, "Check condition ({sense})"),
            CommandOutcome::IoError => write!(f, "I/O error"),
            CommandOutcome::Unsupported => write!(f, "Unsupported"),
            CommandOutcome::Invalid => write!(f, "Invalid"),
            CommandOutcome::Cancelled => write!(f, "Cancelled"),
            CommandOutcome::WarmingUp => write!(f, "Warming up"),
            CommandOutcome::MustCalibrate => write!(f, "Must calibrate"),
            CommandOutcome::HardwareLocked => write!(f, "Hardware locked"),
        }
    }
}

/// SCSI sense keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenseKey {
    NoSense,
    RecoveredError,
    NotReady,
    MediumError,
    HardwareError,
    IllegalRequest,
    UnitAttention,
    DataProtect,
    BlankCheck,
    VendorSpecific,
    CopyAborted,
    AbortedCommand,
    Equal,
    VolumeOverflow,
    Miscompare,
    Completed,
}

impl SenseKey {
    pub fn from_nibble(value: u8) -> Self {
        match value & 0x0F {
            0x0 => SenseKey::NoSense,
            0x1 => SenseKey::RecoveredError,
            0x2 => SenseKey::NotReady,
            0x3 => SenseKey::MediumError,
            0x4 => SenseKey::HardwareError,
            0x5 => SenseKey::IllegalRequest,
            0x6 => SenseKey::UnitAttention,
            0x7 => SenseKey::DataProtect,
            0x8 => SenseKey::BlankCheck,
            0x9 => SenseKey::VendorSpecific,
            0xA => SenseKey::CopyAborted,
            0xB => SenseKey::AbortedCommand,
            0xC => SenseKey::Equal,
            0xD => SenseKey::VolumeOverflow,
            0xE => SenseKey::Miscompare,
            _ => SenseKey::Completed,
        }
    }
}

impl fmt::Display for SenseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SenseKey::NoSense => "No Sense",
            SenseKey::RecoveredError => "Recovered Error",
            SenseKey::NotReady => "Not Ready",
            SenseKey::MediumError => "Medium Error",
            SenseKey::HardwareError => "Hardware Error",
            SenseKey::IllegalRequest => "Illegal Request",
            SenseKey::UnitAttention => "Unit Attention",
            SenseKey::DataProtect => "Data Protect",
            SenseKey::BlankCheck => "Blank Check",
            SenseKey::VendorSpecific => "Vendor Specific",
            SenseKey::CopyAborted => "Copy Aborted",
            SenseKey::AbortedCommand => "Aborted Command",
            SenseKey::Equal => "Equal",
            SenseKey::VolumeOverflow => "Volume Overflow",
            SenseKey::Miscompare => "Miscompare",
            SenseKey::Completed => "Completed",
        };
        write!(f, "{name}")
    }
}

/// Decoded REQUEST SENSE response (14 bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SenseInfo {
    pub error_code: u8,
    pub segment: u8,
    pub key: SenseKey,
    pub info: [u8; 4],
    pub additional_length: u8,
    pub command_info: [u8; 4],
    pub code: u8,
    pub qualifier: u8,
}

impl SenseInfo {
    /// Parse sense bytes; missing trailing bytes read as zero.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut raw = [0u8; SENSE_LEN];
        let n = data.len().min(SENSE_LEN);
        raw[..n].copy_from_slice(&data[..n]);
        Self {
            error_code: raw[0],
            segment: raw[1],
            key: SenseKey::from_nibble(raw[2]),
            info: [raw[3], raw[4], raw[5], raw[6]],
            additional_length: raw[7],
            command_info: [raw[8], raw[9], raw[10], raw[11]],
            code: raw[12],
            qualifier: raw[13],
        }
    }

    /// Map sense data to the outcome callers act on.
    pub fn outcome(&self) -> CommandOutcome {
        match (self.key, self.code, self.qualifier) {
            (SenseKey::NotReady, 0x04, 0x01) => CommandOutcome::WarmingUp,
            (SenseKey::UnitAttention, 0x1A, 0x00)
            | (SenseKey::UnitAttention, 0x20, 0x00)
            | (SenseKey::UnitAttention, 0x26, 0x82)
            | (SenseKey::UnitAttention, 0x26, 0x83) => CommandOutcome::Invalid,
            (SenseKey::UnitAttention, 0x82, 0x00) => CommandOutcome::MustCalibrate,
            (SenseKey::UnitAttention, 0x00, 0x06) => CommandOutcome::IoError,
            _ => CommandOutcome::CheckCondition(self.clone()),
        }
    }

    /// Description of the known code/qualifier combinations.
    pub fn description(&self) -> &'static str {
        match (self.key, self.code, self.qualifier) {
            (SenseKey::NotReady, 0x04, 0x01) => "Logical unit is in the process of becoming ready",
            (SenseKey::UnitAttention, 0x1A, 0x00) => "Invalid field in parameter list",
            (SenseKey::UnitAttention, 0x20, 0x00) => "Invalid command operation code",
            (SenseKey::UnitAttention, 0x82, 0x00) => "Calibration disable not granted",
            (SenseKey::UnitAttention, 0x00, 0x06) => "I/O process terminated",
            (SenseKey::UnitAttention, 0x26, 0x82) => "MODE SELECT value invalid: resolution too high",
            (SenseKey::UnitAttention, 0x26, 0x83) => "MODE SELECT value invalid: select only one color",
            _ => "Unknown sense",
        }
    }
}

impl fmt::Display for SenseInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02X}/{:02X}: {}",
            self.key,
            self.code,
            self.qualifier,
            self.description()
        )
    }
}
