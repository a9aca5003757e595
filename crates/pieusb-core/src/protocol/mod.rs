//! Protocol module - wire constants, command frames and payload records.

pub mod constants;
pub mod frame;
pub mod records;
pub mod status;

pub use constants::*;
pub use frame::{CommandFrame, DataPhase};
pub use records::{
    FrameError, HalftonePattern, Mode, ScanFrame, ScanParameters, ScannerProperties,
    ScannerState, Settings, ShadingParameters,
};
pub use status::{CommandOutcome, SenseInfo, SenseKey};
