//! pieusb-core: driver for PIE/Reflecta USB film scanners in Rust.
//!
//! The scanners sit behind a USB-to-parallel bridge that tunnels SCSI-like
//! commands. This crate drives a complete scan: bridge framing, device
//! commands, the scan state machine, shading calibration and infrared dirt
//! removal.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Constants, command frames, sense decoding, payload records
//! - **Transport**: USB communication abstraction (nusb, mock)
//! - **Engine**: Command round trips over the bridge and typed device commands
//! - **Buffer**: Planar sample storage filled line by line, read as a byte stream
//! - **Shading / Calibration**: Reference levels and gain/offset/exposure
//! - **IR**: Histogram thresholds, spectral correction, filters, inpainting
//! - **State**: Scan state machine and cancellation
//! - **Events**: Observer pattern for UI decoupling
//! - **Session**: High-level orchestrator
//!
//! # Example
//!
//! ```no_run
//! use pieusb_core::config::ScanConfig;
//! use pieusb_core::session::{ReadStatus, ScanSession, StartStatus};
//!
//! let config = ScanConfig::default();
//! let mut session = ScanSession::open_usb(&config).expect("no scanner");
//! if let StartStatus::Ready(params) = session.start().expect("scan failed") {
//!     println!("{}x{}", params.pixels_per_line, params.lines);
//!     while let ReadStatus::Data(chunk) = session.read(64 * 1024).expect("read failed") {
//!         println!("{} bytes", chunk.len());
//!     }
//! }
//! session.close();
//! ```

pub mod acquisition;
pub mod buffer;
pub mod calibration;
pub mod commands;
pub mod config;
pub mod device;
pub mod engine;
pub mod events;
pub mod ir;
pub mod options;
pub mod postprocess;
pub mod protocol;
pub mod session;
pub mod shading;
pub mod state;
pub mod transport;

// Re-exports for convenience
pub use buffer::{BufferError, Color, ColorMask, SampleBuffer};
pub use calibration::{CalibrationMode, GainAdjust, PreviewStats};
pub use config::{DeviceConfig, ScanConfig, TimingConfig};
pub use device::{DEFAULT_DEVICES, DeviceDefinition, SupportedDevice};
pub use engine::{CommandEngine, EngineTiming};
pub use events::{LogLevel, NullObserver, Operation, ScanEvent, ScanObserver, TracingObserver};
pub use ir::CropEdges;
pub use options::{
    FrameFormat, ImageParameters, OptionError, OptionId, OptionValue, ScanMode, ScanOptions,
};
pub use postprocess::{CropMode, PostprocessConfig};
pub use protocol::CommandOutcome;
pub use session::{ReadStatus, ScanSession, SessionError, StartStatus};
pub use shading::ShadingReference;
pub use state::{CancelHandle, ScanState};
pub use transport::{MockTransport, NusbTransport, TransportError, UsbTransport};
