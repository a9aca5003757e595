//! Event system for UI decoupling.
//!
//! Lets a CLI or GUI follow a scan without coupling to the session
//! internals.

use std::fmt;

use crate::ir::CropEdges;
use crate::state::ScanState;

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Long running operations that report progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    WaitReady,
    ShadingData,
    LineTransfer,
    Delivery,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::WaitReady => write!(f, "Waiting for device"),
            Operation::ShadingData => write!(f, "Shading data"),
            Operation::LineTransfer => write!(f, "Line transfer"),
            Operation::Delivery => write!(f, "Delivery"),
        }
    }
}

/// Events emitted by a scan session.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanEvent {
    /// Scanner opened and identified.
    DeviceConnected {
        vid: u16,
        pid: u16,
        product: String,
    },
    /// Session state changed.
    StateChanged { from: ScanState, to: ScanState },
    /// Progress of the current operation.
    Progress {
        operation: Operation,
        current: u64,
        total: u64,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Dark film edges were found.
    CropSuggested(CropEdges),
    /// The image is ready to be read.
    ImageReady { bytes: usize },
    /// The caller read the whole image.
    Complete,
    /// The scan was cancelled.
    Cancelled,
}

/// Observer trait for receiving scan events.
///
/// Implement this trait in your UI layer to receive updates.
pub trait ScanObserver: Send + Sync {
    /// Called when an event occurs.
    fn on_event(&self, event: &ScanEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl ScanObserver for NullObserver {
    fn on_event(&self, _event: &ScanEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl ScanObserver for TracingObserver {
    fn on_event(&self, event: &ScanEvent) {
        match event {
            ScanEvent::DeviceConnected { vid, pid, product } => {
                tracing::info!(vid = %format!("{:04X}", vid), pid = %format!("{:04X}", pid), product = %product, "Device connected");
            }
            ScanEvent::StateChanged { from, to } => {
                tracing::debug!(from = %from, to = %to, "Scan state changed");
            }
            ScanEvent::Progress {
                operation,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::debug!(operation = %operation, progress = %format!("{}%", pct), "Progress");
            }
            ScanEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            ScanEvent::CropSuggested(edges) => {
                tracing::info!(
                    top = edges.top,
                    bottom = edges.bottom,
                    left = edges.left,
                    right = edges.right,
                    "Crop suggested"
                );
            }
            ScanEvent::ImageReady { bytes } => {
                tracing::info!(bytes = bytes, "Image ready");
            }
            ScanEvent::Complete => {
                tracing::info!("Scan complete");
            }
            ScanEvent::Cancelled => {
                tracing::warn!("Scan cancelled");
            }
        }
    }
}
