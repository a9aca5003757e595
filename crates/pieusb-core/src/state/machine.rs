//! Scan session states and the cooperative cancel flag.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Phase of a scan session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ScanState {
    /// No scan in progress.
    #[default]
    Idle,
    /// Waiting for the lamp and the device to become ready.
    WarmingUp,
    /// Pushing exposure, frame and mode.
    Configuring,
    /// Gain/offset and shading reference.
    Calibrating,
    /// Reading the CCD mask.
    MaskAcquiring,
    /// Reading scan lines.
    Transferring,
    /// Shading correction and infrared cleaning.
    PostProcessing,
    /// The image is handed out through `read`.
    Delivering,
    /// Stopped on request; returns to `Idle`.
    Cancelled,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanState::Idle => write!(f, "IDLE"),
            ScanState::WarmingUp => write!(f, "WARMING_UP"),
            ScanState::Configuring => write!(f, "CONFIGURING"),
            ScanState::Calibrating => write!(f, "CALIBRATING"),
            ScanState::MaskAcquiring => write!(f, "MASK_ACQUIRING"),
            ScanState::Transferring => write!(f, "TRANSFERRING"),
            ScanState::PostProcessing => write!(f, "POST_PROCESSING"),
            ScanState::Delivering => write!(f, "DELIVERING"),
            ScanState::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

impl ScanState {
    /// Whether `next` is a regular successor of this state. Any state may
    /// fall back to `Idle` or `Cancelled`.
    pub fn can_transition_to(self, next: ScanState) -> bool {
        use ScanState::*;
        if matches!(next, Idle | Cancelled) {
            return true;
        }
        matches!(
            (self, next),
            (Idle, WarmingUp)
                | (WarmingUp, Configuring)
                | (Configuring, Calibrating)
                | (Configuring, MaskAcquiring)
                | (Calibrating, MaskAcquiring)
                | (MaskAcquiring, Transferring)
                | (Transferring, PostProcessing)
                | (Transferring, Delivering)
                | (PostProcessing, Delivering)
        )
    }

    /// States in which the device is between start and stop.
    pub fn is_active(self) -> bool {
        !matches!(self, ScanState::Idle | ScanState::Cancelled)
    }
}

/// Clonable handle that requests cancellation of a running scan.
#[derive(Debug, Clone, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub(crate) fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Runtime state of a session.
#[derive(Debug, Default)]
pub struct ScanContext {
    /// Current session state.
    pub state: ScanState,
    /// Set from `start` until the image is read or the scan is cancelled.
    pub scanning: bool,
    /// A shading reference is available. It survives across scans until
    /// the device asks for a new calibration.
    pub shading_present: bool,
    pub cancel: CancelHandle,
}

impl ScanContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Transition to a new state, returning the previous one.
    pub fn goto_state(&mut self, new_state: ScanState) -> ScanState {
        if !self.state.can_transition_to(new_state) {
            tracing::warn!(from = %self.state, to = %new_state, "Unexpected state transition");
        }
        tracing::info!(from = %self.state, to = %new_state, "State transition");
        std::mem::replace(&mut self.state, new_state)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Back to `Idle` with the scan flags cleared.
    pub fn reset(&mut self) -> ScanState {
        self.scanning = false;
        self.cancel.reset();
        self.goto_state(ScanState::Idle)
    }
}
