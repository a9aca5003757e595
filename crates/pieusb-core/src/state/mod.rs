//! Scan session state.

pub mod machine;

pub use machine::{CancelHandle, ScanContext, ScanState};
