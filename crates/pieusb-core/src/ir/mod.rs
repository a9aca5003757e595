//! Infrared cleaning pipeline.
//!
//! Works on single colour planes of 16-bit slots as stored by
//! [`SampleBuffer`](crate::buffer::SampleBuffer):
//!
//! - [`histogram`]: normalized 256-bin histograms and the Otsu, Yen and
//!   maximum-entropy threshold estimators
//! - [`spectral`]: removal of the red spectral overlap from the infrared plane
//! - [`filter`]: box mean filter and the adaptive mean-absolute-deviation
//!   noise detector
//! - [`distance`]: Manhattan distance maps, mask dilation, inpainting and
//!   crop suggestion

pub mod distance;
pub mod filter;
pub mod histogram;
pub mod spectral;

pub use distance::{CropEdges, DilateParams, DistanceMap, dilate, dilate_mean, find_crop, manhattan_dist};
pub use filter::{add_threshold, filter_madmean, filter_mean, mad_second_window};
pub use histogram::{HISTOGRAM_SIZE, NormHistogram};
pub use spectral::{LnTable, SAMPLE_SIZE, SpectralFit, spectral_clean};

use thiserror::Error;

/// Mask value of a clean pixel.
pub const MASK_CLEAN: u16 = 255;
/// Mask value of a dirty (noise) pixel.
pub const MASK_DIRTY: u16 = 0;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum IrError {
    #[error("Filter window must be odd sized, got {rows}x{cols}")]
    EvenWindow { rows: usize, cols: usize },

    #[error("Unsupported depth for infrared processing: {0} bits")]
    UnsupportedDepth(u8),

    #[error("Plane size mismatch: expected {expected} samples, got {actual}")]
    SizeMismatch { expected: usize, actual: usize },

    #[error("Empty plane")]
    EmptyPlane,

    #[error("No {0} threshold found")]
    NoThreshold(&'static str),

    #[error("Missing {0} plane")]
    MissingPlane(&'static str),
}

/// Dimensions and sample depth shared by all planes of one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaneGeometry {
    pub width: usize,
    pub height: usize,
    pub depth: u8,
}

impl PlaneGeometry {
    pub fn new(width: usize, height: usize, depth: u8) -> Self {
        Self {
            width,
            height,
            depth,
        }
    }

    pub fn pixels(&self) -> usize {
        self.width * self.height
    }

    /// Largest sample value at this depth.
    pub fn max_value(&self) -> u32 {
        (1u32 << self.depth.min(16)) - 1
    }

    pub(crate) fn check(&self, plane: &[u16]) -> Result<(), IrError> {
        if self.pixels() == 0 {
            return Err(IrError::EmptyPlane);
        }
        if plane.len() != self.pixels() {
            return Err(IrError::SizeMismatch {
                expected: self.pixels(),
                actual: plane.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn check_depth(&self) -> Result<(), IrError> {
        if (8..=16).contains(&self.depth) {
            Ok(())
        } else {
            Err(IrError::UnsupportedDepth(self.depth))
        }
    }
}
