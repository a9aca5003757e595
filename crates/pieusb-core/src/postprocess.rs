//! Infrared post-processing of a filled RGBI buffer: spectral correction
//! of the infrared plane, then dirt detection and inpainting of the
//! visible planes.

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::buffer::{Color, SampleBuffer};
use crate::ir::{
    CropEdges, DilateParams, IrError, LnTable, NormHistogram, PlaneGeometry, SpectralFit,
    add_threshold, dilate_mean, filter_madmean, spectral_clean, MASK_DIRTY,
};

/// Lower noise bound of the MAD filter at 8 bits.
const MAD_A: u32 = 20;
/// Upper noise bound of the MAD filter at 8 bits.
const MAD_B: u32 = 100;
/// Dirty pixels further than this from clean ones are not replaced.
const DIST_MAX: u32 = 500;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PostprocessError {
    #[error(transparent)]
    Ir(#[from] IrError),

    #[error("Post-processing cancelled")]
    Cancelled,
}

/// Where to suggest cropping dark film edges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropMode {
    #[default]
    None,
    /// Crop inside the dark edge.
    Inside,
    /// Crop at the outer end of the dark edge.
    Outside,
}

impl CropMode {
    fn inner(self) -> Option<bool> {
        match self {
            CropMode::None => None,
            CropMode::Inside => Some(true),
            CropMode::Outside => Some(false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostprocessConfig {
    /// Multiply acquired planes by the shading reference.
    pub correct_shading: bool,
    /// Remove the red overlap from the infrared plane.
    pub correct_infrared: bool,
    /// Detect dirt in the infrared plane and inpaint the visible planes.
    pub clean_image: bool,
    /// Film grain smoothing, 0 disables.
    pub smoothing: u8,
    pub crop: CropMode,
    /// Seed for random sampling and tie-breaking; random when absent.
    pub seed: Option<u64>,
}

impl Default for PostprocessConfig {
    fn default() -> Self {
        Self {
            correct_shading: true,
            correct_infrared: false,
            clean_image: false,
            smoothing: 0,
            crop: CropMode::None,
            seed: None,
        }
    }
}

impl PostprocessConfig {
    pub fn wants_infrared(&self) -> bool {
        self.correct_infrared || self.clean_image
    }
}

/// Smoothing window for a resolution and whether the whole image is smoothed.
pub fn smoothing_window(resolution: u16, level: u8) -> (usize, bool) {
    let mut window = (resolution as i32 / 540) | 1;
    let mut smooth = level > 0;
    if smooth {
        window += 2 * (level as i32 - 3);
        if window < 3 {
            smooth = false;
        }
    }
    (window.max(3) as usize, smooth)
}

/// Window of the dirt detecting filter.
pub fn filter_window(resolution: u16) -> usize {
    ((5 * resolution as usize / 300) | 1).max(3)
}

/// Dirt usually has soft edges which also need replacing.
pub fn dilation(resolution: u16) -> i32 {
    resolution as i32 / 1000 + 1
}

/// What the post-processing found.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PostprocessReport {
    pub spectral: Option<SpectralFit>,
    pub static_threshold: Option<u32>,
    /// Pixels flagged as dirt before dilation.
    pub dirty_pixels: usize,
    pub crop: Option<CropEdges>,
}

fn take_plane<'a>(
    planes: &mut [&'a mut [u16]],
    colors: &[Color],
    color: Color,
    name: &'static str,
) -> Result<&'a mut [u16], IrError> {
    colors
        .iter()
        .position(|&c| c == color)
        .map(|p| std::mem::take(&mut planes[p]))
        .ok_or(IrError::MissingPlane(name))
}

/// Run the configured stages on `buffer`. `cancelled` is polled between
/// stages.
#[instrument(skip_all, fields(resolution = resolution))]
pub fn run<R: Rng + ?Sized>(
    buffer: &mut SampleBuffer,
    resolution: u16,
    config: &PostprocessConfig,
    cancelled: impl Fn() -> bool,
    rng: &mut R,
) -> Result<PostprocessReport, PostprocessError> {
    let geometry = PlaneGeometry::new(buffer.width(), buffer.height(), buffer.depth());
    let (win_smooth, smooth) = smoothing_window(resolution, config.smoothing);
    debug!(win_smooth, smooth, "Smoothing window");
    let mut report = PostprocessReport::default();

    let colors = buffer.plane_colors().to_vec();
    let mut planes = buffer.planes_mut();
    let infrared = take_plane(&mut planes, &colors, Color::Infrared, "infrared")?;
    let red = take_plane(&mut planes, &colors, Color::Red, "red")?;

    if config.correct_infrared {
        let ln = LnTable::new(geometry.depth);
        report.spectral = Some(spectral_clean(&geometry, &ln, red, infrared, rng)?);
        if cancelled() {
            return Err(PostprocessError::Cancelled);
        }
    }

    if config.clean_image {
        let green = take_plane(&mut planes, &colors, Color::Green, "green")?;
        let blue = take_plane(&mut planes, &colors, Color::Blue, "blue")?;

        let histogram = NormHistogram::from_plane(&geometry, infrared)?;
        let static_threshold = match (histogram.threshold_yen(), histogram.threshold_otsu()) {
            (Ok(y), Ok(o)) => Some(y.min(o)),
            (Ok(t), Err(_)) | (Err(_), Ok(t)) => Some(t),
            (Err(e), Err(_)) => {
                warn!(error = %e, "No static dirt threshold");
                None
            }
        };
        report.static_threshold = static_threshold;

        let mut mask = filter_madmean(&geometry, infrared, filter_window(resolution), MAD_A, MAD_B)?;
        if let Some(t) = static_threshold {
            add_threshold(infrared, &mut mask, t);
        }
        report.dirty_pixels = mask.iter().filter(|&&m| m == MASK_DIRTY).count();
        info!(
            dirty = report.dirty_pixels,
            static_threshold, "Dirt mask created"
        );
        if cancelled() {
            return Err(PostprocessError::Cancelled);
        }

        let params = DilateParams {
            dist_max: DIST_MAX,
            expand: dilation(resolution),
            win_size: win_smooth,
            smooth,
            crop_inner: config.crop.inner(),
        };
        let mut visible: Vec<&mut [u16]> = vec![red, green, blue];
        report.crop = dilate_mean(&geometry, &mut visible, &mut mask, &params, rng)?;
        if let Some(crop) = report.crop {
            info!(?crop, "Suggested crop");
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::ColorMask;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    const SIZE: usize = 16;

    fn speckled_buffer() -> SampleBuffer {
        let mut buffer = SampleBuffer::new(SIZE, SIZE, ColorMask::RGBI, 8).unwrap();
        for color in Color::ALL {
            let clean = if color == Color::Infrared { 200 } else { 100 };
            let dirt = if color == Color::Infrared { 10 } else { 0 };
            for row in 0..SIZE {
                let mut line = vec![clean; SIZE];
                if row == 8 {
                    line[8] = dirt;
                }
                buffer.put_single_color_line(color, &line).unwrap();
            }
        }
        buffer
    }

    #[test]
    fn test_windows_follow_resolution() {
        assert_eq!(smoothing_window(300, 0), (3, false));
        assert_eq!(smoothing_window(3600, 0), (7, false));
        assert_eq!(smoothing_window(3600, 5), (11, true));
        assert_eq!(smoothing_window(300, 2), (3, false));
        assert_eq!(filter_window(300), 5);
        assert_eq!(filter_window(100), 3);
        assert_eq!(filter_window(7200), 121);
        assert_eq!(dilation(300), 1);
        assert_eq!(dilation(3600), 4);
    }

    #[test]
    fn test_clean_image_removes_speck() {
        let mut buffer = speckled_buffer();
        let config = PostprocessConfig {
            clean_image: true,
            crop: CropMode::Inside,
            ..Default::default()
        };
        let report = run(&mut buffer, 300, &config, || false, &mut StdRng::seed_from_u64(11)).unwrap();

        assert_eq!(report.dirty_pixels, 1);
        assert!(report.crop.is_some());
        for color in [Color::Red, Color::Green, Color::Blue] {
            let plane = buffer.plane(color).unwrap();
            assert!(plane.iter().all(|&v| v == 100), "{color} not cleaned");
        }
    }

    #[test]
    fn test_cancel_between_stages() {
        let mut buffer = speckled_buffer();
        let config = PostprocessConfig {
            correct_infrared: true,
            clean_image: true,
            ..Default::default()
        };
        let result = run(&mut buffer, 300, &config, || true, &mut StdRng::seed_from_u64(0));
        assert_eq!(result, Err(PostprocessError::Cancelled));
    }

    #[test]
    fn test_requires_infrared_plane() {
        let mut buffer = SampleBuffer::new(4, 4, ColorMask::RGB, 8).unwrap();
        let config = PostprocessConfig {
            clean_image: true,
            ..Default::default()
        };
        let result = run(&mut buffer, 300, &config, || false, &mut StdRng::seed_from_u64(0));
        assert_eq!(
            result,
            Err(PostprocessError::Ir(IrError::MissingPlane("infrared")))
        );
    }

    #[test]
    fn test_spectral_stage_reports_fit() {
        let mut buffer = speckled_buffer();
        let config = PostprocessConfig {
            correct_infrared: true,
            ..Default::default()
        };
        let report = run(&mut buffer, 300, &config, || false, &mut StdRng::seed_from_u64(4)).unwrap();
        assert!(report.spectral.is_some());
        assert_eq!(report.crop, None);
    }
}
