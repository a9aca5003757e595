//! Removal of the red spectral overlap from the infrared plane.
//!
//! The infrared channel of a film scanner also picks up some of the red
//! image. The overlap is modelled as `ir = a * ln(red) + b`, fitted by least
//! squares over random samples, and `a * ln(red)` is subtracted.

use rand::Rng;
use tracing::{debug, warn};

use super::histogram::NormHistogram;
use super::{IrError, PlaneGeometry};

/// Cap on the number of random samples used for the fit.
pub const SAMPLE_SIZE: usize = 40_000;

/// Attempts per wanted sample before the fit gives up on dark planes.
const SAMPLE_ATTEMPTS: usize = 64;

/// Natural logarithm of every sample value, with `ln(0) = ln(1) = 0`.
#[derive(Debug, Clone)]
pub struct LnTable(Vec<f64>);

impl LnTable {
    pub fn new(depth: u8) -> Self {
        let len = 1usize << depth.min(16);
        let table = (0..len)
            .map(|i| if i < 2 { 0.0 } else { (i as f64).ln() })
            .collect();
        Self(table)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, value: u16) -> f64 {
        self.0.get(value as usize).copied().unwrap_or(0.0)
    }
}

/// Result of the regression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpectralFit {
    /// Samples that entered the fit.
    pub samples: usize,
    /// `a` in `ir = a * ln(red) + b`.
    pub slope: f64,
    /// `b` in `ir = a * ln(red) + b`.
    pub intercept: f64,
    /// Infrared values at or below this were excluded as opaque.
    pub noise_floor: u32,
}

/// Half the lowest of the three global thresholds of the infrared plane.
fn noise_floor(histogram: &NormHistogram) -> u32 {
    [
        histogram.threshold_max_entropy(),
        histogram.threshold_otsu(),
        histogram.threshold_yen(),
    ]
    .into_iter()
    .filter_map(Result::ok)
    .min()
    .map_or(0, |t| t / 2)
}

/// Subtract the fitted red overlap from `ir` and stretch the result back to
/// the full range of the depth.
///
/// A plane with no samples above the noise floor is left unchanged.
pub fn spectral_clean<R: Rng + ?Sized>(
    geometry: &PlaneGeometry,
    ln: &LnTable,
    red: &[u16],
    ir: &mut [u16],
    rng: &mut R,
) -> Result<SpectralFit, IrError> {
    geometry.check(red)?;
    geometry.check(ir)?;
    let itop = geometry.pixels();

    let floor = noise_floor(&NormHistogram::from_plane(geometry, ir)?);
    debug!(noise_floor = floor, "Spectral clean low threshold");

    let wanted = (itop / 2).clamp(1, SAMPLE_SIZE);
    let mut n = 0usize;
    let (mut isum, mut rsum, mut rrsum, mut risum) = (0.0f64, 0.0f64, 0.0f64, 0.0f64);
    for _ in 0..wanted * SAMPLE_ATTEMPTS {
        if n == wanted {
            break;
        }
        let i = rng.gen_range(0..itop);
        let ival = ir[i] as u32;
        if ival > floor {
            let rval = ln.get(red[i]);
            let ival = ival as f64;
            isum += ival;
            rsum += rval;
            rrsum += rval * rval;
            risum += rval * ival;
            n += 1;
        }
    }
    if n < 2 {
        warn!(samples = n, "Too few infrared samples above noise floor, skipping spectral clean");
        return Ok(SpectralFit {
            samples: n,
            slope: 0.0,
            intercept: 0.0,
            noise_floor: floor,
        });
    }

    let nf = n as f64;
    let denominator = nf * rrsum - rsum * rsum;
    let slope = if denominator != 0.0 {
        (nf * risum - rsum * isum) / denominator
    } else {
        0.0
    };
    let intercept = (isum - slope * rsum) / nf;
    debug!(samples = n, slope, intercept, "ired(red) = slope * ln(red) + intercept");

    let corrected: Vec<i64> = ir
        .iter()
        .zip(red)
        .map(|(&i, &r)| i as i64 - (slope * ln.get(r) + 0.5) as i64)
        .collect();
    let imin = corrected.iter().copied().min().unwrap_or(0);
    let imax = corrected.iter().copied().max().unwrap_or(0);
    let factor = geometry.max_value() as f64 / (imax - imin).max(1) as f64;
    for (dst, v) in ir.iter_mut().zip(corrected) {
        *dst = ((v - imin) as f64 * factor) as u16;
    }

    Ok(SpectralFit {
        samples: n,
        slope,
        intercept,
        noise_floor: floor,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_ln_table() {
        let ln = LnTable::new(8);
        assert_eq!(ln.len(), 256);
        assert_eq!(ln.get(0), 0.0);
        assert_eq!(ln.get(1), 0.0);
        assert!((ln.get(100) - 100f64.ln()).abs() < 1e-12);
    }

    #[test]
    fn test_fit_recovers_overlap() {
        let mut rng = StdRng::seed_from_u64(7);
        let geometry = PlaneGeometry::new(64, 64, 8);
        let red: Vec<u16> = (0..geometry.pixels()).map(|_| rng.gen_range(1..=255)).collect();
        let mut ir: Vec<u16> = red
            .iter()
            .map(|&r| (100.0 + 20.0 * (r as f64).ln()).round() as u16)
            .collect();

        let ln = LnTable::new(8);
        let fit = spectral_clean(&geometry, &ln, &red, &mut ir, &mut rng).unwrap();
        assert_eq!(fit.samples, geometry.pixels() / 2);
        assert!((fit.slope - 20.0).abs() < 0.1, "slope {}", fit.slope);
        assert!((fit.intercept - 100.0).abs() < 1.0, "intercept {}", fit.intercept);
    }

    #[test]
    fn test_result_is_stretched_to_depth() {
        let mut rng = StdRng::seed_from_u64(3);
        let geometry = PlaneGeometry::new(32, 32, 8);
        let red: Vec<u16> = (0..geometry.pixels()).map(|_| rng.gen_range(1..=255)).collect();
        let mut ir: Vec<u16> = (0..geometry.pixels()).map(|i| 60 + (i % 101) as u16).collect();

        let ln = LnTable::new(8);
        spectral_clean(&geometry, &ln, &red, &mut ir, &mut rng).unwrap();
        assert_eq!(ir.iter().copied().min(), Some(0));
        assert!(ir.iter().copied().max().unwrap() >= 254);
    }

    #[test]
    fn test_dark_plane_is_left_alone() {
        let mut rng = StdRng::seed_from_u64(1);
        let geometry = PlaneGeometry::new(8, 8, 8);
        let red = vec![200u16; 64];
        let mut ir = vec![0u16; 64];
        let fit = spectral_clean(&geometry, &LnTable::new(8), &red, &mut ir, &mut rng).unwrap();
        assert_eq!(fit.samples, 0);
        assert!(ir.iter().all(|&v| v == 0));
    }
}
