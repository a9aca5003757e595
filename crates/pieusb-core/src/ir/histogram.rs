//! Normalized histograms and global threshold estimators.

use tracing::debug;

use super::{IrError, PlaneGeometry};

pub const HISTOGRAM_SHIFT: u8 = 8;
pub const HISTOGRAM_SIZE: usize = 1 << HISTOGRAM_SHIFT;

fn safe_ln(x: f64) -> f64 {
    if x > 0.0 { x.ln() } else { 0.0 }
}

/// Relative frequency of each of the 256 bins; the bins sum to 1.
#[derive(Debug, Clone, PartialEq)]
pub struct NormHistogram {
    bins: [f64; HISTOGRAM_SIZE],
    depth: u8,
}

impl NormHistogram {
    /// Bin every sample of `plane` by its top eight significant bits.
    pub fn from_plane(geometry: &PlaneGeometry, plane: &[u16]) -> Result<Self, IrError> {
        geometry.check(plane)?;
        let depth = geometry.depth;
        let mut counts = [0u64; HISTOGRAM_SIZE];
        for &v in plane {
            let bin = if depth >= HISTOGRAM_SHIFT {
                (v as usize) >> (depth - HISTOGRAM_SHIFT)
            } else {
                (v as usize) << (HISTOGRAM_SHIFT - depth)
            };
            counts[bin.min(HISTOGRAM_SIZE - 1)] += 1;
        }
        let term = 1.0 / plane.len() as f64;
        let mut bins = [0.0; HISTOGRAM_SIZE];
        for (b, c) in bins.iter_mut().zip(counts) {
            *b = c as f64 * term;
        }
        Ok(Self { bins, depth })
    }

    pub fn bins(&self) -> &[f64; HISTOGRAM_SIZE] {
        &self.bins
    }

    pub fn cumulative(&self) -> [f64; HISTOGRAM_SIZE] {
        let mut acc = [0.0; HISTOGRAM_SIZE];
        let mut sum = 0.0;
        for (a, b) in acc.iter_mut().zip(self.bins.iter()) {
            sum += b;
            *a = sum;
        }
        acc
    }

    /// Map a bin index back to a sample value at the plane's depth.
    fn scale(&self, bin: usize) -> u32 {
        if self.depth > HISTOGRAM_SHIFT {
            let step = 1u32 << (self.depth - HISTOGRAM_SHIFT);
            bin as u32 * step + step / 2
        } else {
            bin as u32
        }
    }

    /// Last bins whose cumulative frequency stays below `low` and `high`.
    pub fn bounds(&self, low: f64, high: f64) -> (usize, usize) {
        let mut lower = 0;
        let mut upper = 0;
        for (n, level) in self.cumulative().iter().enumerate() {
            if *level < low {
                lower = n;
            }
            if *level < high {
                upper = n;
            }
        }
        (lower, upper)
    }

    /// Yen's maximum correlation criterion.
    pub fn threshold_yen(&self) -> Result<u32, IrError> {
        let h = &self.bins;
        let p1 = self.cumulative();
        let mut p1_sq = [0.0; HISTOGRAM_SIZE];
        let mut p2_sq = [0.0; HISTOGRAM_SIZE];
        p1_sq[0] = h[0] * h[0];
        for i in 1..HISTOGRAM_SIZE {
            p1_sq[i] = p1_sq[i - 1] + h[i] * h[i];
        }
        for i in (0..HISTOGRAM_SIZE - 1).rev() {
            p2_sq[i] = p2_sq[i + 1] + h[i + 1] * h[i + 1];
        }

        let mut threshold = None;
        let mut max_crit = f64::NEG_INFINITY;
        for i in 0..HISTOGRAM_SIZE {
            let crit = -safe_ln(p1_sq[i] * p2_sq[i]) + 2.0 * safe_ln(p1[i] * (1.0 - p1[i]));
            if crit > max_crit {
                max_crit = crit;
                threshold = Some(i);
            }
        }
        let t = self.scale(threshold.ok_or(IrError::NoThreshold("Yen"))?);
        debug!(threshold = t, "Yen threshold");
        Ok(t)
    }

    /// Otsu's maximum between-class variance.
    pub fn threshold_otsu(&self) -> Result<u32, IrError> {
        let h = &self.bins;
        let cnh = self.cumulative();
        let mut mean = [0.0; HISTOGRAM_SIZE];
        for i in 1..HISTOGRAM_SIZE {
            mean[i] = mean[i - 1] + i as f64 * h[i];
        }
        let total_mean = mean[HISTOGRAM_SIZE - 1];
        let (first, last) = occupied_range(&cnh);

        let mut threshold = None;
        let mut max_bcv = 0.0;
        for i in first..=last {
            let diff = total_mean * cnh[i] - mean[i];
            let bcv = diff * diff / (cnh[i] * (1.0 - cnh[i]));
            if max_bcv < bcv {
                max_bcv = bcv;
                threshold = Some(i);
            }
        }
        let t = self.scale(threshold.ok_or(IrError::NoThreshold("Otsu"))?);
        debug!(threshold = t, "Otsu threshold");
        Ok(t)
    }

    /// Kapur's maximum entropy of background plus object.
    pub fn threshold_max_entropy(&self) -> Result<u32, IrError> {
        let h = &self.bins;
        let p1 = self.cumulative();
        let (first, last) = occupied_range(&p1);

        let mut threshold = None;
        let mut max_ent = f64::NEG_INFINITY;
        for it in first..=last {
            let p2 = 1.0 - p1[it];
            let background: f64 = h[..=it]
                .iter()
                .filter(|v| **v != 0.0)
                .map(|v| -(v / p1[it]) * (v / p1[it]).ln())
                .sum();
            let object: f64 = h[it + 1..]
                .iter()
                .filter(|v| **v != 0.0)
                .map(|v| -(v / p2) * (v / p2).ln())
                .sum();
            let total = background + object;
            if max_ent < total {
                max_ent = total;
                threshold = Some(it);
            }
        }
        let t = self.scale(threshold.ok_or(IrError::NoThreshold("maximum entropy"))?);
        debug!(threshold = t, "Maximum entropy threshold");
        Ok(t)
    }
}

/// First bin with mass and last bin with mass above it.
fn occupied_range(cumulative: &[f64; HISTOGRAM_SIZE]) -> (usize, usize) {
    let first = cumulative.iter().position(|c| *c != 0.0).unwrap_or(0);
    let last = (first..HISTOGRAM_SIZE)
        .rev()
        .find(|&i| 1.0 - cumulative[i] != 0.0)
        .unwrap_or(HISTOGRAM_SIZE - 1);
    (first, last)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_clusters(shift: u8) -> (PlaneGeometry, Vec<u16>) {
        let plane: Vec<u16> = (40..=60u16).chain(190..=210).map(|v| v << shift).collect();
        (PlaneGeometry::new(plane.len(), 1, 8 + shift), plane)
    }

    #[test]
    fn test_histogram_is_normalized() {
        let (geometry, plane) = two_clusters(0);
        let histo = NormHistogram::from_plane(&geometry, &plane).unwrap();
        let total: f64 = histo.bins().iter().sum();
        assert!((total - 1.0).abs() < 1e-9);
        assert!((histo.bins()[40] - 1.0 / 42.0).abs() < 1e-12);
    }

    #[test]
    fn test_thresholds_separate_clusters() {
        let (geometry, plane) = two_clusters(0);
        let histo = NormHistogram::from_plane(&geometry, &plane).unwrap();
        for t in [
            histo.threshold_otsu().unwrap(),
            histo.threshold_yen().unwrap(),
            histo.threshold_max_entropy().unwrap(),
        ] {
            assert!((60..190).contains(&t), "threshold {t}");
        }
        assert_eq!(histo.threshold_otsu().unwrap(), 60);
    }

    #[test]
    fn test_deep_thresholds_are_scaled() {
        let (geometry, plane) = two_clusters(8);
        let histo = NormHistogram::from_plane(&geometry, &plane).unwrap();
        assert_eq!(histo.threshold_otsu().unwrap(), 60 * 256 + 128);
    }

    #[test]
    fn test_uniform_plane_has_no_otsu_threshold() {
        let geometry = PlaneGeometry::new(4, 4, 8);
        let histo = NormHistogram::from_plane(&geometry, &[100; 16]).unwrap();
        assert_eq!(histo.threshold_otsu(), Err(IrError::NoThreshold("Otsu")));
    }

    #[test]
    fn test_bounds() {
        let geometry = PlaneGeometry::new(100, 1, 8);
        let plane: Vec<u16> = (0..100).collect();
        let histo = NormHistogram::from_plane(&geometry, &plane).unwrap();
        assert_eq!(histo.bounds(0.055, 0.555), (4, 54));
        assert_eq!(histo.bounds(0.0, 0.0), (0, 0));
    }

    #[test]
    fn test_size_mismatch() {
        let geometry = PlaneGeometry::new(4, 4, 8);
        assert_eq!(
            NormHistogram::from_plane(&geometry, &[0; 3]),
            Err(IrError::SizeMismatch {
                expected: 16,
                actual: 3
            })
        );
    }
}
