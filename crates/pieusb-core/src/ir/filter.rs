//! Box mean filter and adaptive noise detection.

use tracing::debug;

use super::{IrError, MASK_CLEAN, MASK_DIRTY, PlaneGeometry};

/// Second window of the MAD filter, a third larger than the first.
pub fn mad_second_window(win_size: usize) -> usize {
    ((win_size * 4) / 3) | 1
}

/// Mean over a `win_rows` x `win_cols` window centred on each pixel.
///
/// Windows are clipped at the borders and the mean is taken over the
/// pixels actually covered. Integer division truncates.
pub fn filter_mean(
    geometry: &PlaneGeometry,
    input: &[u16],
    output: &mut [u16],
    win_rows: usize,
    win_cols: usize,
) -> Result<(), IrError> {
    if win_rows % 2 == 0 || win_cols % 2 == 0 {
        return Err(IrError::EvenWindow {
            rows: win_rows,
            cols: win_cols,
        });
    }
    geometry.check(input)?;
    geometry.check(output)?;

    let (width, height) = (geometry.width, geometry.height);
    let hwr = win_rows / 2;
    let hwc = win_cols / 2;

    // Column sums over the vertical window of the current row.
    let mut sums = vec![0u64; width];
    let add_row = |sums: &mut [u64], row: usize, sign: bool| {
        for (s, &v) in sums.iter_mut().zip(&input[row * width..(row + 1) * width]) {
            if sign {
                *s += v as u64;
            } else {
                *s -= v as u64;
            }
        }
    };
    for row in 0..hwr.min(height) {
        add_row(&mut sums, row, true);
    }

    let mut prefix = vec![0u64; width + 1];
    for i in 0..height {
        if i + hwr < height {
            add_row(&mut sums, i + hwr, true);
        }
        if i > hwr {
            add_row(&mut sums, i - hwr - 1, false);
        }
        let nrow = ((i + hwr).min(height - 1) - i.saturating_sub(hwr) + 1) as u64;

        for j in 0..width {
            prefix[j + 1] = prefix[j] + sums[j];
        }
        let dest = &mut output[i * width..(i + 1) * width];
        for (j, d) in dest.iter_mut().enumerate() {
            let lo = j.saturating_sub(hwc);
            let hi = (j + hwc).min(width - 1);
            let ncol = (hi - lo + 1) as u64;
            *d = ((prefix[hi + 1] - prefix[lo]) / (ncol * nrow)) as u16;
        }
    }
    Ok(())
}

/// Noise map from the mean absolute deviation to the local mean.
///
/// A pixel is noise when its deviation reaches a threshold that runs from
/// `a_val` for flat surroundings up to `b_val` for busy ones. Both bounds
/// are given for 8-bit data and scaled to the depth. Noise is marked
/// [`MASK_DIRTY`], everything else [`MASK_CLEAN`].
pub fn filter_madmean(
    geometry: &PlaneGeometry,
    input: &[u16],
    win_size: usize,
    a_val: u32,
    b_val: u32,
) -> Result<Vec<u16>, IrError> {
    geometry.check_depth()?;
    geometry.check(input)?;
    let shift = geometry.depth - 8;
    let a_val = (a_val << shift) as f64;
    let b_val = (b_val << shift) as f64;

    let mut delta = vec![0u16; geometry.pixels()];
    filter_mean(geometry, input, &mut delta, win_size, win_size)?;
    for (d, &v) in delta.iter_mut().zip(input) {
        *d = (v as i32 - *d as i32).unsigned_abs() as u16;
    }

    let win2 = mad_second_window(win_size);
    let mut mad = vec![0u16; geometry.pixels()];
    filter_mean(geometry, &delta, &mut mad, win2, win2)?;
    debug!(win_size, win2, a_val, b_val, "MAD filter");

    let ab_term = (b_val - a_val) / b_val;
    let mask = delta
        .iter()
        .zip(&mad)
        .map(|(&d, &m)| {
            let m = m as f64;
            let threshold = if m >= b_val {
                a_val
            } else {
                (a_val + m * ab_term).trunc()
            };
            if d as f64 >= threshold { MASK_DIRTY } else { MASK_CLEAN }
        })
        .collect();
    Ok(mask)
}

/// Mark every pixel at or below `threshold` as dirty.
pub fn add_threshold(input: &[u16], mask: &mut [u16], threshold: u32) {
    for (m, &v) in mask.iter_mut().zip(input) {
        if v as u32 <= threshold {
            *m = MASK_DIRTY;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mean_of_constant_plane() {
        let geometry = PlaneGeometry::new(7, 5, 8);
        let input = vec![42u16; 35];
        let mut output = vec![0u16; 35];
        filter_mean(&geometry, &input, &mut output, 3, 5).unwrap();
        assert!(output.iter().all(|&v| v == 42));
    }

    #[test]
    fn test_mean_clips_window_at_borders() {
        let geometry = PlaneGeometry::new(5, 5, 8);
        let mut input = vec![0u16; 25];
        input[12] = 9;
        let mut output = vec![0u16; 25];
        filter_mean(&geometry, &input, &mut output, 3, 3).unwrap();
        assert_eq!(output[12], 1);
        assert_eq!(output[6], 1);
        assert_eq!(output[2], 0);
        assert_eq!(output[0], 0);

        input = vec![0u16; 25];
        input[0] = 8;
        filter_mean(&geometry, &input, &mut output, 3, 3).unwrap();
        assert_eq!(output[0], 2);
        assert_eq!(output[1], 1);
    }

    #[test]
    fn test_even_window_rejected() {
        let geometry = PlaneGeometry::new(4, 4, 8);
        let mut output = vec![0u16; 16];
        assert_eq!(
            filter_mean(&geometry, &[0; 16], &mut output, 4, 3),
            Err(IrError::EvenWindow { rows: 4, cols: 3 })
        );
    }

    #[test]
    fn test_mad_second_window() {
        assert_eq!(mad_second_window(5), 7);
        assert_eq!(mad_second_window(3), 5);
        assert_eq!(mad_second_window(9), 13);
    }

    #[test]
    fn test_madmean_flags_speck() {
        let geometry = PlaneGeometry::new(16, 16, 8);
        let mut input = vec![200u16; 256];
        input[8 * 16 + 8] = 20;
        let mask = filter_madmean(&geometry, &input, 5, 20, 100).unwrap();
        assert_eq!(mask[8 * 16 + 8], MASK_DIRTY);
        assert_eq!(mask[8 * 16 + 9], MASK_CLEAN);
        assert_eq!(mask[0], MASK_CLEAN);
        assert_eq!(mask.iter().filter(|&&m| m == MASK_DIRTY).count(), 1);
    }

    #[test]
    fn test_madmean_rejects_shallow_depth() {
        let geometry = PlaneGeometry::new(2, 2, 1);
        assert_eq!(
            filter_madmean(&geometry, &[0; 4], 3, 20, 100),
            Err(IrError::UnsupportedDepth(1))
        );
    }

    #[test]
    fn test_add_threshold() {
        let mut mask = vec![MASK_CLEAN; 4];
        add_threshold(&[10, 50, 51, 200], &mut mask, 50);
        assert_eq!(mask, vec![MASK_DIRTY, MASK_DIRTY, MASK_CLEAN, MASK_CLEAN]);
    }
}
