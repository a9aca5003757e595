//! Manhattan distance maps, mask dilation, inpainting and crop suggestion.

use rand::Rng;
use tracing::debug;

use super::filter::filter_mean;
use super::{IrError, MASK_CLEAN, MASK_DIRTY, PlaneGeometry};

/// Per-pixel taxicab distance to the nearest pixel of the target class and
/// the linear index of that pixel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DistanceMap {
    pub distance: Vec<u32>,
    pub index: Vec<usize>,
}

/// Distances from every pixel to the nearest target pixel.
///
/// With `erode` the targets are clean pixels, otherwise dirty ones. Two
/// raster passes propagate `distance + 1` and the source index from already
/// visited neighbours; equal candidates are picked at random.
pub fn manhattan_dist<R: Rng + ?Sized>(
    geometry: &PlaneGeometry,
    mask: &[u16],
    erode: bool,
    rng: &mut R,
) -> DistanceMap {
    let target = if erode { MASK_CLEAN } else { MASK_DIRTY };
    let (cols, rows) = (geometry.width, geometry.height);
    let itop = rows * cols;
    let far = (cols + rows) as u32;
    let mut distance = vec![0u32; itop];
    let mut index: Vec<usize> = (0..itop).collect();

    for i in 0..rows {
        for j in 0..cols {
            let p = i * cols + j;
            if mask[p] == target {
                distance[p] = 0;
                continue;
            }
            distance[p] = far;
            if i > 0 && distance[p - cols] + 1 < distance[p] {
                distance[p] = distance[p - cols] + 1;
                index[p] = index[p - cols];
            }
            if j > 0 {
                if distance[p - 1] + 1 < distance[p] {
                    distance[p] = distance[p - 1] + 1;
                    index[p] = index[p - 1];
                } else if distance[p - 1] + 1 == distance[p] && rng.gen_bool(0.5) {
                    index[p] = index[p - 1];
                }
            }
        }
    }

    for i in (0..rows).rev() {
        for j in (0..cols).rev() {
            let p = i * cols + j;
            if i + 1 < rows {
                let below = distance[p + cols] + 1;
                if below < distance[p] {
                    distance[p] = below;
                    index[p] = index[p + cols];
                } else if below == distance[p] && rng.gen_bool(0.5) {
                    index[p] = index[p + cols];
                }
            }
            if j + 1 < cols {
                let right = distance[p + 1] + 1;
                if right < distance[p] {
                    distance[p] = right;
                    index[p] = index[p + 1];
                } else if right == distance[p] && rng.gen_bool(0.5) {
                    index[p] = index[p + 1];
                }
            }
        }
    }

    DistanceMap { distance, index }
}

/// Grow the dirty regions of `mask` by `by` pixels, or shrink them when
/// `by` is negative.
pub fn dilate<R: Rng + ?Sized>(geometry: &PlaneGeometry, mask: &mut [u16], by: i32, rng: &mut R) {
    if by == 0 {
        return;
    }
    let grow = by > 0;
    let reach = by.unsigned_abs();
    let map = manhattan_dist(geometry, mask, !grow, rng);
    for (m, d) in mask.iter_mut().zip(&map.distance) {
        let near = *d <= reach;
        *m = match (grow, near) {
            (true, true) | (false, false) => MASK_DIRTY,
            _ => MASK_CLEAN,
        };
    }
}

/// Suggested crop rectangle, in pixels from each image edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropEdges {
    pub top: i32,
    pub bottom: i32,
    pub left: i32,
    pub right: i32,
}

/// Fit a line through the distances along each border, ignoring the outer
/// eighth at both ends, and take the larger (`inner`) or smaller end value.
///
/// `bottom` and `right` are returned as coordinates, not margins.
pub fn find_crop(geometry: &PlaneGeometry, distance: &[u32], inner: bool) -> CropEdges {
    let (width, height) = (geometry.width, geometry.height);
    let mut edges = [0i32; 4];

    for (side, edge) in edges.iter_mut().enumerate() {
        let (span, start, step) = if side < 2 {
            let row = if side == 1 { (height - 1) * width } else { 0 };
            (width, row, 1)
        } else {
            let col = if side == 3 { width - 1 } else { 0 };
            (height, col, width)
        };
        let off1 = span / 8;
        let off2 = span - off1;
        let n = (off2 - off1) as f64;

        let (mut sum_x, mut sum_y, mut sum_xx, mut sum_xy) = (0f64, 0f64, 0f64, 0f64);
        for i in off1..off2 {
            let y = distance[start + i * step] as f64;
            let x = i as f64;
            sum_x += x;
            sum_y += y;
            sum_xx += x * x;
            sum_xy += x * y;
        }
        let denominator = n * sum_xx - sum_x * sum_x;
        let b = if denominator != 0.0 {
            (n * sum_xy - sum_x * sum_y) / denominator
        } else {
            0.0
        };
        let a = (sum_y - b * sum_x) / n;
        debug!(side, a, b, "Crop regression y = a + b * x");

        let far_end = a + b * (span - 1) as f64;
        let value = if inner { a.max(far_end) } else { a.min(far_end) };
        *edge = (value + 0.5) as i32;
    }

    CropEdges {
        top: edges[0],
        bottom: height as i32 - edges[1],
        left: edges[2],
        right: width as i32 - edges[3],
    }
}

/// Inpainting parameters for [`dilate_mean`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DilateParams {
    /// Dirty pixels further than this from clean ones are kept.
    pub dist_max: u32,
    /// Grow the dirty regions by this many pixels first.
    pub expand: i32,
    /// Smoothing window, odd.
    pub win_size: usize,
    /// Smooth the whole plane instead of only the replaced pixels.
    pub smooth: bool,
    /// Compute a crop suggestion; `Some(true)` crops inside the dark edge.
    pub crop_inner: Option<bool>,
}

/// Replace dirty pixels of every plane by their nearest clean pixel and
/// blend them into their surroundings with a box filter.
pub fn dilate_mean<R: Rng + ?Sized>(
    geometry: &PlaneGeometry,
    planes: &mut [&mut [u16]],
    mask: &mut [u16],
    params: &DilateParams,
    rng: &mut R,
) -> Result<Option<CropEdges>, IrError> {
    geometry.check(mask)?;
    for plane in planes.iter() {
        geometry.check(plane)?;
    }
    debug!(?params, "Dilate mean");

    if params.expand > 0 {
        dilate(geometry, mask, params.expand, rng);
    }
    let map = manhattan_dist(geometry, mask, true, rng);
    let crop = params
        .crop_inner
        .map(|inner| find_crop(geometry, &map.distance, inner));

    let replaced = |d: u32| d != 0 && d <= params.dist_max;
    let mut smoothed = vec![0u16; geometry.pixels()];
    for color in planes.iter_mut() {
        for (i, &d) in map.distance.iter().enumerate() {
            if replaced(d) {
                color[i] = color[map.index[i]];
            }
        }
        filter_mean(geometry, color, &mut smoothed, params.win_size, params.win_size)?;
        if params.smooth {
            // A second pass turns the box into a triangular kernel.
            filter_mean(geometry, &smoothed, color, params.win_size, params.win_size)?;
        } else {
            for (i, &d) in map.distance.iter().enumerate() {
                if replaced(d) {
                    color[i] = smoothed[i];
                }
            }
        }
    }
    Ok(crop)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_distance_along_a_line() {
        let geometry = PlaneGeometry::new(5, 1, 8);
        let mask = [MASK_CLEAN, MASK_DIRTY, MASK_DIRTY, MASK_DIRTY, MASK_CLEAN];
        let mut rng = StdRng::seed_from_u64(0);
        let map = manhattan_dist(&geometry, &mask, true, &mut rng);
        assert_eq!(map.distance, vec![0, 1, 2, 1, 0]);
        assert_eq!(map.index[1], 0);
        assert_eq!(map.index[3], 4);
        assert!(map.index[2] == 0 || map.index[2] == 4);
    }

    #[test]
    fn test_distance_map_symmetry() {
        let geometry = PlaneGeometry::new(23, 17, 8);
        let mut rng = StdRng::seed_from_u64(42);
        let mask: Vec<u16> = (0..geometry.pixels())
            .map(|_| if rng.gen_bool(0.2) { MASK_DIRTY } else { MASK_CLEAN })
            .collect();
        let inverted: Vec<u16> = mask.iter().map(|&m| MASK_CLEAN - m).collect();

        let eroded = manhattan_dist(&geometry, &mask, true, &mut StdRng::seed_from_u64(1));
        let dilated = manhattan_dist(&geometry, &inverted, false, &mut StdRng::seed_from_u64(2));
        assert_eq!(eroded.distance, dilated.distance);
    }

    #[test]
    fn test_nearest_index_is_a_target() {
        let geometry = PlaneGeometry::new(9, 9, 8);
        let mut rng = StdRng::seed_from_u64(5);
        let mut mask = vec![MASK_DIRTY; 81];
        mask[0] = MASK_CLEAN;
        mask[80] = MASK_CLEAN;
        let map = manhattan_dist(&geometry, &mask, true, &mut rng);
        for (i, &idx) in map.index.iter().enumerate() {
            assert!(idx == 0 || idx == 80, "pixel {i} points at {idx}");
            let (r, c) = (i / 9, i % 9);
            let (tr, tc) = (idx / 9, idx % 9);
            assert_eq!(map.distance[i] as usize, r.abs_diff(tr) + c.abs_diff(tc));
        }
    }

    #[test]
    fn test_dilate_grows_dirt_into_a_diamond() {
        let geometry = PlaneGeometry::new(5, 5, 8);
        let mut mask = vec![MASK_CLEAN; 25];
        mask[12] = MASK_DIRTY;
        dilate(&geometry, &mut mask, 1, &mut StdRng::seed_from_u64(0));
        let dirty: Vec<usize> = (0..25).filter(|&i| mask[i] == MASK_DIRTY).collect();
        assert_eq!(dirty, vec![7, 11, 12, 13, 17]);

        dilate(&geometry, &mut mask, -1, &mut StdRng::seed_from_u64(0));
        assert_eq!(mask.iter().filter(|&&m| m == MASK_DIRTY).count(), 1);
        assert_eq!(mask[12], MASK_DIRTY);
    }

    #[test]
    fn test_find_crop_on_uniform_border() {
        let geometry = PlaneGeometry::new(16, 8, 8);
        let distance = vec![3u32; 128];
        let crop = find_crop(&geometry, &distance, true);
        assert_eq!(
            crop,
            CropEdges {
                top: 3,
                bottom: 5,
                left: 3,
                right: 13
            }
        );
    }

    #[test]
    fn test_dilate_mean_inpaints_speck() {
        let geometry = PlaneGeometry::new(5, 5, 8);
        let mut red = vec![100u16; 25];
        let mut green = vec![100u16; 25];
        let mut blue = vec![100u16; 25];
        red[12] = 0;
        green[12] = 0;
        blue[12] = 0;
        let mut mask = vec![MASK_CLEAN; 25];
        mask[12] = MASK_DIRTY;

        let params = DilateParams {
            dist_max: 500,
            expand: 0,
            win_size: 3,
            smooth: false,
            crop_inner: Some(false),
        };
        let mut planes: Vec<&mut [u16]> = vec![&mut red, &mut green, &mut blue];
        let crop = dilate_mean(&geometry, &mut planes, &mut mask, &params, &mut StdRng::seed_from_u64(9))
            .unwrap();
        assert!(crop.is_some());
        assert!(red.iter().all(|&v| v == 100));
        assert!(blue.iter().all(|&v| v == 100));
    }

    #[test]
    fn test_dilate_mean_rejects_even_window() {
        let geometry = PlaneGeometry::new(3, 3, 8);
        let mut plane = vec![0u16; 9];
        let mut mask = vec![MASK_CLEAN; 9];
        let params = DilateParams {
            dist_max: 10,
            expand: 0,
            win_size: 2,
            smooth: true,
            crop_inner: None,
        };
        let mut planes: Vec<&mut [u16]> = vec![&mut plane];
        assert_eq!(
            dilate_mean(&geometry, &mut planes, &mut mask, &params, &mut StdRng::seed_from_u64(0)),
            Err(IrError::EvenWindow { rows: 2, cols: 2 })
        );
    }
}
