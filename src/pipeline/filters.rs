/// Grid filters running on the downsampled depth and label buffers.
/// All of them write into a caller provided destination so the detector
/// can ping-pong between its scratch buffers without allocating.

use types::{depth_is_valid, BEYOND_RANGE, MAX_SENSOR_DEPTH, NUM_LABELS};

/// Block-averages the raw depth frame by an integer factor. Only valid
/// source pixels contribute; a block without a single valid pixel is
/// marked BEYOND_RANGE so it cannot be mistaken for missing sensor data.
pub fn downsample_depth(dst: &mut [i16],
                        src: &[i16],
                        width: usize,
                        height: usize,
                        factor: usize) {
    let down_width = width / factor;
    for v in (0..height).step_by(factor) {
        for u in (0..width).step_by(factor) {
            let mut sum = 0f32;
            let mut num_valid = 0u32;
            for v_offset in 0..factor {
                for u_offset in 0..factor {
                    let d = src[(v + v_offset) * width + u + u_offset];
                    if depth_is_valid(d) {
                        sum += d as f32;
                        num_valid += 1;
                    }
                }
            }
            dst[(v / factor) * down_width + u / factor] = if num_valid > 0 {
                (sum / num_valid as f32) as i16
            } else {
                BEYOND_RANGE
            };
        }
    }
}

/// Replicates every downsampled label over its source block.
pub fn upsample_labels(dst: &mut [u8],
                       src: &[u8],
                       down_width: usize,
                       down_height: usize,
                       factor: usize) {
    let width = down_width * factor;
    for v in 0..down_height {
        for u in 0..down_width {
            let label = src[v * down_width + u];
            for v_offset in 0..factor {
                let row = (v * factor + v_offset) * width + u * factor;
                for u_offset in 0..factor {
                    dst[row + u_offset] = label;
                }
            }
        }
    }
}

/// Plus-shaped erosion: any positive pixel within `radius` of a zero
/// pixel horizontally or vertically becomes zero. Radius 0 is a copy.
pub fn shrink_filter(dst: &mut [u8], src: &[u8], width: usize, height: usize, radius: usize) {
    dst.copy_from_slice(src);
    if radius == 0 {
        return;
    }
    for v in 0..height {
        for u in 0..width {
            if src[v * width + u] == 0 {
                let lo = u.saturating_sub(radius);
                let hi = if u + radius < width { u + radius } else { width - 1 };
                for u_offset in lo..hi + 1 {
                    dst[v * width + u_offset] = 0;
                }
            }
        }
    }
    for v in 0..height {
        for u in 0..width {
            if src[v * width + u] == 0 {
                let lo = v.saturating_sub(radius);
                let hi = if v + radius < height { v + radius } else { height - 1 };
                for v_offset in lo..hi + 1 {
                    dst[v_offset * width + u] = 0;
                }
            }
        }
    }
}

/// Plus-shaped dilation, the counterpart of `shrink_filter`.
pub fn grow_filter(dst: &mut [u8], src: &[u8], width: usize, height: usize, radius: usize) {
    dst.copy_from_slice(src);
    if radius == 0 {
        return;
    }
    for v in 0..height {
        for u in 0..width {
            let label = src[v * width + u];
            if label != 0 {
                let lo = u.saturating_sub(radius);
                let hi = if u + radius < width { u + radius } else { width - 1 };
                for u_offset in lo..hi + 1 {
                    dst[v * width + u_offset] = label;
                }
            }
        }
    }
    for v in 0..height {
        for u in 0..width {
            let label = src[v * width + u];
            if label != 0 {
                let lo = v.saturating_sub(radius);
                let hi = if v + radius < height { v + radius } else { height - 1 };
                for v_offset in lo..hi + 1 {
                    dst[v_offset * width + u] = label;
                }
            }
        }
    }
}

/// Like `grow_filter`, but a label only spreads onto pixels whose depth
/// is within `depth_thresh` of the seed pixel. Keeps a hand label from
/// bleeding over a depth discontinuity onto the background.
pub fn grow_filter_depth_threshold(dst: &mut [u8],
                                   src: &[u8],
                                   depth: &[i16],
                                   width: usize,
                                   height: usize,
                                   radius: usize,
                                   depth_thresh: i16) {
    dst.copy_from_slice(src);
    if radius == 0 {
        return;
    }
    for v in 0..height {
        for u in 0..width {
            let index = v * width + u;
            let label = src[index];
            if label != 0 && depth_is_valid(depth[index]) {
                let lo = u.saturating_sub(radius);
                let hi = if u + radius < width { u + radius } else { width - 1 };
                for u_offset in lo..hi + 1 {
                    let target = v * width + u_offset;
                    if depth_is_valid(depth[target]) &&
                       (depth[target] - depth[index]).abs() < depth_thresh {
                        dst[target] = label;
                    }
                }
            }
        }
    }
    for v in 0..height {
        for u in 0..width {
            let index = v * width + u;
            let label = src[index];
            if label != 0 && depth_is_valid(depth[index]) {
                let lo = v.saturating_sub(radius);
                let hi = if v + radius < height { v + radius } else { height - 1 };
                for v_offset in lo..hi + 1 {
                    let target = v_offset * width + u;
                    if depth_is_valid(depth[target]) &&
                       (depth[target] - depth[index]).abs() < depth_thresh {
                        dst[target] = label;
                    }
                }
            }
        }
    }
}

/// Majority vote over the labels of valid-depth neighbors within
/// `radius`. Pixels with invalid depth are forced to background, and so
/// are pixels without a single valid neighbor. Ties pick the lowest
/// label.
pub fn median_label_filter(dst: &mut [u8],
                           src: &[u8],
                           depth: &[i16],
                           width: usize,
                           height: usize,
                           radius: usize) {
    for v in 0..height {
        for u in 0..width {
            let index = v * width + u;
            if !depth_is_valid(depth[index]) {
                dst[index] = 0;
                continue;
            }
            let mut counts = [0u32; NUM_LABELS];
            let v_lo = v.saturating_sub(radius);
            let v_hi = if v + radius < height { v + radius } else { height - 1 };
            let u_lo = u.saturating_sub(radius);
            let u_hi = if u + radius < width { u + radius } else { width - 1 };
            for v_offset in v_lo..v_hi + 1 {
                for u_offset in u_lo..u_hi + 1 {
                    let neighbor = v_offset * width + u_offset;
                    if depth_is_valid(depth[neighbor]) {
                        counts[src[neighbor] as usize] += 1;
                    }
                }
            }
            let mut best = 0;
            for i in 1..NUM_LABELS {
                if counts[i] > counts[best] {
                    best = i;
                }
            }
            dst[index] = best as u8;
        }
    }
}

/// Clears any positive label whose neighborhood spans a depth step
/// larger than `depth_thresh`, or touches invalid depth. Runs at source
/// resolution after upsampling, in place.
pub fn discontinuity_filter(labels: &mut [u8],
                            depth: &[i16],
                            width: usize,
                            height: usize,
                            radius: usize,
                            depth_thresh: i16) {
    if radius == 0 {
        return;
    }
    for v in 0..height {
        for u in 0..width {
            let index = v * width + u;
            if labels[index] != 1 {
                continue;
            }
            let mut depth_min = MAX_SENSOR_DEPTH;
            let mut depth_max = 0i16;
            let v_lo = v.saturating_sub(radius);
            let v_hi = if v + radius < height { v + radius } else { height - 1 };
            let u_lo = u.saturating_sub(radius);
            let u_hi = if u + radius < width { u + radius } else { width - 1 };
            for v_offset in v_lo..v_hi + 1 {
                for u_offset in u_lo..u_hi + 1 {
                    let d = depth[v_offset * width + u_offset];
                    if !depth_is_valid(d) {
                        depth_min = 0;
                        depth_max = MAX_SENSOR_DEPTH;
                    } else {
                        if d > depth_max {
                            depth_max = d;
                        }
                        if d < depth_min {
                            depth_min = d;
                        }
                    }
                }
            }
            if depth_max - depth_min > depth_thresh {
                labels[index] = 0;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::BEYOND_RANGE;

    #[test]
    fn test_downsample_averages_valid_pixels() {
        // 4x2 -> 2x1 with factor 2. Left block has two valid pixels,
        // right block none.
        let src = vec![100i16, 200, 2000, 2000, 0, 0, 2000, 0];
        let mut dst = vec![0i16; 2];
        downsample_depth(&mut dst, &src, 4, 2, 2);
        assert_eq!(dst[0], 150);
        assert_eq!(dst[1], BEYOND_RANGE);
    }

    #[test]
    fn test_upsample_replicates() {
        let src = vec![0u8, 1];
        let mut dst = vec![9u8; 8];
        upsample_labels(&mut dst, &src, 2, 1, 2);
        assert_eq!(dst, vec![0, 0, 1, 1, 0, 0, 1, 1]);
    }

    #[test]
    fn test_shrink_radius_zero_is_noop() {
        let src = vec![1u8, 0, 1, 1, 1, 1, 0, 1, 1];
        let mut dst = vec![0u8; 9];
        shrink_filter(&mut dst, &src, 3, 3, 0);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_shrink_erodes_around_zero() {
        // A single zero in the middle wipes the full plus at radius 1.
        let src = vec![1u8, 1, 1, 1, 0, 1, 1, 1, 1];
        let mut dst = vec![0u8; 9];
        shrink_filter(&mut dst, &src, 3, 3, 1);
        assert_eq!(dst, vec![1, 0, 1, 0, 0, 0, 1, 0, 1]);
    }

    #[test]
    fn test_grow_radius_zero_is_noop() {
        let src = vec![0u8, 1, 0, 0, 0, 0, 0, 0, 0];
        let mut dst = vec![9u8; 9];
        grow_filter(&mut dst, &src, 3, 3, 0);
        assert_eq!(dst, src);
    }

    #[test]
    fn test_grow_dilates_plus() {
        let src = vec![0u8, 0, 0, 0, 1, 0, 0, 0, 0];
        let mut dst = vec![0u8; 9];
        grow_filter(&mut dst, &src, 3, 3, 1);
        assert_eq!(dst, vec![0, 1, 0, 1, 1, 1, 0, 1, 0]);
    }

    #[test]
    fn test_grow_respects_depth_threshold() {
        // The right neighbor sits 50mm deeper and must not be labelled.
        let src = vec![0u8, 1, 0];
        let depth = vec![1000i16, 1000, 1050];
        let mut dst = vec![0u8; 3];
        grow_filter_depth_threshold(&mut dst, &src, &depth, 3, 1, 1, 25);
        assert_eq!(dst, vec![1, 1, 0]);
    }

    #[test]
    fn test_median_invalid_depth_is_background() {
        let src = vec![1u8, 1, 1, 1];
        let depth = vec![1000i16, 0, 1000, 1000];
        let mut dst = vec![9u8; 4];
        median_label_filter(&mut dst, &src, &depth, 2, 2, 1);
        assert_eq!(dst[1], 0);
        assert_eq!(dst[0], 1);
    }

    #[test]
    fn test_median_majority_vote() {
        // Center pixel is an outlier against its 8 neighbors.
        let src = vec![0u8, 0, 0, 0, 1, 0, 0, 0, 0];
        let depth = vec![1000i16; 9];
        let mut dst = vec![9u8; 9];
        median_label_filter(&mut dst, &src, &depth, 3, 3, 1);
        assert_eq!(dst[4], 0);
    }

    #[test]
    fn test_discontinuity_filter_clears_edges() {
        // A labelled pixel next to a 100mm depth step loses its label,
        // one in a flat area keeps it.
        let width = 7;
        let mut depth = vec![1000i16; width];
        depth[6] = 1100;
        let mut labels = vec![1u8; width];
        discontinuity_filter(&mut labels, &depth, width, 1, 1, 25);
        assert_eq!(labels, vec![1, 1, 1, 1, 1, 0, 0]);
    }
}
