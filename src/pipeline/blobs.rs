/// Connected component extraction over the filtered label grid, plus a
/// second fill mode that grows a hand region from a single known 3-D
/// point. Both share one array-backed queue and visited bitmap, sized
/// once for the source resolution.

use types::{depth_is_valid, dist_sq, Intrinsics};

/// Pixel offsets checked per fill step: an inner ring for connectivity
/// and an outer ring that can jump small holes. Real world units, the
/// actual pixel step is divided by the current depth.
const FILL_KERNEL_RINGS: usize = 16;

/// One connected component of positively labelled pixels. The centroid
/// is the pixel mean mapped back to source resolution; its depth is
/// averaged from the raw frame at the mapped pixel centers.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Blob {
    pub pixel_count: u32,
    pub centroid_u: f32,
    pub centroid_v: f32,
    pub centroid_depth: f32,
}

/// Which hands were found this frame and where, as (u, v, depth) in
/// source resolution.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HandsResult {
    pub left: Option<[f32; 3]>,
    pub right: Option<[f32; 3]>,
}

/// Thresholds of the seed flood fill. All distances in real world units
/// (mm for the kinect).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SeedFillConfig {
    /// Real world radius of the window searched for the closest point.
    pub seed_search_radius: f32,
    /// Lower bound of the search window radius in pixels.
    pub seed_search_min_uv: i32,
    /// No fill pixel may be further than this from the seed point.
    pub hand_radius: f32,
    /// Step discontinuity over which the fill never walks.
    pub background_thresh: f32,
    /// Real world radius of the outer kernel ring.
    pub coarse_radius: f32,
    /// Real world radius of the inner kernel ring.
    pub fine_radius: f32,
}

impl Default for SeedFillConfig {
    fn default() -> SeedFillConfig {
        SeedFillConfig {
            seed_search_radius: 20.0,
            seed_search_min_uv: 10,
            hand_radius: 150.0,
            background_thresh: 100.0,
            coarse_radius: 5000.0,
            fine_radius: 1.0,
        }
    }
}

/// Reusable flood fill state. One instance per detector, never shared
/// across threads.
pub struct BlobExtractor {
    src_width: usize,
    src_height: usize,
    down_width: usize,
    down_height: usize,
    downsample: usize,
    min_pts_per_blob: u32,
    queue: Vec<u32>,
    on_queue: Vec<u8>,
    blobs: Vec<Blob>,
}

impl BlobExtractor {
    pub fn new(src_width: usize,
               src_height: usize,
               downsample: usize,
               min_pts_per_blob: u32)
               -> BlobExtractor {
        BlobExtractor {
            src_width: src_width,
            src_height: src_height,
            down_width: src_width / downsample,
            down_height: src_height / downsample,
            downsample: downsample,
            min_pts_per_blob: min_pts_per_blob,
            queue: vec![0; src_width * src_height],
            on_queue: vec![0; src_width * src_height],
            blobs: Vec::new(),
        }
    }

    pub fn min_pts_per_blob(&self) -> u32 {
        self.min_pts_per_blob
    }

    pub fn set_min_pts_per_blob(&mut self, min_pts: u32) {
        self.min_pts_per_blob = min_pts;
    }

    /// Extracts all 8-connected components of label 1 pixels from the
    /// downsampled label grid, dropping those below the size threshold.
    /// `raw_depth` is the source resolution frame the centroid depth is
    /// sampled from.
    pub fn extract_blobs(&mut self, labels: &[u8], raw_depth: &[i16]) -> &[Blob] {
        let down_size = self.down_width * self.down_height;
        debug_assert_eq!(labels.len(), down_size);
        for flag in self.on_queue[..down_size].iter_mut() {
            *flag = 0;
        }
        self.blobs.clear();

        let mut head = 0;
        let mut tail = 0;
        for seed in 0..down_size {
            if labels[seed] != 1 || self.on_queue[seed] != 0 {
                continue;
            }
            // A pixel we have not visited yet seeds a new component.
            self.queue[tail] = seed as u32;
            self.on_queue[seed] = 1;
            tail += 1;

            let mut pixel_count = 0u32;
            let mut sum_u = 0u64;
            let mut sum_v = 0u64;
            let mut sum_depth = 0u64;
            let mut num_depth = 0u32;
            while head != tail {
                let index = self.queue[head] as usize;
                head += 1;
                let u = index % self.down_width;
                let v = index / self.down_width;
                pixel_count += 1;
                sum_u += u as u64;
                sum_v += v as u64;
                let raw_index = (v * self.downsample + self.downsample / 2) * self.src_width +
                                u * self.downsample + self.downsample / 2;
                if depth_is_valid(raw_depth[raw_index]) {
                    sum_depth += raw_depth[raw_index] as u64;
                    num_depth += 1;
                }

                for v_offset in -1i32..2 {
                    for u_offset in -1i32..2 {
                        if v_offset == 0 && u_offset == 0 {
                            continue;
                        }
                        self.enqueue_if_labeled(u as i32 + u_offset,
                                                v as i32 + v_offset,
                                                labels,
                                                &mut tail);
                    }
                }
            }

            if pixel_count >= self.min_pts_per_blob {
                let half = (self.downsample / 2) as f32;
                let ds = self.downsample as f32;
                self.blobs.push(Blob {
                    pixel_count: pixel_count,
                    centroid_u: sum_u as f32 / pixel_count as f32 * ds + half,
                    centroid_v: sum_v as f32 / pixel_count as f32 * ds + half,
                    centroid_depth: if num_depth > 0 {
                        sum_depth as f32 / num_depth as f32
                    } else {
                        0.0
                    },
                });
            }
        }
        &self.blobs
    }

    fn enqueue_if_labeled(&mut self, u: i32, v: i32, labels: &[u8], tail: &mut usize) {
        if u < 0 || u >= self.down_width as i32 || v < 0 || v >= self.down_height as i32 {
            return;
        }
        let index = v as usize * self.down_width + u as usize;
        if labels[index] == 1 && self.on_queue[index] == 0 {
            self.queue[*tail] = index as u32;
            self.on_queue[index] = 1;
            *tail += 1;
        }
    }

    /// Grows a hand region from a known (u, v, depth) point over the
    /// source resolution real world frame `xyz` (x, y, z triples per
    /// pixel, z <= 0 marking invalid). Marks hand pixels with 1 in
    /// `labels`, which the caller must have cleared. Returns false if no
    /// usable seed pixel exists near the given point.
    ///
    /// A neighbor joins the fill only if it stays within
    /// `config.hand_radius` of the seed AND within
    /// `config.background_thresh` of the pixel that discovered it.
    pub fn flood_fill_from_seed(&mut self,
                                seed_uvd: [f32; 3],
                                xyz: &[f32],
                                intrinsics: &Intrinsics,
                                config: &SeedFillConfig,
                                labels: &mut [u8])
                                -> bool {
        debug_assert_eq!(xyz.len(), self.src_width * self.src_height * 3);
        debug_assert_eq!(labels.len(), self.src_width * self.src_height);

        // The UV search radius covering `seed_search_radius` at the
        // seed's depth: push the seed sideways in world space and
        // project both points back.
        let seed_xyz = intrinsics.projective_to_real_world(seed_uvd);
        let off_uvd = intrinsics.real_world_to_projective([seed_xyz[0] -
                                                           config.seed_search_radius,
                                                           seed_xyz[1],
                                                           seed_xyz[2]]);
        let du = off_uvd[0] - seed_uvd[0];
        let dv = off_uvd[1] - seed_uvd[1];
        let mut radius = (du * du + dv * dv).sqrt() as i32;
        if radius < config.seed_search_min_uv {
            radius = config.seed_search_min_uv;
        }

        // The given point may sit on sensor noise; the fill starts from
        // the closest real point near it instead. Unsuccessful searches
        // double the radius a few times before giving up.
        let mut seed_index = None;
        for _ in 0..10 {
            seed_index = self.search_closest_point(seed_uvd, radius, xyz);
            if seed_index.is_some() {
                break;
            }
            radius *= 2;
        }
        let seed_index = match seed_index {
            Some(index) => index,
            None => {
                warn!("no valid seed pixel near ({}, {})", seed_uvd[0], seed_uvd[1]);
                return false;
            }
        };
        let seed_xyz = [xyz[seed_index * 3], xyz[seed_index * 3 + 1], xyz[seed_index * 3 + 2]];

        let kernel = fill_kernel(config);
        let hand_radius_sq = config.hand_radius * config.hand_radius;
        let background_thresh_sq = config.background_thresh * config.background_thresh;

        for flag in self.on_queue.iter_mut() {
            *flag = 0;
        }
        self.queue[0] = seed_index as u32;
        self.on_queue[seed_index] = 1;
        let mut head = 0;
        let mut tail = 1;
        while head != tail {
            let index = self.queue[head] as usize;
            head += 1;
            labels[index] = 1;
            let u = (index % self.src_width) as i32;
            let v = (index / self.src_width) as i32;
            let depth = xyz[index * 3 + 2];
            let cur_xyz = [xyz[index * 3], xyz[index * 3 + 1], depth];

            for &(ku, kv) in kernel.iter() {
                let nu = u + ceil_sym(ku / depth);
                let nv = v + ceil_sym(kv / depth);
                if nu < 0 || nu >= self.src_width as i32 || nv < 0 ||
                   nv >= self.src_height as i32 {
                    continue;
                }
                let neighbor = nv as usize * self.src_width + nu as usize;
                if self.on_queue[neighbor] != 0 {
                    continue;
                }
                let neighbor_xyz = [xyz[neighbor * 3],
                                    xyz[neighbor * 3 + 1],
                                    xyz[neighbor * 3 + 2]];
                if neighbor_xyz[2] > 0.0 && dist_sq(neighbor_xyz, seed_xyz) < hand_radius_sq &&
                   dist_sq(neighbor_xyz, cur_xyz) < background_thresh_sq {
                    self.queue[tail] = neighbor as u32;
                    self.on_queue[neighbor] = 1;
                    tail += 1;
                }
            }
        }
        true
    }

    /// Index of the closest valid point in a window around `center_uvd`,
    /// or None if every pixel there is invalid.
    fn search_closest_point(&self,
                            center_uvd: [f32; 3],
                            radius: i32,
                            xyz: &[f32])
                            -> Option<usize> {
        let center_u = round_sym(center_uvd[0]) as i32;
        let center_v = round_sym(center_uvd[1]) as i32;
        let u_min = clamp(center_u - radius, 0, self.src_width as i32 - 1);
        let u_max = clamp(center_u + radius, 0, self.src_width as i32 - 1);
        let v_min = clamp(center_v - radius, 0, self.src_height as i32 - 1);
        let v_max = clamp(center_v + radius, 0, self.src_height as i32 - 1);

        let mut best = None;
        let mut best_depth = ::std::f32::INFINITY;
        for v in v_min..v_max + 1 {
            for u in u_min..u_max + 1 {
                let index = v as usize * self.src_width + u as usize;
                let depth = xyz[index * 3 + 2];
                if depth > 1.0 && depth < best_depth {
                    best_depth = depth;
                    best = Some(index);
                }
            }
        }
        best
    }
}

/// Picks the one or two largest blobs and assigns them to hands. With
/// two, the smaller centroid U is the left hand; a single blob is
/// assigned by which image half its centroid falls into.
pub fn select_hands(blobs: &[Blob], src_width: usize) -> HandsResult {
    let (largest, second) = two_largest(blobs);
    let mut result = HandsResult::default();
    match (largest, second) {
        (None, _) => (),
        (Some(a), None) => {
            if a.centroid_u < (src_width / 2) as f32 {
                result.left = Some(blob_uvd(a));
            } else {
                result.right = Some(blob_uvd(a));
            }
        }
        (Some(a), Some(b)) => {
            if a.centroid_u < b.centroid_u {
                result.left = Some(blob_uvd(a));
                result.right = Some(blob_uvd(b));
            } else {
                result.left = Some(blob_uvd(b));
                result.right = Some(blob_uvd(a));
            }
        }
    }
    result
}

/// The largest blob regardless of side, for single hand use cases.
pub fn select_hand(blobs: &[Blob]) -> Option<[f32; 3]> {
    two_largest(blobs).0.map(blob_uvd)
}

fn two_largest(blobs: &[Blob]) -> (Option<&Blob>, Option<&Blob>) {
    let mut largest: Option<&Blob> = None;
    let mut second: Option<&Blob> = None;
    for blob in blobs.iter() {
        if largest.map_or(true, |l| blob.pixel_count > l.pixel_count) {
            second = largest;
            largest = Some(blob);
        } else if second.map_or(true, |s| blob.pixel_count > s.pixel_count) {
            second = Some(blob);
        }
    }
    (largest, second)
}

fn blob_uvd(blob: &Blob) -> [f32; 3] {
    [blob.centroid_u, blob.centroid_v, blob.centroid_depth]
}

/// The 16 kernel offsets in real world units: the inner ring keeps the
/// fill connected, the outer ring jumps small invalid-depth holes.
fn fill_kernel(config: &SeedFillConfig) -> [(f32, f32); FILL_KERNEL_RINGS] {
    let f = config.fine_radius;
    let c = config.coarse_radius;
    [(-f, -f), (-f, 0.0), (-f, f), (0.0, f), (f, f), (f, 0.0), (f, -f), (0.0, -f),
     (-c, -c), (-c, 0.0), (-c, c), (0.0, c), (c, c), (c, 0.0), (c, -c), (0.0, -c)]
}

/// Ceiling away from zero, so a sub-pixel offset never collapses to 0.
fn ceil_sym(value: f32) -> i32 {
    if value < 0.0 {
        value.floor() as i32
    } else {
        value.ceil() as i32
    }
}

fn round_sym(value: f32) -> f32 {
    value.round()
}

fn clamp(value: i32, min: i32, max: i32) -> i32 {
    if value < min {
        min
    } else if value > max {
        max
    } else {
        value
    }
}
