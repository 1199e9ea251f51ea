/// Shared constants, image aliases and camera intrinsics used by both the
/// decision forest and the pixel pipeline.

use image::{ImageBuffer, Luma};

/// Number of per-pixel classes. Labels must be indexed 0..NUM_LABELS-1,
/// label 0 is always "background".
pub const NUM_LABELS: usize = 2;

/// Everything 2m or further away from the sensor is treated as background.
pub const MAX_SENSOR_DEPTH: i16 = 2000;

/// Depth value marking a downsampled block without any valid source pixel.
/// Deliberately not 0, so it cannot be confused with missing sensor data.
pub const BEYOND_RANGE: i16 = MAX_SENSOR_DEPTH + 1;

/// Added to probabilities before taking the logarithm in entropy sums.
pub const PROB_EPSILON: f32 = 0.00000001;

/// Returns true if a raw depth value carries usable information.
#[inline]
pub fn depth_is_valid(depth: i16) -> bool {
    depth != 0 && depth < MAX_SENSOR_DEPTH
}

pub type DepthImage = ImageBuffer<Luma<u16>, Vec<u16>>;
pub type LabelImage = ImageBuffer<Luma<u8>, Vec<u8>>;

/// Flattens a depth image into the signed buffer the forest operates on.
/// Values beyond the i16 range are clamped, they are invalid anyway.
pub fn depth_buffer_from_image(img: &DepthImage) -> Vec<i16> {
    img.pixels()
        .map(|p| {
            let v = p.data[0];
            if v > (i16::max_value() as u16) {
                i16::max_value()
            } else {
                v as i16
            }
        })
        .collect()
}

/// Wraps a flat label grid into an image, e.g. for writing debug output.
/// Returns None if the buffer does not match the dimensions.
pub fn label_image_from_grid(labels: &[u8], width: u32, height: u32) -> Option<LabelImage> {
    if labels.len() != (width * height) as usize {
        return None;
    }
    ImageBuffer::from_raw(width, height, labels.to_vec())
}

/// Projective (u, v, depth) <-> real world (x, y, z) conversion for a
/// pinhole depth camera, parametrized over resolution and field of view.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Intrinsics {
    x_res: f32,
    y_res: f32,
    x_to_z: f32,
    y_to_z: f32,
}

impl Intrinsics {
    /// Creates intrinsics for a sensor with the given resolution and
    /// horizontal/vertical field of view (in radian).
    pub fn new(x_res: u32, y_res: u32, h_fov: f32, v_fov: f32) -> Intrinsics {
        Intrinsics {
            x_res: x_res as f32,
            y_res: y_res as f32,
            x_to_z: (h_fov / 2.0).tan() * 2.0,
            y_to_z: (v_fov / 2.0).tan() * 2.0,
        }
    }

    /// Returns the intrinsics of a first generation kinect at 640x480.
    pub fn default_kinect() -> Intrinsics {
        Intrinsics::new(640, 480, 1.0144687, 0.78980943)
    }

    /// Maps image coordinates plus depth to a real world point.
    pub fn projective_to_real_world(&self, uvd: [f32; 3]) -> [f32; 3] {
        let norm_x = uvd[0] / self.x_res - 0.5;
        let norm_y = 0.5 - uvd[1] / self.y_res;
        [norm_x * uvd[2] * self.x_to_z, norm_y * uvd[2] * self.y_to_z, uvd[2]]
    }

    /// Maps a real world point back to image coordinates plus depth.
    pub fn real_world_to_projective(&self, xyz: [f32; 3]) -> [f32; 3] {
        let coeff_x = self.x_res / self.x_to_z;
        let coeff_y = self.y_res / self.y_to_z;
        [coeff_x * xyz[0] / xyz[2] + self.x_res / 2.0,
         self.y_res / 2.0 - coeff_y * xyz[1] / xyz[2],
         xyz[2]]
    }
}

/// Squared euclidean distance between two real world points.
#[inline]
pub fn dist_sq(a: [f32; 3], b: [f32; 3]) -> f32 {
    let dx = a[0] - b[0];
    let dy = a[1] - b[1];
    let dz = a[2] - b[2];
    dx * dx + dy * dy + dz * dz
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_validity() {
        assert!(!depth_is_valid(0));
        assert!(depth_is_valid(1));
        assert!(depth_is_valid(MAX_SENSOR_DEPTH - 1));
        assert!(!depth_is_valid(MAX_SENSOR_DEPTH));
        assert!(!depth_is_valid(BEYOND_RANGE));
    }

    #[test]
    fn test_intrinsics_roundtrip() {
        let intr = Intrinsics::default_kinect();
        let uvd = [123.0, 222.0, 853.0];
        let xyz = intr.projective_to_real_world(uvd);
        let back = intr.real_world_to_projective(xyz);
        for i in 0..3 {
            assert!((back[i] - uvd[i]).abs() < 0.001);
        }
    }

    #[test]
    fn test_label_image_from_grid() {
        let grid = vec![0u8, 1, 1, 0, 0, 1];
        let img = label_image_from_grid(&grid, 3, 2).unwrap();
        assert_eq!(img.width(), 3);
        assert_eq!(img[(1, 0)].data[0], 1);
        assert!(label_image_from_grid(&grid, 4, 2).is_none());
    }
}
