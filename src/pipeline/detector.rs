/// The per-frame hand detector: owns the trained forest, the worker
/// pool partitioning and every scratch buffer, so running a frame never
/// allocates. One instance services one stream of frames; it is not
/// meant to be shared across threads.

use rayon;
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use forest::eval::ForestEvaluator;
use forest::io::{self, ForestIoError};
use pipeline::blobs::{self, BlobExtractor, HandsResult, SeedFillConfig};
use pipeline::filters;
use pipeline::scheduler::EvaluationScheduler;
use types::Intrinsics;

/// Integer factor between the sensor frame and the grid the forest
/// runs on. Frame dimensions must divide evenly.
pub const DOWNSAMPLE_FACTOR: usize = 4;

/// Components smaller than this are never reported as hands.
pub const MIN_PTS_PER_HAND_BLOB: u32 = 25;

const NUM_WORKER_THREADS: usize = 6;
const STARTING_SHRINK_FILTER_RADIUS: usize = 0;
const STARTING_MEDIAN_FILTER_RADIUS: usize = 2;
const STARTING_GROW_FILTER_RADIUS: usize = 2;
const DISCONT_FILTER_RADIUS: usize = 3;
const DISCONT_FILTER_DEPTH_THRESH: i16 = 25;

/// How `find_hand_labels` produces its source resolution label grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelMethod {
    /// Forest labels, block-replicated back to source resolution.
    Upconvert,
    /// `Upconvert` plus clearing labels near depth discontinuities.
    UpconvertFilter,
    /// 3-D flood fill seeded from the detected hand point.
    Floodfill,
}

pub struct HandDetector {
    evaluator: ForestEvaluator,
    scheduler: EvaluationScheduler,
    extractor: BlobExtractor,
    intrinsics: Intrinsics,
    seed_fill: SeedFillConfig,

    src_width: usize,
    src_height: usize,
    down_width: usize,
    down_height: usize,

    shrink_filter_radius: usize,
    median_filter_radius: usize,
    grow_filter_radius: usize,

    depth_downsampled: Vec<i16>,
    labels_evaluated: Vec<u8>,
    labels_filtered: Vec<u8>,
    labels_temp: Vec<u8>,
}

impl HandDetector {
    /// Loads the forest and sets up a private worker pool.
    pub fn new<P: AsRef<Path>>(src_width: usize,
                               src_height: usize,
                               forest_path: P)
                               -> Result<HandDetector, DetectorError> {
        let config = rayon::Configuration::new().num_threads(NUM_WORKER_THREADS);
        let pool = rayon::ThreadPool::new(config)
            .map_err(|e| DetectorError::ThreadPool(e.to_string()))?;
        HandDetector::with_thread_pool(src_width, src_height, forest_path, Arc::new(pool))
    }

    /// Like `new` with a shared worker pool, e.g. one pool serving
    /// several detectors.
    pub fn with_thread_pool<P: AsRef<Path>>(src_width: usize,
                                            src_height: usize,
                                            forest_path: P,
                                            pool: Arc<rayon::ThreadPool>)
                                            -> Result<HandDetector, DetectorError> {
        if src_width == 0 || src_height == 0 || src_width % DOWNSAMPLE_FACTOR != 0 ||
           src_height % DOWNSAMPLE_FACTOR != 0 {
            return Err(DetectorError::BadDimensions(src_width, src_height));
        }
        let forest = io::load_forest(forest_path)?;
        info!("loaded forest with {} trees, max height {}",
              forest.num_trees(),
              forest.max_height());

        let down_width = src_width / DOWNSAMPLE_FACTOR;
        let down_height = src_height / DOWNSAMPLE_FACTOR;
        let down_size = down_width * down_height;
        Ok(HandDetector {
            evaluator: ForestEvaluator::new(forest),
            scheduler: EvaluationScheduler::new(pool, down_size),
            extractor: BlobExtractor::new(src_width,
                                          src_height,
                                          DOWNSAMPLE_FACTOR,
                                          MIN_PTS_PER_HAND_BLOB),
            intrinsics: Intrinsics::default_kinect(),
            seed_fill: SeedFillConfig::default(),
            src_width: src_width,
            src_height: src_height,
            down_width: down_width,
            down_height: down_height,
            shrink_filter_radius: STARTING_SHRINK_FILTER_RADIUS,
            median_filter_radius: STARTING_MEDIAN_FILTER_RADIUS,
            grow_filter_radius: STARTING_GROW_FILTER_RADIUS,
            depth_downsampled: vec![0; down_size],
            labels_evaluated: vec![0; down_size],
            labels_filtered: vec![0; down_size],
            labels_temp: vec![0; down_size],
        })
    }

    /// Runs the full pipeline on one depth frame and reports the
    /// detected hand positions.
    pub fn find_hands(&mut self, depth: &[i16]) -> Result<HandsResult, DetectorError> {
        self.check_frame(depth.len())?;
        self.create_labels(depth);
        let blobs = self.extractor.extract_blobs(&self.labels_filtered, depth);
        Ok(blobs::select_hands(blobs, self.src_width))
    }

    /// Like `find_hands` but only reports the most prominent hand,
    /// regardless of side.
    pub fn find_hand(&mut self, depth: &[i16]) -> Result<Option<[f32; 3]>, DetectorError> {
        self.check_frame(depth.len())?;
        self.create_labels(depth);
        let blobs = self.extractor.extract_blobs(&self.labels_filtered, depth);
        Ok(blobs::select_hand(blobs))
    }

    /// Writes a source resolution label grid for one frame. `xyz` is
    /// the per-pixel real world frame matching `depth` and is only read
    /// by the `Floodfill` method. Returns false if the method needs a
    /// hand and none was found; `labels` is all background then.
    pub fn find_hand_labels(&mut self,
                            depth: &[i16],
                            xyz: &[f32],
                            method: LabelMethod,
                            labels: &mut [u8])
                            -> Result<bool, DetectorError> {
        self.check_frame(depth.len())?;
        if labels.len() != self.src_width * self.src_height {
            return Err(DetectorError::FrameSizeMismatch(labels.len()));
        }
        match method {
            LabelMethod::Upconvert => {
                self.create_labels(depth);
                filters::upsample_labels(labels,
                                         &self.labels_filtered,
                                         self.down_width,
                                         self.down_height,
                                         DOWNSAMPLE_FACTOR);
                Ok(true)
            }
            LabelMethod::UpconvertFilter => {
                self.create_labels(depth);
                filters::upsample_labels(labels,
                                         &self.labels_filtered,
                                         self.down_width,
                                         self.down_height,
                                         DOWNSAMPLE_FACTOR);
                filters::discontinuity_filter(labels,
                                              depth,
                                              self.src_width,
                                              self.src_height,
                                              DISCONT_FILTER_RADIUS,
                                              DISCONT_FILTER_DEPTH_THRESH);
                Ok(true)
            }
            LabelMethod::Floodfill => {
                if xyz.len() != self.src_width * self.src_height * 3 {
                    return Err(DetectorError::FrameSizeMismatch(xyz.len()));
                }
                for label in labels.iter_mut() {
                    *label = 0;
                }
                let hand = match self.find_hand(depth)? {
                    Some(uvd) => uvd,
                    None => return Ok(false),
                };
                let found = self.extractor.flood_fill_from_seed(hand,
                                                                xyz,
                                                                &self.intrinsics,
                                                                &self.seed_fill,
                                                                labels);
                Ok(found)
            }
        }
    }

    /// Downsample, classify in parallel, then clean the label grid up.
    /// The result ends up in `labels_filtered`.
    fn create_labels(&mut self, depth: &[i16]) {
        filters::downsample_depth(&mut self.depth_downsampled,
                                  depth,
                                  self.src_width,
                                  self.src_height,
                                  DOWNSAMPLE_FACTOR);
        self.scheduler.evaluate(&self.evaluator,
                                self.down_width,
                                self.down_height,
                                &self.depth_downsampled,
                                &mut self.labels_evaluated);
        filters::shrink_filter(&mut self.labels_temp,
                               &self.labels_evaluated,
                               self.down_width,
                               self.down_height,
                               self.shrink_filter_radius);
        filters::median_label_filter(&mut self.labels_filtered,
                                     &self.labels_temp,
                                     &self.depth_downsampled,
                                     self.down_width,
                                     self.down_height,
                                     self.median_filter_radius);
        filters::grow_filter(&mut self.labels_temp,
                             &self.labels_filtered,
                             self.down_width,
                             self.down_height,
                             self.grow_filter_radius);
        ::std::mem::swap(&mut self.labels_temp, &mut self.labels_filtered);
    }

    fn check_frame(&self, len: usize) -> Result<(), DetectorError> {
        if len != self.src_width * self.src_height {
            Err(DetectorError::FrameSizeMismatch(len))
        } else {
            Ok(())
        }
    }

    // Tunables. Values above what the forest supports are clamped with
    // a warning rather than rejected, the detector stays usable.

    pub fn num_trees_to_evaluate(&self) -> usize {
        self.evaluator.num_trees()
    }

    pub fn set_num_trees_to_evaluate(&mut self, num_trees: usize) {
        self.evaluator.set_num_trees(num_trees);
    }

    pub fn max_height_to_evaluate(&self) -> u32 {
        self.evaluator.max_height()
    }

    pub fn set_max_height_to_evaluate(&mut self, max_height: u32) {
        self.evaluator.set_max_height(max_height);
    }

    pub fn shrink_filter_radius(&self) -> usize {
        self.shrink_filter_radius
    }

    pub fn set_shrink_filter_radius(&mut self, radius: usize) {
        self.shrink_filter_radius = radius;
    }

    pub fn median_filter_radius(&self) -> usize {
        self.median_filter_radius
    }

    pub fn set_median_filter_radius(&mut self, radius: usize) {
        self.median_filter_radius = radius;
    }

    pub fn grow_filter_radius(&self) -> usize {
        self.grow_filter_radius
    }

    pub fn set_grow_filter_radius(&mut self, radius: usize) {
        self.grow_filter_radius = radius;
    }

    pub fn min_pts_per_blob(&self) -> u32 {
        self.extractor.min_pts_per_blob()
    }

    pub fn set_min_pts_per_blob(&mut self, min_pts: u32) {
        self.extractor.set_min_pts_per_blob(min_pts);
    }

    pub fn intrinsics(&self) -> &Intrinsics {
        &self.intrinsics
    }

    pub fn set_intrinsics(&mut self, intrinsics: Intrinsics) {
        self.intrinsics = intrinsics;
    }

    pub fn seed_fill_config(&self) -> &SeedFillConfig {
        &self.seed_fill
    }

    pub fn set_seed_fill_config(&mut self, config: SeedFillConfig) {
        self.seed_fill = config;
    }
}

// Error Definitions

#[derive(Debug)]
pub enum DetectorError {
    /// Frame dimensions not divisible by the downsample factor.
    BadDimensions(usize, usize),
    /// An input buffer does not match the configured frame size.
    FrameSizeMismatch(usize),
    Forest(ForestIoError),
    ThreadPool(String),
}

impl From<ForestIoError> for DetectorError {
    fn from(err: ForestIoError) -> Self {
        DetectorError::Forest(err)
    }
}

impl fmt::Display for DetectorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            DetectorError::BadDimensions(w, h) => {
                write!(f,
                       "Frame size {}x{} is not divisible by the downsample factor {}",
                       w,
                       h,
                       DOWNSAMPLE_FACTOR)
            }
            DetectorError::FrameSizeMismatch(len) => {
                write!(f, "Input buffer of {} entries does not match the frame size", len)
            }
            DetectorError::Forest(ref err) => err.fmt(f),
            DetectorError::ThreadPool(ref msg) => write!(f, "Worker pool setup failed: {}", msg),
        }
    }
}

impl Error for DetectorError {
    fn description(&self) -> &str {
        match *self {
            DetectorError::BadDimensions(..) => "bad frame dimensions",
            DetectorError::FrameSizeMismatch(_) => "frame size mismatch",
            DetectorError::Forest(ref err) => err.description(),
            DetectorError::ThreadPool(_) => "worker pool setup failed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest::io;
    use forest::tree::{DecisionTree, Forest, TreeNode, WeakLearner, WeakLearnerCoeffs};
    use std::env;
    use std::fs;
    use std::path::PathBuf;

    /// A forest whose single tree marks every pixel with valid depth as
    /// hand. Written to a temp file because the detector loads from
    /// disk.
    fn write_stub_forest(name: &str) -> PathBuf {
        let mut root = TreeNode::leaf([0.5, 0.5]);
        // Offset 0 compares the pixel against itself, so only the
        // threshold sign matters: 0 >= -1 is always true.
        root.coeffs = WeakLearnerCoeffs {
            u_offset: 0,
            v_offset: 0,
            threshold: -1,
            test: WeakLearner::CenterDelta,
        };
        root.left_child = 1;
        root.right_child = 2;
        let tree = DecisionTree {
            nodes: vec![root, TreeNode::leaf([0.0, 1.0]), TreeNode::leaf([1.0, 0.0])],
            height: 2,
        };
        let path = env::temp_dir().join(name);
        io::save_forest(&Forest::new(vec![tree]), &path).unwrap();
        path
    }

    #[test]
    fn test_rejects_bad_dimensions() {
        let path = write_stub_forest("detector_test_bad_dims.bin");
        match HandDetector::new(30, 24, &path) {
            Err(DetectorError::BadDimensions(30, 24)) => (),
            other => panic!("expected BadDimensions, got {:?}", other.map(|_| ())),
        }
        fs::remove_file(path).unwrap();
    }

    #[test]
    fn test_finds_hand_blob() {
        let path = write_stub_forest("detector_test_finds_hand.bin");
        let width = 64;
        let height = 48;
        let mut detector = HandDetector::new(width, height, &path).unwrap();
        fs::remove_file(path).unwrap();
        detector.set_min_pts_per_blob(4);

        // Everything valid at 1m; the stub forest labels every valid
        // pixel as hand, so the frame yields one giant blob.
        let depth = vec![1000i16; width * height];
        let result = detector.find_hands(&depth).unwrap();
        let hand = result.left.or(result.right).unwrap();
        assert!((hand[2] - 1000.0).abs() < 1.0);

        // An all-invalid frame yields nothing.
        let empty = vec![0i16; width * height];
        let result = detector.find_hands(&empty).unwrap();
        assert!(result.left.is_none() && result.right.is_none());
    }

    #[test]
    fn test_upconvert_labels() {
        let path = write_stub_forest("detector_test_upconvert.bin");
        let width = 32;
        let height = 32;
        let mut detector = HandDetector::new(width, height, &path).unwrap();
        fs::remove_file(path).unwrap();

        let depth = vec![1000i16; width * height];
        let mut labels = vec![0u8; width * height];
        let found = detector.find_hand_labels(&depth,
                                              &[],
                                              LabelMethod::Upconvert,
                                              &mut labels)
            .unwrap();
        assert!(found);
        assert!(labels.iter().all(|&l| l == 1));
    }

    #[test]
    fn test_frame_size_mismatch() {
        let path = write_stub_forest("detector_test_mismatch.bin");
        let mut detector = HandDetector::new(32, 32, &path).unwrap();
        fs::remove_file(path).unwrap();
        match detector.find_hands(&vec![0i16; 7]) {
            Err(DetectorError::FrameSizeMismatch(7)) => (),
            other => panic!("expected FrameSizeMismatch, got {:?}", other.map(|_| ())),
        }
    }
}
