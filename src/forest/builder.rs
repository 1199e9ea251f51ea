/// Breadth-first tree induction. The training set is a concatenation of
/// labelled depth images; each node greedily picks the best of a random
/// sample of weak learners by information gain.
///
/// Because the tree is descended breadth-first, the per-pixel occupancy
/// only has to exist for two adjacent levels. The builder keeps two flat
/// index buffers and ping-pongs between them whenever the BFS moves down
/// a level.

use rand::{Rng, SeedableRng, StdRng};
use rayon::prelude::*;
use std::cmp;
use std::collections::VecDeque;
use std::error::Error;
use std::fmt;
use std::mem;

use super::settings::{TrainingConfig, TrainingSettings, WeakLearnerPool};
use super::tree::{calc_entropy, calc_tree_size, DecisionTree, Forest, TreeNode,
                  WeakLearnerCoeffs};
use types::{depth_is_valid, NUM_LABELS};

/// A labelled training set: `num_images` depth images of identical size
/// laid out back to back, with one label per pixel.
#[derive(Debug, Clone)]
pub struct TrainingData {
    pub im_width: usize,
    pub im_height: usize,
    pub num_images: usize,
    pub depth: Vec<i16>,
    pub labels: Vec<u8>,
}

impl TrainingData {
    pub fn new(im_width: usize,
               im_height: usize,
               depth: Vec<i16>,
               labels: Vec<u8>)
               -> Result<TrainingData, TrainError> {
        let im_size = im_width * im_height;
        if im_size == 0 || depth.len() != labels.len() || depth.len() % im_size != 0 {
            return Err(TrainError::SizeMismatch);
        }
        // Indices are carried around as u32, also in the binary forest
        // format, so the address space must fit.
        if depth.len() > i32::max_value() as usize {
            return Err(TrainError::DataTooLarge);
        }
        if labels.iter().any(|&l| l as usize >= NUM_LABELS) {
            return Err(TrainError::BadLabel);
        }
        Ok(TrainingData {
            im_width: im_width,
            im_height: im_height,
            num_images: depth.len() / im_size,
            depth: depth,
            labels: labels,
        })
    }
}

/// One BFS queue entry: a tree node together with its slice of the
/// current occupancy buffer.
struct QueueNode {
    tree_node: usize,
    height: u32,
    occ_start: usize,
    occ_len: usize,
    entropy: f32,
}

/// Trains trees from a training set, using a fixed weak learner pool.
pub struct ForestBuilder {
    pool: WeakLearnerPool,
}

impl ForestBuilder {
    pub fn new(pool: WeakLearnerPool) -> ForestBuilder {
        ForestBuilder { pool: pool }
    }

    /// Samples at most `max_per_label` valid pixels per image and label
    /// into a flat occupancy list. Pixels with invalid depth never enter
    /// training.
    fn populate_occupancy(&self,
                          data: &TrainingData,
                          max_per_label: usize,
                          rng: &mut StdRng)
                          -> Vec<u32> {
        let im_size = data.im_width * data.im_height;
        let mut occupancy = Vec::new();
        let mut per_label: Vec<Vec<u32>> = vec![Vec::new(); NUM_LABELS];
        for im in 0..data.num_images {
            for list in per_label.iter_mut() {
                list.clear();
            }
            for pix in 0..im_size {
                let index = im * im_size + pix;
                if depth_is_valid(data.depth[index]) {
                    per_label[data.labels[index] as usize].push(index as u32);
                }
            }
            for list in per_label.iter_mut() {
                let count = if list.len() > max_per_label {
                    max_per_label
                } else {
                    list.len()
                };
                // Partial Knuth shuffle, the first `count` entries end up
                // uniformly drawn without replacement.
                for pix in 0..count {
                    let swap = rng.gen_range(pix, list.len());
                    list.swap(pix, swap);
                }
                occupancy.extend_from_slice(&list[..count]);
            }
        }
        occupancy
    }

    /// Trains a single tree. The node array is filled in BFS order, so
    /// the root always sits at index 0.
    pub fn build_tree(&self,
                      data: &TrainingData,
                      settings: &TrainingSettings)
                      -> Result<DecisionTree, TrainError> {
        let num_permutations = self.pool.num_permutations();
        if settings.tree_height as u64 > num_permutations {
            return Err(TrainError::TreeDeeperThanPool);
        }
        let num_samples = if settings.num_samples_per_node as u64 > num_permutations {
            num_permutations as u32
        } else {
            settings.num_samples_per_node
        };

        let seed: &[usize] = &[settings.seed as usize];
        let mut rng: StdRng = SeedableRng::from_seed(seed);

        debug!("populating occupancy list (seed {})", settings.seed);
        let mut cur_occ =
            self.populate_occupancy(data, settings.max_pix_per_im_per_label as usize, &mut rng);
        if cur_occ.is_empty() {
            return Err(TrainError::NoValidPixels);
        }
        let mut next_occ = vec![0u32; cur_occ.len()];

        // Root node distribution and entropy.
        let mut hist_root = [0u32; NUM_LABELS];
        for &index in cur_occ.iter() {
            hist_root[data.labels[index as usize] as usize] += 1;
        }
        let root_probs = normalize(&hist_root, cur_occ.len());
        let root_entropy = calc_entropy(&root_probs);

        let mut nodes = vec![TreeNode::leaf(root_probs)];
        let mut queue = VecDeque::new();
        queue.push_back(QueueNode {
            tree_node: 0,
            height: 1,
            occ_start: 0,
            occ_len: cur_occ.len(),
            entropy: root_entropy,
        });
        debug!("root: {} occupied pixels, entropy {}",
               cur_occ.len(),
               root_entropy);

        // Progress is reported in units of the fully grown tree; a node
        // that stays a leaf accounts for its whole potential subtree at
        // once.
        let total_nodes = calc_tree_size(cmp::max(settings.tree_height, 1));
        let mut nodes_finished = 0u32;

        let mut cur_height = 1;
        while let Some(cur) = queue.pop_front() {
            if cur.height != cur_height {
                // The BFS moved down a level; the buffer holding the
                // parents' partitions becomes the next scratch space.
                mem::swap(&mut cur_occ, &mut next_occ);
                cur_height = cur.height;
                debug!("training height {} of {} ({} of {} nodes finished)",
                       cur_height,
                       settings.tree_height,
                       nodes_finished,
                       total_nodes);
            }
            nodes_finished += 1;
            // Nodes at the height limit stay leaves.
            if cur.height >= settings.tree_height {
                continue;
            }
            // The subtree one child of this node would span when grown to
            // full height.
            let child_subtree = calc_tree_size(settings.tree_height - cur.height);
            let occ = &cur_occ[cur.occ_start..cur.occ_start + cur.occ_len];

            // Sample candidate weak learners until one reaches the target
            // gain or the budget runs out. Ties keep the earlier sample.
            let mut max_gain = 0f32;
            let mut best = None;
            let mut attempts = 0;
            while attempts < num_samples && max_gain < settings.min_info_gain {
                attempts += 1;
                let coeffs = WeakLearnerCoeffs {
                    u_offset: self.pool.u_offsets[rng.gen_range(0, self.pool.u_offsets.len())],
                    v_offset: self.pool.v_offsets[rng.gen_range(0, self.pool.v_offsets.len())],
                    threshold: self.pool.thresholds[rng.gen_range(0, self.pool.thresholds.len())],
                    test: self.pool.tests[rng.gen_range(0, self.pool.tests.len())],
                };

                let mut hist_left = [0u32; NUM_LABELS];
                let mut hist_right = [0u32; NUM_LABELS];
                for &index in occ.iter() {
                    let goes_left = coeffs.decide(index as usize,
                                                  data.im_width,
                                                  data.im_height,
                                                  &data.depth);
                    let label = data.labels[index as usize] as usize;
                    if goes_left {
                        hist_left[label] += 1;
                    } else {
                        hist_right[label] += 1;
                    }
                }

                let num_left: u32 = hist_left.iter().sum();
                let num_right: u32 = hist_right.iter().sum();
                if num_left == 0 || num_right == 0 {
                    continue;
                }
                let probs_left = normalize(&hist_left, num_left as usize);
                let probs_right = normalize(&hist_right, num_right as usize);
                let entropy_left = calc_entropy(&probs_left);
                let entropy_right = calc_entropy(&probs_right);
                // Gain normalized by the number of pixels reaching the node.
                let gain = cur.entropy -
                           (entropy_left * num_left as f32 / cur.occ_len as f32 +
                            entropy_right * num_right as f32 / cur.occ_len as f32);
                if gain > max_gain {
                    max_gain = gain;
                    best = Some((coeffs,
                                 hist_left,
                                 hist_right,
                                 probs_left,
                                 probs_right,
                                 entropy_left,
                                 entropy_right));
                }
            }

            // Without a positive gain the node stays the leaf it already is.
            let (coeffs, hist_left, hist_right, probs_left, probs_right, entropy_left,
                 entropy_right) = match best {
                Some(b) => b,
                None => {
                    nodes_finished += 2 * child_subtree;
                    continue;
                }
            };

            // Materialize both children and re-partition the node's pixels
            // into the next level's buffer.
            let left_len: u32 = hist_left.iter().sum();
            let right_len: u32 = hist_right.iter().sum();
            let left_start = cur.occ_start;
            let right_start = left_start + left_len as usize;
            {
                let mut left_cursor = left_start;
                let mut right_cursor = right_start;
                for &index in occ.iter() {
                    if coeffs.decide(index as usize, data.im_width, data.im_height, &data.depth) {
                        next_occ[left_cursor] = index;
                        left_cursor += 1;
                    } else {
                        next_occ[right_cursor] = index;
                        right_cursor += 1;
                    }
                }
            }

            let left_child = nodes.len();
            nodes.push(TreeNode::leaf(probs_left));
            let right_child = nodes.len();
            nodes.push(TreeNode::leaf(probs_right));
            nodes[cur.tree_node].coeffs = coeffs;
            nodes[cur.tree_node].left_child = left_child as i32;
            nodes[cur.tree_node].right_child = right_child as i32;

            // Children at maximum height are always leaves, pure children
            // have nothing left to split either.
            if cur.height + 1 < settings.tree_height {
                if !is_pure(&hist_left, left_len) {
                    queue.push_back(QueueNode {
                        tree_node: left_child,
                        height: cur.height + 1,
                        occ_start: left_start,
                        occ_len: left_len as usize,
                        entropy: entropy_left,
                    });
                } else {
                    nodes_finished += child_subtree;
                }
                if !is_pure(&hist_right, right_len) {
                    queue.push_back(QueueNode {
                        tree_node: right_child,
                        height: cur.height + 1,
                        occ_start: right_start,
                        occ_len: right_len as usize,
                        entropy: entropy_right,
                    });
                } else {
                    nodes_finished += child_subtree;
                }
            } else {
                nodes_finished += 2 * child_subtree;
            }
        }

        // Every potential node must end up accounted for, either popped
        // off the queue or inside a pruned subtree.
        debug_assert_eq!(nodes_finished, total_nodes);
        info!("tree finished with {} nodes (height {}, {} of {} potential nodes)",
              nodes.len(),
              settings.tree_height,
              nodes_finished,
              total_nodes);
        Ok(DecisionTree {
            nodes: nodes,
            height: settings.tree_height,
        })
    }

    /// Trains all of the configured trees one after another.
    pub fn build_forest(&self,
                        data: &TrainingData,
                        config: &TrainingConfig)
                        -> Result<Forest, TrainError> {
        let mut trees = Vec::with_capacity(config.num_trees as usize);
        for i in 0..config.num_trees {
            info!("training tree {} of {}", i + 1, config.num_trees);
            trees.push(self.build_tree(data, &config.settings_for_tree(i))?);
        }
        Ok(Forest::new(trees))
    }

    /// Trains the configured trees in parallel. The result is identical
    /// to `build_forest` since every tree has its own seed.
    pub fn build_forest_parallel(&self,
                                 data: &TrainingData,
                                 config: &TrainingConfig)
                                 -> Result<Forest, TrainError> {
        let results: Vec<Result<DecisionTree, TrainError>> = (0..config.num_trees)
            .into_par_iter()
            .map(|i| {
                info!("training tree {} of {}", i + 1, config.num_trees);
                self.build_tree(data, &config.settings_for_tree(i))
            })
            .collect();
        let mut trees = Vec::with_capacity(results.len());
        for result in results {
            trees.push(result?);
        }
        Ok(Forest::new(trees))
    }
}

fn normalize(hist: &[u32; NUM_LABELS], total: usize) -> [f32; NUM_LABELS] {
    let mut probs = [0f32; NUM_LABELS];
    for i in 0..NUM_LABELS {
        probs[i] = hist[i] as f32 / total as f32;
    }
    probs
}

fn is_pure(hist: &[u32; NUM_LABELS], total: u32) -> bool {
    total == 0 || hist.iter().any(|&h| h == total)
}

// Error Definitions

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainError {
    /// Depth and label buffers disagree or do not tile into whole images.
    SizeMismatch,
    /// The training set does not fit the 32 bit pixel address space.
    DataTooLarge,
    /// A label outside 0..NUM_LABELS appeared in the training set.
    BadLabel,
    /// Not a single pixel with valid depth in the whole training set.
    NoValidPixels,
    /// The pool cannot provide distinct splits for every level.
    TreeDeeperThanPool,
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            TrainError::SizeMismatch => {
                write!(f, "Depth and label buffers do not form whole images of the given size")
            }
            TrainError::DataTooLarge => {
                write!(f, "Training data exceeds the 32 bit pixel address space")
            }
            TrainError::BadLabel => write!(f, "Training label out of range"),
            TrainError::NoValidPixels => {
                write!(f, "No pixel with valid depth in the training set")
            }
            TrainError::TreeDeeperThanPool => {
                write!(f, "The weak learner pool is smaller than the tree height")
            }
        }
    }
}

impl Error for TrainError {
    fn description(&self) -> &str {
        match *self {
            TrainError::SizeMismatch => "depth/label size mismatch",
            TrainError::DataTooLarge => "training data too large",
            TrainError::BadLabel => "label out of range",
            TrainError::NoValidPixels => "no valid pixels",
            TrainError::TreeDeeperThanPool => "weak learner pool too small",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest::settings::{TrainingConfig, TrainingSettings, WeakLearnerPool};
    use forest::tree::{calc_tree_size, WeakLearner, LEAF};

    fn default_settings() -> TrainingSettings {
        TrainingSettings {
            tree_height: 8,
            min_info_gain: 0.02,
            max_pix_per_im_per_label: 1000,
            num_samples_per_node: 500,
            seed: 1,
        }
    }

    /// 8x8 image at ~1m: left half is background, right half is "hand"
    /// and 80mm closer. A pool with a single pixel step can separate
    /// these perfectly.
    fn split_image() -> TrainingData {
        let width = 8;
        let height = 8;
        let mut depth = Vec::with_capacity(width * height);
        let mut labels = Vec::with_capacity(width * height);
        for _v in 0..height {
            for u in 0..width {
                if u < width / 2 {
                    depth.push(1000i16);
                    labels.push(0u8);
                } else {
                    depth.push(920i16);
                    labels.push(1u8);
                }
            }
        }
        TrainingData::new(width, height, depth, labels).unwrap()
    }

    fn small_pool() -> WeakLearnerPool {
        WeakLearnerPool {
            u_offsets: vec![0, 1000, -1000],
            v_offsets: vec![0, 1000, -1000],
            thresholds: vec![40, -40],
            tests: vec![WeakLearner::CenterDelta, WeakLearner::CrossDelta],
        }
    }

    #[test]
    fn test_root_is_node_zero() {
        let data = split_image();
        let builder = ForestBuilder::new(small_pool());
        let tree = builder.build_tree(&data, &default_settings()).unwrap();
        assert!(tree.num_nodes() >= 1);
        // Root carries the full training distribution.
        assert!((tree.nodes[0].probs[0] - 0.5).abs() < 0.001);
        assert!((tree.nodes[0].probs[1] - 0.5).abs() < 0.001);
    }

    #[test]
    fn test_children_are_consistent() {
        let data = split_image();
        let builder = ForestBuilder::new(small_pool());
        let tree = builder.build_tree(&data, &default_settings()).unwrap();
        for node in tree.nodes.iter() {
            // Either a full leaf or two valid children.
            if node.left_child == LEAF {
                assert_eq!(node.right_child, LEAF);
            } else {
                assert!((node.left_child as u32) < tree.num_nodes());
                assert!((node.right_child as u32) < tree.num_nodes());
            }
            let sum: f32 = node.probs.iter().sum();
            assert!((sum - 1.0).abs() < 0.001);
        }
    }

    #[test]
    fn test_deterministic_for_seed() {
        let data = split_image();
        let builder = ForestBuilder::new(small_pool());
        let tree_a = builder.build_tree(&data, &default_settings()).unwrap();
        let tree_b = builder.build_tree(&data, &default_settings()).unwrap();
        assert_eq!(tree_a, tree_b);
        let mut other = default_settings();
        other.seed = 99;
        // Not a guarantee in general, but with this pool the sampling
        // order differs.
        let _ = builder.build_tree(&data, &other).unwrap();
    }

    #[test]
    fn test_single_label_stops_at_root() {
        // Entropy is already zero, no candidate can improve it.
        let data = TrainingData::new(8, 8, vec![1000i16; 64], vec![0u8; 64]).unwrap();
        let builder = ForestBuilder::new(small_pool());
        let tree = builder.build_tree(&data, &default_settings()).unwrap();
        assert_eq!(tree.num_nodes(), 1);
        assert!(tree.nodes[0].is_leaf());
        assert!((tree.nodes[0].probs[0] - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_deep_tree_prunes_pure_children() {
        // The two halves separate after a few splits, so most of the
        // potential height-12 tree is pruned away. The accounting
        // assertion at the end of build_tree checks that the pruned
        // subtrees are still counted as finished.
        let data = split_image();
        let builder = ForestBuilder::new(small_pool());
        let mut settings = default_settings();
        settings.tree_height = 12;
        let tree = builder.build_tree(&data, &settings).unwrap();
        assert!(tree.num_nodes() < calc_tree_size(12));
        // Splits come in pairs, so a tree always has an odd node count.
        assert_eq!(tree.num_nodes() % 2, 1);
    }

    #[test]
    fn test_no_valid_pixels() {
        let data = TrainingData::new(4, 4, vec![0i16; 16], vec![0u8; 16]).unwrap();
        let builder = ForestBuilder::new(small_pool());
        match builder.build_tree(&data, &default_settings()) {
            Err(TrainError::NoValidPixels) => (),
            other => panic!("expected NoValidPixels, got {:?}", other),
        }
    }

    #[test]
    fn test_size_mismatch() {
        assert_eq!(TrainingData::new(4, 4, vec![1i16; 15], vec![0u8; 15]).unwrap_err(),
                   TrainError::SizeMismatch);
        assert_eq!(TrainingData::new(4, 4, vec![1i16; 16], vec![0u8; 15]).unwrap_err(),
                   TrainError::SizeMismatch);
    }

    #[test]
    fn test_bad_label() {
        assert_eq!(TrainingData::new(2, 2, vec![1i16; 4], vec![0, 1, 2, 0]).unwrap_err(),
                   TrainError::BadLabel);
    }

    #[test]
    fn test_forest_training() {
        let data = split_image();
        let builder = ForestBuilder::new(small_pool());
        let config = TrainingConfig {
            num_trees: 3,
            settings: default_settings(),
            pool: small_pool(),
        };
        let forest = builder.build_forest(&data, &config).unwrap();
        assert_eq!(forest.num_trees(), 3);
        let parallel = builder.build_forest_parallel(&data, &config).unwrap();
        assert_eq!(forest, parallel);
    }
}
