/// The static data model of a trained forest: weak learners, tree nodes,
/// trees and the forest itself.

use types::NUM_LABELS;

/// Sentinel child index marking a leaf node.
pub const LEAF: i32 = -1;

/// The two depth comparison tests a node may run. Both sample the image at
/// a perspective corrected offset, i.e. the stored offset is divided by the
/// depth at the query pixel so that it covers a constant real world step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WeakLearner {
    /// Depth at the offset pixel minus depth at the query pixel.
    CenterDelta,
    /// Depth at the row offset minus depth at the column offset.
    CrossDelta,
}

impl WeakLearner {
    pub fn from_id(id: u8) -> Option<WeakLearner> {
        match id {
            0 => Some(WeakLearner::CenterDelta),
            1 => Some(WeakLearner::CrossDelta),
            _ => None,
        }
    }

    pub fn id(&self) -> u8 {
        match *self {
            WeakLearner::CenterDelta => 0,
            WeakLearner::CrossDelta => 1,
        }
    }
}

/// Number of known weak learner tests.
pub const NUM_WL_FUNCS: usize = 2;

#[inline]
#[cfg(feature = "reduce_bound_checks")]
fn depth_at(depth: &[i16], index: usize) -> i16 {
    // The callers only pass indices which were checked against the image
    // dimensions already.
    unsafe { *depth.get_unchecked(index) }
}

#[inline]
#[cfg(not(feature = "reduce_bound_checks"))]
fn depth_at(depth: &[i16], index: usize) -> i16 {
    depth[index]
}

/// The coefficients of one weak learner test as stored in a tree node.
/// Immutable once assigned to a node.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WeakLearnerCoeffs {
    /// Horizontal offset in real world units (divided by depth in mm).
    pub u_offset: i32,
    /// Vertical offset in real world units (divided by depth in mm).
    pub v_offset: i32,
    pub threshold: i16,
    pub test: WeakLearner,
}

impl WeakLearnerCoeffs {
    /// Runs the test for the pixel at `index`. Returns true if the pixel
    /// should descend into the left child, false for the right one.
    ///
    /// If the perspective corrected offset leaves the image the result is
    /// always false. `index` may point into a concatenation of several
    /// images of size `width` x `height`; the depth at `index` must be
    /// valid (in particular non-zero).
    #[inline]
    pub fn decide(&self, index: usize, width: usize, height: usize, depth: &[i16]) -> bool {
        let im_index = index % (width * height);
        let u = (im_index % width) as i32;
        let v = (im_index / width) as i32;
        let d = depth_at(depth, index) as i32;
        let cur_u_offset = self.u_offset / d;
        let cur_v_offset = self.v_offset / d;
        let u_target = u + cur_u_offset;
        let v_target = v + cur_v_offset;
        if u_target < 0 || u_target >= width as i32 || v_target < 0 ||
           v_target >= height as i32 {
            return false;
        }
        let row_offset = index as i32 + width as i32 * cur_v_offset;
        match self.test {
            WeakLearner::CenterDelta => {
                let sample = depth_at(depth, (row_offset + cur_u_offset) as usize) as i32;
                sample - d >= self.threshold as i32
            }
            WeakLearner::CrossDelta => {
                let sample1 = depth_at(depth, row_offset as usize) as i32;
                let sample2 = depth_at(depth, (index as i32 + cur_u_offset) as usize) as i32;
                sample1 - sample2 >= self.threshold as i32
            }
        }
    }
}

/// One node of a decision tree. `left_child == LEAF` marks a leaf;
/// otherwise both children are valid indices into the same tree's
/// node array. `probs` sums to 1 for every populated node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TreeNode {
    pub coeffs: WeakLearnerCoeffs,
    pub probs: [f32; NUM_LABELS],
    pub left_child: i32,
    pub right_child: i32,
}

impl TreeNode {
    /// A leaf with the given class distribution.
    pub fn leaf(probs: [f32; NUM_LABELS]) -> TreeNode {
        TreeNode {
            coeffs: WeakLearnerCoeffs {
                u_offset: 0,
                v_offset: 0,
                threshold: 0,
                test: WeakLearner::CenterDelta,
            },
            probs: probs,
            left_child: LEAF,
            right_child: LEAF,
        }
    }

    #[inline]
    pub fn is_leaf(&self) -> bool {
        self.left_child == LEAF
    }
}

/// A single decision tree. Nodes are appended during construction and
/// never mutated afterwards; children are referenced by index.
#[derive(Debug, Clone, PartialEq)]
pub struct DecisionTree {
    pub nodes: Vec<TreeNode>,
    pub height: u32,
}

impl DecisionTree {
    pub fn num_nodes(&self) -> u32 {
        self.nodes.len() as u32
    }
}

/// An ordered sequence of independently trained trees. The order is
/// significant: evaluation may be restricted to the first k trees.
#[derive(Debug, Clone, PartialEq)]
pub struct Forest {
    pub trees: Vec<DecisionTree>,
}

impl Forest {
    pub fn new(trees: Vec<DecisionTree>) -> Forest {
        Forest { trees: trees }
    }

    pub fn num_trees(&self) -> usize {
        self.trees.len()
    }

    /// The largest height over all trees, 0 for an empty forest.
    pub fn max_height(&self) -> u32 {
        self.trees.iter().map(|t| t.height).max().unwrap_or(0)
    }
}

/// Maximum number of nodes a tree of the given height can have.
pub fn calc_tree_size(height: u32) -> u32 {
    (1u32 << height) - 1
}

/// Shannon entropy of a class distribution (in bit).
pub fn calc_entropy(probs: &[f32; NUM_LABELS]) -> f32 {
    use types::PROB_EPSILON;
    let mut ret = 0f32;
    for p in probs.iter() {
        ret += p * (p + PROB_EPSILON).log2();
    }
    -ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wl_ids() {
        for id in 0..NUM_WL_FUNCS as u8 {
            assert_eq!(WeakLearner::from_id(id).unwrap().id(), id);
        }
        assert!(WeakLearner::from_id(2).is_none());
    }

    #[test]
    fn test_tree_size() {
        assert_eq!(calc_tree_size(1), 1);
        assert_eq!(calc_tree_size(2), 3);
        assert_eq!(calc_tree_size(5), 31);
    }

    #[test]
    fn test_entropy() {
        assert!(calc_entropy(&[1.0, 0.0]).abs() < 0.001);
        assert!((calc_entropy(&[0.5, 0.5]) - 1.0).abs() < 0.001);
    }

    #[test]
    fn test_decide_out_of_image() {
        // 4x4 image, everything at depth 1 => offset of 100 leaves the image
        let depth = vec![1i16; 16];
        let coeffs = WeakLearnerCoeffs {
            u_offset: 100,
            v_offset: 0,
            threshold: -10000,
            test: WeakLearner::CenterDelta,
        };
        assert!(!coeffs.decide(0, 4, 4, &depth));
    }

    #[test]
    fn test_decide_center_delta() {
        // 2 wide, depth difference of 50 between the columns
        let depth = vec![100i16, 150, 100, 150];
        let coeffs = WeakLearnerCoeffs {
            u_offset: 100, // 100 / 100mm = 1 pixel to the right
            v_offset: 0,
            threshold: 50,
            test: WeakLearner::CenterDelta,
        };
        assert!(coeffs.decide(0, 2, 2, &depth));
        let coeffs = WeakLearnerCoeffs { threshold: 51, ..coeffs };
        assert!(!coeffs.decide(0, 2, 2, &depth));
    }

    #[test]
    fn test_decide_cross_delta() {
        let depth = vec![100i16, 100, 160, 100];
        let coeffs = WeakLearnerCoeffs {
            u_offset: 100, // one to the right at 1m
            v_offset: 100, // one down at 1m
            threshold: 60,
            test: WeakLearner::CrossDelta,
        };
        // row sample = depth[(0,1)] = 160, column sample = depth[(1,0)] = 100
        assert!(coeffs.decide(0, 2, 2, &depth));
    }
}
