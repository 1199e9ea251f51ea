/// Per-pixel evaluation of a trained forest.

use super::tree::Forest;
use types::{depth_is_valid, NUM_LABELS};

/// How the per-tree leaf distributions are combined into one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafAggregation {
    /// Sum of the leaf probabilities, robust against a single bad tree.
    Sum,
    /// Product of the leaf probabilities, a single zero vetoes the class.
    Product,
}

/// Evaluates a forest over depth buffers. The number of trees and the
/// maximum descent height can be restricted below what the forest was
/// trained with, e.g. to trade accuracy for speed at run time.
pub struct ForestEvaluator {
    forest: Forest,
    num_trees: usize,
    max_height: u32,
    aggregation: LeafAggregation,
}

impl ForestEvaluator {
    pub fn new(forest: Forest) -> ForestEvaluator {
        let num_trees = forest.num_trees();
        let max_height = forest.max_height();
        ForestEvaluator {
            forest: forest,
            num_trees: num_trees,
            max_height: max_height,
            aggregation: LeafAggregation::Sum,
        }
    }

    pub fn with_aggregation(forest: Forest, aggregation: LeafAggregation) -> ForestEvaluator {
        let mut evaluator = ForestEvaluator::new(forest);
        evaluator.aggregation = aggregation;
        evaluator
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn num_trees(&self) -> usize {
        self.num_trees
    }

    /// Restricts evaluation to the first `num_trees` trees. Clamped to
    /// the size of the forest.
    pub fn set_num_trees(&mut self, num_trees: usize) {
        if num_trees > self.forest.num_trees() {
            warn!("requested {} trees, forest only has {}",
                  num_trees,
                  self.forest.num_trees());
            self.num_trees = self.forest.num_trees();
        } else {
            self.num_trees = num_trees;
        }
    }

    pub fn max_height(&self) -> u32 {
        self.max_height
    }

    /// Restricts the descent depth. Clamped to the tallest tree.
    pub fn set_max_height(&mut self, max_height: u32) {
        if max_height > self.forest.max_height() {
            warn!("requested height {}, forest only has {}",
                  max_height,
                  self.forest.max_height());
            self.max_height = self.forest.max_height();
        } else {
            self.max_height = max_height;
        }
    }

    /// Classifies the pixel at `index` of a `width` x `height` depth
    /// buffer. Pixels without valid depth are always background (0).
    /// Ties pick the lowest label.
    pub fn classify(&self, index: usize, width: usize, height: usize, depth: &[i16]) -> u8 {
        if !depth_is_valid(depth[index]) {
            return 0;
        }
        let init = match self.aggregation {
            LeafAggregation::Sum => 0f32,
            LeafAggregation::Product => 1f32,
        };
        let mut accumulated = [init; NUM_LABELS];
        for tree in self.forest.trees.iter().take(self.num_trees) {
            let mut cur_node = &tree.nodes[0];
            let mut cur_height = 1;
            // A node is terminal when it carries no children or the
            // descent budget for this evaluation is spent.
            while cur_height < self.max_height && cur_height < tree.height &&
                  !cur_node.is_leaf() {
                if cur_node.coeffs.decide(index, width, height, depth) {
                    cur_node = &tree.nodes[cur_node.left_child as usize];
                } else {
                    cur_node = &tree.nodes[cur_node.right_child as usize];
                }
                cur_height += 1;
            }
            for i in 0..NUM_LABELS {
                match self.aggregation {
                    LeafAggregation::Sum => accumulated[i] += cur_node.probs[i],
                    LeafAggregation::Product => accumulated[i] *= cur_node.probs[i],
                }
            }
        }
        let mut best = 0;
        for i in 1..NUM_LABELS {
            if accumulated[i] > accumulated[best] {
                best = i;
            }
        }
        best as u8
    }

    /// Classifies a whole depth buffer into `labels`. Both buffers must
    /// have `width * height` entries.
    pub fn classify_grid(&self, width: usize, height: usize, depth: &[i16], labels: &mut [u8]) {
        debug_assert_eq!(depth.len(), width * height);
        debug_assert_eq!(labels.len(), width * height);
        for index in 0..width * height {
            labels[index] = self.classify(index, width, height, depth);
        }
    }

    /// Fraction of pixels whose predicted label disagrees with the given
    /// ground truth. Used to monitor training.
    pub fn evaluate_error(&self,
                          width: usize,
                          height: usize,
                          depth: &[i16],
                          truth: &[u8])
                          -> f32 {
        let mut predicted = vec![0u8; width * height];
        self.classify_grid(width, height, depth, &mut predicted);
        let wrong = predicted.iter().zip(truth.iter()).filter(|&(a, b)| a != b).count();
        wrong as f32 / (width * height) as f32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest::tree::{DecisionTree, Forest, TreeNode, WeakLearner, WeakLearnerCoeffs};

    /// A stub tree: root splits on "right neighbor 40mm further away",
    /// left child says hand, right child says background.
    fn stub_tree() -> DecisionTree {
        let mut root = TreeNode::leaf([0.5, 0.5]);
        root.coeffs = WeakLearnerCoeffs {
            u_offset: 1000,
            v_offset: 0,
            threshold: 40,
            test: WeakLearner::CenterDelta,
        };
        root.left_child = 1;
        root.right_child = 2;
        DecisionTree {
            nodes: vec![root, TreeNode::leaf([0.1, 0.9]), TreeNode::leaf([0.8, 0.2])],
            height: 2,
        }
    }

    #[test]
    fn test_invalid_depth_is_background() {
        let evaluator = ForestEvaluator::new(Forest::new(vec![stub_tree()]));
        let depth = vec![0i16, 1000, 1000, 1000];
        assert_eq!(evaluator.classify(0, 2, 2, &depth), 0);
    }

    #[test]
    fn test_classify_descends() {
        let evaluator = ForestEvaluator::new(Forest::new(vec![stub_tree()]));
        // Pixel 0 at 920mm, right neighbor 80mm further => goes left => hand.
        let depth = vec![920i16, 1000, 920, 1000];
        assert_eq!(evaluator.classify(0, 2, 2, &depth), 1);
        // Pixel 1 has no right neighbor => false => right => background.
        assert_eq!(evaluator.classify(1, 2, 2, &depth), 0);
    }

    #[test]
    fn test_height_restriction() {
        let mut evaluator = ForestEvaluator::new(Forest::new(vec![stub_tree()]));
        evaluator.set_max_height(1);
        // Root distribution is tied, so the lowest label wins.
        let depth = vec![920i16, 1000, 920, 1000];
        assert_eq!(evaluator.classify(0, 2, 2, &depth), 0);
    }

    #[test]
    fn test_product_aggregation() {
        fn leaf_tree(probs: [f32; 2]) -> DecisionTree {
            DecisionTree {
                nodes: vec![TreeNode::leaf(probs)],
                height: 1,
            }
        }
        let depth = vec![500i16];

        // The accumulator starts at one, so a single tree reproduces its
        // own leaf distribution instead of collapsing to all zeros.
        let single = ForestEvaluator::with_aggregation(Forest::new(vec![leaf_tree([0.3, 0.7])]),
                                                       LeafAggregation::Product);
        assert_eq!(single.classify(0, 1, 1, &depth), 1);

        // Two trees vote hand, one pure background tree holds a zero for
        // it. The sum still picks hand, the product is vetoed.
        let trees =
            vec![leaf_tree([0.1, 0.9]), leaf_tree([0.1, 0.9]), leaf_tree([1.0, 0.0])];
        let summed = ForestEvaluator::new(Forest::new(trees.clone()));
        assert_eq!(summed.classify(0, 1, 1, &depth), 1);
        let multiplied = ForestEvaluator::with_aggregation(Forest::new(trees),
                                                           LeafAggregation::Product);
        assert_eq!(multiplied.classify(0, 1, 1, &depth), 0);
    }

    #[test]
    fn test_restrictions_clamped() {
        let mut evaluator = ForestEvaluator::new(Forest::new(vec![stub_tree()]));
        evaluator.set_num_trees(5);
        assert_eq!(evaluator.num_trees(), 1);
        evaluator.set_max_height(100);
        assert_eq!(evaluator.max_height(), 2);
    }

    #[test]
    fn test_evaluate_error() {
        let evaluator = ForestEvaluator::new(Forest::new(vec![stub_tree()]));
        let depth = vec![920i16, 1000, 920, 1000];
        let truth = vec![1u8, 0, 1, 0];
        // Pixels 0 and 2 classify as hand, 1 and 3 fall off the image and
        // go right => zero error against this truth.
        assert!(evaluator.evaluate_error(2, 2, &depth, &truth) < 0.001);
    }
}
