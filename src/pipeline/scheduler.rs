/// Fan-out/fan-in forest evaluation over a shared worker pool.
///
/// The pixel range of the downsampled grid is split once, at
/// construction, into contiguous sub-ranges (one per pool worker). Every
/// frame each sub-range is evaluated as one task; the scope acts as the
/// barrier the caller blocks on. The label sub-slices are disjoint, so
/// the tasks never need a lock, and the result does not depend on which
/// worker runs which range.

use rayon;
use std::sync::Arc;

use forest::eval::ForestEvaluator;

pub struct EvaluationScheduler {
    pool: Arc<rayon::ThreadPool>,
    /// (start pixel, length) per task. Contiguous, disjoint, covering.
    ranges: Vec<(usize, usize)>,
}

impl EvaluationScheduler {
    /// Partitions `num_pixels` over the pool's worker count.
    pub fn new(pool: Arc<rayon::ThreadPool>, num_pixels: usize) -> EvaluationScheduler {
        let partitions = pool.current_num_threads();
        EvaluationScheduler::with_partitions(pool, num_pixels, partitions)
    }

    /// Like `new` with an explicit partition count. The last range picks
    /// up the integer division remainder.
    pub fn with_partitions(pool: Arc<rayon::ThreadPool>,
                           num_pixels: usize,
                           partitions: usize)
                           -> EvaluationScheduler {
        let partitions = if partitions == 0 { 1 } else { partitions };
        let per_task = num_pixels / partitions;
        let mut ranges = Vec::with_capacity(partitions);
        for i in 0..partitions {
            let start = i * per_task;
            let len = if i == partitions - 1 {
                num_pixels - start
            } else {
                per_task
            };
            if len > 0 {
                ranges.push((start, len));
            }
        }
        EvaluationScheduler {
            pool: pool,
            ranges: ranges,
        }
    }

    pub fn num_tasks(&self) -> usize {
        self.ranges.len()
    }

    /// Classifies every pixel of `depth` into `labels`. Blocks until all
    /// sub-ranges are done; afterwards `labels` is fully written.
    pub fn evaluate(&self,
                    evaluator: &ForestEvaluator,
                    width: usize,
                    height: usize,
                    depth: &[i16],
                    labels: &mut [u8]) {
        debug_assert_eq!(depth.len(), width * height);
        debug_assert_eq!(labels.len(), width * height);
        self.pool.install(|| {
            rayon::scope(|scope| {
                let mut rest = labels;
                for &(start, len) in self.ranges.iter() {
                    let (chunk, tail) = { rest }.split_at_mut(len);
                    rest = tail;
                    scope.spawn(move |_| {
                        for (i, out) in chunk.iter_mut().enumerate() {
                            *out = evaluator.classify(start + i, width, height, depth);
                        }
                    });
                }
            });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forest::eval::ForestEvaluator;
    use forest::tree::{DecisionTree, Forest, TreeNode, WeakLearner, WeakLearnerCoeffs};
    use rayon::{Configuration, ThreadPool};
    use std::sync::Arc;

    fn test_pool(threads: usize) -> Arc<ThreadPool> {
        Arc::new(ThreadPool::new(Configuration::new().num_threads(threads)).unwrap())
    }

    fn stub_evaluator() -> ForestEvaluator {
        let mut root = TreeNode::leaf([0.5, 0.5]);
        root.coeffs = WeakLearnerCoeffs {
            u_offset: 1000,
            v_offset: 0,
            threshold: 40,
            test: WeakLearner::CenterDelta,
        };
        root.left_child = 1;
        root.right_child = 2;
        let tree = DecisionTree {
            nodes: vec![root, TreeNode::leaf([0.1, 0.9]), TreeNode::leaf([0.8, 0.2])],
            height: 2,
        };
        ForestEvaluator::new(Forest::new(vec![tree]))
    }

    fn checkerboard_depth(width: usize, height: usize) -> Vec<i16> {
        (0..width * height)
            .map(|i| if (i % width + i / width) % 2 == 0 { 920 } else { 1000 })
            .collect()
    }

    #[test]
    fn test_ranges_cover_all_pixels() {
        let scheduler = EvaluationScheduler::with_partitions(test_pool(2), 103, 4);
        let total: usize = (0..scheduler.num_tasks())
            .map(|i| scheduler.ranges[i].1)
            .sum();
        assert_eq!(total, 103);
        for window in scheduler.ranges.windows(2) {
            assert_eq!(window[0].0 + window[0].1, window[1].0);
        }
    }

    #[test]
    fn test_partition_invariant() {
        let evaluator = stub_evaluator();
        let width = 16;
        let height = 12;
        let depth = checkerboard_depth(width, height);

        let mut labels_a = vec![0u8; width * height];
        let scheduler_a = EvaluationScheduler::with_partitions(test_pool(2), width * height, 2);
        scheduler_a.evaluate(&evaluator, width, height, &depth, &mut labels_a);

        let mut labels_b = vec![0u8; width * height];
        let scheduler_b = EvaluationScheduler::with_partitions(test_pool(4), width * height, 7);
        scheduler_b.evaluate(&evaluator, width, height, &depth, &mut labels_b);

        assert_eq!(labels_a, labels_b);
    }

    #[test]
    fn test_matches_sequential_classification() {
        let evaluator = stub_evaluator();
        let width = 8;
        let height = 8;
        let depth = checkerboard_depth(width, height);

        let mut sequential = vec![0u8; width * height];
        evaluator.classify_grid(width, height, &depth, &mut sequential);

        let mut parallel = vec![0u8; width * height];
        let scheduler = EvaluationScheduler::with_partitions(test_pool(3), width * height, 3);
        scheduler.evaluate(&evaluator, width, height, &depth, &mut parallel);

        assert_eq!(sequential, parallel);
    }
}
