/// Hyperparameters for tree induction and the coefficient pools the
/// candidate weak learners are drawn from. Both can be loaded from a
/// JSON settings file, so no recompile is needed for a new experiment.

use super::tree::WeakLearner;
use serde_json;
use std::error::Error;
use std::fmt;
use std::fs::File;
use std::io;
use std::io::Write;
use std::path::Path;

/// Per tree hyperparameters. Every tree gets its own instance;
/// independent seeds allow trees to be grown in parallel.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Maximum height the tree may reach (root has height 1).
    pub tree_height: u32,
    /// Stop sampling candidates at a node once a split reaches this gain.
    pub min_info_gain: f32,
    /// Cap on sampled pixels per image and label.
    pub max_pix_per_im_per_label: u32,
    /// Number of candidate weak learners drawn per node (with replacement).
    pub num_samples_per_node: u32,
    /// Seed of the per-tree random number generator.
    pub seed: u64,
}

/// The coefficient pools candidate weak learners are drawn from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WeakLearnerPool {
    pub u_offsets: Vec<i32>,
    pub v_offsets: Vec<i32>,
    pub thresholds: Vec<i16>,
    pub tests: Vec<WeakLearner>,
}

impl WeakLearnerPool {
    /// The pool used for the kinect hand forests: offsets are logarithmically
    /// spaced real world units (1000 is one pixel at 1m), thresholds span
    /// sub-millimeter noise up to gross depth steps.
    pub fn default_kinect_pool() -> WeakLearnerPool {
        let offsets: Vec<i32> = vec![0, 398, 631, 1000, 1585, 2512, 3981, 6310, 10000,
                                     15850, 25120, 39810, 63100, 100000, 158500, 251200,
                                     398100, 631000, -398, -631, -1000, -1585, -2512,
                                     -3981, -6310, -10000, -15850, -25120, -39810,
                                     -63100, -100000, -158500, -251200, -398100, -631000];
        let thresholds: Vec<i16> = vec![0, 1, 2, 3, 4, 5, 6, 8, 10, 12, 15, 25, 50, 75,
                                        100, 250, 500, 750, 1000, 1250, 1500, -1, -2, -3,
                                        -4, -5, -6, -8, -10, -12, -15, -25, -50, -75,
                                        -100, -250, -500, -750, -1000, -1250, -1500];
        WeakLearnerPool {
            u_offsets: offsets.clone(),
            v_offsets: offsets,
            thresholds: thresholds,
            tests: vec![WeakLearner::CenterDelta, WeakLearner::CrossDelta],
        }
    }

    /// Number of distinct coefficient permutations this pool can produce.
    pub fn num_permutations(&self) -> u64 {
        self.u_offsets.len() as u64 * self.v_offsets.len() as u64 *
        self.thresholds.len() as u64 * self.tests.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.u_offsets.is_empty() || self.v_offsets.is_empty() ||
        self.thresholds.is_empty() || self.tests.is_empty()
    }
}

/// Everything needed to train a whole forest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    pub num_trees: u32,
    /// Template settings; the seed is re-derived per tree.
    pub settings: TrainingSettings,
    pub pool: WeakLearnerPool,
}

impl TrainingConfig {
    /// The settings of tree number `index`: same hyperparameters,
    /// tree specific seed.
    pub fn settings_for_tree(&self, index: u32) -> TrainingSettings {
        let mut settings = self.settings;
        settings.seed = self.settings.seed.wrapping_add(index as u64);
        settings
    }

    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<TrainingConfig, SettingsError> {
        let file = File::open(path)?;
        let config: TrainingConfig = serde_json::from_reader(file)?;
        if config.pool.is_empty() {
            return Err(SettingsError::EmptyPool);
        }
        Ok(config)
    }

    pub fn to_json_file<P: AsRef<Path>>(&self, path: P) -> Result<(), SettingsError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

// Error Definitions

#[derive(Debug)]
pub enum SettingsError {
    Io(io::Error),
    Json(serde_json::Error),
    EmptyPool,
}

impl From<io::Error> for SettingsError {
    fn from(err: io::Error) -> Self {
        SettingsError::Io(err)
    }
}

impl From<serde_json::Error> for SettingsError {
    fn from(err: serde_json::Error) -> Self {
        SettingsError::Json(err)
    }
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            SettingsError::Io(ref err) => err.fmt(f),
            SettingsError::Json(ref err) => err.fmt(f),
            SettingsError::EmptyPool => {
                write!(f, "One of the weak learner coefficient pools is empty")
            }
        }
    }
}

impl Error for SettingsError {
    fn description(&self) -> &str {
        match *self {
            SettingsError::Io(ref err) => err.description(),
            SettingsError::Json(ref err) => err.description(),
            SettingsError::EmptyPool => "empty weak learner pool",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool() {
        let pool = WeakLearnerPool::default_kinect_pool();
        assert!(!pool.is_empty());
        assert_eq!(pool.u_offsets.len(), 35);
        assert_eq!(pool.thresholds.len(), 41);
        assert_eq!(pool.num_permutations(), 35 * 35 * 41 * 2);
    }

    #[test]
    fn test_per_tree_seeds() {
        let config = TrainingConfig {
            num_trees: 4,
            settings: TrainingSettings {
                tree_height: 10,
                min_info_gain: 0.01,
                max_pix_per_im_per_label: 500,
                num_samples_per_node: 1000,
                seed: 42,
            },
            pool: WeakLearnerPool::default_kinect_pool(),
        };
        assert_eq!(config.settings_for_tree(0).seed, 42);
        assert_eq!(config.settings_for_tree(3).seed, 45);
    }
}
