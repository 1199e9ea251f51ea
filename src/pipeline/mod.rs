/// The per-frame labelling pipeline: downsampling, parallel forest
/// evaluation, morphological label cleanup and blob extraction. All
/// scratch buffers are owned by the detector and reused every frame.

pub mod filters;
pub mod scheduler;
pub mod blobs;
pub mod detector;

pub use self::blobs::{Blob, BlobExtractor, HandsResult, SeedFillConfig};
pub use self::detector::{DetectorError, HandDetector, LabelMethod};
pub use self::scheduler::EvaluationScheduler;
