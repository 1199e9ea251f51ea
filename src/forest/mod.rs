/// Randomized decision forest for per-pixel depth classification.
/// For literature see
/// * https://www.microsoft.com/en-us/research/wp-content/uploads/2016/02/BodyPartRecognition.pdf

pub mod tree;
pub mod settings;
pub mod builder;
pub mod eval;
pub mod io;
