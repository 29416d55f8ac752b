pub mod classifier;
pub mod evaluator;
pub mod orchestrator;
pub mod preprocess;
pub mod sampler;
pub mod validator;

pub use crate::domain::model::{
    CanonicalColor, ClassificationResult, CubeFace, FaceCandidate, PipelineState, Provenance,
    TilePosition,
};
pub use crate::domain::ports::VisionBackend;
pub use crate::utils::error::Result;
