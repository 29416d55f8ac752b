pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::cli::CliArgs;

pub use config::CubeVisionConfig;
pub use core::orchestrator::FacePipeline;
pub use domain::model::{
    CanonicalColor, ClassificationResult, CubeFace, PipelineState, Provenance, TilePosition,
};
pub use domain::ports::VisionBackend;
pub use utils::error::{CubeError, Result};
