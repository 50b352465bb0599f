//! Catalog domain types: scenes, analysis jobs and derived vector features.

pub mod feature;
pub mod job;
pub mod scene;

pub use feature::VectorFeature;
pub use job::{AnalysisJob, AnalysisKind, AnalysisRequest, JobStatus};
pub use scene::{BoundingBox, ImagerySource, ProcessingStatus};
