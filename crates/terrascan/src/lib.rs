pub mod broadcast;
pub mod cancel;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod model;
pub mod raster;
pub mod remote;
pub mod sanitize;
pub mod secrets;
pub mod service;
pub mod storage;
pub mod telemetry;

pub use broadcast::{ProgressBroadcaster, ProgressEvent, ProgressReporter};
pub use catalog::{Database, DatabaseError};
pub use config::{load_config, Config};
pub use error::{ConfigError, Result, StorageError, TerraScanError};
pub use ingest::{IngestError, IngestPipeline, IngestReport};
pub use jobs::{JobError, JobExecutor, JobOrchestrator};
pub use model::{
    AnalysisJob, AnalysisKind, AnalysisRequest, BoundingBox, ImagerySource, JobStatus,
    ProcessingStatus, VectorFeature,
};
pub use raster::{Band, BandSet, ChangeMethod, ChangeResult, RasterError, SpectralIndex};
pub use service::TerraScan;
