use thiserror::Error;

use crate::catalog::DatabaseError;
use crate::error::StorageError;
use crate::model::{JobStatus, ProcessingStatus};
use crate::raster::{CodecError, RasterError};
use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Invalid analysis request: {0}")]
    InvalidRequest(String),

    #[error("Scene not found: {0}")]
    SceneNotFound(String),

    #[error("Scene {id} is not ready (status: {status})")]
    SceneNotReady { id: String, status: ProcessingStatus },

    #[error("Job not found: {0}")]
    NotFound(String),

    #[error("Job {id} is already {status}")]
    AlreadyTerminal { id: String, status: JobStatus },

    #[error("Catalog error: {0}")]
    Catalog(#[from] DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Raster codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Raster error: {0}")]
    Raster(#[from] RasterError),

    #[error("Inference error: {0}")]
    Inference(#[from] RemoteError),

    #[error("No inference service configured")]
    InferenceUnavailable,

    #[error("Analysis task failed: {0}")]
    Task(String),

    #[error("Job cancelled")]
    Cancelled,

    #[error("Orchestrator is shutting down")]
    ShuttingDown,
}
