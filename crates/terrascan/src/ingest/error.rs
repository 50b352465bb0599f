use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::DatabaseError;
use crate::error::StorageError;
use crate::raster::{CodecError, RasterError};
use crate::remote::RemoteError;

/// Step of the ingestion pipeline a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Search,
    Download,
    Correction,
    Masking,
    Conversion,
    Upload,
    Catalog,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Search => "search",
            Stage::Download => "download",
            Stage::Correction => "correction",
            Stage::Masking => "masking",
            Stage::Conversion => "conversion",
            Stage::Upload => "upload",
            Stage::Catalog => "catalog",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion failure. Displays as `"<stage>: <message>"`, which is also the
/// error recorded on a failed scene.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("{stage}: {source}")]
    Remote {
        stage: Stage,
        #[source]
        source: RemoteError,
    },

    #[error("{stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },

    #[error("{stage}: {source}")]
    Codec {
        stage: Stage,
        #[source]
        source: CodecError,
    },

    #[error("{stage}: {source}")]
    Raster {
        stage: Stage,
        #[source]
        source: RasterError,
    },

    #[error("{stage}: {message}")]
    Invalid { stage: Stage, message: String },

    #[error("catalog: {0}")]
    Catalog(#[from] DatabaseError),

    #[error("ingest cancelled")]
    Cancelled,
}

impl IngestError {
    pub fn remote(stage: Stage, source: RemoteError) -> Self {
        IngestError::Remote { stage, source }
    }

    pub fn storage(stage: Stage, source: StorageError) -> Self {
        IngestError::Storage { stage, source }
    }

    pub fn codec(stage: Stage, source: CodecError) -> Self {
        IngestError::Codec { stage, source }
    }

    pub fn raster(stage: Stage, source: RasterError) -> Self {
        IngestError::Raster { stage, source }
    }

    pub fn invalid(stage: Stage, message: impl Into<String>) -> Self {
        IngestError::Invalid {
            stage,
            message: message.into(),
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            IngestError::Remote { stage, .. }
            | IngestError::Storage { stage, .. }
            | IngestError::Codec { stage, .. }
            | IngestError::Raster { stage, .. }
            | IngestError::Invalid { stage, .. } => Some(*stage),
            IngestError::Catalog(_) => Some(Stage::Catalog),
            IngestError::Cancelled => None,
        }
    }

    /// Whether the failed stage is worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            IngestError::Remote { source, .. } => source.is_transient(),
            IngestError::Storage { source, .. } => source.is_transient(),
            _ => false,
        }
    }
}
