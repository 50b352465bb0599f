use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::raster::{ChangeMethod, SpectralIndex};

/// Lifecycle of an analysis job.
///
/// `pending -> running -> {completed, failed, cancelled}`; a pending job may
/// also fail or be cancelled before it starts. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        Self::predecessors(next).contains(self)
    }

    /// States from which `next` may be entered.
    pub fn predecessors(next: JobStatus) -> &'static [JobStatus] {
        match next {
            JobStatus::Pending => &[],
            JobStatus::Running => &[JobStatus::Pending],
            JobStatus::Completed => &[JobStatus::Running],
            JobStatus::Failed | JobStatus::Cancelled => &[JobStatus::Pending, JobStatus::Running],
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

fn default_min_confidence() -> f32 {
    0.5
}

/// The work a job performs, with its parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AnalysisKind {
    SpectralIndex {
        index: SpectralIndex,
    },
    ChangeDetection {
        method: ChangeMethod,
        /// Index to difference; required by `index_difference`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        index: Option<SpectralIndex>,
    },
    Classification {
        model: String,
    },
    ObjectDetection {
        model: String,
        #[serde(default = "default_min_confidence")]
        min_confidence: f32,
    },
}

impl AnalysisKind {
    pub fn name(&self) -> &'static str {
        match self {
            AnalysisKind::SpectralIndex { .. } => "spectral_index",
            AnalysisKind::ChangeDetection { .. } => "change_detection",
            AnalysisKind::Classification { .. } => "classification",
            AnalysisKind::ObjectDetection { .. } => "object_detection",
        }
    }

    /// Number of scenes the analysis consumes.
    pub fn required_scenes(&self) -> usize {
        match self {
            AnalysisKind::ChangeDetection { .. } => 2,
            _ => 1,
        }
    }

    /// Checks parameters that do not depend on catalog state.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            AnalysisKind::ChangeDetection {
                method: ChangeMethod::IndexDifference,
                index: None,
            } => Err("index_difference change detection requires an index".to_string()),
            AnalysisKind::Classification { model } | AnalysisKind::ObjectDetection { model, .. }
                if model.trim().is_empty() =>
            {
                Err("model name must not be empty".to_string())
            }
            AnalysisKind::ObjectDetection { min_confidence, .. }
                if !(0.0..=1.0).contains(min_confidence) =>
            {
                Err(format!(
                    "min_confidence must be within [0, 1], got {}",
                    min_confidence
                ))
            }
            _ => Ok(()),
        }
    }
}

/// A request to run an analysis over catalog scenes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisRequest {
    pub owner: String,
    pub kind: AnalysisKind,
    /// Scene catalog ids; for change detection `[before, after]`.
    pub scene_ids: Vec<String>,
}

/// A persisted analysis job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisJob {
    pub id: String,
    pub owner: String,
    pub kind: AnalysisKind,
    pub scene_ids: Vec<String>,
    pub status: JobStatus,
    pub error: Option<String>,
    /// Blob key of the result raster, if the analysis produced one.
    pub result_uri: Option<String>,
    pub summary: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl AnalysisJob {
    /// Creates a pending job for a request.
    pub fn pending(request: &AnalysisRequest) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner: request.owner.clone(),
            kind: request.kind.clone(),
            scene_ids: request.scene_ids.clone(),
            status: JobStatus::Pending,
            error: None,
            result_uri: None,
            summary: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}
