//! Progress broadcaster for scene ingestion and analysis jobs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// What a progress event is about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SubjectKind {
    Scene,
    Job,
}

/// Phase of scene preprocessing or job execution.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Discovered,
    Download,
    Correction,
    Masking,
    Conversion,
    Upload,
    Ready,
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl ProgressPhase {
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ProgressPhase::Ready
                | ProgressPhase::Completed
                | ProgressPhase::Failed
                | ProgressPhase::Cancelled
        )
    }
}

impl std::fmt::Display for ProgressPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProgressPhase::Discovered => write!(f, "Discovered"),
            ProgressPhase::Download => write!(f, "Downloading assets"),
            ProgressPhase::Correction => write!(f, "Atmospheric correction"),
            ProgressPhase::Masking => write!(f, "Cloud masking"),
            ProgressPhase::Conversion => write!(f, "Converting raster"),
            ProgressPhase::Upload => write!(f, "Uploading"),
            ProgressPhase::Ready => write!(f, "Ready"),
            ProgressPhase::Queued => write!(f, "Queued"),
            ProgressPhase::Running => write!(f, "Running"),
            ProgressPhase::Completed => write!(f, "Completed"),
            ProgressPhase::Failed => write!(f, "Failed"),
            ProgressPhase::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// A single progress update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub subject: SubjectKind,
    /// Catalog id of the scene or job.
    pub id: String,
    pub phase: ProgressPhase,
    /// Human-readable message describing current activity.
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Error message (set on failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressEvent {
    pub fn new(subject: SubjectKind, id: &str, phase: ProgressPhase, message: &str) -> Self {
        Self {
            subject,
            id: id.to_string(),
            phase,
            message: message.to_string(),
            timestamp: Utc::now(),
            error: None,
        }
    }

    pub fn failed(subject: SubjectKind, id: &str, error: &str) -> Self {
        Self {
            error: Some(error.to_string()),
            ..Self::new(subject, id, ProgressPhase::Failed, "Processing failed")
        }
    }
}

/// Sink for progress events.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter for tests and headless runs.
pub struct NoopProgress;

impl ProgressReporter for NoopProgress {
    fn report(&self, _event: ProgressEvent) {}
}

/// Broadcasts progress events to any number of subscribers.
#[derive(Clone)]
pub struct ProgressBroadcaster {
    sender: Arc<broadcast::Sender<ProgressEvent>>,
}

impl ProgressBroadcaster {
    /// Creates a broadcaster with the specified channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    /// Sends an event to all subscribers.
    pub fn send(&self, event: ProgressEvent) {
        // No active receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.sender.subscribe()
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(256)
    }
}

impl ProgressReporter for ProgressBroadcaster {
    fn report(&self, event: ProgressEvent) {
        self.send(event);
    }
}

/// Reports progress for a single scene or job.
#[derive(Clone)]
pub struct ProgressTracker {
    subject: SubjectKind,
    id: String,
    reporter: Arc<dyn ProgressReporter>,
}

impl ProgressTracker {
    pub fn new(reporter: Arc<dyn ProgressReporter>, subject: SubjectKind, id: &str) -> Self {
        Self {
            subject,
            id: id.to_string(),
            reporter,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Updates the current phase with a message.
    pub fn phase(&self, phase: ProgressPhase, message: &str) {
        self.reporter
            .report(ProgressEvent::new(self.subject, &self.id, phase, message));
    }

    /// Marks the subject as failed with an error message.
    pub fn failed(&self, error: &str) {
        self.reporter
            .report(ProgressEvent::failed(self.subject, &self.id, error));
    }
}
