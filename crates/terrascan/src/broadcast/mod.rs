//! Real-time progress streaming for scenes and analysis jobs.

pub mod progress;

pub use progress::{
    NoopProgress, ProgressBroadcaster, ProgressEvent, ProgressPhase, ProgressReporter,
    ProgressTracker, SubjectKind,
};
