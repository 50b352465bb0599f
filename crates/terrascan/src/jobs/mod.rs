//! Analysis jobs: validation, asynchronous execution and lifecycle tracking.

pub mod error;
pub mod executor;
pub mod orchestrator;

pub use error::JobError;
pub use executor::{JobExecutor, JobOutput};
pub use orchestrator::{JobOrchestrator, INTERRUPTED_MESSAGE};
