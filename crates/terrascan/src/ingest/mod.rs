//! Scene ingestion: discovery, download, preprocessing and cataloguing.

pub mod cloud;
pub mod config;
pub mod context;
pub mod correction;
pub mod error;
pub mod retry;
pub mod runner;

pub use cloud::{masker_from_config, CloudMasker, NoCloudMasker, RemoteCloudMasker, SpectralCloudMasker};
pub use config::IngestConfig;
pub use correction::AtmosphericCorrector;
pub use error::{IngestError, Stage};
pub use retry::RetryPolicy;
pub use runner::{IngestPipeline, IngestReport, SceneOutcome};
