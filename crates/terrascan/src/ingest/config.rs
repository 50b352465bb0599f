use super::retry::RetryPolicy;
use crate::config::Config;
use crate::raster::codec::DEFAULT_STRIP_ROWS;

/// Runtime settings of the ingestion pipeline.
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub max_concurrent_scenes: usize,
    pub retry: RetryPolicy,
    /// Rows per TIFF strip in stored rasters.
    pub strip_rows: u32,
}

impl IngestConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_concurrent_scenes: config.workers.max_concurrent_scenes.max(1),
            retry: RetryPolicy::from(&config.retry),
            strip_rows: config.preprocessing.strip_rows,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scenes: num_cpus::get(),
            retry: RetryPolicy::default(),
            strip_rows: DEFAULT_STRIP_ROWS,
        }
    }
}
