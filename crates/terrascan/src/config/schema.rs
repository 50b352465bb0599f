use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::model::BoundingBox;
use crate::remote::SearchQuery;
use crate::secrets::SecretRef;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    #[serde(default = "default_data_directory")]
    pub data_directory: String,
    /// Catalog database file; defaults to `<data_directory>/terrascan.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    pub stac: StacConfig,
    #[serde(default)]
    pub inference: Option<InferenceConfig>,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Search run by the command-line binary.
    #[serde(default)]
    pub search: Option<SearchConfig>,
}

fn default_data_directory() -> String {
    dirs::home_dir()
        .map(|home| {
            home.join(".terrascan")
                .join("data")
                .to_string_lossy()
                .to_string()
        })
        .unwrap_or_else(|| "~/.terrascan/data".to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StacConfig {
    /// STAC API root, e.g. `https://earth-search.aws.element84.com/v1`.
    pub endpoint: String,
    /// Provider name recorded on every discovered scene.
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,
    #[serde(default)]
    pub auth: SecretRef,
    #[serde(default = "default_stac_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

fn default_provider() -> String {
    "stac".to_string()
}

fn default_collections() -> Vec<String> {
    vec!["sentinel-2-l2a".to_string()]
}

fn default_stac_timeout() -> u64 {
    60
}

fn default_page_size() -> usize {
    100
}

fn default_max_pages() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceConfig {
    pub endpoint: String,
    #[serde(default)]
    pub auth: SecretRef,
    #[serde(default = "default_inference_timeout")]
    pub timeout_secs: u64,
}

fn default_inference_timeout() -> u64 {
    120
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudMaskingMode {
    /// Ask the inference service for a mask.
    Remote,
    /// Local brightness/whiteness test.
    #[default]
    Spectral,
    /// Keep every pixel.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PreprocessingConfig {
    #[serde(default)]
    pub cloud_masking: CloudMaskingMode,
    /// Digital number that corresponds to reflectance 1.0.
    #[serde(default = "default_quantification")]
    pub quantification: f64,
    /// Offset added to digital numbers before scaling.
    #[serde(default)]
    pub radiometric_offset: f64,
    /// Percentile of valid reflectance treated as haze in dark-object subtraction.
    #[serde(default = "default_haze_percentile")]
    pub haze_percentile: f64,
    #[serde(default = "default_cloud_blue_threshold")]
    pub cloud_blue_threshold: f64,
    #[serde(default = "default_cloud_brightness_threshold")]
    pub cloud_brightness_threshold: f64,
    /// Rows per TIFF strip in stored rasters.
    #[serde(default = "default_strip_rows")]
    pub strip_rows: u32,
}

fn default_quantification() -> f64 {
    10_000.0
}

fn default_haze_percentile() -> f64 {
    1.0
}

fn default_cloud_blue_threshold() -> f64 {
    0.18
}

fn default_cloud_brightness_threshold() -> f64 {
    0.3
}

fn default_strip_rows() -> u32 {
    crate::raster::codec::DEFAULT_STRIP_ROWS
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            cloud_masking: CloudMaskingMode::default(),
            quantification: default_quantification(),
            radiometric_offset: 0.0,
            haze_percentile: default_haze_percentile(),
            cloud_blue_threshold: default_cloud_blue_threshold(),
            cloud_brightness_threshold: default_cloud_brightness_threshold(),
            strip_rows: default_strip_rows(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff_ms() -> u64 {
    500
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            multiplier: default_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub max_concurrent_scenes: usize,
    #[serde(default = "default_worker_count")]
    pub max_concurrent_jobs: usize,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            max_concurrent_scenes: default_worker_count(),
            max_concurrent_jobs: default_worker_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    pub bbox: BoundingBox,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    #[serde(default = "default_max_cloud_cover")]
    pub max_cloud_cover: f64,
    #[serde(default)]
    pub limit: Option<usize>,
}

fn default_max_cloud_cover() -> f64 {
    100.0
}

impl SearchConfig {
    pub fn to_query(&self, collections: &[String]) -> SearchQuery {
        SearchQuery {
            bbox: self.bbox,
            start: self.start,
            end: self.end,
            max_cloud_cover: self.max_cloud_cover,
            collections: collections.to_vec(),
            limit: self.limit,
        }
    }
}

impl Config {
    /// Root directory for blobs, with `~` expanded.
    pub fn data_dir(&self) -> std::path::PathBuf {
        std::path::PathBuf::from(crate::secrets::expand_home(&self.data_directory))
    }

    /// Catalog database file, with `~` expanded.
    pub fn database_file(&self) -> std::path::PathBuf {
        match &self.database_path {
            Some(path) => std::path::PathBuf::from(crate::secrets::expand_home(path)),
            None => self.data_dir().join("terrascan.db"),
        }
    }
}
