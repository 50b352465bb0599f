pub mod loader;
pub mod schema;

pub use loader::{load_config, load_config_from_str};
pub use schema::{
    CloudMaskingMode, Config, InferenceConfig, LogFormat, LoggingConfig, PreprocessingConfig,
    RetryConfig, SearchConfig, StacConfig, WorkersConfig,
};
