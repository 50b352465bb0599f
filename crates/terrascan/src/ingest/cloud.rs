//! Cloud masking. `true` in a mask marks cloud (or shadow) to discard.

use std::sync::Arc;

use async_trait::async_trait;
use ndarray::{Array2, Zip};

use super::error::{IngestError, Stage};
use crate::config::{CloudMaskingMode, PreprocessingConfig};
use crate::raster::{Band, BandSet};
use crate::remote::InferenceClient;

#[async_trait]
pub trait CloudMasker: Send + Sync {
    async fn mask(&self, scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, IngestError>;
}

/// Offline masker: bright blue and bright across the visible range.
#[derive(Debug, Clone)]
pub struct SpectralCloudMasker {
    blue_threshold: f32,
    brightness_threshold: f32,
}

impl SpectralCloudMasker {
    pub fn new(blue_threshold: f32, brightness_threshold: f32) -> Self {
        Self {
            blue_threshold,
            brightness_threshold,
        }
    }

    /// Per-pixel test. Without a blue band nothing is flagged.
    pub fn classify(&self, bands: &BandSet) -> Result<Array2<bool>, IngestError> {
        let shape = bands
            .shape()
            .ok_or_else(|| IngestError::invalid(Stage::Masking, "scene has no bands"))?;
        let Some(blue) = bands.get(Band::Blue) else {
            tracing::debug!("No blue band, spectral cloud mask skipped");
            return Ok(Array2::from_elem(shape, false));
        };

        let mut brightness = blue.clone();
        let mut count = 1.0f32;
        for band in [Band::Green, Band::Red] {
            if let Some(data) = bands.get(band) {
                brightness += data;
                count += 1.0;
            }
        }

        let mut mask = Array2::from_elem(shape, false);
        Zip::from(&mut mask)
            .and(blue)
            .and(&brightness)
            .for_each(|m, &b, &sum| {
                // NaN comparisons are false, so invalid pixels stay unmasked.
                *m = b > self.blue_threshold && sum / count > self.brightness_threshold;
            });
        Ok(mask)
    }
}

#[async_trait]
impl CloudMasker for SpectralCloudMasker {
    async fn mask(&self, _scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, IngestError> {
        self.classify(bands)
    }
}

/// Masker that keeps every pixel.
#[derive(Debug, Clone, Default)]
pub struct NoCloudMasker;

#[async_trait]
impl CloudMasker for NoCloudMasker {
    async fn mask(&self, _scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, IngestError> {
        let shape = bands
            .shape()
            .ok_or_else(|| IngestError::invalid(Stage::Masking, "scene has no bands"))?;
        Ok(Array2::from_elem(shape, false))
    }
}

/// Delegates masking to the inference service.
pub struct RemoteCloudMasker {
    client: Arc<dyn InferenceClient>,
}

impl RemoteCloudMasker {
    pub fn new(client: Arc<dyn InferenceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl CloudMasker for RemoteCloudMasker {
    async fn mask(&self, scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, IngestError> {
        self.client
            .cloud_mask(scene_id, bands)
            .await
            .map_err(|e| IngestError::remote(Stage::Masking, e))
    }
}

/// Builds the masker selected by configuration.
pub fn masker_from_config(
    config: &PreprocessingConfig,
    inference: Option<Arc<dyn InferenceClient>>,
) -> Result<Arc<dyn CloudMasker>, IngestError> {
    match config.cloud_masking {
        CloudMaskingMode::Spectral => Ok(Arc::new(SpectralCloudMasker::new(
            config.cloud_blue_threshold as f32,
            config.cloud_brightness_threshold as f32,
        ))),
        CloudMaskingMode::None => Ok(Arc::new(NoCloudMasker)),
        CloudMaskingMode::Remote => inference
            .map(|client| Arc::new(RemoteCloudMasker::new(client)) as Arc<dyn CloudMasker>)
            .ok_or_else(|| {
                IngestError::invalid(
                    Stage::Masking,
                    "remote cloud masking configured without an inference client",
                )
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn scene() -> BandSet {
        BandSet::new()
            .with_band(Band::Blue, array![[0.05, 0.6], [0.5, f32::NAN]])
            .unwrap()
            .with_band(Band::Green, array![[0.08, 0.6], [0.1, 0.5]])
            .unwrap()
            .with_band(Band::Red, array![[0.06, 0.6], [0.1, 0.5]])
            .unwrap()
    }

    #[tokio::test]
    async fn test_spectral_mask_flags_bright_white_pixels() {
        let masker = SpectralCloudMasker::new(0.18, 0.3);
        let mask = masker.mask("s", &scene()).await.unwrap();
        assert!(!mask[[0, 0]], "dark vegetation is clear");
        assert!(mask[[0, 1]], "bright white is cloud");
        // Bright blue but dark overall (water glint) stays clear.
        assert!(!mask[[1, 0]]);
        assert!(!mask[[1, 1]], "invalid pixels are never flagged");
    }

    #[test]
    fn test_spectral_mask_without_blue() {
        let masker = SpectralCloudMasker::new(0.18, 0.3);
        let bands = BandSet::filled(2, 3, &[(Band::Red, 0.9), (Band::Nir, 0.9)]);
        let mask = masker.classify(&bands).unwrap();
        assert_eq!(mask.dim(), (2, 3));
        assert!(mask.iter().all(|m| !m));
    }

    #[test]
    fn test_empty_scene_is_an_error() {
        let masker = SpectralCloudMasker::new(0.18, 0.3);
        let err = masker.classify(&BandSet::new()).unwrap_err();
        assert_eq!(err.stage(), Some(Stage::Masking));
    }

    #[test]
    fn test_remote_mode_needs_client() {
        let config = PreprocessingConfig {
            cloud_masking: CloudMaskingMode::Remote,
            ..PreprocessingConfig::default()
        };
        assert!(masker_from_config(&config, None).is_err());
        assert!(masker_from_config(&PreprocessingConfig::default(), None).is_ok());
    }
}
