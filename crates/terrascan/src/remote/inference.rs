//! Model-serving client for cloud masking, land-cover classification and
//! object detection.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use ndarray::Array2;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::{create_http_client, status_error, RemoteError};
use crate::model::ImagerySource;
use crate::raster::codec::{self, DEFAULT_STRIP_ROWS};
use crate::raster::BandSet;

/// A geometry returned by a classification or detection model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferredFeature {
    /// Feature class, e.g. `building`.
    pub kind: String,
    pub geometry: Value,
    #[serde(default = "default_confidence")]
    pub confidence: f32,
    #[serde(default)]
    pub properties: Value,
}

fn default_confidence() -> f32 {
    1.0
}

#[async_trait]
pub trait InferenceClient: Send + Sync {
    /// Per-pixel cloud mask for a scene; `true` marks cloud or shadow.
    async fn cloud_mask(&self, scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, RemoteError>;

    /// Land-cover polygons for a ready scene.
    async fn classify(
        &self,
        model: &str,
        scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError>;

    /// Detected objects for a ready scene.
    async fn detect(
        &self,
        model: &str,
        scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError>;
}

/// JSON-over-HTTP inference client.
///
/// - `POST /v1/cloud-mask` with the scene raster (base64 TIFF), answering
///   `{width, height, mask}` where `mask` is base64 with one byte per pixel.
/// - `POST /v1/classify` and `POST /v1/detect` with the scene reference,
///   answering `{features: [...]}`.
pub struct HttpInferenceClient {
    client: Client,
    endpoint: String,
    token: Option<SecretString>,
}

#[derive(Debug, Deserialize)]
struct CloudMaskResponse {
    width: usize,
    height: usize,
    mask: String,
}

#[derive(Debug, Deserialize)]
struct FeaturesResponse {
    #[serde(default)]
    features: Vec<InferredFeature>,
}

impl HttpInferenceClient {
    pub fn new(
        endpoint: &str,
        token: Option<SecretString>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        Ok(Self {
            client: create_http_client(timeout)?,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
    ) -> Result<T, RemoteError> {
        let url = format!("{}{}", self.endpoint, path);
        let mut request = self.client.post(&url).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token.expose_secret());
        }
        let response = request
            .send()
            .await
            .map_err(|e| RemoteError::http(&url, e))?;
        if !response.status().is_success() {
            return Err(status_error(&url, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| RemoteError::invalid(&url, e.to_string()))
    }

    fn scene_body(model: &str, scene: &ImagerySource) -> Value {
        json!({
            "model": model,
            "scene_id": scene.scene_id,
            "storage_uri": scene.storage_uri,
            "bbox": scene.bbox.as_array(),
            "acquired_at": scene.acquired_at.to_rfc3339(),
        })
    }
}

/// Decodes a one-byte-per-pixel base64 mask into a boolean raster.
pub fn decode_mask(
    width: usize,
    height: usize,
    encoded: &str,
) -> Result<Array2<bool>, String> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| format!("mask is not valid base64: {}", e))?;
    if bytes.len() != width * height {
        return Err(format!(
            "mask has {} bytes for a {}x{} raster",
            bytes.len(),
            width,
            height
        ));
    }
    Array2::from_shape_vec((height, width), bytes.into_iter().map(|b| b != 0).collect())
        .map_err(|e| e.to_string())
}

#[async_trait]
impl InferenceClient for HttpInferenceClient {
    async fn cloud_mask(&self, scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, RemoteError> {
        let url = format!("{}/v1/cloud-mask", self.endpoint);
        let raster = codec::encode_bands(bands, DEFAULT_STRIP_ROWS)
            .map_err(|e| RemoteError::invalid(&url, format!("cannot encode request raster: {}", e)))?;
        let body = json!({
            "scene_id": scene_id,
            "raster": base64::engine::general_purpose::STANDARD.encode(raster),
        });
        let response: CloudMaskResponse = self.post("/v1/cloud-mask", &body).await?;

        let mask = decode_mask(response.width, response.height, &response.mask)
            .map_err(|reason| RemoteError::invalid(&url, reason))?;
        if let Some(shape) = bands.shape() {
            if mask.dim() != shape {
                return Err(RemoteError::invalid(
                    &url,
                    format!("mask shape {:?} does not match raster {:?}", mask.dim(), shape),
                ));
            }
        }
        Ok(mask)
    }

    async fn classify(
        &self,
        model: &str,
        scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError> {
        let response: FeaturesResponse = self
            .post("/v1/classify", &Self::scene_body(model, scene))
            .await?;
        Ok(response.features)
    }

    async fn detect(
        &self,
        model: &str,
        scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError> {
        let response: FeaturesResponse = self
            .post("/v1/detect", &Self::scene_body(model, scene))
            .await?;
        Ok(response.features)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_mask() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([0u8, 1, 255, 0, 0, 1]);
        let mask = decode_mask(3, 2, &encoded).unwrap();
        assert_eq!(mask.dim(), (2, 3));
        assert!(!mask[[0, 0]]);
        assert!(mask[[0, 1]]);
        assert!(mask[[0, 2]]);
        assert!(mask[[1, 2]]);
    }

    #[test]
    fn test_decode_mask_wrong_size() {
        let encoded = base64::engine::general_purpose::STANDARD.encode([0u8; 5]);
        assert!(decode_mask(3, 2, &encoded).is_err());
        assert!(decode_mask(1, 1, "***").is_err());
    }

    #[test]
    fn test_feature_defaults() {
        let feature: InferredFeature = serde_json::from_value(json!({
            "kind": "building",
            "geometry": {"type": "Point", "coordinates": [0, 0]}
        }))
        .unwrap();
        assert_eq!(feature.confidence, 1.0);
        assert!(feature.properties.is_null());
    }
}
