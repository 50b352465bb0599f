//! In-process stand-ins for the remote services.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ndarray::Array2;

use terrascan::remote::{
    AssetFetcher, InferenceClient, InferredFeature, RemoteError, SceneCandidate, SearchQuery,
    StacClient,
};
use terrascan::{BandSet, ImagerySource};
use tokio::sync::Notify;

/// Returns a fixed list of candidates and counts searches.
pub struct FakeStac {
    provider: String,
    candidates: Vec<SceneCandidate>,
    pub searches: AtomicUsize,
}

impl FakeStac {
    pub fn new(candidates: Vec<SceneCandidate>) -> Arc<Self> {
        Self::for_provider("fake-stac", candidates)
    }

    pub fn for_provider(provider: &str, candidates: Vec<SceneCandidate>) -> Arc<Self> {
        Arc::new(Self {
            provider: provider.to_string(),
            candidates,
            searches: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl StacClient for FakeStac {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn search(&self, query: &SearchQuery) -> Result<Vec<SceneCandidate>, RemoteError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        let mut found: Vec<SceneCandidate> = self
            .candidates
            .iter()
            .filter(|c| c.cloud_cover <= query.max_cloud_cover)
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

/// Wraps another fetcher and answers the first `failures` calls with
/// HTTP 503.
pub struct FlakyFetcher<F> {
    inner: F,
    failures: usize,
    pub calls: AtomicUsize,
}

impl<F: AssetFetcher> FlakyFetcher<F> {
    pub fn new(inner: F, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            inner,
            failures,
            calls: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl<F: AssetFetcher> AssetFetcher for FlakyFetcher<F> {
    async fn fetch(&self, href: &str) -> Result<Vec<u8>, RemoteError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            return Err(RemoteError::Status {
                url: href.to_string(),
                status: 503,
                body: "try again".to_string(),
            });
        }
        self.inner.fetch(href).await
    }
}

/// Inference service returning canned features, optionally after a delay.
pub struct FakeInference {
    features: Vec<InferredFeature>,
    delay: Duration,
    gate: Option<Arc<Notify>>,
    pub calls: AtomicUsize,
}

impl FakeInference {
    pub fn new(features: Vec<InferredFeature>) -> Self {
        Self {
            features,
            delay: Duration::ZERO,
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Holds every answer back until the returned handle is notified.
    pub fn gated(features: Vec<InferredFeature>) -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let fake = Self {
            gate: Some(Arc::clone(&gate)),
            ..Self::new(features)
        };
        (fake, gate)
    }

    /// Never answers within a test's lifetime unless cancelled.
    pub fn stalled() -> Self {
        Self {
            features: vec![],
            delay: Duration::from_secs(600),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    async fn respond(&self) -> Result<Vec<InferredFeature>, RemoteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(self.features.clone())
    }
}

#[async_trait]
impl InferenceClient for FakeInference {
    async fn cloud_mask(&self, _scene_id: &str, bands: &BandSet) -> Result<Array2<bool>, RemoteError> {
        let shape = bands.shape().unwrap_or((0, 0));
        Ok(Array2::from_elem(shape, false))
    }

    async fn classify(
        &self,
        _model: &str,
        _scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError> {
        self.respond().await
    }

    async fn detect(
        &self,
        _model: &str,
        _scene: &ImagerySource,
    ) -> Result<Vec<InferredFeature>, RemoteError> {
        self.respond().await
    }
}

/// A feature as a detection model would return it.
pub fn detection(kind: &str, confidence: f32) -> InferredFeature {
    InferredFeature {
        kind: kind.to_string(),
        geometry: serde_json::json!({"type": "Point", "coordinates": [0.5, 0.5]}),
        confidence,
        properties: serde_json::json!({"source": "fake"}),
    }
}
