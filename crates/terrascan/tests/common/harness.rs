//! Isolated environment for pipeline and job tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use ndarray::Array2;
use tempfile::TempDir;

use terrascan::broadcast::{NoopProgress, ProgressReporter};
use terrascan::catalog::scene_repo;
use terrascan::ingest::{AtmosphericCorrector, CloudMasker, IngestConfig, IngestPipeline, RetryPolicy};
use terrascan::jobs::{JobExecutor, JobOrchestrator};
use terrascan::raster::codec;
use terrascan::remote::{AssetFetcher, HttpFetcher, InferenceClient, SceneCandidate, SearchQuery, StacClient};
use terrascan::storage::{keys, BlobStore, FileBlobStore};
use terrascan::{Band, BandSet, BoundingBox, Database, ImagerySource, ProcessingStatus};

pub struct TestHarness {
    temp_dir: TempDir,
    /// Directory holding band assets served through `file://` hrefs.
    pub asset_dir: PathBuf,
    pub db: Database,
    pub blobs: Arc<FileBlobStore>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let asset_dir = temp_dir.path().join("assets");
        std::fs::create_dir_all(&asset_dir).expect("Failed to create asset directory");
        let blobs = Arc::new(FileBlobStore::new(temp_dir.path().join("blobs")));
        Self {
            temp_dir,
            asset_dir,
            db: Database::open_in_memory().expect("Failed to open catalog"),
            blobs,
        }
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn blob_store(&self) -> Arc<dyn BlobStore> {
        self.blobs.clone()
    }

    /// Writes a single-band TIFF of digital numbers and returns its href.
    pub fn write_asset(&self, scene_id: &str, band: Band, data: &Array2<f32>) -> String {
        let path = self.asset_dir.join(format!("{}_{}.tif", scene_id, band));
        let bytes = codec::encode_layers(&[(band.as_str(), data)], 16).expect("encode asset");
        std::fs::write(&path, bytes).expect("write asset");
        format!("file://{}", path.display())
    }

    /// A candidate whose assets are written to disk from `bands`.
    pub fn candidate(&self, scene_id: &str, bands: &[(Band, Array2<f32>)]) -> SceneCandidate {
        let assets: BTreeMap<Band, String> = bands
            .iter()
            .map(|(band, data)| (*band, self.write_asset(scene_id, *band, data)))
            .collect();
        Self::candidate_with_assets(scene_id, assets)
    }

    /// A candidate pointing at arbitrary hrefs.
    pub fn candidate_with_assets(scene_id: &str, assets: BTreeMap<Band, String>) -> SceneCandidate {
        let bbox = BoundingBox::new(10.0, 45.0, 10.5, 45.5);
        SceneCandidate {
            id: scene_id.to_string(),
            collection: Some("sentinel-2-l2a".to_string()),
            acquired_at: Utc.with_ymd_and_hms(2024, 6, 1, 10, 30, 0).unwrap(),
            cloud_cover: 5.0,
            footprint: bbox.to_polygon(),
            bbox,
            resolution_m: Some(10.0),
            assets,
        }
    }

    pub fn query() -> SearchQuery {
        SearchQuery {
            bbox: BoundingBox::new(10.0, 45.0, 11.0, 46.0),
            start: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            end: Utc.with_ymd_and_hms(2024, 7, 1, 0, 0, 0).unwrap(),
            max_cloud_cover: 20.0,
            collections: vec!["sentinel-2-l2a".to_string()],
            limit: None,
        }
    }

    pub fn ingest_config(retry: RetryPolicy) -> Arc<IngestConfig> {
        Arc::new(IngestConfig {
            max_concurrent_scenes: 2,
            retry,
            strip_rows: 4,
        })
    }

    /// Quick retries so transient-failure tests stay fast.
    pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(1),
            multiplier: 2.0,
            max_backoff: Duration::from_millis(5),
        }
    }

    pub fn file_fetcher() -> HttpFetcher {
        HttpFetcher::new(None, Duration::from_secs(5)).expect("build fetcher")
    }

    pub fn pipeline(
        &self,
        stac: Arc<dyn StacClient>,
        fetcher: Arc<dyn AssetFetcher>,
        masker: Arc<dyn CloudMasker>,
        retry: RetryPolicy,
    ) -> IngestPipeline {
        IngestPipeline::new(
            Self::ingest_config(retry),
            self.db.clone(),
            stac,
            fetcher,
            self.blob_store(),
            AtmosphericCorrector::new(10_000.0, 0.0, 0.0),
            masker,
        )
    }

    pub fn orchestrator(
        &self,
        inference: Option<Arc<dyn InferenceClient>>,
        max_concurrent: usize,
        progress: Arc<dyn ProgressReporter>,
    ) -> JobOrchestrator {
        let executor = JobExecutor::new(self.db.clone(), self.blob_store(), inference)
            .with_strip_rows(4);
        JobOrchestrator::new(self.db.clone(), executor, max_concurrent, progress)
    }

    pub fn quiet_orchestrator(
        &self,
        inference: Option<Arc<dyn InferenceClient>>,
        max_concurrent: usize,
    ) -> JobOrchestrator {
        self.orchestrator(inference, max_concurrent, Arc::new(NoopProgress))
    }

    /// Registers a scene in `status` without running the pipeline.
    pub fn register_scene(&self, scene_id: &str, status: ProcessingStatus) -> ImagerySource {
        let candidate = Self::candidate_with_assets(scene_id, BTreeMap::new());
        let scene = ImagerySource::discovered("fake-stac", &candidate);
        let (scene, _) = scene_repo::insert_or_get(&self.db, &scene).expect("insert scene");
        match status {
            ProcessingStatus::Raw => scene,
            ProcessingStatus::Corrected => {
                scene_repo::advance_status(&self.db, &scene.id, ProcessingStatus::Corrected)
                    .expect("advance scene")
            }
            ProcessingStatus::Failed => {
                scene_repo::mark_failed(&self.db, &scene.id, "broken").expect("fail scene")
            }
            ProcessingStatus::Ready => panic!("use ready_scene for ready scenes"),
        }
    }

    /// Stores `bands` as the analysis-ready raster of a new `ready` scene and
    /// returns its catalog id.
    pub async fn ready_scene(&self, scene_id: &str, bands: &BandSet) -> String {
        let scene = self.register_scene(scene_id, ProcessingStatus::Raw);
        let key = keys::scene(&scene.id);
        let bytes = codec::encode_bands(bands, 4).expect("encode scene");
        self.blobs.put(&key, bytes).await.expect("store scene");
        scene_repo::advance_status(&self.db, &scene.id, ProcessingStatus::Corrected)
            .expect("advance scene");
        scene_repo::mark_ready(&self.db, &scene.id, &key).expect("mark ready");
        scene.id
    }
}

/// Digital numbers rising across the raster from `base` in steps of `step`.
pub fn gradient(rows: usize, cols: usize, base: f32, step: f32) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |(r, c)| base + (r * cols + c) as f32 * step)
}
