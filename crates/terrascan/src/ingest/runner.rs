use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::try_join_all;
use futures_util::stream::{self, StreamExt};
use ndarray::Array2;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::cloud::CloudMasker;
use super::config::IngestConfig;
use super::context::SceneContext;
use super::correction::AtmosphericCorrector;
use super::error::{IngestError, Stage};
use super::retry::retry;
use crate::broadcast::{NoopProgress, ProgressPhase, ProgressReporter, ProgressTracker, SubjectKind};
use crate::cancel::OrCancel;
use crate::catalog::{scene_repo, Database, DatabaseError};
use crate::model::{ImagerySource, ProcessingStatus};
use crate::raster::{codec, resample_nearest, Band, BandSet};
use crate::remote::{AssetFetcher, SceneCandidate, SearchQuery, StacClient};
use crate::sanitize;
use crate::storage::{keys, BlobStore};

/// Final state of one discovered scene after an ingest run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SceneOutcome {
    /// Catalog id; `None` if the scene could not be registered at all.
    pub id: Option<String>,
    /// Provider-side scene id.
    pub scene_id: String,
    pub status: ProcessingStatus,
    pub error: Option<String>,
}

impl SceneOutcome {
    fn from_scene(scene: &ImagerySource) -> Self {
        Self {
            id: Some(scene.id.clone()),
            scene_id: scene.scene_id.clone(),
            status: scene.status,
            error: scene.error.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    /// One entry per discovered scene, ordered by provider scene id.
    pub scenes: Vec<SceneOutcome>,
}

impl IngestReport {
    pub fn ready(&self) -> impl Iterator<Item = &SceneOutcome> {
        self.scenes
            .iter()
            .filter(|s| s.status == ProcessingStatus::Ready)
    }

    pub fn failed(&self) -> impl Iterator<Item = &SceneOutcome> {
        self.scenes
            .iter()
            .filter(|s| s.status == ProcessingStatus::Failed)
    }

    pub fn get(&self, scene_id: &str) -> Option<&SceneOutcome> {
        self.scenes.iter().find(|s| s.scene_id == scene_id)
    }
}

/// Discovers scenes and turns each into an analysis-ready raster:
/// download, atmospheric correction, cloud masking, conversion, upload.
pub struct IngestPipeline {
    config: Arc<IngestConfig>,
    db: Database,
    stac: Arc<dyn StacClient>,
    fetcher: Arc<dyn AssetFetcher>,
    blobs: Arc<dyn BlobStore>,
    corrector: AtmosphericCorrector,
    masker: Arc<dyn CloudMasker>,
    progress: Arc<dyn ProgressReporter>,
    cancel: CancellationToken,
}

impl IngestPipeline {
    pub fn new(
        config: Arc<IngestConfig>,
        db: Database,
        stac: Arc<dyn StacClient>,
        fetcher: Arc<dyn AssetFetcher>,
        blobs: Arc<dyn BlobStore>,
        corrector: AtmosphericCorrector,
        masker: Arc<dyn CloudMasker>,
    ) -> Self {
        Self {
            config,
            db,
            stac,
            fetcher,
            blobs,
            corrector,
            masker,
            progress: Arc::new(NoopProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Stops in-flight scenes at the next stage boundary or I/O wait once
    /// `token` is cancelled. Interrupted scenes keep their status and are
    /// resumed by the next run.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Searches the catalog and processes every returned scene.
    ///
    /// Fails only if the search itself fails; per-scene failures are
    /// recorded in the report and in the catalog.
    pub async fn ingest(&self, query: &SearchQuery) -> Result<IngestReport, IngestError> {
        let span = info_span!("ingest",
            provider = %self.stac.provider(),
            bbox = ?query.bbox.as_array(),
            start = %query.start,
            end = %query.end,
        );
        async {
            query
                .validate()
                .map_err(|e| IngestError::remote(Stage::Search, e))?;

            let candidates = self
                .guard(retry(&self.config.retry, Stage::Search, || async {
                    self.stac
                        .search(query)
                        .await
                        .map_err(|e| IngestError::remote(Stage::Search, e))
                }))
                .await?;
            info!(count = candidates.len(), "Search returned scenes");

            // Two tasks driving one catalog row would race each other's
            // status updates.
            let returned = candidates.len();
            let mut seen = HashSet::new();
            let candidates: Vec<SceneCandidate> = candidates
                .into_iter()
                .filter(|c| seen.insert(c.id.clone()))
                .collect();
            if candidates.len() < returned {
                warn!(
                    duplicates = returned - candidates.len(),
                    "Search returned duplicate scenes"
                );
            }

            let mut scenes: Vec<SceneOutcome> = stream::iter(candidates)
                .map(|candidate| self.process_candidate(candidate))
                .buffer_unordered(self.config.max_concurrent_scenes.max(1))
                .collect()
                .await;
            scenes.sort_by(|a, b| a.scene_id.cmp(&b.scene_id));

            let report = IngestReport { scenes };
            info!(
                scenes = report.scenes.len(),
                ready = report.ready().count(),
                failed = report.failed().count(),
                "Ingest finished"
            );
            Ok::<_, IngestError>(report)
        }
        .instrument(span)
        .await
    }

    /// Registers a single candidate and drives it to `ready` or `failed`.
    pub async fn process_candidate(&self, candidate: SceneCandidate) -> SceneOutcome {
        let span = info_span!("scene",
            scene_id = %candidate.id,
            cloud_cover = candidate.cloud_cover,
        );
        self.run_scene(candidate).instrument(span).await
    }

    async fn run_scene(&self, candidate: SceneCandidate) -> SceneOutcome {
        let discovered = ImagerySource::discovered(self.stac.provider(), &candidate);
        let (scene, created) = match scene_repo::insert_or_get(&self.db, &discovered) {
            Ok(found) => found,
            Err(e) => {
                let err = IngestError::from(e);
                warn!(error = %err, "Could not register scene");
                return SceneOutcome {
                    id: None,
                    scene_id: candidate.id,
                    status: ProcessingStatus::Failed,
                    error: Some(err.to_string()),
                };
            }
        };

        match scene.status {
            ProcessingStatus::Ready => {
                debug!(id = %scene.id, "Scene already ready");
                return SceneOutcome::from_scene(&scene);
            }
            ProcessingStatus::Failed => {
                debug!(id = %scene.id, "Scene failed in an earlier run");
                return SceneOutcome::from_scene(&scene);
            }
            ProcessingStatus::Raw | ProcessingStatus::Corrected => {}
        }

        let tracker =
            ProgressTracker::new(Arc::clone(&self.progress), SubjectKind::Scene, &scene.id);
        if created {
            tracker.phase(
                ProgressPhase::Discovered,
                &format!("Discovered with {} band assets", candidate.assets.len()),
            );
        } else {
            info!(id = %scene.id, status = %scene.status, "Resuming scene");
        }

        let id = scene.id.clone();
        let mut ctx = SceneContext::new(scene, candidate);
        match self.preprocess(&mut ctx, &tracker).await {
            Ok(()) => {
                tracker.phase(ProgressPhase::Ready, "Scene ready for analysis");
                info!(
                    id = %id,
                    masked_pixels = ctx.masked_pixels,
                    reused_assets = ctx.reused_assets,
                    "Scene ready"
                );
                SceneOutcome::from_scene(&ctx.scene)
            }
            Err(IngestError::Cancelled) => {
                info!(id = %id, status = %ctx.scene.status, "Scene interrupted");
                SceneOutcome {
                    id: Some(id),
                    scene_id: ctx.scene.scene_id.clone(),
                    status: ctx.scene.status,
                    error: Some(IngestError::Cancelled.to_string()),
                }
            }
            Err(IngestError::Catalog(DatabaseError::InvalidTransition { from, .. })) => {
                info!(id = %id, status = %from, "Scene advanced by another worker");
                self.settled_outcome(&ctx.scene)
            }
            Err(e) => {
                let message = e.to_string();
                warn!(id = %id, error = %message, "Scene failed");
                tracker.failed(&message);
                match scene_repo::mark_failed(&self.db, &id, &message) {
                    Ok(failed) => SceneOutcome::from_scene(&failed),
                    Err(DatabaseError::InvalidTransition { from, .. }) => {
                        info!(id = %id, status = %from, "Scene settled by another worker");
                        self.settled_outcome(&ctx.scene)
                    }
                    Err(db_err) => {
                        warn!(id = %id, error = %db_err, "Could not record scene failure");
                        SceneOutcome {
                            id: Some(id),
                            scene_id: ctx.scene.scene_id.clone(),
                            status: ProcessingStatus::Failed,
                            error: Some(message),
                        }
                    }
                }
            }
        }
    }

    /// Reports the catalog's view of a scene whose row was moved on by a
    /// concurrent run.
    fn settled_outcome(&self, scene: &ImagerySource) -> SceneOutcome {
        match scene_repo::find_by_scene_id(&self.db, &scene.provider, &scene.scene_id) {
            Ok(Some(current)) => SceneOutcome::from_scene(&current),
            Ok(None) => SceneOutcome::from_scene(scene),
            Err(e) => {
                warn!(id = %scene.id, error = %e, "Could not re-read scene");
                SceneOutcome::from_scene(scene)
            }
        }
    }

    async fn preprocess(
        &self,
        ctx: &mut SceneContext,
        tracker: &ProgressTracker,
    ) -> Result<(), IngestError> {
        if ctx.scene.status == ProcessingStatus::Corrected {
            self.step_load_corrected(ctx)
                .instrument(info_span!("load_corrected"))
                .await?;
        }

        if ctx.bands.is_none() {
            tracker.phase(
                ProgressPhase::Download,
                &format!("Fetching {} band assets", ctx.candidate.assets.len()),
            );
            self.step_download(ctx)
                .instrument(info_span!("download"))
                .await?;

            tracker.phase(ProgressPhase::Correction, "Converting to surface reflectance");
            self.step_correct(ctx)
                .instrument(info_span!("correction"))
                .await?;
        }

        tracker.phase(ProgressPhase::Masking, "Masking clouds");
        self.step_mask(ctx).instrument(info_span!("masking")).await?;

        tracker.phase(ProgressPhase::Conversion, "Encoding analysis-ready raster");
        self.step_convert(ctx)
            .instrument(info_span!("conversion"))
            .await?;

        tracker.phase(ProgressPhase::Upload, "Storing raster");
        self.step_upload(ctx).instrument(info_span!("upload")).await?;

        self.step_catalog(ctx)
    }

    /// Reuses the corrected raster of an interrupted run. Leaves `bands`
    /// empty when it is gone, so the scene is recomputed from its assets.
    async fn step_load_corrected(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let key = keys::corrected(&ctx.scene.id);
        let present = self
            .blobs
            .exists(&key)
            .await
            .map_err(|e| IngestError::storage(Stage::Correction, e))?;
        if !present {
            debug!(key = %key, "Corrected raster missing, recomputing");
            return Ok(());
        }

        let bytes = self
            .guard(async {
                self.blobs
                    .get(&key)
                    .await
                    .map_err(|e| IngestError::storage(Stage::Correction, e))
            })
            .await?;
        let bands =
            codec::decode_bands(&bytes).map_err(|e| IngestError::codec(Stage::Correction, e))?;
        debug!(bands = bands.len(), "Loaded corrected raster");
        ctx.bands = Some(bands);
        Ok(())
    }

    async fn step_download(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        if ctx.candidate.assets.is_empty() {
            return Err(IngestError::invalid(
                Stage::Download,
                "scene has no recognised band assets",
            ));
        }

        let id = ctx.scene.id.clone();
        let downloads = ctx
            .candidate
            .assets
            .iter()
            .map(|(band, href)| self.fetch_band(&id, *band, href));
        let fetched = self.guard(try_join_all(downloads)).await?;

        // Bring every band onto the finest grid.
        let target = fetched
            .iter()
            .map(|(_, data, _)| data.dim())
            .max_by_key(|&(rows, cols)| rows * cols)
            .unwrap_or((0, 0));
        let mut bands = BandSet::new();
        for (band, data, reused) in fetched {
            if reused {
                ctx.reused_assets += 1;
            }
            let data = if data.dim() == target {
                data
            } else {
                debug!(band = %band, from = ?data.dim(), to = ?target, "Resampling band");
                resample_nearest(&data, target)
            };
            bands
                .insert(band, data)
                .map_err(|e| IngestError::raster(Stage::Download, e))?;
        }
        ctx.bands = Some(bands);
        Ok(())
    }

    /// Fetches one band asset, keeping a copy under `raw/` so an
    /// interrupted scene does not download it again.
    async fn fetch_band(
        &self,
        id: &str,
        band: Band,
        href: &str,
    ) -> Result<(Band, Array2<f32>, bool), IngestError> {
        let key = keys::raw_band(id, band);
        let cached = self
            .blobs
            .exists(&key)
            .await
            .map_err(|e| IngestError::storage(Stage::Download, e))?;

        let (bytes, reused) = if cached {
            let bytes = self
                .blobs
                .get(&key)
                .await
                .map_err(|e| IngestError::storage(Stage::Download, e))?;
            (bytes, true)
        } else {
            let bytes = retry(&self.config.retry, Stage::Download, || async {
                self.fetcher
                    .fetch(href)
                    .await
                    .map_err(|e| IngestError::remote(Stage::Download, e))
            })
            .await?;
            debug!(
                band = %band,
                href = %sanitize::redact_url(href),
                bytes = bytes.len(),
                "Fetched band asset"
            );
            self.put_blob(Stage::Download, &key, &bytes).await?;
            (bytes, false)
        };

        let data = codec::decode_single_band(&bytes)
            .map_err(|e| IngestError::codec(Stage::Download, e))?;
        Ok((band, data, reused))
    }

    async fn step_correct(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let raw = take_bands(ctx, Stage::Correction)?;
        let corrector = self.corrector.clone();
        let corrected = tokio::task::spawn_blocking(move || corrector.correct(raw))
            .await
            .map_err(|e| {
                IngestError::invalid(Stage::Correction, format!("correction task failed: {}", e))
            })?;

        let encoded = codec::encode_bands(&corrected, self.config.strip_rows)
            .map_err(|e| IngestError::codec(Stage::Correction, e))?;
        self.put_blob(Stage::Correction, &keys::corrected(&ctx.scene.id), &encoded)
            .await?;

        if ctx.scene.status == ProcessingStatus::Raw {
            ctx.scene = scene_repo::advance_status(
                &self.db,
                &ctx.scene.id,
                ProcessingStatus::Corrected,
            )?;
        }
        ctx.bands = Some(corrected);
        Ok(())
    }

    async fn step_mask(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let mut bands = take_bands(ctx, Stage::Masking)?;
        let scene_id = ctx.scene.scene_id.clone();
        let mask = self
            .guard(retry(&self.config.retry, Stage::Masking, || {
                self.masker.mask(&scene_id, &bands)
            }))
            .await?;

        ctx.masked_pixels = bands
            .apply_mask(&mask)
            .map_err(|e| IngestError::raster(Stage::Masking, e))?;
        debug!(masked_pixels = ctx.masked_pixels, "Cloud mask applied");
        ctx.bands = Some(bands);
        Ok(())
    }

    async fn step_convert(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let bands = take_bands(ctx, Stage::Conversion)?;
        let strip_rows = self.config.strip_rows;
        let encoded = tokio::task::spawn_blocking(move || codec::encode_bands(&bands, strip_rows))
            .await
            .map_err(|e| {
                IngestError::invalid(Stage::Conversion, format!("conversion task failed: {}", e))
            })?
            .map_err(|e| IngestError::codec(Stage::Conversion, e))?;
        debug!(bytes = encoded.len(), "Raster encoded");
        ctx.raster = Some(encoded);
        Ok(())
    }

    async fn step_upload(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        self.check_cancelled()?;
        let raster = ctx
            .raster
            .take()
            .ok_or_else(|| IngestError::invalid(Stage::Upload, "no raster to upload"))?;
        let uri = self
            .put_blob(Stage::Upload, &keys::scene(&ctx.scene.id), &raster)
            .await?;
        ctx.storage_uri = Some(uri);
        Ok(())
    }

    fn step_catalog(&self, ctx: &mut SceneContext) -> Result<(), IngestError> {
        let uri = ctx
            .storage_uri
            .as_deref()
            .ok_or_else(|| IngestError::invalid(Stage::Catalog, "raster was not stored"))?;
        ctx.scene = scene_repo::mark_ready(&self.db, &ctx.scene.id, uri)?;
        Ok(())
    }

    async fn put_blob(&self, stage: Stage, key: &str, bytes: &[u8]) -> Result<String, IngestError> {
        self.guard(retry(&self.config.retry, stage, || async {
            self.blobs
                .put(key, bytes.to_vec())
                .await
                .map_err(|e| IngestError::storage(stage, e))
        }))
        .await
    }

    /// Runs `operation` unless the pipeline is cancelled first.
    async fn guard<T, F>(&self, operation: F) -> Result<T, IngestError>
    where
        F: Future<Output = Result<T, IngestError>> + Send,
        T: Send,
    {
        operation
            .or_cancel(&self.cancel)
            .await
            .unwrap_or(Err(IngestError::Cancelled))
    }

    fn check_cancelled(&self) -> Result<(), IngestError> {
        if self.cancel.is_cancelled() {
            Err(IngestError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn take_bands(ctx: &mut SceneContext, stage: Stage) -> Result<BandSet, IngestError> {
    ctx.bands
        .take()
        .ok_or_else(|| IngestError::invalid(stage, "no bands loaded"))
}
