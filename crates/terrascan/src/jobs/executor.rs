//! Runs the analysis behind a job: loads scene rasters from the blob store,
//! computes on the blocking pool and persists results.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::Array2;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::error::JobError;
use crate::cancel::OrCancel;
use crate::catalog::{scene_repo, Database};
use crate::model::{AnalysisJob, AnalysisKind, ImagerySource, VectorFeature};
use crate::raster::codec::{self, DEFAULT_STRIP_ROWS};
use crate::raster::{change, index, BandSet, ChangeMethod, SpectralIndex};
use crate::remote::{InferenceClient, InferredFeature};
use crate::storage::{keys, BlobStore};

/// What a finished analysis produced.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutput {
    /// Blob key of the result raster, if any.
    pub result_uri: Option<String>,
    pub summary: Value,
    /// Features to persist together with the job's completion.
    pub features: Vec<VectorFeature>,
}

#[derive(Clone)]
pub struct JobExecutor {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    inference: Option<Arc<dyn InferenceClient>>,
    strip_rows: u32,
}

#[derive(Debug, Clone, Copy)]
enum InferenceTask {
    Classify,
    Detect { min_confidence: f32 },
}

impl JobExecutor {
    pub fn new(
        db: Database,
        blobs: Arc<dyn BlobStore>,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Self {
        Self {
            db,
            blobs,
            inference,
            strip_rows: DEFAULT_STRIP_ROWS,
        }
    }

    pub fn with_strip_rows(mut self, strip_rows: u32) -> Self {
        self.strip_rows = strip_rows.max(1);
        self
    }

    /// Executes `job`, returning `JobError::Cancelled` as soon as `cancel`
    /// fires while waiting on I/O or between steps.
    pub async fn execute(
        &self,
        job: &AnalysisJob,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let scenes = self.load_scenes(job)?;
        match &job.kind {
            AnalysisKind::SpectralIndex { index } => {
                self.run_index(job, *index, &scenes[0], cancel).await
            }
            AnalysisKind::ChangeDetection { method, index } => {
                self.run_change(job, *method, *index, &scenes, cancel)
                    .await
            }
            AnalysisKind::Classification { model } => {
                self.run_inference(job, model, &scenes[0], InferenceTask::Classify, cancel)
                    .await
            }
            AnalysisKind::ObjectDetection {
                model,
                min_confidence,
            } => {
                let task = InferenceTask::Detect {
                    min_confidence: *min_confidence,
                };
                self.run_inference(job, model, &scenes[0], task, cancel)
                    .await
            }
        }
    }

    /// Catalog records of the job's scenes, in request order. Every scene
    /// must still be `ready`.
    fn load_scenes(&self, job: &AnalysisJob) -> Result<Vec<ImagerySource>, JobError> {
        if job.scene_ids.len() != job.kind.required_scenes() {
            return Err(JobError::InvalidRequest(format!(
                "{} needs {} scene(s), job has {}",
                job.kind.name(),
                job.kind.required_scenes(),
                job.scene_ids.len()
            )));
        }
        job.scene_ids
            .iter()
            .map(|id| {
                let scene = scene_repo::find_by_id(&self.db, id)?
                    .ok_or_else(|| JobError::SceneNotFound(id.clone()))?;
                if !scene.is_ready() || scene.storage_uri.is_none() {
                    return Err(JobError::SceneNotReady {
                        id: id.clone(),
                        status: scene.status,
                    });
                }
                Ok(scene)
            })
            .collect()
    }

    async fn load_bands(
        &self,
        scene: &ImagerySource,
        cancel: &CancellationToken,
    ) -> Result<BandSet, JobError> {
        let key = scene
            .storage_uri
            .clone()
            .ok_or_else(|| JobError::SceneNotReady {
                id: scene.id.clone(),
                status: scene.status,
            })?;
        let bytes = self
            .blobs
            .get(&key)
            .or_cancel(cancel)
            .await
            .map_err(|_| JobError::Cancelled)??;
        let bands = blocking(move || codec::decode_bands(&bytes)).await??;
        debug!(scene = %scene.scene_id, bands = bands.len(), "Loaded scene raster");
        Ok(bands)
    }

    async fn store_result(
        &self,
        job: &AnalysisJob,
        layers: &[(&str, &Array2<f32>)],
        cancel: &CancellationToken,
    ) -> Result<String, JobError> {
        let encoded = codec::encode_layers(layers, self.strip_rows)?;
        check(cancel)?;
        let uri = self
            .blobs
            .put(&keys::job_result(&job.id), encoded)
            .or_cancel(cancel)
            .await
            .map_err(|_| JobError::Cancelled)??;
        Ok(uri)
    }

    async fn run_index(
        &self,
        job: &AnalysisJob,
        selected: SpectralIndex,
        scene: &ImagerySource,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let bands = self.load_bands(scene, cancel).await?;
        check(cancel)?;

        let values = blocking(move || index::compute(selected, &bands)).await??;
        let stats = index::summarize(&values);
        check(cancel)?;

        let uri = self
            .store_result(job, &[(selected.as_str(), &values)], cancel)
            .await?;
        info!(
            index = %selected,
            valid_pixels = stats.valid_pixels,
            "Spectral index computed"
        );
        Ok(JobOutput {
            result_uri: Some(uri),
            summary: json!({
                "type": job.kind.name(),
                "index": selected,
                "scene_id": scene.id,
                "min": stats.min,
                "max": stats.max,
                "mean": stats.mean,
                "valid_pixels": stats.valid_pixels,
                "total_pixels": stats.total_pixels,
            }),
            features: Vec::new(),
        })
    }

    async fn run_change(
        &self,
        job: &AnalysisJob,
        method: ChangeMethod,
        selected: Option<SpectralIndex>,
        scenes: &[ImagerySource],
        cancel: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let (before, after) = tokio::try_join!(
            self.load_bands(&scenes[0], cancel),
            self.load_bands(&scenes[1], cancel)
        )?;
        check(cancel)?;

        let result =
            blocking(move || change::detect(method, selected, &before, &after)).await??;
        check(cancel)?;

        let mask = result.mask.mapv(|changed| if changed { 1.0f32 } else { 0.0 });
        let uri = self
            .store_result(
                job,
                &[("magnitude", &result.magnitude), ("changed", &mask)],
                cancel,
            )
            .await?;

        let fraction = if result.valid_pixels > 0 {
            result.changed_pixels as f64 / result.valid_pixels as f64
        } else {
            0.0
        };
        info!(
            method = method.as_str(),
            threshold = result.threshold,
            changed_pixels = result.changed_pixels,
            "Change detection finished"
        );
        Ok(JobOutput {
            result_uri: Some(uri),
            summary: json!({
                "type": job.kind.name(),
                "method": method,
                "index": selected,
                "before_scene_id": scenes[0].id,
                "after_scene_id": scenes[1].id,
                "threshold": result.threshold,
                "changed_pixels": result.changed_pixels,
                "valid_pixels": result.valid_pixels,
                "changed_fraction": fraction,
            }),
            features: Vec::new(),
        })
    }

    async fn run_inference(
        &self,
        job: &AnalysisJob,
        model: &str,
        scene: &ImagerySource,
        task: InferenceTask,
        cancel: &CancellationToken,
    ) -> Result<JobOutput, JobError> {
        let client = self
            .inference
            .as_ref()
            .ok_or(JobError::InferenceUnavailable)?;

        let inferred = match task {
            InferenceTask::Classify => client.classify(model, scene).or_cancel(cancel).await,
            InferenceTask::Detect { .. } => client.detect(model, scene).or_cancel(cancel).await,
        }
        .map_err(|_| JobError::Cancelled)??;

        let returned = inferred.len();
        let kept: Vec<InferredFeature> = match task {
            InferenceTask::Detect { min_confidence } => inferred
                .into_iter()
                .filter(|f| f.confidence >= min_confidence)
                .collect(),
            InferenceTask::Classify => inferred,
        };

        let features: Vec<VectorFeature> = kept.into_iter().map(|f| to_feature(job, f)).collect();
        let mut by_kind: BTreeMap<&str, usize> = BTreeMap::new();
        for feature in &features {
            *by_kind.entry(feature.kind.as_str()).or_default() += 1;
        }

        check(cancel)?;
        let kept = features.len();
        info!(model, returned, kept, "Inference finished");

        Ok(JobOutput {
            result_uri: None,
            summary: json!({
                "type": job.kind.name(),
                "model": model,
                "scene_id": scene.id,
                "features": kept,
                "dropped": returned - kept,
                "by_kind": by_kind,
            }),
            features,
        })
    }
}

fn to_feature(job: &AnalysisJob, inferred: InferredFeature) -> VectorFeature {
    let mut properties = match inferred.properties {
        Value::Object(map) => map,
        Value::Null => Default::default(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other);
            map
        }
    };
    properties.insert("confidence".to_string(), json!(inferred.confidence));
    VectorFeature::new(
        &job.id,
        &inferred.kind,
        inferred.geometry,
        Value::Object(properties),
    )
}

fn check(cancel: &CancellationToken) -> Result<(), JobError> {
    if cancel.is_cancelled() {
        Err(JobError::Cancelled)
    } else {
        Ok(())
    }
}

/// Runs CPU-bound raster work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T, JobError>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| JobError::Task(e.to_string()))
}
