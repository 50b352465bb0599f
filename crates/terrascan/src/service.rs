//! Wires the catalog, blob store, remote clients, ingest pipeline and job
//! orchestrator together from a loaded [`Config`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::broadcast::{ProgressBroadcaster, ProgressReporter};
use crate::catalog::Database;
use crate::config::Config;
use crate::error::Result;
use crate::ingest::{masker_from_config, AtmosphericCorrector, IngestConfig, IngestPipeline, IngestReport};
use crate::jobs::{JobExecutor, JobOrchestrator};
use crate::model::AnalysisRequest;
use crate::remote::{
    AssetFetcher, HttpFetcher, HttpInferenceClient, HttpStacClient, InferenceClient, SearchQuery,
    StacClient,
};
use crate::storage::{BlobStore, FileBlobStore};

/// Capacity of the progress channel.
const PROGRESS_CAPACITY: usize = 1024;

/// A fully wired TerraScan instance.
pub struct TerraScan {
    db: Database,
    blobs: Arc<dyn BlobStore>,
    ingest: IngestPipeline,
    jobs: JobOrchestrator,
    progress: ProgressBroadcaster,
    cancel: CancellationToken,
}

impl TerraScan {
    /// Opens the catalog, resolves credentials and builds the HTTP clients
    /// described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let data_dir = config.data_dir();
        let db = Database::open(&config.database_file())?;
        let blobs: Arc<dyn BlobStore> = Arc::new(FileBlobStore::new(data_dir.join("blobs")));

        debug!(
            endpoint = %config.stac.endpoint,
            authenticated = config.stac.auth.is_configured(),
            "Connecting to STAC catalog"
        );
        let stac_token = config.stac.auth.resolve()?;
        let stac_timeout = Duration::from_secs(config.stac.timeout_secs);
        let stac: Arc<dyn StacClient> = Arc::new(
            HttpStacClient::new(
                &config.stac.endpoint,
                &config.stac.provider,
                stac_token.clone(),
                stac_timeout,
            )?
            .with_paging(config.stac.page_size, config.stac.max_pages),
        );
        let fetcher: Arc<dyn AssetFetcher> = Arc::new(HttpFetcher::new(stac_token, stac_timeout)?);

        let inference: Option<Arc<dyn InferenceClient>> = match &config.inference {
            Some(section) => {
                let client: Arc<dyn InferenceClient> = Arc::new(HttpInferenceClient::new(
                    &section.endpoint,
                    section.auth.resolve()?,
                    Duration::from_secs(section.timeout_secs),
                )?);
                Some(client)
            }
            None => None,
        };

        Self::from_parts(config, db, blobs, stac, fetcher, inference)
    }

    /// Builds an instance around caller-supplied backends.
    pub fn from_parts(
        config: &Config,
        db: Database,
        blobs: Arc<dyn BlobStore>,
        stac: Arc<dyn StacClient>,
        fetcher: Arc<dyn AssetFetcher>,
        inference: Option<Arc<dyn InferenceClient>>,
    ) -> Result<Self> {
        let progress = ProgressBroadcaster::new(PROGRESS_CAPACITY);
        let reporter: Arc<dyn ProgressReporter> = Arc::new(progress.clone());
        let cancel = CancellationToken::new();

        let masker = masker_from_config(&config.preprocessing, inference.clone())?;
        let ingest = IngestPipeline::new(
            Arc::new(IngestConfig::from_config(config)),
            db.clone(),
            stac,
            fetcher,
            Arc::clone(&blobs),
            AtmosphericCorrector::from_config(&config.preprocessing),
            masker,
        )
        .with_progress(Arc::clone(&reporter))
        .with_cancellation(cancel.child_token());

        let executor = JobExecutor::new(db.clone(), Arc::clone(&blobs), inference)
            .with_strip_rows(config.preprocessing.strip_rows);
        let jobs = JobOrchestrator::new(
            db.clone(),
            executor,
            config.workers.max_concurrent_jobs,
            reporter,
        );

        info!(
            data_dir = %config.data_dir().display(),
            max_concurrent_scenes = config.workers.max_concurrent_scenes,
            max_concurrent_jobs = config.workers.max_concurrent_jobs,
            "TerraScan initialized"
        );

        Ok(Self {
            db,
            blobs,
            ingest,
            jobs,
            progress,
            cancel,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn blobs(&self) -> &Arc<dyn BlobStore> {
        &self.blobs
    }

    pub fn jobs(&self) -> &JobOrchestrator {
        &self.jobs
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.progress
    }

    /// Runs one ingestion pass over the scenes matching `query`.
    pub async fn ingest(&self, query: &SearchQuery) -> Result<IngestReport> {
        Ok(self.ingest.ingest(query).await?)
    }

    /// Submits an analysis job and returns its id.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<String> {
        Ok(self.jobs.submit(request).await?)
    }

    /// Stops in-flight ingestion and jobs. Interrupted scenes resume on the
    /// next ingest run.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        self.jobs.shutdown().await;
    }
}
