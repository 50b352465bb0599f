use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::error::JobError;
use super::executor::JobExecutor;
use crate::broadcast::{ProgressPhase, ProgressReporter, ProgressTracker, SubjectKind};
use crate::cancel::OrCancel;
use crate::catalog::job_repo::{self, JobFilter};
use crate::catalog::{feature_repo, scene_repo, Database, DatabaseError};
use crate::model::{AnalysisJob, AnalysisRequest, JobStatus, VectorFeature};

/// Error recorded on jobs a previous process left unfinished.
pub const INTERRUPTED_MESSAGE: &str = "interrupted: process restarted before the job finished";

/// Handle to an in-flight job task.
struct RunningJob {
    cancel: CancellationToken,
    done: watch::Receiver<bool>,
}

struct Inner {
    db: Database,
    executor: JobExecutor,
    progress: Arc<dyn ProgressReporter>,
    limiter: Arc<Semaphore>,
    running: Mutex<HashMap<String, RunningJob>>,
    /// Parent of every job token.
    shutdown: CancellationToken,
}

impl Inner {
    fn running(&self) -> MutexGuard<'_, HashMap<String, RunningJob>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn tracker(&self, id: &str) -> ProgressTracker {
        ProgressTracker::new(Arc::clone(&self.progress), SubjectKind::Job, id)
    }
}

/// Accepts analysis requests, runs each as its own Tokio task and tracks
/// them until they reach a terminal state.
///
/// At most `max_concurrent` jobs execute at once; the rest wait `pending`.
#[derive(Clone)]
pub struct JobOrchestrator {
    inner: Arc<Inner>,
}

impl JobOrchestrator {
    pub fn new(
        db: Database,
        executor: JobExecutor,
        max_concurrent: usize,
        progress: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                db,
                executor,
                progress,
                limiter: Arc::new(Semaphore::new(max_concurrent.max(1))),
                running: Mutex::new(HashMap::new()),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Validates a request, persists it as a `pending` job and starts it.
    /// Returns the new job id.
    ///
    /// Every referenced scene must exist and be `ready`.
    pub async fn submit(&self, request: AnalysisRequest) -> Result<String, JobError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(JobError::ShuttingDown);
        }
        self.validate(&request)?;

        let job = AnalysisJob::pending(&request);
        job_repo::insert(&self.inner.db, &job)?;
        info!(job_id = %job.id, kind = job.kind.name(), owner = %job.owner, "Job submitted");

        let cancel = self.inner.shutdown.child_token();
        let (done_tx, done_rx) = watch::channel(false);
        self.inner.running().insert(
            job.id.clone(),
            RunningJob {
                cancel: cancel.clone(),
                done: done_rx,
            },
        );
        self.inner
            .tracker(&job.id)
            .phase(ProgressPhase::Queued, "Job queued");

        tokio::spawn(run_job(Arc::clone(&self.inner), job.id.clone(), cancel, done_tx));
        Ok(job.id)
    }

    fn validate(&self, request: &AnalysisRequest) -> Result<(), JobError> {
        if request.owner.trim().is_empty() {
            return Err(JobError::InvalidRequest("owner must not be empty".to_string()));
        }
        request.kind.validate().map_err(JobError::InvalidRequest)?;

        let required = request.kind.required_scenes();
        if request.scene_ids.len() != required {
            return Err(JobError::InvalidRequest(format!(
                "{} needs {} scene(s), got {}",
                request.kind.name(),
                required,
                request.scene_ids.len()
            )));
        }
        if required == 2 && request.scene_ids[0] == request.scene_ids[1] {
            return Err(JobError::InvalidRequest(
                "change detection needs two different scenes".to_string(),
            ));
        }

        for id in &request.scene_ids {
            let scene = scene_repo::find_by_id(&self.inner.db, id)?
                .ok_or_else(|| JobError::SceneNotFound(id.clone()))?;
            if !scene.is_ready() {
                return Err(JobError::SceneNotReady {
                    id: id.clone(),
                    status: scene.status,
                });
            }
        }
        Ok(())
    }

    /// Requests cancellation of a `pending` or `running` job. The catalog
    /// record moves to `cancelled` immediately; the task stops at its next
    /// cancellation point.
    pub fn cancel(&self, id: &str) -> Result<AnalysisJob, JobError> {
        let job = self.status(id)?;
        if job.status.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: id.to_string(),
                status: job.status,
            });
        }

        let cancelled = match job_repo::transition(&self.inner.db, id, JobStatus::Cancelled, None) {
            Ok(job) => job,
            Err(DatabaseError::InvalidTransition { .. }) => {
                // Finished between the read and the update.
                let current = self.status(id)?;
                return Err(JobError::AlreadyTerminal {
                    id: id.to_string(),
                    status: current.status,
                });
            }
            Err(e) => return Err(e.into()),
        };

        if let Some(running) = self.inner.running().get(id) {
            running.cancel.cancel();
        }
        self.inner
            .tracker(id)
            .phase(ProgressPhase::Cancelled, "Job cancelled");
        info!(job_id = %id, "Job cancelled");
        Ok(cancelled)
    }

    /// Waits until the job's task has finished and returns the final record.
    pub async fn wait(&self, id: &str) -> Result<AnalysisJob, JobError> {
        let done = self.inner.running().get(id).map(|r| r.done.clone());
        if let Some(mut done) = done {
            // An error means the task is gone, which is just as final.
            let _ = done.wait_for(|finished| *finished).await;
        }
        self.status(id)
    }

    pub fn status(&self, id: &str) -> Result<AnalysisJob, JobError> {
        job_repo::find_by_id(&self.inner.db, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    pub fn list(&self, filter: &JobFilter) -> Result<(Vec<AnalysisJob>, u64), JobError> {
        Ok(job_repo::query(&self.inner.db, filter)?)
    }

    /// Vector features produced by a classification or detection job.
    pub fn features(&self, id: &str) -> Result<Vec<VectorFeature>, JobError> {
        Ok(feature_repo::list_by_job(&self.inner.db, id)?)
    }

    /// Number of job tasks that have not finished yet.
    pub fn in_flight(&self) -> usize {
        self.inner.running().len()
    }

    /// Fails jobs a previous process left `pending` or `running`. Call once
    /// at startup, before submitting new work.
    pub fn recover_interrupted(&self) -> Result<Vec<String>, JobError> {
        let ids = job_repo::fail_interrupted(&self.inner.db, INTERRUPTED_MESSAGE)?;
        if !ids.is_empty() {
            warn!(count = ids.len(), "Marked interrupted jobs as failed");
        }
        Ok(ids)
    }

    /// Cancels every in-flight job, waits for their tasks and refuses new
    /// submissions.
    pub async fn shutdown(&self) {
        info!("Shutting down job orchestrator...");
        self.inner.shutdown.cancel();
        let pending: Vec<watch::Receiver<bool>> = self
            .inner
            .running()
            .values()
            .map(|r| r.done.clone())
            .collect();
        for mut done in pending {
            let _ = done.wait_for(|finished| *finished).await;
        }
        info!("All jobs have stopped");
    }
}

async fn run_job(
    inner: Arc<Inner>,
    id: String,
    cancel: CancellationToken,
    done: watch::Sender<bool>,
) {
    let span = info_span!("job", job_id = %id);
    execute_job(&inner, &id, &cancel).instrument(span).await;
    inner.running().remove(&id);
    let _ = done.send(true);
}

async fn execute_job(inner: &Inner, id: &str, cancel: &CancellationToken) {
    let tracker = inner.tracker(id);

    let permit = match Arc::clone(&inner.limiter).acquire_owned().or_cancel(cancel).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(_)) => {
            record_failure(inner, id, &tracker, "job limiter closed");
            return;
        }
        Err(_) => {
            record_cancelled(inner, id, &tracker);
            return;
        }
    };

    // pending -> running; fails if the job was cancelled while queued.
    let job = match job_repo::transition(&inner.db, id, JobStatus::Running, None) {
        Ok(job) => job,
        Err(e) => {
            debug!(error = %e, "Job not started");
            return;
        }
    };
    tracker.phase(
        ProgressPhase::Running,
        &format!("Running {}", job.kind.name()),
    );

    let result = inner.executor.execute(&job, cancel).await;
    drop(permit);

    match result {
        Ok(output) => {
            let recorded = job_repo::complete(
                &inner.db,
                id,
                output.result_uri.as_deref(),
                &output.summary,
                &output.features,
            );
            match recorded {
                Ok(_) => {
                    tracker.phase(ProgressPhase::Completed, "Job completed");
                    info!("Job completed");
                }
                Err(DatabaseError::InvalidTransition { from, .. }) => {
                    info!(status = %from, "Job finished after leaving running, result discarded");
                }
                Err(e) => error!(error = %e, "Failed to record job completion"),
            }
        }
        Err(JobError::Cancelled) => record_cancelled(inner, id, &tracker),
        Err(e) => record_failure(inner, id, &tracker, &e.to_string()),
    }
}

fn record_failure(inner: &Inner, id: &str, tracker: &ProgressTracker, message: &str) {
    warn!(error = %message, "Job failed");
    match job_repo::transition(&inner.db, id, JobStatus::Failed, Some(message)) {
        Ok(_) => tracker.failed(message),
        Err(DatabaseError::InvalidTransition { from, .. }) => {
            debug!(status = %from, "Failure not recorded, job already final");
        }
        Err(e) => error!(error = %e, "Failed to record job failure"),
    }
}

/// Cancellation requested through `cancel()` is already in the catalog;
/// shutdown cancellation is recorded here.
fn record_cancelled(inner: &Inner, id: &str, tracker: &ProgressTracker) {
    match job_repo::transition(&inner.db, id, JobStatus::Cancelled, None) {
        Ok(_) => {
            tracker.phase(ProgressPhase::Cancelled, "Job cancelled");
            info!("Job cancelled");
        }
        Err(DatabaseError::InvalidTransition { .. }) => debug!("Job already final"),
        Err(e) => error!(error = %e, "Failed to record job cancellation"),
    }
}
