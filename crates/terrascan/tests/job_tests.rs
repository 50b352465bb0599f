//! Job lifecycle tests through the orchestrator: submission, completion,
//! failure, cancellation and shutdown.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{detection, FakeInference, TestHarness};
use terrascan::broadcast::{ProgressBroadcaster, ProgressPhase, SubjectKind};
use terrascan::catalog::job_repo::{self, JobFilter};
use terrascan::catalog::DatabaseError;
use terrascan::raster::codec;
use terrascan::remote::InferenceClient;
use terrascan::storage::{keys, BlobStore};
use terrascan::{
    AnalysisKind, AnalysisRequest, Band, BandSet, ChangeMethod, JobError, JobOrchestrator,
    JobStatus, SpectralIndex,
};

fn request(kind: AnalysisKind, scene_ids: Vec<String>) -> AnalysisRequest {
    AnalysisRequest {
        owner: "analyst".to_string(),
        kind,
        scene_ids,
    }
}

fn ndvi() -> AnalysisKind {
    AnalysisKind::SpectralIndex {
        index: SpectralIndex::Ndvi,
    }
}

fn classification() -> AnalysisKind {
    AnalysisKind::Classification {
        model: "landcover-v2".to_string(),
    }
}

fn vegetation() -> BandSet {
    BandSet::filled(4, 4, &[(Band::Nir, 0.8), (Band::Red, 0.2)])
}

/// Polls until the job reaches `status`.
async fn wait_for_status(jobs: &JobOrchestrator, id: &str, status: JobStatus) {
    for _ in 0..200 {
        if jobs.status(id).unwrap().status == status {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", id, status);
}

#[tokio::test]
async fn test_index_job_completes_with_result_raster() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_VEG", &vegetation()).await;
    let jobs = harness.quiet_orchestrator(None, 2);

    let id = jobs.submit(request(ndvi(), vec![scene])).await.unwrap();
    let job = jobs.wait(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(job.started_at.is_some());
    assert!(job.completed_at.is_some());
    assert_eq!(job.result_uri.as_deref(), Some(keys::job_result(&id).as_str()));

    let raster = harness.blobs.get(&keys::job_result(&id)).await.unwrap();
    let ndvi = codec::decode_single_band(&raster).unwrap();
    assert!(ndvi.iter().all(|v| *v == 0.6f32));
    assert_eq!(jobs.in_flight(), 0);
}

#[tokio::test]
async fn test_change_detection_job_summary() {
    let harness = TestHarness::new();
    let before = harness.ready_scene("BEFORE", &vegetation()).await;
    let after = harness
        .ready_scene(
            "AFTER",
            &BandSet::filled(4, 4, &[(Band::Nir, 0.3), (Band::Red, 0.3)]),
        )
        .await;
    let jobs = harness.quiet_orchestrator(None, 2);

    let kind = AnalysisKind::ChangeDetection {
        method: ChangeMethod::IndexDifference,
        index: Some(SpectralIndex::Ndvi),
    };
    let id = jobs.submit(request(kind, vec![before, after])).await.unwrap();
    let job = jobs.wait(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);
    let summary = job.summary.unwrap();
    assert_eq!(summary["valid_pixels"], 16);
    assert!(summary.get("threshold").is_some());
}

#[tokio::test]
async fn test_detection_job_stores_confident_features() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_PORT", &vegetation()).await;
    let inference: Arc<dyn InferenceClient> = Arc::new(FakeInference::new(vec![
        detection("ship", 0.9),
        detection("ship", 0.2),
        detection("building", 0.75),
    ]));
    let jobs = harness.quiet_orchestrator(Some(inference), 2);

    let kind = AnalysisKind::ObjectDetection {
        model: "ships-v1".to_string(),
        min_confidence: 0.5,
    };
    let id = jobs.submit(request(kind, vec![scene])).await.unwrap();
    let job = jobs.wait(&id).await.unwrap();
    assert_eq!(job.status, JobStatus::Completed, "{:?}", job.error);

    let features = jobs.features(&id).unwrap();
    assert_eq!(features.len(), 2);
    assert!(features.iter().all(|f| f.job_id == id));
    assert!(features
        .iter()
        .all(|f| f.properties["confidence"].as_f64().unwrap() >= 0.5));
}

#[tokio::test]
async fn test_job_fails_without_inference_service() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_NOINF", &vegetation()).await;
    let jobs = harness.quiet_orchestrator(None, 2);

    let id = jobs.submit(request(classification(), vec![scene])).await.unwrap();
    let job = jobs.wait(&id).await.unwrap();

    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.error.is_some());
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn test_cancel_running_job() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_SLOW", &vegetation()).await;
    let stalled: Arc<dyn InferenceClient> = Arc::new(FakeInference::stalled());
    let jobs = harness.quiet_orchestrator(Some(stalled), 2);

    let id = jobs.submit(request(classification(), vec![scene])).await.unwrap();
    wait_for_status(&jobs, &id, JobStatus::Running).await;

    let cancelled = jobs.cancel(&id).unwrap();
    assert_eq!(cancelled.status, JobStatus::Cancelled);

    let job = tokio::time::timeout(Duration::from_secs(5), jobs.wait(&id))
        .await
        .expect("cancelled job did not stop")
        .unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.result_uri.is_none());
    assert!(jobs.features(&id).unwrap().is_empty());
}

#[tokio::test]
async fn test_terminal_states_are_final() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_DONE", &vegetation()).await;
    let jobs = harness.quiet_orchestrator(None, 2);

    let id = jobs.submit(request(ndvi(), vec![scene])).await.unwrap();
    assert_eq!(jobs.wait(&id).await.unwrap().status, JobStatus::Completed);

    let err = jobs.cancel(&id).unwrap_err();
    assert!(matches!(
        err,
        JobError::AlreadyTerminal {
            status: JobStatus::Completed,
            ..
        }
    ));

    for next in [JobStatus::Running, JobStatus::Failed, JobStatus::Cancelled] {
        let err = job_repo::transition(&harness.db, &id, next, None).unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }
    assert_eq!(jobs.status(&id).unwrap().status, JobStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_job_cannot_be_cancelled_again() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_TWICE", &vegetation()).await;
    let stalled: Arc<dyn InferenceClient> = Arc::new(FakeInference::stalled());
    let jobs = harness.quiet_orchestrator(Some(stalled), 1);

    let id = jobs.submit(request(classification(), vec![scene])).await.unwrap();
    jobs.cancel(&id).unwrap();
    jobs.wait(&id).await.unwrap();

    assert!(matches!(
        jobs.cancel(&id),
        Err(JobError::AlreadyTerminal {
            status: JobStatus::Cancelled,
            ..
        })
    ));
}

#[tokio::test]
async fn test_concurrency_limit_keeps_jobs_pending() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_BUSY", &vegetation()).await;
    let stalled: Arc<dyn InferenceClient> = Arc::new(FakeInference::stalled());
    let jobs = harness.quiet_orchestrator(Some(stalled), 1);

    let first = jobs
        .submit(request(classification(), vec![scene.clone()]))
        .await
        .unwrap();
    wait_for_status(&jobs, &first, JobStatus::Running).await;
    let second = jobs
        .submit(request(classification(), vec![scene]))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(jobs.status(&second).unwrap().status, JobStatus::Pending);
    assert_eq!(jobs.in_flight(), 2);

    jobs.cancel(&first).unwrap();
    wait_for_status(&jobs, &second, JobStatus::Running).await;
    assert_eq!(jobs.status(&first).unwrap().status, JobStatus::Cancelled);

    jobs.shutdown().await;
    assert_eq!(jobs.status(&second).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_shutdown_cancels_in_flight_jobs() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_SHUTDOWN", &vegetation()).await;
    let stalled: Arc<dyn InferenceClient> = Arc::new(FakeInference::stalled());
    let jobs = harness.quiet_orchestrator(Some(stalled), 2);

    let id = jobs.submit(request(classification(), vec![scene])).await.unwrap();
    wait_for_status(&jobs, &id, JobStatus::Running).await;

    tokio::time::timeout(Duration::from_secs(5), jobs.shutdown())
        .await
        .expect("shutdown did not finish");
    assert_eq!(jobs.status(&id).unwrap().status, JobStatus::Cancelled);
    assert_eq!(jobs.in_flight(), 0);
}

#[tokio::test]
async fn test_list_jobs_by_owner_and_status() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_LIST", &vegetation()).await;
    let jobs = harness.quiet_orchestrator(None, 2);

    let done = jobs
        .submit(request(ndvi(), vec![scene.clone()]))
        .await
        .unwrap();
    jobs.wait(&done).await.unwrap();
    let mut other = request(ndvi(), vec![scene]);
    other.owner = "someone-else".to_string();
    let theirs = jobs.submit(other).await.unwrap();
    jobs.wait(&theirs).await.unwrap();

    let (mine, total) = jobs
        .list(&JobFilter {
            owner: Some("analyst".to_string()),
            status: Some(JobStatus::Completed),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(total, 1);
    assert_eq!(mine[0].id, done);
}

#[tokio::test]
async fn test_progress_events_for_completed_job() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_EVENTS", &vegetation()).await;
    let broadcaster = ProgressBroadcaster::new(16);
    let mut rx = broadcaster.subscribe();
    let jobs = harness.orchestrator(None, 2, Arc::new(broadcaster.clone()));

    let id = jobs.submit(request(ndvi(), vec![scene])).await.unwrap();
    jobs.wait(&id).await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        assert_eq!(event.subject, SubjectKind::Job);
        assert_eq!(event.id, id);
        phases.push(event.phase);
    }
    assert_eq!(
        phases,
        vec![
            ProgressPhase::Queued,
            ProgressPhase::Running,
            ProgressPhase::Completed
        ]
    );
}

#[tokio::test]
async fn test_no_features_kept_when_cancel_lands_before_completion() {
    let harness = TestHarness::new();
    let scene = harness.ready_scene("S2A_LATE", &vegetation()).await;
    let (gated, release) = FakeInference::gated(vec![detection("ship", 0.9)]);
    let inference: Arc<dyn InferenceClient> = Arc::new(gated);
    let jobs = harness.quiet_orchestrator(Some(inference), 2);

    let kind = AnalysisKind::ObjectDetection {
        model: "ships-v1".to_string(),
        min_confidence: 0.5,
    };
    let id = jobs.submit(request(kind, vec![scene])).await.unwrap();
    wait_for_status(&jobs, &id, JobStatus::Running).await;

    // The catalog records the cancellation before the task observes it.
    job_repo::transition(&harness.db, &id, JobStatus::Cancelled, None).unwrap();
    release.notify_one();

    let job = tokio::time::timeout(Duration::from_secs(5), jobs.wait(&id))
        .await
        .expect("job did not finish")
        .unwrap();
    assert_eq!(job.status, JobStatus::Cancelled);
    assert!(job.summary.is_none());
    assert!(jobs.features(&id).unwrap().is_empty());
}
