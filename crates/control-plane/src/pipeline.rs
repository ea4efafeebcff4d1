//! Upload orchestration.
//!
//! One upload walks a linear state machine:
//!
//! ```text
//! ResolvingApplication -> ReceivingUpload -> Storing -> Deploying -> RecordingHistory -> Done
//!          \__________________\________________\__________\______________________ Failed(stage, cause)
//! ```
//!
//! `RecordingHistory` never fails the upload: the job is already registered, so a
//! history write error moves to `Done` with a warning attached. Everything from
//! `Storing` on runs on its own task and is not abandoned when the caller goes away.
use std::{fmt, sync::Arc, time::Instant};
use serde::Serialize;
use tracing::{info, warn};
use crate::{
    config::JobTemplate,
    error::PipelineError,
    form::{ReceivedUpload, UploadSource},
    models::{Application, ArtifactRef},
    nomad::{self, Job},
    scheduler::{Scheduler, SubmissionResult},
    services::{apps::{self, ApplicationStore}, history::{self, HistoryStore}},
    storage::ArtifactStore,
    telemetry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage { ResolvingApplication, ReceivingUpload, Storing, Deploying, RecordingHistory, Done }

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::ResolvingApplication => "resolve",
            Stage::ReceivingUpload => "parse",
            Stage::Storing => "storage",
            Stage::Deploying => "deploy",
            Stage::RecordingHistory => "history",
            Stage::Done => "done",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// One upload request as seen by the pipeline.
pub struct UploadRequest {
    /// Must already be normalized.
    pub slug: String,
    pub auto_create: bool,
    pub source: Box<dyn UploadSource>,
    /// The request body could not be read as a form; nothing else in it can be trusted.
    pub form_error: Option<PipelineError>,
}

/// Result of a completed upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadReport {
    pub application: Application,
    pub artifact: ArtifactRef,
    pub bundle_name: String,
    pub job_id: String,
    pub submission: SubmissionResult,
    /// Bytes stored.
    pub size: u64,
    /// True when the deploy history row was written.
    pub version_recorded: bool,
    pub warnings: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
#[error("upload failed at {stage}: {cause}")]
pub struct StageFailure { pub stage: Stage, pub cause: PipelineError }

pub enum UploadState {
    ResolvingApplication { slug: String, auto_create: bool, source: Box<dyn UploadSource> },
    ReceivingUpload { app: Application, source: Box<dyn UploadSource> },
    Storing { app: Application, upload: ReceivedUpload },
    Deploying { app: Application, upload: ReceivedUpload, artifact: ArtifactRef },
    RecordingHistory { app: Application, upload: ReceivedUpload, artifact: ArtifactRef, job: Job, submission: SubmissionResult },
    Done(UploadReport),
    Failed { stage: Stage, cause: PipelineError },
}

impl UploadState {
    pub fn stage(&self) -> Stage {
        match self {
            Self::ResolvingApplication { .. } => Stage::ResolvingApplication,
            Self::ReceivingUpload { .. } => Stage::ReceivingUpload,
            Self::Storing { .. } => Stage::Storing,
            Self::Deploying { .. } => Stage::Deploying,
            Self::RecordingHistory { .. } => Stage::RecordingHistory,
            Self::Done(_) => Stage::Done,
            Self::Failed { stage, .. } => *stage,
        }
    }
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Done(_) | Self::Failed { .. }) }
}

impl fmt::Debug for UploadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Failed { stage, cause } => f.debug_struct("Failed").field("stage", stage).field("cause", cause).finish(),
            other => f.debug_tuple("UploadState").field(&other.stage()).finish(),
        }
    }
}

/// Sequences registry, storage, scheduler and history for one upload at a time.
/// Cheap to clone; holds no per-request state.
#[derive(Clone)]
pub struct UploadPipeline {
    apps: Arc<dyn ApplicationStore>,
    history: Arc<dyn HistoryStore>,
    storage: ArtifactStore,
    scheduler: Scheduler,
    job_template: Arc<JobTemplate>,
}

impl UploadPipeline {
    pub fn new(apps: Arc<dyn ApplicationStore>, history: Arc<dyn HistoryStore>, storage: ArtifactStore, scheduler: Scheduler, job_template: JobTemplate) -> Self {
        Self { apps, history, storage, scheduler, job_template: Arc::new(job_template) }
    }

    pub async fn run(&self, req: UploadRequest) -> Result<UploadReport, StageFailure> {
        let start = Instant::now();
        let slug = req.slug.clone();
        let mut state = match req.form_error {
            Some(cause) => UploadState::Failed { stage: Stage::ReceivingUpload, cause },
            None => UploadState::ResolvingApplication { slug: req.slug, auto_create: req.auto_create, source: req.source },
        };
        while !state.is_terminal() {
            if state.stage() == Stage::Storing {
                // from here on the upload finishes even if the caller goes away
                let this = self.clone();
                let task_slug = slug.clone();
                return match tokio::spawn(async move { let end = this.drive(state).await; conclude(&task_slug, start, end) }).await {
                    Ok(res) => res,
                    Err(e) => {
                        let cause = PipelineError::Internal(format!("pipeline task failed: {e}"));
                        conclude(&slug, start, UploadState::Failed { stage: Stage::Storing, cause })
                    }
                };
            }
            state = self.advance(state).await;
        }
        conclude(&slug, start, state)
    }

    async fn drive(&self, mut state: UploadState) -> UploadState {
        while !state.is_terminal() { state = self.advance(state).await; }
        state
    }

    /// Perform the work of the current state and return the next one.
    pub async fn advance(&self, state: UploadState) -> UploadState {
        match state {
            UploadState::ResolvingApplication { slug, auto_create, source } => {
                match apps::resolve(self.apps.as_ref(), &slug, auto_create).await {
                    Ok(app) => UploadState::ReceivingUpload { app, source },
                    Err(cause) => UploadState::Failed { stage: Stage::ResolvingApplication, cause },
                }
            }
            UploadState::ReceivingUpload { app, mut source } => match source.receive().await {
                Ok(upload) => UploadState::Storing { app, upload },
                Err(cause) => UploadState::Failed { stage: Stage::ReceivingUpload, cause },
            },
            UploadState::Storing { app, upload } => match self.storage.store(&upload.body, Some(&upload.sha256)).await {
                Ok(artifact) => UploadState::Deploying { app, upload, artifact },
                Err(cause) => UploadState::Failed { stage: Stage::Storing, cause },
            },
            UploadState::Deploying { app, upload, artifact } => {
                let job = match nomad::build_job(&app.slug, &artifact.name, &self.job_template) {
                    Ok(job) => job,
                    Err(cause) => return UploadState::Failed { stage: Stage::Deploying, cause },
                };
                match self.scheduler.submit(&job).await {
                    Ok(submission) => UploadState::RecordingHistory { app, upload, artifact, job, submission },
                    Err(cause) => UploadState::Failed { stage: Stage::Deploying, cause },
                }
            }
            UploadState::RecordingHistory { app, upload, artifact, job, submission } => {
                let mut warnings = Vec::new();
                let size = upload.body.len();
                let version_recorded = match history::record(self.history.as_ref(), app.id, &upload.file_name, &artifact.name).await {
                    Ok(row) => { info!(app_id=%app.id, history_id=%row.id, bundle=%row.bundle_name, "history.recorded"); true }
                    Err(e) => {
                        telemetry::record_history_failure();
                        warn!(slug=%app.slug, job_id=%job.id, artifact=%artifact.name, kind=e.kind(), error=%e, "history.write_failed");
                        warnings.push(e.client_message().to_string());
                        false
                    }
                };
                UploadState::Done(UploadReport {
                    application: app,
                    bundle_name: upload.file_name,
                    artifact,
                    job_id: job.id,
                    submission,
                    version_recorded,
                    warnings,
                    size,
                })
            }
            terminal @ (UploadState::Done(_) | UploadState::Failed { .. }) => terminal,
        }
    }
}

fn conclude(slug: &str, start: Instant, state: UploadState) -> Result<UploadReport, StageFailure> {
    let elapsed = start.elapsed().as_secs_f64();
    match state {
        UploadState::Done(report) => {
            telemetry::record_upload_success(report.size, elapsed);
            info!(slug=%slug, job_id=%report.job_id, artifact=%report.artifact.name, eval_id=%report.submission.eval_id, version_recorded=report.version_recorded, "upload.done");
            Ok(report)
        }
        UploadState::Failed { stage, cause } => {
            telemetry::record_upload_failure(stage.as_str(), cause.kind(), elapsed);
            warn!(stage=%stage, kind=cause.kind(), slug=%slug, error=%cause, "upload.stage_failed");
            Err(StageFailure { stage, cause })
        }
        other => {
            let stage = other.stage();
            Err(StageFailure { stage, cause: PipelineError::Internal(format!("pipeline stopped in non-terminal state {stage}")) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::time::Duration;
    use crate::{
        form::InMemoryUpload,
        scheduler::MockScheduler,
        services::MemoryStore,
        storage::{MockStorageBackend, ObjectBody, PutObject, StorageBackend},
    };

    struct Harness { store: Arc<MemoryStore>, storage: Arc<MockStorageBackend>, scheduler: Arc<MockScheduler>, pipeline: UploadPipeline }

    fn harness() -> Harness {
        let storage = Arc::new(MockStorageBackend::new("loom"));
        let (store, scheduler, pipeline) = pipeline_over(storage.clone());
        Harness { store, storage, scheduler, pipeline }
    }

    fn pipeline_over(backend: Arc<dyn StorageBackend>) -> (Arc<MemoryStore>, Arc<MockScheduler>, UploadPipeline) {
        let store = Arc::new(MemoryStore::new());
        let scheduler = Arc::new(MockScheduler::new());
        let pipeline = UploadPipeline::new(
            store.clone(), store.clone(),
            ArtifactStore::new(backend, "uploads"),
            Scheduler::new(scheduler.clone()),
            JobTemplate::default(),
        );
        (store, scheduler, pipeline)
    }

    /// Delays every write, then hands it to the in-memory backend.
    struct SlowStorage { inner: MockStorageBackend, delay: Duration }

    #[async_trait]
    impl StorageBackend for SlowStorage {
        async fn put_object(&self, req: PutObject<'_>, body: &ObjectBody) -> anyhow::Result<u64> {
            tokio::time::sleep(self.delay).await;
            self.inner.put_object(req, body).await
        }
        fn bucket(&self) -> &str { self.inner.bucket() }
    }

    struct PanickingStorage;

    #[async_trait]
    impl StorageBackend for PanickingStorage {
        async fn put_object(&self, _req: PutObject<'_>, _body: &ObjectBody) -> anyhow::Result<u64> {
            panic!("storage backend blew up")
        }
        fn bucket(&self) -> &str { "loom" }
    }

    fn request(slug: &str, auto_create: bool) -> UploadRequest {
        UploadRequest { slug: slug.into(), auto_create, source: Box::new(InMemoryUpload { file_name: "bundle.zip".into(), data: Bytes::from_static(b"PK\x03\x04demo") }), form_error: None }
    }

    struct BrokenUpload;

    #[async_trait]
    impl UploadSource for BrokenUpload {
        async fn receive(&mut self) -> Result<ReceivedUpload, PipelineError> { Err(PipelineError::Parse("unexpected end of body".into())) }
    }

    #[tokio::test]
    async fn happy_path_runs_every_stage() {
        let h = harness();
        let report = h.pipeline.run(request("demo", true)).await.unwrap();
        assert_eq!(report.application.slug, "demo");
        assert_eq!(report.job_id, "loomapp-demo");
        assert_eq!(report.bundle_name, "bundle.zip");
        assert_eq!(report.artifact.path, format!("uploads/{}", report.artifact.name));
        assert_eq!(report.size, 8);
        assert!(report.version_recorded);
        assert!(report.warnings.is_empty());
        assert_eq!(h.storage.keys(), vec![report.artifact.path.clone()]);
        assert_eq!(h.scheduler.submitted().len(), 1);
        assert_eq!(h.store.history_len(), 1);
    }

    #[tokio::test]
    async fn unknown_application_fails_before_reading_upload() {
        let h = harness();
        let err = h.pipeline.run(request("demo", false)).await.unwrap_err();
        assert_eq!(err.stage, Stage::ResolvingApplication);
        assert!(matches!(err.cause, PipelineError::NotFound(_)));
        assert!(h.storage.keys().is_empty());
        assert!(h.scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn unnormalized_slug_is_rejected() {
        let h = harness();
        let err = h.pipeline.run(request("Demo App", true)).await.unwrap_err();
        assert_eq!(err.stage, Stage::ResolvingApplication);
        assert!(matches!(err.cause, PipelineError::InvalidArgument(_)));
        assert!(h.store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn broken_upload_fails_in_receiving() {
        let h = harness();
        let req = UploadRequest { slug: "demo".into(), auto_create: true, source: Box::new(BrokenUpload), form_error: None };
        let err = h.pipeline.run(req).await.unwrap_err();
        assert_eq!(err.stage, Stage::ReceivingUpload);
        assert_eq!(err.cause.client_message(), "unable to parse the upload");
        assert!(h.storage.keys().is_empty());
        // the application was created before the body was read
        assert!(h.store.find_by_slug("demo").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreadable_form_fails_before_touching_the_registry() {
        let h = harness();
        let mut req = request("demo", true);
        req.form_error = Some(PipelineError::Parse("incomplete multipart stream".into()));
        let err = h.pipeline.run(req).await.unwrap_err();
        assert_eq!(err.stage, Stage::ReceivingUpload);
        assert_eq!(err.cause.client_message(), "unable to parse the upload");
        assert!(h.store.list().await.unwrap().is_empty());
        assert!(h.storage.keys().is_empty());
        assert!(h.scheduler.submitted().is_empty());
    }

    #[tokio::test]
    async fn dropped_caller_does_not_abandon_deploy() {
        let inner = MockStorageBackend::new("loom");
        let slow = Arc::new(SlowStorage { inner, delay: Duration::from_millis(200) });
        let (store, scheduler, pipeline) = pipeline_over(slow.clone());
        let res = tokio::time::timeout(Duration::from_millis(50), pipeline.run(request("demo", true))).await;
        assert!(res.is_err(), "run should still be storing when the caller gives up");
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(slow.inner.keys().len(), 1);
        assert_eq!(scheduler.submitted().len(), 1);
        assert_eq!(store.history_len(), 1);
    }

    #[tokio::test]
    async fn panic_in_storage_task_reports_internal_failure() {
        let (store, scheduler, pipeline) = pipeline_over(Arc::new(PanickingStorage));
        let err = pipeline.run(request("demo", true)).await.unwrap_err();
        assert_eq!(err.stage, Stage::Storing);
        assert!(matches!(err.cause, PipelineError::Internal(_)));
        assert!(scheduler.submitted().is_empty());
        assert_eq!(store.history_len(), 0);
    }

    #[tokio::test]
    async fn storage_failure_stops_before_scheduling() {
        let h = harness();
        h.storage.set_failing(true);
        let err = h.pipeline.run(request("demo", true)).await.unwrap_err();
        assert_eq!(err.stage, Stage::Storing);
        assert!(matches!(err.cause, PipelineError::Storage(_)));
        assert!(h.scheduler.submitted().is_empty());
        assert_eq!(h.store.history_len(), 0);
    }

    #[tokio::test]
    async fn scheduler_failure_leaves_object_but_no_history() {
        let h = harness();
        h.scheduler.set_failing(true);
        let err = h.pipeline.run(request("demo", true)).await.unwrap_err();
        assert_eq!(err.stage, Stage::Deploying);
        assert!(matches!(err.cause, PipelineError::Scheduler(_)));
        assert_eq!(h.storage.keys().len(), 1);
        assert_eq!(h.store.history_len(), 0);
    }

    #[tokio::test]
    async fn history_failure_is_soft() {
        let h = harness();
        h.store.set_history_failing(true);
        let report = h.pipeline.run(request("demo", true)).await.unwrap();
        assert!(!report.version_recorded);
        assert_eq!(report.warnings, vec!["deploy history not recorded".to_string()]);
        assert_eq!(h.scheduler.submitted().len(), 1);
    }

    #[tokio::test]
    async fn redeploy_reuses_job_id_and_appends_history() {
        let h = harness();
        let a = h.pipeline.run(request("demo", true)).await.unwrap();
        let b = h.pipeline.run(request("demo", false)).await.unwrap();
        assert_eq!(a.application.id, b.application.id);
        assert_eq!(a.job_id, b.job_id);
        assert_ne!(a.artifact.name, b.artifact.name);
        assert_eq!(h.store.history_len(), 2);
    }

    #[tokio::test]
    async fn advance_is_identity_on_terminal_states() {
        let h = harness();
        let failed = UploadState::Failed { stage: Stage::Deploying, cause: PipelineError::Internal("x".into()) };
        let next = h.pipeline.advance(failed).await;
        assert_eq!(next.stage(), Stage::Deploying);
        assert!(next.is_terminal());
    }

    #[test]
    fn stage_labels() {
        let labels: Vec<_> = [Stage::ResolvingApplication, Stage::ReceivingUpload, Stage::Storing, Stage::Deploying, Stage::RecordingHistory]
            .iter().map(|s| s.to_string()).collect();
        assert_eq!(labels, ["resolve", "parse", "storage", "deploy", "history"]);
    }
}
