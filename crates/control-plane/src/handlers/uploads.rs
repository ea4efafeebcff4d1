use axum::{extract::{Multipart, State, multipart::MultipartRejection}, http::StatusCode, response::{IntoResponse, Response}, Json};
use serde::Serialize;
use utoipa::ToSchema;
use crate::{
    AppState,
    error::UploadErrorBody,
    form::read_upload_form,
    models::{Application, ArtifactRef, normalize_slug},
    pipeline::{UploadReport, UploadRequest},
};

#[derive(Debug, Serialize, ToSchema)]
pub struct UploadResponse {
    pub application: Application,
    /// Scheduler job the bundle was deployed as (`loomapp-<slug>`).
    pub job_id: String,
    pub eval_id: String,
    pub artifact: ArtifactRef,
    pub warnings: Vec<String>,
}

impl From<UploadReport> for UploadResponse {
    fn from(r: UploadReport) -> Self {
        Self { application: r.application, job_id: r.job_id, eval_id: r.submission.eval_id, artifact: r.artifact, warnings: r.warnings }
    }
}

/// Upload an application bundle and deploy it.
///
/// Multipart fields: `application_slug`, `auto_create` (`"true"` to create a missing
/// application) and the bundle as `uploadfile`.
#[utoipa::path(post, path = "/upload",
    request_body(content = String, content_type = "multipart/form-data", description = "application_slug, auto_create, uploadfile"),
    responses(
        (status = 200, body = UploadResponse, description = "Bundle stored and job registered"),
        (status = 400, body = UploadErrorBody, description = "Upload failed; message names the failing step"),
    )
)]
#[tracing::instrument(level="info", skip_all)]
pub async fn upload(State(state): State<AppState>, multipart: Result<Multipart, MultipartRejection>) -> Response {
    // the slug lives inside the body, so the whole bundle is spooled before the application is looked up
    let form = read_upload_form(multipart, &state.spool_dir).await;
    let req = UploadRequest {
        slug: normalize_slug(&form.application_slug),
        auto_create: form.auto_create,
        source: Box::new(form.upload),
        form_error: form.failure,
    };
    match state.pipeline.run(req).await {
        Ok(report) => (StatusCode::OK, Json(UploadResponse::from(report))).into_response(),
        Err(failure) => {
            let body = UploadErrorBody { error: failure.cause.client_message().to_string() };
            (StatusCode::BAD_REQUEST, Json(body)).into_response()
        }
    }
}
