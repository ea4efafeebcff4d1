use axum::{Json, extract::{Path, State}};
use crate::{AppState, error::{ApiError, ApiResult}, models::{Application, DeployHistory, normalize_slug}};

/// List registered applications, newest first.
#[utoipa::path(get, path = "/apps", responses(
    (status = 200, body = [Application]),
    (status = 500, body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="debug", skip_all)]
pub async fn list_apps(State(state): State<AppState>) -> ApiResult<Json<Vec<Application>>> {
    let apps = state.apps.list().await.map_err(|e| {
        tracing::error!(error=%format!("{e:#}"), "apps.list_failed");
        ApiError::internal("could not list applications")
    })?;
    Ok(Json(apps))
}

/// Deploy history of one application, newest first.
#[utoipa::path(get, path = "/apps/{slug}/history", params(("slug" = String, Path, description = "Application slug")), responses(
    (status = 200, body = [DeployHistory]),
    (status = 404, body = crate::error::ApiErrorBody, description = "Unknown application"),
    (status = 500, body = crate::error::ApiErrorBody)
))]
#[tracing::instrument(level="debug", skip_all, fields(slug=%slug))]
pub async fn app_history(State(state): State<AppState>, Path(slug): Path<String>) -> ApiResult<Json<Vec<DeployHistory>>> {
    let slug = normalize_slug(&slug);
    let app = state.apps.find_by_slug(&slug).await
        .map_err(|e| { tracing::error!(slug=%slug, error=%format!("{e:#}"), "apps.lookup_failed"); ApiError::internal("could not look up application") })?
        .ok_or_else(|| ApiError::not_found(format!("application {slug} not found")))?;
    let rows = state.history.list_for_app(app.id).await
        .map_err(|e| { tracing::error!(slug=%slug, error=%format!("{e:#}"), "apps.history_failed"); ApiError::internal("could not list deploy history") })?;
    Ok(Json(rows))
}
