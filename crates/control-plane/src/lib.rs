pub mod config;
pub mod db;
pub mod error;
pub mod form;
pub mod handlers;
pub mod models;
pub mod nomad;
pub mod pipeline;
pub mod scheduler;
pub mod services;
pub mod storage;
pub mod telemetry;
pub mod test_support;

use std::{path::PathBuf, sync::Arc, time::Duration};
use axum::{Router, extract::DefaultBodyLimit, middleware, routing::{get, post}};
use tower_http::{limit::RequestBodyLimitLayer, timeout::TimeoutLayer};
use tracing::info;
use utoipa::OpenApi;
use config::{Config, StoreMode};
use handlers::{health::health, readiness::readiness, apps::{list_apps, app_history}, uploads::upload};
use pipeline::UploadPipeline;
use scheduler::Scheduler;
use services::{MemoryStore, PgStore, apps::ApplicationStore, history::HistoryStore};
use storage::ArtifactStore;
use telemetry::{metrics_handler, track_metrics};

#[derive(Clone)]
pub struct AppState {
    pub apps: Arc<dyn ApplicationStore>,
    pub history: Arc<dyn HistoryStore>,
    pub pipeline: UploadPipeline,
    /// Directory uploads are spooled into before they are stored.
    pub spool_dir: Arc<PathBuf>,
    pub max_body_bytes: usize,
    pub request_timeout: Duration,
}

impl AppState {
    /// Wire every component from `cfg`, connecting (and migrating) Postgres when configured.
    pub async fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let (apps, history): (Arc<dyn ApplicationStore>, Arc<dyn HistoryStore>) = match cfg.store_mode {
            StoreMode::Postgres => {
                let store = Arc::new(PgStore::new(db::init_db(&cfg.database_url).await?));
                (store.clone(), store)
            }
            StoreMode::Memory => {
                info!("store.init_memory");
                let store = Arc::new(MemoryStore::new());
                (store.clone(), store)
            }
        };
        let storage = ArtifactStore::from_config(&cfg.storage).await;
        let scheduler = Scheduler::from_config(&cfg.scheduler)?;
        let pipeline = UploadPipeline::new(apps.clone(), history.clone(), storage, scheduler, cfg.job.clone());
        Ok(Self {
            apps,
            history,
            pipeline,
            spool_dir: Arc::new(cfg.spool_dir.clone()),
            max_body_bytes: cfg.max_body_bytes,
            request_timeout: cfg.request_timeout,
        })
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::readiness::readiness,
        handlers::uploads::upload,
        handlers::apps::list_apps,
        handlers::apps::app_history,
    ),
    components(schemas(
        error::ApiErrorBody,
        error::UploadErrorBody,
        handlers::health::HealthResponse,
        handlers::readiness::ReadinessResponse,
        handlers::uploads::UploadResponse,
        models::Application,
        models::DeployHistory,
        models::ArtifactRef,
    )),
    tags( (name = "loom", description = "Loom application upload API") )
)]
pub struct ApiDoc;

pub fn build_router(state: AppState) -> Router {
    let openapi = ApiDoc::openapi();
    // the multipart extractor's own 2MB default would cut bundles short
    let upload_routes = Router::new()
        .route("/upload", post(upload))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes));
    let timeout = TimeoutLayer::new(state.request_timeout);
    Router::new()
        .route("/health", get(health))
        .route("/readyz", get(readiness))
        .route("/metrics", get(metrics_handler))
        .merge(upload_routes)
        .route("/apps", get(list_apps))
        .route("/apps/:slug/history", get(app_history))
        .route("/openapi.json", get(|| async move { axum::Json(openapi.clone()) }))
        .layer(timeout)
        .layer(middleware::from_fn(track_metrics))
        .with_state(state)
}
