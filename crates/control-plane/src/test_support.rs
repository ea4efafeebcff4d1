//! Test harness utilities for integration & unit tests.
//! Builds application state over in-memory backends, multipart request bodies, and
//! (when `DATABASE_URL` is set) a migrated Postgres pool.
use std::{sync::Arc, time::Duration};
use sqlx::{Pool, Postgres};
use crate::{
    AppState,
    config::JobTemplate,
    pipeline::UploadPipeline,
    scheduler::{MockScheduler, Scheduler},
    services::{MemoryStore, PgStore},
    storage::{ArtifactStore, MockStorageBackend},
};

static TEST_DB_URL_ENV: &str = "DATABASE_URL";

/// State plus handles on the in-memory backends behind it.
pub struct TestHarness {
    pub state: AppState,
    pub store: Arc<MemoryStore>,
    pub storage: Arc<MockStorageBackend>,
    pub scheduler: Arc<MockScheduler>,
}

pub fn memory_state() -> TestHarness {
    let store = Arc::new(MemoryStore::new());
    let storage = Arc::new(MockStorageBackend::new("loom"));
    let scheduler = Arc::new(MockScheduler::new());
    let pipeline = UploadPipeline::new(
        store.clone(), store.clone(),
        ArtifactStore::new(storage.clone(), "uploads"),
        Scheduler::new(scheduler.clone()),
        JobTemplate::default(),
    );
    let state = AppState {
        apps: store.clone(),
        history: store.clone(),
        pipeline,
        spool_dir: Arc::new(std::env::temp_dir()),
        max_body_bytes: 8 * 1024 * 1024,
        request_timeout: Duration::from_secs(30),
    };
    TestHarness { state, store, storage, scheduler }
}

pub const BOUNDARY: &str = "loomtestboundary";

/// Hand-assembled `multipart/form-data` body.
#[derive(Debug, Default, Clone)]
pub struct MultipartBody { buf: Vec<u8> }

impl MultipartBody {
    pub fn new() -> Self { Self::default() }

    pub fn text(mut self, name: &str, value: &str) -> Self {
        self.buf.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"\r\n\r\n{value}\r\n").as_bytes());
        self
    }

    pub fn file(mut self, name: &str, file_name: &str, data: &[u8]) -> Self {
        self.buf.extend_from_slice(format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: application/zip\r\n\r\n").as_bytes());
        self.buf.extend_from_slice(data);
        self.buf.extend_from_slice(b"\r\n");
        self
    }

    pub fn content_type() -> String { format!("multipart/form-data; boundary={BOUNDARY}") }

    pub fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
        self.buf
    }

    /// Body cut off mid-part, with no closing boundary.
    pub fn truncated(self) -> Vec<u8> { self.buf }
}

/// Postgres-backed state, or `None` when no database is configured for this run.
pub async fn pg_state() -> Option<(AppState, Pool<Postgres>)> {
    let pool = test_pool().await?;
    let _ = sqlx::query("DELETE FROM deploy_histories").execute(&pool).await;
    let _ = sqlx::query("DELETE FROM applications").execute(&pool).await;
    let store = Arc::new(PgStore::new(pool.clone()));
    let pipeline = UploadPipeline::new(
        store.clone(), store.clone(),
        ArtifactStore::new(Arc::new(MockStorageBackend::new("loom")), "uploads"),
        Scheduler::new(Arc::new(MockScheduler::new())),
        JobTemplate::default(),
    );
    let state = AppState {
        apps: store.clone(),
        history: store,
        pipeline,
        spool_dir: Arc::new(std::env::temp_dir()),
        max_body_bytes: 8 * 1024 * 1024,
        request_timeout: Duration::from_secs(30),
    };
    Some((state, pool))
}

/// Migrated pool for `DATABASE_URL`; `None` when the variable is unset.
pub async fn test_pool() -> Option<Pool<Postgres>> {
    let raw_url = std::env::var(TEST_DB_URL_ENV).ok()?;
    let url = normalize_url_with_password(&raw_url);
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(8))
        .connect(&url)
        .await
        .unwrap_or_else(|e| panic!("connect {}: {e}", sanitize_url(&url)));
    sqlx::migrate!().run(&pool).await.expect("migrations");
    Some(pool)
}

/// Inject POSTGRES_PASSWORD into a connection URL that omits one.
fn normalize_url_with_password(input: &str) -> String {
    if !input.starts_with("postgres://") { return input.to_string(); }
    if let Ok(mut url) = url::Url::parse(input) {
        if url.password().is_some() { return input.to_string(); }
        if let Ok(pw) = std::env::var("POSTGRES_PASSWORD") {
            let _ = url.set_password(Some(&pw));
            return url.to_string();
        }
    }
    input.to_string()
}

fn sanitize_url(u: &str) -> String {
    if let Ok(mut parsed) = url::Url::parse(u) {
        if parsed.password().is_some() {
            let _ = parsed.set_password(Some("***"));
            return parsed.to_string();
        }
    }
    u.to_string()
}
