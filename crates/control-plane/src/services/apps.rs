//! Application registry: slug -> application, with optional creation.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use crate::{error::PipelineError, models::{Application, validate_slug}};

#[async_trait]
pub trait ApplicationStore: Send + Sync + 'static {
    async fn find_by_slug(&self, slug: &str) -> anyhow::Result<Option<Application>>;
    /// Insert a new application. Returns `None` when the slug is already taken.
    async fn insert(&self, slug: &str, name: &str, last_deployed: DateTime<Utc>) -> anyhow::Result<Option<Application>>;
    async fn list(&self) -> anyhow::Result<Vec<Application>>;
    async fn ping(&self) -> anyhow::Result<()>;
}

/// Resolve `slug` to its application, creating it when absent and `auto_create` is set.
///
/// `slug` must already be normalized. Creation is insert-first: losing a race against a
/// concurrent create re-reads the winner's row; if even that finds nothing the store's
/// uniqueness constraint fired for a row we cannot see and the call is a conflict.
pub async fn resolve(store: &dyn ApplicationStore, slug: &str, auto_create: bool) -> Result<Application, PipelineError> {
    if !validate_slug(slug) {
        return Err(PipelineError::InvalidArgument(format!("slug {slug:?} is empty or not normalized")));
    }
    if let Some(app) = store.find_by_slug(slug).await.map_err(PipelineError::Registry)? { return Ok(app); }
    if !auto_create { return Err(PipelineError::NotFound(slug.to_string())); }

    info!(slug=%slug, "application.auto_create");
    if let Some(app) = store.insert(slug, slug, Utc::now()).await.map_err(PipelineError::Registry)? { return Ok(app); }
    match store.find_by_slug(slug).await.map_err(PipelineError::Registry)? {
        Some(app) => { info!(slug=%slug, app_id=%app.id, "application.create_race_lost"); Ok(app) }
        None => Err(PipelineError::Conflict(slug.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryStore;

    #[tokio::test]
    async fn existing_application_is_returned_untouched() {
        let store = MemoryStore::new();
        let created = store.insert("demo", "Demo", Utc::now()).await.unwrap().unwrap();
        let got = resolve(&store, "demo", false).await.unwrap();
        assert_eq!(got, created);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_without_auto_create_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(resolve(&store, "demo", false).await, Err(PipelineError::NotFound(s)) if s == "demo"));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn auto_create_inserts_exactly_once() {
        let store = MemoryStore::new();
        let a = resolve(&store, "demo", true).await.unwrap();
        assert_eq!((a.slug.as_str(), a.name.as_str()), ("demo", "demo"));
        let b = resolve(&store, "demo", true).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_creates_yield_one_row() {
        let store = std::sync::Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { resolve(s.as_ref(), "race", true).await.map(|a| a.id) }));
        }
        let mut ids = Vec::new();
        for h in handles { ids.push(h.await.unwrap().unwrap()); }
        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn lost_race_with_invisible_winner_is_conflict() {
        let store = MemoryStore::new();
        store.reserve_slug("ghost");
        assert!(matches!(resolve(&store, "ghost", true).await, Err(PipelineError::Conflict(_))));
    }

    #[tokio::test]
    async fn invalid_slug_is_rejected_before_lookup() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(resolve(&store, "", true).await, Err(PipelineError::InvalidArgument(_))));
        assert!(matches!(resolve(&store, "Not Normal", true).await, Err(PipelineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn store_outage_is_registry_error() {
        let store = MemoryStore::new();
        store.set_failing(true);
        assert!(matches!(resolve(&store, "demo", true).await, Err(PipelineError::Registry(_))));
    }
}
