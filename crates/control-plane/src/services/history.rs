//! Deploy history: one immutable row per deployed bundle.
use async_trait::async_trait;
use uuid::Uuid;
use crate::{error::PipelineError, models::DeployHistory};

#[async_trait]
pub trait HistoryStore: Send + Sync + 'static {
    /// Append a history row and bump the application's `last_deployed`, atomically.
    async fn append(&self, application_id: Uuid, bundle_name: &str, unique_file_name: &str) -> anyhow::Result<DeployHistory>;
    /// Newest first.
    async fn list_for_app(&self, application_id: Uuid) -> anyhow::Result<Vec<DeployHistory>>;
}

pub async fn record(store: &dyn HistoryStore, application_id: Uuid, original_filename: &str, storage_filename: &str) -> Result<DeployHistory, PipelineError> {
    store.append(application_id, original_filename, storage_filename).await.map_err(PipelineError::HistoryWrite)
}
