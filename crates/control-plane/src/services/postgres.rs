use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;
use crate::models::{Application, DeployHistory};
use super::{apps::ApplicationStore, history::HistoryStore};

const APP_COLUMNS: &str = "id, slug, name, last_deployed, created_at, updated_at";

/// Registry and history backed by the relational store.
#[derive(Debug, Clone)]
pub struct PgStore { pool: Pool<Postgres> }

impl PgStore {
    pub fn new(pool: Pool<Postgres>) -> Self { Self { pool } }
    pub fn pool(&self) -> &Pool<Postgres> { &self.pool }
}

#[async_trait]
impl ApplicationStore for PgStore {
    async fn find_by_slug(&self, slug: &str) -> anyhow::Result<Option<Application>> {
        let q = format!("SELECT {APP_COLUMNS} FROM applications WHERE slug = $1");
        Ok(sqlx::query_as::<_, Application>(&q).bind(slug).fetch_optional(&self.pool).await?)
    }

    async fn insert(&self, slug: &str, name: &str, last_deployed: DateTime<Utc>) -> anyhow::Result<Option<Application>> {
        // the unique constraint on slug decides; a losing insert returns no row
        let q = format!("INSERT INTO applications (slug, name, last_deployed) VALUES ($1, $2, $3) ON CONFLICT (slug) DO NOTHING RETURNING {APP_COLUMNS}");
        Ok(sqlx::query_as::<_, Application>(&q)
            .bind(slug)
            .bind(name)
            .bind(last_deployed)
            .fetch_optional(&self.pool).await?)
    }

    async fn list(&self) -> anyhow::Result<Vec<Application>> {
        let q = format!("SELECT {APP_COLUMNS} FROM applications ORDER BY created_at DESC");
        Ok(sqlx::query_as::<_, Application>(&q).fetch_all(&self.pool).await?)
    }

    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl HistoryStore for PgStore {
    async fn append(&self, application_id: Uuid, bundle_name: &str, unique_file_name: &str) -> anyhow::Result<DeployHistory> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, DeployHistory>("INSERT INTO deploy_histories (application_id, bundle_name, unique_file_name) VALUES ($1, $2, $3) RETURNING id, application_id, bundle_name, unique_file_name, created_at")
            .bind(application_id)
            .bind(bundle_name)
            .bind(unique_file_name)
            .fetch_one(&mut *tx).await?;
        let updated = sqlx::query("UPDATE applications SET last_deployed = now(), updated_at = now() WHERE id = $1")
            .bind(application_id)
            .execute(&mut *tx).await?
            .rows_affected();
        if updated != 1 { anyhow::bail!("application {application_id} disappeared while recording history"); }
        tx.commit().await?;
        Ok(row)
    }

    async fn list_for_app(&self, application_id: Uuid) -> anyhow::Result<Vec<DeployHistory>> {
        Ok(sqlx::query_as::<_, DeployHistory>("SELECT id, application_id, bundle_name, unique_file_name, created_at FROM deploy_histories WHERE application_id = $1 ORDER BY created_at DESC, id DESC")
            .bind(application_id)
            .fetch_all(&self.pool).await?)
    }
}
