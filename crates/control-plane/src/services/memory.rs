//! In-memory registry and history for tests and local runs. Nothing survives a restart.
use std::{collections::{HashMap, HashSet}, sync::{Mutex, atomic::{AtomicBool, Ordering}}};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;
use crate::models::{Application, DeployHistory};
use super::{apps::ApplicationStore, history::HistoryStore};

#[derive(Debug, Default)]
struct Tables {
    apps: HashMap<String, Application>,
    /// slugs the unique constraint treats as taken but no reader can see
    reserved: HashSet<String>,
    history: Vec<DeployHistory>,
}

#[derive(Debug, Default)]
pub struct MemoryStore { tables: Mutex<Tables>, fail: AtomicBool, fail_history: AtomicBool }

impl MemoryStore {
    pub fn new() -> Self { Self::default() }
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::SeqCst); }
    pub fn set_history_failing(&self, fail: bool) { self.fail_history.store(fail, Ordering::SeqCst); }
    /// Make inserts for `slug` lose to a row that lookups never return.
    pub fn reserve_slug(&self, slug: &str) {
        if let Ok(mut t) = self.tables.lock() { t.reserved.insert(slug.to_string()); }
    }
    pub fn history_len(&self) -> usize { self.tables.lock().map(|t| t.history.len()).unwrap_or(0) }

    fn tables(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Tables>> {
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("memory store unavailable"); }
        self.tables.lock().map_err(|_| anyhow::anyhow!("memory store lock poisoned"))
    }
}

#[async_trait]
impl ApplicationStore for MemoryStore {
    async fn find_by_slug(&self, slug: &str) -> anyhow::Result<Option<Application>> {
        Ok(self.tables()?.apps.get(slug).cloned())
    }

    async fn insert(&self, slug: &str, name: &str, last_deployed: DateTime<Utc>) -> anyhow::Result<Option<Application>> {
        let mut t = self.tables()?;
        if t.apps.contains_key(slug) || t.reserved.contains(slug) { return Ok(None); }
        let now = Utc::now();
        let app = Application { id: Uuid::new_v4(), slug: slug.to_string(), name: name.to_string(), last_deployed, created_at: now, updated_at: now };
        t.apps.insert(slug.to_string(), app.clone());
        Ok(Some(app))
    }

    async fn list(&self) -> anyhow::Result<Vec<Application>> {
        let mut apps: Vec<Application> = self.tables()?.apps.values().cloned().collect();
        apps.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.slug.cmp(&b.slug)));
        Ok(apps)
    }

    async fn ping(&self) -> anyhow::Result<()> { self.tables().map(|_| ()) }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn append(&self, application_id: Uuid, bundle_name: &str, unique_file_name: &str) -> anyhow::Result<DeployHistory> {
        if self.fail_history.load(Ordering::SeqCst) { anyhow::bail!("deploy_histories insert failed (memory store)"); }
        let mut t = self.tables()?;
        let now = Utc::now();
        let app = t.apps.values_mut().find(|a| a.id == application_id)
            .ok_or_else(|| anyhow::anyhow!("application {application_id} disappeared while recording history"))?;
        app.last_deployed = now;
        app.updated_at = now;
        let row = DeployHistory { id: Uuid::new_v4(), application_id, bundle_name: bundle_name.to_string(), unique_file_name: unique_file_name.to_string(), created_at: now };
        t.history.push(row.clone());
        Ok(row)
    }

    async fn list_for_app(&self, application_id: Uuid) -> anyhow::Result<Vec<DeployHistory>> {
        // insertion order is creation order; newest first
        Ok(self.tables()?.history.iter().rev().filter(|h| h.application_id == application_id).cloned().collect())
    }
}
