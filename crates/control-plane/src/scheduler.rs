//! Submitting job descriptors to the cluster scheduler.
use std::sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use crate::{config::{SchedulerConfig, SchedulerMode}, error::PipelineError, nomad::{Job, JobRegisterRequest}};

/// Acknowledgement of a job registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmissionResult {
    #[serde(rename = "EvalID", default)]
    pub eval_id: String,
    #[serde(rename = "JobModifyIndex", default)]
    pub job_modify_index: u64,
    #[serde(rename = "Warnings", default)]
    pub warnings: Option<String>,
}

#[async_trait]
pub trait SchedulerBackend: Send + Sync + 'static {
    /// Register (or update) `job`, keyed by its ID.
    async fn register_job(&self, job: &Job) -> anyhow::Result<SubmissionResult>;
}

/// Nomad HTTP API client. The address is injected; nothing is read from the environment.
#[derive(Clone)]
pub struct NomadClient { client: Client, base_url: String, token: Option<String> }

impl std::fmt::Debug for NomadClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("NomadClient").field("base_url", &self.base_url).finish() }
}

impl NomadClient {
    pub fn new(cfg: &SchedulerConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(cfg.timeout).build()?;
        Ok(Self { client, base_url: cfg.address.trim_end_matches('/').to_owned(), token: cfg.token.clone() })
    }
}

#[async_trait]
impl SchedulerBackend for NomadClient {
    async fn register_job(&self, job: &Job) -> anyhow::Result<SubmissionResult> {
        let url = format!("{}/v1/jobs", self.base_url);
        let mut req = self.client.post(&url).json(&JobRegisterRequest { job: job.clone() });
        if let Some(t) = &self.token { req = req.header("X-Nomad-Token", t); }
        let resp = req.send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("nomad register {} returned {status}: {}", job.id, body.trim());
        }
        Ok(resp.json::<SubmissionResult>().await?)
    }
}

/// Records submissions instead of talking to a cluster.
#[derive(Debug, Default)]
pub struct MockScheduler { submitted: Mutex<Vec<Job>>, fail: AtomicBool }

impl MockScheduler {
    pub fn new() -> Self { Self::default() }
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::SeqCst); }
    pub fn submitted(&self) -> Vec<Job> { self.submitted.lock().map(|v| v.clone()).unwrap_or_default() }
}

#[async_trait]
impl SchedulerBackend for MockScheduler {
    async fn register_job(&self, job: &Job) -> anyhow::Result<SubmissionResult> {
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("connection refused (mock scheduler)"); }
        let mut jobs = self.submitted.lock().map_err(|_| anyhow::anyhow!("mock scheduler lock poisoned"))?;
        jobs.push(job.clone());
        let n = jobs.len() as u64;
        Ok(SubmissionResult { eval_id: format!("mock-eval-{n}"), job_modify_index: n, warnings: None })
    }
}

/// Cluster scheduler client used by the upload pipeline.
#[derive(Clone)]
pub struct Scheduler { inner: Arc<dyn SchedulerBackend> }

impl Scheduler {
    pub fn new(inner: Arc<dyn SchedulerBackend>) -> Self { Self { inner } }

    pub fn from_config(cfg: &SchedulerConfig) -> anyhow::Result<Self> {
        match cfg.mode {
            SchedulerMode::Nomad => {
                info!(address=%cfg.address, "scheduler.init_nomad");
                Ok(Self::new(Arc::new(NomadClient::new(cfg)?)))
            }
            SchedulerMode::Mock => {
                info!("scheduler.init_mock");
                Ok(Self::new(Arc::new(MockScheduler::new())))
            }
        }
    }

    pub async fn submit(&self, job: &Job) -> Result<SubmissionResult, PipelineError> {
        match self.inner.register_job(job).await {
            Ok(res) => {
                info!(job_id=%job.id, eval_id=%res.eval_id, job_modify_index=res.job_modify_index, "scheduler.job_registered");
                if let Some(w) = res.warnings.as_deref().filter(|w| !w.is_empty()) { warn!(job_id=%job.id, warnings=%w, "scheduler.job_warnings"); }
                Ok(res)
            }
            Err(e) => {
                warn!(job_id=%job.id, error=%format!("{e:#}"), "scheduler.register_failed");
                Err(PipelineError::Scheduler(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::JobTemplate, nomad::build_job};
    use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::TcpListener};

    /// One-shot HTTP server answering with `status` and `body`; returns the raw request it saw.
    async fn fake_nomad(status: u16, body: &'static str) -> (String, tokio::task::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = sock.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(idx) = text.find("\r\n\r\n") {
                    let len = text.lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse::<usize>().unwrap()))
                        .unwrap_or(0);
                    if raw.len() >= idx + 4 + len { break; }
                }
                if n == 0 { break; }
            }
            let resp = format!("HTTP/1.1 {status} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}", body.len());
            sock.write_all(resp.as_bytes()).await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (format!("http://{addr}"), handle)
    }

    fn cfg(address: String) -> SchedulerConfig {
        SchedulerConfig { address, token: Some("tok".into()), ..SchedulerConfig::default() }
    }

    #[tokio::test]
    async fn registers_job_over_http() {
        let (addr, seen) = fake_nomad(200, r#"{"EvalID":"e-1","JobModifyIndex":42,"Warnings":""}"#).await;
        let sched = Scheduler::new(Arc::new(NomadClient::new(&cfg(addr)).unwrap()));
        let job = build_job("demo", "x.zip", &JobTemplate::default()).unwrap();
        let res = sched.submit(&job).await.unwrap();
        assert_eq!(res.eval_id, "e-1");
        assert_eq!(res.job_modify_index, 42);
        let raw = seen.await.unwrap();
        assert!(raw.starts_with("POST /v1/jobs "), "{raw}");
        assert!(raw.to_ascii_lowercase().contains("x-nomad-token: tok"));
        assert!(raw.contains(r#""ID":"loomapp-demo""#));
    }

    #[tokio::test]
    async fn non_success_status_is_scheduler_error() {
        let (addr, _seen) = fake_nomad(500, r#"{"error":"no leader"}"#).await;
        let sched = Scheduler::new(Arc::new(NomadClient::new(&cfg(addr)).unwrap()));
        let job = build_job("demo", "x.zip", &JobTemplate::default()).unwrap();
        let err = sched.submit(&job).await.unwrap_err();
        assert!(matches!(err, PipelineError::Scheduler(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn unreachable_scheduler_is_scheduler_error() {
        // bind then drop so the port is (almost certainly) closed
        let port = TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port();
        let sched = Scheduler::new(Arc::new(NomadClient::new(&cfg(format!("http://127.0.0.1:{port}"))).unwrap()));
        let job = build_job("demo", "x.zip", &JobTemplate::default()).unwrap();
        assert!(matches!(sched.submit(&job).await, Err(PipelineError::Scheduler(_))));
    }

    #[tokio::test]
    async fn mock_records_submissions() {
        let mock = Arc::new(MockScheduler::new());
        let sched = Scheduler::new(mock.clone());
        let job = build_job("demo", "x.zip", &JobTemplate::default()).unwrap();
        sched.submit(&job).await.unwrap();
        sched.submit(&job).await.unwrap();
        assert_eq!(mock.submitted().len(), 2);
        assert!(mock.submitted().iter().all(|j| j.id == "loomapp-demo"));
    }
}
