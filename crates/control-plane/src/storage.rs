use async_trait::async_trait;
use bytes::Bytes;
use std::{collections::HashMap, sync::{Arc, Mutex, atomic::{AtomicBool, Ordering}}};
use tempfile::TempPath;
use tracing::{info, warn};
use uuid::Uuid;
use crate::{config::{StorageConfig, StorageMode}, error::PipelineError, models::ArtifactRef};

pub const ZIP_CONTENT_TYPE: &str = "application/zip";

/// Bundle bytes ready to be written, either held in memory or spooled to a temp file.
#[derive(Debug)]
pub enum ObjectBody {
    Bytes(Bytes),
    /// Fully written spool file; removed from disk when dropped.
    Spooled { path: TempPath, size: u64 },
}

impl ObjectBody {
    pub fn len(&self) -> u64 {
        match self { Self::Bytes(b) => b.len() as u64, Self::Spooled { size, .. } => *size }
    }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
    pub async fn to_bytes(&self) -> std::io::Result<Bytes> {
        match self {
            Self::Bytes(b) => Ok(b.clone()),
            Self::Spooled { path, .. } => tokio::fs::read(path).await.map(Bytes::from),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PutObject<'a> { pub key: &'a str, pub content_type: &'a str, pub sha256: Option<&'a str> }

#[async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Write `body` under `req.key` in the backend's bucket; returns bytes written.
    async fn put_object(&self, req: PutObject<'_>, body: &ObjectBody) -> anyhow::Result<u64>;
    fn bucket(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject { pub content_type: String, pub metadata: HashMap<String,String>, pub data: Bytes }

/// In-process backend for tests and local runs. Keeps every object in memory.
#[derive(Debug, Default)]
pub struct MockStorageBackend { bucket: String, objects: Mutex<HashMap<String, StoredObject>>, fail: AtomicBool }

impl MockStorageBackend {
    pub fn new(bucket: impl Into<String>) -> Self { Self { bucket: bucket.into(), ..Default::default() } }
    /// Make every following write fail (simulates the store being unreachable).
    pub fn set_failing(&self, fail: bool) { self.fail.store(fail, Ordering::SeqCst); }
    pub fn object(&self, key: &str) -> Option<StoredObject> { self.objects.lock().ok()?.get(key).cloned() }
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.lock().map(|m| m.keys().cloned().collect()).unwrap_or_default();
        keys.sort();
        keys
    }
}

#[async_trait]
impl StorageBackend for MockStorageBackend {
    async fn put_object(&self, req: PutObject<'_>, body: &ObjectBody) -> anyhow::Result<u64> {
        if self.fail.load(Ordering::SeqCst) { anyhow::bail!("mock storage unavailable"); }
        let data = body.to_bytes().await?;
        let n = data.len() as u64;
        let mut metadata = HashMap::new();
        if let Some(d) = req.sha256 { metadata.insert("sha256".to_string(), d.to_string()); }
        let obj = StoredObject { content_type: req.content_type.to_string(), metadata, data };
        self.objects.lock().map_err(|_| anyhow::anyhow!("mock storage lock poisoned"))?.insert(req.key.to_string(), obj);
        Ok(n)
    }
    fn bucket(&self) -> &str { &self.bucket }
}

#[cfg(feature="s3")]
#[derive(Clone)]
pub struct S3StorageBackend { client: aws_sdk_s3::Client, bucket: String }

#[cfg(feature="s3")]
impl std::fmt::Debug for S3StorageBackend { fn fmt(&self, f:&mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("S3StorageBackend").field("bucket", &self.bucket).finish() } }

#[cfg(feature="s3")]
impl S3StorageBackend {
    pub async fn from_config(cfg: &StorageConfig) -> Self {
        use aws_config::BehaviorVersion;
        let shared = aws_config::defaults(BehaviorVersion::latest()).region(aws_sdk_s3::config::Region::new(cfg.region.clone())).load().await;
        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(ep) = &cfg.endpoint_url {
            // S3-compatible stores (Spaces, MinIO) want path-style addressing
            builder = builder.endpoint_url(ep).force_path_style(true);
        }
        if let (Some(key), Some(secret)) = (&cfg.access_key_id, &cfg.secret_access_key) {
            builder = builder.credentials_provider(aws_sdk_s3::config::Credentials::new(key, secret, None, None, "loom-static"));
        }
        let client = aws_sdk_s3::Client::from_conf(builder.build());
        Self { client, bucket: cfg.bucket.clone() }
    }
}

#[cfg(feature="s3")]
#[async_trait]
impl StorageBackend for S3StorageBackend {
    async fn put_object(&self, req: PutObject<'_>, body: &ObjectBody) -> anyhow::Result<u64> {
        use aws_sdk_s3::primitives::ByteStream;
        let size = body.len();
        let stream = match body {
            ObjectBody::Bytes(b) => ByteStream::from(b.clone()),
            ObjectBody::Spooled { path, .. } => ByteStream::from_path(path.to_path_buf()).await?,
        };
        let mut put = self.client.put_object()
            .bucket(&self.bucket)
            .key(req.key)
            .content_type(req.content_type)
            .content_length(i64::try_from(size)?)
            .body(stream);
        if let Some(d) = req.sha256 { put = put.metadata("sha256", d); }
        put.send().await?;
        Ok(size)
    }
    fn bucket(&self) -> &str { &self.bucket }
}

/// Generate a fresh object name: a v4 uuid (122 random bits) with a `.zip` suffix.
pub fn generate_object_name() -> String { format!("{}.zip", Uuid::new_v4()) }

/// Writes uploaded bundles under a fixed prefix with generated names.
#[derive(Clone)]
pub struct ArtifactStore { inner: Arc<dyn StorageBackend>, prefix: String }

impl std::fmt::Debug for ArtifactStore { fn fmt(&self, f:&mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.debug_struct("ArtifactStore").field("bucket", &self.inner.bucket()).field("prefix", &self.prefix).finish() } }

impl ArtifactStore {
    pub fn new(inner: Arc<dyn StorageBackend>, prefix: impl Into<String>) -> Self {
        Self { inner, prefix: prefix.into().trim_matches('/').to_string() }
    }

    pub async fn from_config(cfg: &StorageConfig) -> Self {
        if cfg.mode == StorageMode::S3 {
            #[cfg(feature="s3")]
            {
                let backend = S3StorageBackend::from_config(cfg).await;
                info!(bucket=%cfg.bucket, prefix=%cfg.prefix, endpoint=?cfg.endpoint_url, "storage.init_s3");
                return Self::new(Arc::new(backend), cfg.prefix.clone());
            }
            #[cfg(not(feature="s3"))]
            warn!("s3 feature not enabled, falling back to mock backend");
        }
        info!(bucket=%cfg.bucket, prefix=%cfg.prefix, "storage.init_mock");
        Self::new(Arc::new(MockStorageBackend::new(cfg.bucket.clone())), cfg.prefix.clone())
    }

    pub fn prefix(&self) -> &str { &self.prefix }
    pub fn backend(&self) -> &dyn StorageBackend { self.inner.as_ref() }

    /// Persist one bundle under `<prefix>/<generated name>`.
    pub async fn store(&self, body: &ObjectBody, sha256: Option<&str>) -> Result<ArtifactRef, PipelineError> {
        let name = generate_object_name();
        let path = format!("{}/{}", self.prefix, name);
        let req = PutObject { key: &path, content_type: ZIP_CONTENT_TYPE, sha256 };
        match self.inner.put_object(req, body).await {
            Ok(n) => {
                info!(bucket=%self.inner.bucket(), path=%path, size=n, "storage.put_object");
                Ok(ArtifactRef { name, path })
            }
            Err(e) => {
                warn!(bucket=%self.inner.bucket(), path=%path, error=%format!("{e:#}"), "storage.put_object_failed");
                Err(PipelineError::Storage(e))
            }
        }
    }
}
