//! Reading the upload form.
//!
//! The multipart body is consumed in one pass: text fields are kept, the first
//! `uploadfile` part is streamed into a spool file. A body that cannot be read as a form
//! is reported on [`UploadForm::failure`]; a missing file part surfaces only when the
//! pipeline asks for the upload.
use std::path::Path;
use async_trait::async_trait;
use axum::extract::{Multipart, multipart::{Field, MultipartRejection}};
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::debug;
use crate::{error::PipelineError, storage::ObjectBody};

pub const SLUG_FIELD: &str = "application_slug";
pub const AUTO_CREATE_FIELD: &str = "auto_create";
pub const FILE_FIELD: &str = "uploadfile";

/// A fully received bundle.
#[derive(Debug)]
pub struct ReceivedUpload {
    /// Client-supplied filename, reduced to its last path component.
    pub file_name: String,
    pub body: ObjectBody,
    pub sha256: String,
}

#[async_trait]
pub trait UploadSource: Send {
    /// Hand over the uploaded bundle. Called at most once.
    async fn receive(&mut self) -> Result<ReceivedUpload, PipelineError>;
}

/// An upload already held in memory.
#[derive(Debug, Clone)]
pub struct InMemoryUpload { pub file_name: String, pub data: Bytes }

#[async_trait]
impl UploadSource for InMemoryUpload {
    async fn receive(&mut self) -> Result<ReceivedUpload, PipelineError> {
        let sha256 = hex::encode(Sha256::digest(&self.data));
        Ok(ReceivedUpload { file_name: base_name(&self.file_name), body: ObjectBody::Bytes(self.data.clone()), sha256 })
    }
}

/// Outcome of reading the file part, delivered on `receive`.
#[derive(Debug)]
pub struct SpooledUpload(Option<Result<ReceivedUpload, PipelineError>>);

#[async_trait]
impl UploadSource for SpooledUpload {
    async fn receive(&mut self) -> Result<ReceivedUpload, PipelineError> {
        self.0.take().unwrap_or_else(|| Err(PipelineError::Parse(format!("missing form file {FILE_FIELD:?}"))))
    }
}

#[derive(Debug)]
pub struct UploadForm {
    /// Raw, not yet normalized.
    pub application_slug: String,
    pub auto_create: bool,
    pub upload: SpooledUpload,
    /// Set when the body itself could not be read as a form.
    pub failure: Option<PipelineError>,
}

pub async fn read_upload_form(multipart: Result<Multipart, MultipartRejection>, spool_dir: &Path) -> UploadForm {
    let mut form = UploadForm { application_slug: String::new(), auto_create: false, upload: SpooledUpload(None), failure: None };
    let mut multipart = match multipart {
        Ok(m) => m,
        Err(rej) => { form.failure = Some(PipelineError::Parse(rej.body_text())); return form; }
    };
    let mut failure: Option<PipelineError> = None;
    loop {
        let field = match multipart.next_field().await {
            Ok(Some(f)) => f,
            Ok(None) => break,
            Err(e) => { failure = Some(PipelineError::Parse(e.body_text())); break; }
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            SLUG_FIELD => match field.text().await {
                Ok(v) => form.application_slug = v,
                Err(e) => { failure = Some(PipelineError::Parse(e.body_text())); break; }
            },
            AUTO_CREATE_FIELD => match field.text().await {
                Ok(v) => form.auto_create = v.trim() == "true",
                Err(e) => { failure = Some(PipelineError::Parse(e.body_text())); break; }
            },
            FILE_FIELD if form.upload.0.is_none() => match spool_field(field, spool_dir).await {
                Ok(u) => form.upload = SpooledUpload(Some(Ok(u))),
                Err(e) => { failure = Some(e); break; }
            },
            other => debug!(field=%other, "upload_form.ignored_field"),
        }
    }
    // a broken body invalidates whatever was spooled before the break
    if failure.is_some() { form.upload = SpooledUpload(None); }
    form.failure = failure;
    form
}

async fn spool_field(mut field: Field<'_>, dir: &Path) -> Result<ReceivedUpload, PipelineError> {
    let Some(file_name) = field.file_name().map(base_name) else {
        return Err(PipelineError::Parse(format!("{FILE_FIELD:?} is not a file part")));
    };
    let tmp = tempfile::Builder::new().prefix("loom-upload-").suffix(".part").tempfile_in(dir)
        .map_err(|e| PipelineError::Internal(format!("create spool file in {}: {e}", dir.display())))?;
    let (file, path) = tmp.into_parts();
    let mut out = tokio::fs::File::from_std(file);
    let mut hasher = Sha256::new();
    let mut size: u64 = 0;
    while let Some(chunk) = field.chunk().await.map_err(|e| PipelineError::Parse(e.body_text()))? {
        hasher.update(&chunk);
        out.write_all(&chunk).await.map_err(|e| PipelineError::Internal(format!("write spool file: {e}")))?;
        size += chunk.len() as u64;
    }
    out.flush().await.map_err(|e| PipelineError::Internal(format!("flush spool file: {e}")))?;
    debug!(file_name=%file_name, size, "upload_form.spooled");
    Ok(ReceivedUpload { file_name, body: ObjectBody::Spooled { path, size }, sha256: hex::encode(hasher.finalize()) })
}

/// Last path component of a client filename (`C:\\x\\bundle.zip` -> `bundle.zip`).
pub fn base_name(raw: &str) -> String {
    raw.rsplit(['/', '\\']).next().unwrap_or_default().to_string()
}
