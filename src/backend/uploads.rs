//! Source ingestion: file uploads, web scraping and processing status
//!
//! Files are checked locally (type, size, emptiness) before anything is
//! sent; the backend stores them and answers with a retrievable URL.

use std::path::Path;

use reqwest::multipart::{Form, Part};
use reqwest::{Method, Url};
use serde_json::{json, Value};
use thiserror::Error;

use crate::config::UploadLimits;
use crate::engine::{poll_until_settled, PollOutcome, PollPolicy, ProcessingStatus};

use super::{id_string, BackendClient, BackendError, FeatureType};

/// Response fields that may hold the stored file's URL, in lookup order
const URL_FIELDS: [&str; 6] = [
    "url",
    "public_url",
    "publicUrl",
    "signedURL",
    "signed_url",
    "file_url",
];

/// Input rejected before any network call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Unsupported file type: {0}")]
    UnsupportedFileType(String),

    #[error("File is too large: {size} bytes (limit {limit} bytes)")]
    FileTooLarge { size: u64, limit: u64 },

    #[error("File is empty")]
    EmptyFile,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("{0} sources cannot be uploaded as files")]
    NotUploadable(&'static str),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Pdf,
    Csv,
    Web,
}

impl SourceKind {
    pub fn label(self) -> &'static str {
        match self {
            SourceKind::Pdf => "PDF",
            SourceKind::Csv => "CSV",
            SourceKind::Web => "Web",
        }
    }

    pub fn feature_type(self) -> FeatureType {
        match self {
            SourceKind::Pdf => FeatureType::Pdf,
            SourceKind::Csv => FeatureType::Csv,
            SourceKind::Web => FeatureType::Web,
        }
    }
}

/// A file read into memory, ready for upload
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(file_name: impl Into<String>, content_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }

    /// Read a file from disk, guessing its content type from the extension.
    ///
    /// Files over `max_bytes` are rejected from their metadata before any
    /// content is read.
    pub async fn from_path(path: &Path, max_bytes: u64) -> Result<Self, BackendError> {
        let size = tokio::fs::metadata(path).await?.len();
        if size > max_bytes {
            return Err(ValidationError::FileTooLarge {
                size,
                limit: max_bytes,
            }
            .into());
        }

        let bytes = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let content_type = match path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .as_deref()
        {
            Some("pdf") => "application/pdf",
            Some("csv") => "text/csv",
            _ => "application/octet-stream",
        };

        Ok(Self::new(file_name, content_type, bytes))
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// Largest accepted upload for `kind`
fn size_limit(kind: SourceKind, limits: &UploadLimits) -> Result<u64, ValidationError> {
    match kind {
        SourceKind::Pdf => Ok(limits.pdf_max_bytes),
        SourceKind::Csv => Ok(limits.csv_max_bytes),
        SourceKind::Web => Err(ValidationError::NotUploadable(kind.label())),
    }
}

/// Check a file against the backend's acceptance rules
pub fn validate_upload(
    kind: SourceKind,
    file: &UploadFile,
    limits: &UploadLimits,
) -> Result<(), ValidationError> {
    let limit = size_limit(kind, limits)?;
    match kind {
        SourceKind::Pdf if file.content_type != "application/pdf" => {
            return Err(ValidationError::UnsupportedFileType(format!(
                "{} ({}), only PDF files are allowed",
                file.file_name, file.content_type
            )));
        }
        SourceKind::Csv if !file.file_name.to_lowercase().ends_with(".csv") => {
            return Err(ValidationError::UnsupportedFileType(format!(
                "{}, only CSV files are allowed",
                file.file_name
            )));
        }
        _ => {}
    }

    if file.bytes.is_empty() {
        return Err(ValidationError::EmptyFile);
    }
    if file.size() > limit {
        return Err(ValidationError::FileTooLarge {
            size: file.size(),
            limit,
        });
    }
    Ok(())
}

/// Accept only absolute http(s) URLs with a host
pub fn validate_url(raw: &str) -> Result<Url, ValidationError> {
    let url = Url::parse(raw.trim()).map_err(|e| ValidationError::InvalidUrl(format!("{}: {}", raw, e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ValidationError::InvalidUrl(format!(
            "{}: scheme must be http or https",
            raw
        )));
    }
    if url.host_str().map_or(true, str::is_empty) {
        return Err(ValidationError::InvalidUrl(format!("{}: missing host", raw)));
    }
    Ok(url)
}

/// A stored source as reported by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedSource {
    pub kind: SourceKind,
    pub id: Option<String>,
    pub file_name: Option<String>,
    pub path: Option<String>,
    pub url: String,
}

impl UploadedSource {
    fn from_response(kind: SourceKind, data: &Value, raw: &Value) -> Option<Self> {
        let url = extract_url(data).or_else(|| extract_url(raw))?;
        Some(Self {
            kind,
            id: data.get("id").and_then(id_string),
            file_name: data
                .get("filename")
                .and_then(Value::as_str)
                .map(str::to_string),
            path: data.get("path").and_then(Value::as_str).map(str::to_string),
            url,
        })
    }
}

/// First non-empty URL among the accepted field names
fn extract_url(value: &Value) -> Option<String> {
    URL_FIELDS
        .iter()
        .filter_map(|field| value.get(*field).and_then(Value::as_str))
        .find(|url| !url.is_empty())
        .map(str::to_string)
}

fn status_of(record: &Value) -> Option<ProcessingStatus> {
    record
        .get("embedding_status")
        .or_else(|| record.get("status"))
        .and_then(Value::as_str)
        .map(ProcessingStatus::parse)
}

impl BackendClient {
    fn record_path(&self, kind: SourceKind, id: &str) -> String {
        let base = match kind {
            SourceKind::Pdf => &self.endpoints.pdf_record,
            SourceKind::Csv => &self.endpoints.csv_record,
            SourceKind::Web => &self.endpoints.web_record,
        };
        format!("{}/{}", base, id)
    }

    /// Read a file from disk and upload it
    pub async fn upload_path(
        &self,
        kind: SourceKind,
        path: &Path,
    ) -> Result<UploadedSource, BackendError> {
        let file = UploadFile::from_path(path, size_limit(kind, &self.limits)?).await?;
        self.upload(kind, file).await
    }

    /// Upload a PDF or CSV as multipart field `file`
    pub async fn upload(
        &self,
        kind: SourceKind,
        file: UploadFile,
    ) -> Result<UploadedSource, BackendError> {
        validate_upload(kind, &file, &self.limits)?;

        let path = match kind {
            SourceKind::Pdf => &self.endpoints.pdf_upload,
            SourceKind::Csv => &self.endpoints.csv_upload,
            SourceKind::Web => return Err(ValidationError::NotUploadable(kind.label()).into()),
        };

        tracing::info!(
            kind = kind.label(),
            file = %file.file_name,
            size = file.size(),
            "uploading source"
        );

        let part = Part::bytes(file.bytes)
            .file_name(file.file_name)
            .mime_str(&file.content_type)?;
        let form = Form::new().part("file", part);

        let raw = self.call_raw(self.request(Method::POST, path).multipart(form)).await?;
        let data = raw.get("data").unwrap_or(&raw);
        UploadedSource::from_response(kind, data, &raw).ok_or_else(|| {
            BackendError::InvalidResponse(format!("No file URL in upload response: {}", raw))
        })
    }

    /// Submit a web page for scraping
    pub async fn scrape(&self, url: &str) -> Result<UploadedSource, BackendError> {
        let url = validate_url(url)?;
        tracing::info!(%url, "submitting page for scraping");

        let raw = self
            .call_raw(
                self.request(Method::POST, &self.endpoints.web_scrape)
                    .json(&json!({ "url": url.as_str() })),
            )
            .await?;
        let data = raw.get("data").unwrap_or(&raw);

        Ok(UploadedSource::from_response(SourceKind::Web, data, &raw).unwrap_or_else(|| {
            UploadedSource {
                kind: SourceKind::Web,
                id: data.get("id").and_then(id_string),
                file_name: None,
                path: None,
                url: url.to_string(),
            }
        }))
    }

    /// Fetch a source record; the backend refreshes its URL on every read
    pub async fn source_record(&self, kind: SourceKind, id: &str) -> Result<Value, BackendError> {
        self.call(self.request(Method::GET, &self.record_path(kind, id)))
            .await
    }

    pub async fn source_status(
        &self,
        kind: SourceKind,
        id: &str,
    ) -> Result<ProcessingStatus, BackendError> {
        let record = self.source_record(kind, id).await?;
        status_of(&record).ok_or_else(|| {
            BackendError::InvalidResponse(format!("No processing status in record {}", id))
        })
    }

    /// Poll a source until the backend has finished processing it
    pub async fn wait_until_processed(
        &self,
        kind: SourceKind,
        id: &str,
        policy: &PollPolicy,
    ) -> PollOutcome {
        let outcome = poll_until_settled(policy, move || self.source_status(kind, id)).await;
        tracing::info!(kind = kind.label(), %id, ?outcome, "source processing settled");
        outcome
    }
}
