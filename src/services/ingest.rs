use garde::Validate;
use image::ImageFormat;
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{JobStore, StoreError};
use crate::models::analysis::SubmitMetadata;
use crate::models::job::{AnalysisJob, ImageInput, NewAnalysisJob};
use crate::services::storage::{ImageStore, StorageError};

const DICOM_PREAMBLE_LEN: usize = 128;
const DICOM_MAGIC: &[u8] = b"DICM";

/// A file as received from the client, before any checks.
#[derive(Debug, Clone)]
pub struct Upload {
    pub filename: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Accepted scan formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanFormat {
    Jpeg,
    Png,
    Gif,
    Dicom,
}

impl ScanFormat {
    pub fn from_mime(mime: &str) -> Option<Self> {
        let essence = mime.split(';').next().unwrap_or_default().trim();
        match essence.to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" => Some(ScanFormat::Jpeg),
            "image/png" => Some(ScanFormat::Png),
            "image/gif" => Some(ScanFormat::Gif),
            "application/dicom" => Some(ScanFormat::Dicom),
            _ => None,
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ScanFormat::Jpeg),
            "png" => Some(ScanFormat::Png),
            "gif" => Some(ScanFormat::Gif),
            "dcm" => Some(ScanFormat::Dicom),
            _ => None,
        }
    }

    /// Identify the format from the file's leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<Self> {
        if bytes.len() >= DICOM_PREAMBLE_LEN + DICOM_MAGIC.len()
            && &bytes[DICOM_PREAMBLE_LEN..DICOM_PREAMBLE_LEN + DICOM_MAGIC.len()] == DICOM_MAGIC
        {
            return Some(ScanFormat::Dicom);
        }
        match image::guess_format(bytes) {
            Ok(ImageFormat::Jpeg) => Some(ScanFormat::Jpeg),
            Ok(ImageFormat::Png) => Some(ScanFormat::Png),
            Ok(ImageFormat::Gif) => Some(ScanFormat::Gif),
            _ => None,
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ScanFormat::Jpeg => "image/jpeg",
            ScanFormat::Png => "image/png",
            ScanFormat::Gif => "image/gif",
            ScanFormat::Dicom => "application/dicom",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            ScanFormat::Jpeg => "jpg",
            ScanFormat::Png => "png",
            ScanFormat::Gif => "gif",
            ScanFormat::Dicom => "dcm",
        }
    }
}

fn extension_of(filename: &str) -> Option<&str> {
    let (stem, ext) = filename.rsplit_once('.')?;
    (!stem.is_empty()).then_some(ext)
}

/// Strip any client-side directory components.
fn base_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Check an upload against the allowed formats and the size ceiling.
///
/// Checks run in order: presence, emptiness, size, declared type, content.
pub fn validate_upload(upload: Option<&Upload>, max_bytes: usize) -> Result<ScanFormat, IngestError> {
    let upload = upload.ok_or(IngestError::MissingFile)?;

    if upload.bytes.is_empty() {
        return Err(IngestError::EmptyFile);
    }
    if upload.bytes.len() > max_bytes {
        return Err(IngestError::TooLarge {
            size: upload.bytes.len(),
            max: max_bytes,
        });
    }

    let extension = upload.filename.as_deref().map(base_name).and_then(extension_of);

    // A generic content type says nothing; fall back to the extension.
    let declared = upload
        .content_type
        .as_deref()
        .and_then(ScanFormat::from_mime)
        .or_else(|| extension.and_then(ScanFormat::from_extension))
        .ok_or_else(|| {
            IngestError::UnsupportedType(format!(
                "{} is not an accepted scan type (jpeg, png, gif, dicom)",
                upload
                    .content_type
                    .as_deref()
                    .or(extension)
                    .unwrap_or("unknown")
            ))
        })?;

    match ScanFormat::sniff(&upload.bytes) {
        Some(actual) if actual == declared => Ok(declared),
        Some(actual) => Err(IngestError::UnsupportedType(format!(
            "file content is {} but was declared as {}",
            actual.mime_type(),
            declared.mime_type()
        ))),
        // Some DICOM files omit the preamble; accept them on the extension alone.
        None if declared == ScanFormat::Dicom
            && extension.is_some_and(|ext| ext.eq_ignore_ascii_case("dcm")) =>
        {
            Ok(declared)
        }
        None => Err(IngestError::UnsupportedType(format!(
            "file content is not a valid {}",
            declared.mime_type()
        ))),
    }
}

/// Validates uploads, stores them, and creates the `uploaded` job record.
pub struct Ingestor {
    jobs: Arc<dyn JobStore>,
    storage: Arc<ImageStore>,
    max_upload_bytes: usize,
}

impl Ingestor {
    pub fn new(jobs: Arc<dyn JobStore>, storage: Arc<ImageStore>, max_upload_bytes: usize) -> Self {
        Self {
            jobs,
            storage,
            max_upload_bytes,
        }
    }

    pub fn max_upload_bytes(&self) -> usize {
        self.max_upload_bytes
    }

    /// Nothing is written unless every check passes.
    pub async fn ingest(
        &self,
        owner_id: &str,
        upload: Option<Upload>,
        metadata: SubmitMetadata,
    ) -> Result<AnalysisJob, IngestError> {
        let format = validate_upload(upload.as_ref(), self.max_upload_bytes)?;
        metadata.validate().map_err(IngestError::InvalidMetadata)?;

        let upload = upload.ok_or(IngestError::MissingFile)?;
        let original_filename = upload
            .filename
            .as_deref()
            .map(base_name)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("upload.{}", format.extension()));

        let storage_key = format!("scans/{}.{}", Uuid::new_v4(), format.extension());
        self.storage
            .put(&storage_key, &upload.bytes, format.mime_type())
            .await?;

        let new = NewAnalysisJob {
            owner_id: owner_id.to_string(),
            input: ImageInput {
                storage_key: storage_key.clone(),
                original_filename,
                byte_size: upload.bytes.len() as i64,
                mime_type: format.mime_type().to_string(),
                scan_type: metadata.scan_type,
            },
            notes: metadata.notes.filter(|n| !n.trim().is_empty()),
        };

        let job = match self.jobs.create_job(new).await {
            Ok(job) => job,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete(&storage_key).await {
                    tracing::warn!(storage_key = %storage_key, error = %cleanup, "Failed to remove orphaned upload");
                }
                return Err(e.into());
            }
        };

        if let Err(e) = self.jobs.record_upload(owner_id).await {
            tracing::warn!(owner_id = %owner_id, error = %e, "Failed to update upload counter");
        }

        metrics::counter!("analysis_jobs_submitted_total").increment(1);
        tracing::info!(
            job_id = %job.id,
            owner_id = %owner_id,
            scan_type = %job.input.scan_type,
            byte_size = job.input.byte_size,
            mime_type = %job.input.mime_type,
            "Scan uploaded"
        );

        Ok(job)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("No image file was provided")]
    MissingFile,

    #[error("The uploaded file is empty")]
    EmptyFile,

    #[error("Unsupported file type: {0}")]
    UnsupportedType(String),

    #[error("File too large: {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: usize, max: usize },

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(garde::Report),

    #[error("Failed to store upload: {0}")]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Store(#[from] StoreError),
}
