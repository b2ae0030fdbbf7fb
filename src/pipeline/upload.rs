//! Upload intake: multipart validation and the scoped temporary file.
//!
//! Validation happens entirely in memory. No file touches the disk until
//! [`read_upload`] has accepted the request, so every rejection is free of
//! cleanup. Once accepted, the bytes are written to a [`ScopedUpload`] whose
//! file is deleted when the guard is dropped, whichever way the request ends.

use crate::error::UploadError;
use crate::report::CheckType;
use axum::extract::multipart::{Field, Multipart, MultipartError};
use axum::http::StatusCode;
use bytes::{Bytes, BytesMut};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

/// Declared content types accepted for the `file` field.
///
/// Browsers and HTTP clients disagree on what to send for a PDF; the
/// extractor verifies the `%PDF` signature regardless.
pub const ACCEPTED_CONTENT_TYPES: [&str; 3] =
    ["application/pdf", "application/x-pdf", "application/octet-stream"];

/// A multipart upload that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedUpload {
    pub file_name: String,
    pub content_type: Option<String>,
    pub bytes: Bytes,
    pub check_type: CheckType,
}

/// Read and validate the `file` and `check_type` fields.
///
/// The file size is enforced chunk by chunk, so an oversized upload is
/// rejected as soon as it crosses `max_bytes`. Unknown fields are ignored.
pub async fn read_upload(
    multipart: &mut Multipart,
    max_bytes: u64,
) -> Result<ValidatedUpload, UploadError> {
    let mut file: Option<(String, Option<String>, Bytes)> = None;
    let mut check_type: Option<CheckType> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| map_multipart_error(e, max_bytes))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("file") => {
                if file.is_some() {
                    return Err(UploadError::InvalidMultipart(
                        "more than one 'file' field".into(),
                    ));
                }
                let file_name = validate_file_meta(field.file_name(), field.content_type())?;
                let content_type = field.content_type().map(str::to_string);
                let bytes = read_limited(field, max_bytes).await?;
                debug!(file_name = %file_name, size = bytes.len(), "Received upload");
                file = Some((file_name, content_type, bytes));
            }
            Some("check_type") => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| map_multipart_error(e, max_bytes))?;
                check_type = Some(raw.parse()?);
            }
            other => {
                debug!(field = ?other, "Ignoring unknown multipart field");
            }
        }
    }

    let (file_name, content_type, bytes) = file.ok_or(UploadError::MissingFile)?;
    Ok(ValidatedUpload {
        file_name,
        content_type,
        bytes,
        check_type: check_type.unwrap_or_default(),
    })
}

/// Check the declared file name and content type of the `file` field.
///
/// Returns the file name on success.
pub fn validate_file_meta(
    file_name: Option<&str>,
    content_type: Option<&str>,
) -> Result<String, UploadError> {
    let reject = || UploadError::UnsupportedFileType {
        file_name: file_name.map(str::to_string),
        content_type: content_type.map(str::to_string),
    };

    let name = file_name.map(str::trim).filter(|n| !n.is_empty()).ok_or_else(reject)?;
    if !name.to_ascii_lowercase().ends_with(".pdf") {
        return Err(reject());
    }

    if let Some(ct) = content_type {
        // Ignore parameters such as `; charset=binary`.
        let essence = ct.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        if !ACCEPTED_CONTENT_TYPES.contains(&essence.as_str()) {
            return Err(reject());
        }
    }

    Ok(name.to_string())
}

async fn read_limited(mut field: Field<'_>, max_bytes: u64) -> Result<Bytes, UploadError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| map_multipart_error(e, max_bytes))?
    {
        if (buf.len() + chunk.len()) as u64 > max_bytes {
            return Err(UploadError::FileTooLarge { max_bytes });
        }
        buf.extend_from_slice(&chunk);
    }
    Ok(buf.freeze())
}

fn map_multipart_error(err: MultipartError, max_bytes: u64) -> UploadError {
    if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
        UploadError::FileTooLarge { max_bytes }
    } else {
        UploadError::InvalidMultipart(err.body_text())
    }
}

// ── Scoped temporary file ────────────────────────────────────────────────

/// An upload persisted to disk for the extractor.
///
/// The file is named `a11y-*.pdf` and removed when the guard drops.
#[derive(Debug)]
pub struct ScopedUpload {
    file: NamedTempFile,
    original_name: String,
}

impl ScopedUpload {
    /// Write `bytes` to a new temporary file in `dir` (or the OS temp dir).
    ///
    /// Blocking; call from `spawn_blocking` in async contexts.
    pub fn persist(bytes: &[u8], original_name: &str, dir: Option<&Path>) -> std::io::Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("a11y-").suffix(".pdf");
        let mut file = match dir {
            Some(d) => builder.tempfile_in(d)?,
            None => builder.tempfile()?,
        };
        file.write_all(bytes)?;
        file.flush()?;
        debug!(path = %file.path().display(), size = bytes.len(), "Upload persisted");
        Ok(Self {
            file,
            original_name: original_name.to_string(),
        })
    }

    /// Async wrapper around [`Self::persist`].
    pub async fn persist_async(
        bytes: Bytes,
        original_name: String,
        dir: Option<PathBuf>,
    ) -> std::io::Result<Self> {
        tokio::task::spawn_blocking(move || Self::persist(&bytes, &original_name, dir.as_deref()))
            .await
            .map_err(std::io::Error::other)?
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// File name the client sent, e.g. `thesis.pdf`.
    pub fn original_name(&self) -> &str {
        &self.original_name
    }

    /// Delete the file now, reporting failures instead of swallowing them.
    pub fn release(self) {
        let path = self.file.path().to_path_buf();
        match self.file.close() {
            Ok(()) => debug!(path = %path.display(), "Upload released"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove upload"),
        }
    }
}
