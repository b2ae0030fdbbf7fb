//! Error types for the a11y-check service.
//!
//! Failures are split by *when* they can happen, because that decides how the
//! client learns about them:
//!
//! * [`UploadError`]: **Synchronous**: the request is rejected with HTTP 400
//!   and a JSON body before any temporary file exists.
//!
//! * [`PipelineError`]: **In-stream**: the request was accepted and the SSE
//!   response has started, so the failure is delivered as the single terminal
//!   `error` event. It wraps the stage-specific [`ExtractionError`] and
//!   [`AnalysisError`].
//!
//! * [`A11yError`]: **Startup**: bad configuration or an analysis backend
//!   that cannot be constructed. Only the binary and embedders see these.
//!
//! No error is retried and none of them outlives its request.

use crate::report::Stage;
use thiserror::Error;

/// Startup-time errors.
#[derive(Debug, Error)]
pub enum A11yError {
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The analysis backend could not be constructed.
    #[error(transparent)]
    Analysis(#[from] AnalysisError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Request validation ───────────────────────────────────────────────────

/// Rejections of the multipart upload itself.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("No file was attached. Send the PDF in a multipart field named 'file'.")]
    MissingFile,

    #[error("File too large. Maximum size is {}.", size_limit(.max_bytes))]
    FileTooLarge { max_bytes: u64 },

    #[error("Only PDF files are supported. Please upload a .pdf file.")]
    UnsupportedFileType {
        file_name: Option<String>,
        content_type: Option<String>,
    },

    #[error("Invalid check_type '{value}'. Expected one of: accessibility, formatting, both.")]
    InvalidCheckType { value: String },

    #[error("Malformed multipart request: {0}")]
    InvalidMultipart(String),
}

/// `25MB`, rounded up; limits under 1 MB are shown in bytes.
fn size_limit(max_bytes: &u64) -> String {
    const MB: u64 = 1024 * 1024;
    let max_bytes = *max_bytes;
    if max_bytes < MB {
        format!("{max_bytes} bytes")
    } else {
        format!("{}MB", max_bytes.div_ceil(MB))
    }
}

impl UploadError {
    /// Stable machine-readable code for the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            UploadError::MissingFile => "missing_file",
            UploadError::FileTooLarge { .. } => "file_too_large",
            UploadError::UnsupportedFileType { .. } => "unsupported_file_type",
            UploadError::InvalidCheckType { .. } => "invalid_check_type",
            UploadError::InvalidMultipart(_) => "invalid_multipart",
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────

/// Structure extraction failed; the document cannot be analysed.
#[derive(Debug, Error)]
pub enum ExtractionError {
    /// The upload does not start with the `%PDF` signature.
    #[error("The uploaded file is not a valid PDF (first bytes: {magic:?})")]
    NotAPdf { magic: Vec<u8> },

    /// Header, trailer or cross-reference table cannot be parsed.
    #[error("The PDF is corrupt and cannot be read: {detail}")]
    Corrupt { detail: String },

    /// Encrypted documents are not analysed.
    #[error("The PDF is password-protected. Remove the password and upload it again.")]
    PasswordRequired,

    /// pdfium could not be bound or downloaded.
    #[error(
        "PDF engine unavailable: {0}\n\
Set PDFIUM_LIB_PATH=/path/to/libpdfium to use an existing copy."
    )]
    EngineUnavailable(String),

    #[error("Failed to read the uploaded file: {0}")]
    Io(#[from] std::io::Error),

    /// The blocking extraction task panicked or was cancelled.
    #[error("Internal extraction error: {0}")]
    Internal(String),
}

// ── Analysis ─────────────────────────────────────────────────────────────

/// The analysis service failed before or while streaming its report.
#[derive(Debug, Clone, Error)]
pub enum AnalysisError {
    /// Missing API key, unknown provider name, etc.
    #[error("Analysis provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    /// HTTP 401/403 from the provider.
    #[error("Authentication error from provider '{provider}': {detail}")]
    Auth { provider: String, detail: String },

    /// HTTP 429 from the provider.
    #[error("Rate limit exceeded for provider '{provider}'")]
    RateLimited {
        provider: String,
        retry_after_secs: Option<u64>,
    },

    /// Any other API-level failure, including in-stream `error` frames.
    #[error("Analysis API error{}: {message}", .status.map(|s| format!(" (HTTP {s})")).unwrap_or_default())]
    Api { status: Option<u16>, message: String },

    /// Connection reset, DNS failure, TLS error, ...
    #[error("Network error talking to the analysis service: {0}")]
    Transport(String),

    /// The response stream could not be decoded.
    #[error("Malformed response from the analysis service: {0}")]
    MalformedStream(String),

    #[error("Analysis timed out after {secs}s")]
    Timeout { secs: u64 },
}

// ── Pipeline ─────────────────────────────────────────────────────────────

/// A failure after the SSE response has started.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The upload could not be persisted to a temporary file.
    #[error("Failed to store the upload: {0}")]
    Upload(#[source] std::io::Error),

    #[error(transparent)]
    Extraction(#[from] ExtractionError),

    #[error(transparent)]
    Analysis(#[from] AnalysisError),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Upload(_) => Stage::Upload,
            PipelineError::Extraction(_) => Stage::Extraction,
            PipelineError::Analysis(_) => Stage::Analysis,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_too_large_reports_megabytes() {
        let e = UploadError::FileTooLarge {
            max_bytes: 25 * 1024 * 1024,
        };
        assert_eq!(e.to_string(), "File too large. Maximum size is 25MB.");
        assert_eq!(e.code(), "file_too_large");
    }

    #[test]
    fn file_too_large_small_limits() {
        let e = UploadError::FileTooLarge { max_bytes: 1024 };
        assert_eq!(e.to_string(), "File too large. Maximum size is 1024 bytes.");

        let e = UploadError::FileTooLarge {
            max_bytes: 3 * 1024 * 1024 / 2,
        };
        assert_eq!(e.to_string(), "File too large. Maximum size is 2MB.");
    }

    #[test]
    fn unsupported_type_message() {
        let e = UploadError::UnsupportedFileType {
            file_name: Some("notes.docx".into()),
            content_type: None,
        };
        assert!(e.to_string().contains("Only PDF files are supported"));
    }

    #[test]
    fn api_error_display_with_status() {
        let e = AnalysisError::Api {
            status: Some(529),
            message: "overloaded".into(),
        };
        assert_eq!(e.to_string(), "Analysis API error (HTTP 529): overloaded");
    }

    #[test]
    fn api_error_display_without_status() {
        let e = AnalysisError::Api {
            status: None,
            message: "stream interrupted".into(),
        };
        assert_eq!(e.to_string(), "Analysis API error: stream interrupted");
    }

    #[test]
    fn rate_limit_display() {
        let e = AnalysisError::RateLimited {
            provider: "anthropic".into(),
            retry_after_secs: Some(30),
        };
        assert!(e.to_string().contains("anthropic"));
    }

    #[test]
    fn pipeline_error_stage() {
        let e: PipelineError = ExtractionError::PasswordRequired.into();
        assert_eq!(e.stage(), Stage::Extraction);
        assert!(e.to_string().contains("password-protected"));

        let e: PipelineError = AnalysisError::Timeout { secs: 300 }.into();
        assert_eq!(e.stage(), Stage::Analysis);

        let e = PipelineError::Upload(std::io::Error::other("disk full"));
        assert_eq!(e.stage(), Stage::Upload);
    }
}
