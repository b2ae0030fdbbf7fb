//! # a11y-check
//!
//! Review dissertation PDFs for WCAG 2.1 accessibility and for institutional
//! formatting rules, streaming the findings to the browser as they are found.
//!
//! ## Why structure first?
//!
//! A model reading page images sees what a sighted reader sees, which is
//! exactly what an accessibility review must look past. Screen readers
//! consume the tag tree, the `/Alt` text and the document language. This
//! crate extracts those facts (plus the visual layout for untagged files)
//! into a Markdown report and asks the model to judge *that*, so "this
//! figure has no alt text" is a fact from the file rather than a guess.
//!
//! ## Pipeline Overview
//!
//! ```text
//! multipart upload
//!  │
//!  ├─ 1. Validate  file field, .pdf name, content type, size, check_type
//!  ├─ 2. Persist   scoped temp file a11y-*.pdf (removed on every path)
//!  ├─ 3. Extract   pdfium layout + lopdf tag tree (spawn_blocking)
//!  ├─ 4. Report    DocumentStructure → Markdown prompt report
//!  ├─ 5. Analyze   Anthropic (streaming) or any edgequake-llm provider
//!  └─ 6. Relay     JSON-lines → finding/summary SSE events → complete|error
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a11y_check::{router, AppState, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Reads .env, then HOST, PORT, ANTHROPIC_API_KEY, ...
//!     let config = ServerConfig::builder_from_env()?.build()?;
//!     let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
//!     let app = router(AppState::from_config(config)?);
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `a11y-check` binary (clap + anyhow + indicatif + tracing-subscriber) |
//!
//! Disable `cli` when embedding only the library:
//! ```toml
//! a11y-check = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod analysis;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod report;
pub mod server;
pub mod stream;
pub mod structure;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use analysis::{AnalysisRequest, AnalysisService, ReportStream};
pub use config::{AnalysisConfig, ServerConfig, ServerConfigBuilder};
pub use error::{A11yError, AnalysisError, ExtractionError, PipelineError, UploadError};
pub use pipeline::extract::{PdfiumExtractor, StructureExtractor};
pub use pipeline::upload::{ScopedUpload, ValidatedUpload};
pub use progress::{NoopObserver, PipelineObserver, TracingObserver};
pub use report::{Category, CheckType, Finding, ReportEvent, Severity, Stage, StreamEvent};
pub use server::{router, AppState};
pub use stream::{run_pipeline, PipelineContext, PipelineHandle};
pub use structure::DocumentStructure;
