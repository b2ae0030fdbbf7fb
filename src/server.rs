//! HTTP surface: axum router, shared state and handlers.
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /` | `{"status":"ok","message":"A11y Check API is running"}` |
//! | `GET /health` | `{"status":"healthy"}` |
//! | `POST /analyze` | `text/event-stream` of [`StreamEvent`]s, or 400 + JSON error |
//!
//! Upload validation happens before the response starts, so a rejected
//! request gets an ordinary status code. Once accepted, every outcome,
//! failures included, is an SSE event.

use crate::analysis::{self, AnalysisService};
use crate::config::ServerConfig;
use crate::error::{A11yError, UploadError};
use crate::pipeline::extract::{PdfiumExtractor, StructureExtractor};
use crate::pipeline::upload::read_upload;
use crate::progress::TracingObserver;
use crate::report::StreamEvent;
use crate::stream::{run_pipeline, PipelineContext};
use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, State};
use axum::http::{header, HeaderValue, Method, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Serialize;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Multipart framing allowance on top of the file ceiling.
const MULTIPART_OVERHEAD_BYTES: u64 = 1024 * 1024;

// ── State ────────────────────────────────────────────────────────────────

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: ServerConfig,
    pipeline: PipelineContext,
}

impl AppState {
    /// Build state around explicit collaborators.
    pub fn new(
        config: ServerConfig,
        extractor: Arc<dyn StructureExtractor>,
        analysis: Arc<dyn AnalysisService>,
    ) -> Self {
        let pipeline = PipelineContext::new(extractor, analysis)
            .observer(Arc::new(TracingObserver))
            .upload_dir(config.upload_dir.clone())
            .max_content_chars(config.max_content_chars);
        Self {
            inner: Arc::new(AppStateInner { config, pipeline }),
        }
    }

    /// Build state with the pdfium extractor and the configured backend.
    pub fn from_config(config: ServerConfig) -> Result<Self, A11yError> {
        let extractor = Arc::new(PdfiumExtractor::new(config.pdfium_lib_path.clone()));
        let analysis = analysis::from_config(&config)?;
        Ok(Self::new(config, extractor, analysis))
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn pipeline(&self) -> &PipelineContext {
        &self.inner.pipeline
    }
}

// ── Router ───────────────────────────────────────────────────────────────

/// Build the application router.
pub fn router(state: AppState) -> Router {
    let body_limit = state
        .config()
        .max_upload_bytes
        .saturating_add(MULTIPART_OVERHEAD_BYTES);
    let cors = cors_layer(&state.config().allowed_origins);

    Router::new()
        .route("/", get(root))
        .route("/health", get(health_check))
        .route("/analyze", post(analyze))
        .layer(DefaultBodyLimit::max(usize::try_from(body_limit).unwrap_or(usize::MAX)))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let origins: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(e) => {
                warn!(origin = %o, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
}

// ── Handlers ─────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct RootResponse {
    status: &'static str,
    message: &'static str,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

async fn root() -> Json<RootResponse> {
    Json(RootResponse {
        status: "ok",
        message: "A11y Check API is running",
    })
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse { status: "healthy" })
}

async fn analyze(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, UploadError> {
    let mut multipart = multipart.map_err(|e| UploadError::InvalidMultipart(e.to_string()))?;
    let upload = read_upload(&mut multipart, state.config().max_upload_bytes)
        .await
        .map_err(|e| {
            warn!(code = e.code(), error = %e, "Upload rejected");
            e
        })?;

    info!(
        file = %upload.file_name,
        size = upload.bytes.len(),
        check_type = %upload.check_type,
        "Upload accepted"
    );

    // The task is detached; it stops by itself once the body is dropped.
    let handle = run_pipeline(state.pipeline().clone(), upload);
    let events = handle.events.map(|event| Ok(to_sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// `event: <type>` plus the JSON payload, which repeats the type as a tag.
pub fn to_sse_event(event: &StreamEvent) -> Event {
    match Event::default().event(event.name()).json_data(event) {
        Ok(sse) => sse,
        Err(e) => {
            error!(error = %e, "Failed to serialize stream event");
            Event::default().comment("unserializable event dropped")
        }
    }
}

// ── Error responses ──────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    code: &'static str,
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.to_string(),
            code: self.code(),
        });
        (StatusCode::BAD_REQUEST, body).into_response()
    }
}
