//! HTTP-level tests for the analysis API.
//!
//! The router runs in-process through `axum-test` with stub collaborators,
//! so no pdfium library or API key is needed. The disconnect test serves on
//! a loopback port so the client can hang up mid-stream.
//!
//! ```bash
//! cargo test --test api
//! ```

use a11y_check::error::{AnalysisError, ExtractionError};
use a11y_check::structure::{DocumentStructure, ElementKind, ImageInfo};
use a11y_check::{
    router, AnalysisRequest, AnalysisService, AppState, Category, CheckType, Finding, ReportEvent,
    ReportStream, ServerConfig, Severity, StructureExtractor,
};
use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::multipart::{MultipartForm, Part};
use axum_test::TestServer;
use futures::StreamExt;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

// ── Stubs ────────────────────────────────────────────────────────────────────

/// Records each call and whether the upload existed while it was read.
#[derive(Default)]
struct RecordingExtractor {
    fail: bool,
    /// Returned instead of the default document when set.
    document: Option<DocumentStructure>,
    calls: AtomicUsize,
    seen: Mutex<Vec<(PathBuf, bool)>>,
}

impl StructureExtractor for RecordingExtractor {
    fn extract(&self, path: &Path, filename: &str) -> Result<DocumentStructure, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap()
            .push((path.to_path_buf(), path.exists()));
        if self.fail {
            return Err(ExtractionError::Corrupt {
                detail: "xref table missing".into(),
            });
        }
        if let Some(doc) = &self.document {
            return Ok(doc.clone());
        }
        let mut doc = DocumentStructure::new(filename, 3);
        doc.metadata.tagged = true;
        doc.metadata.language = Some("en-US".into());
        Ok(doc)
    }
}

/// Replays a fixed script of report items.
struct ScriptedAnalysis {
    script: Vec<Result<ReportEvent, AnalysisError>>,
    calls: AtomicUsize,
    requests: Mutex<Vec<AnalysisRequest>>,
}

impl ScriptedAnalysis {
    fn new(script: Vec<Result<ReportEvent, AnalysisError>>) -> Self {
        Self {
            script,
            calls: AtomicUsize::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl AnalysisService for ScriptedAnalysis {
    async fn analyze(&self, request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);
        Ok(Box::pin(futures::stream::iter(self.script.clone())))
    }
}

/// Reports one critical finding per image the structure report flags as
/// lacking alt text.
#[derive(Default)]
struct AltTextReviewer {
    reports: Mutex<Vec<String>>,
}

#[async_trait]
impl AnalysisService for AltTextReviewer {
    async fn analyze(&self, request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
        let events: Vec<Result<ReportEvent, AnalysisError>> = request
            .structure_report
            .lines()
            .filter(|l| l.starts_with("- Image ") && l.contains("NO CAPTION/ALT TEXT DETECTED"))
            .map(|l| {
                let label = l.trim_start_matches("- ").split(':').next().unwrap_or("Image");
                Ok(ReportEvent::Finding(Finding::new(
                    Category::Accessibility,
                    Severity::Critical,
                    format!("{label} is missing alt text"),
                )))
            })
            .collect();
        self.reports.lock().unwrap().push(request.structure_report);
        Ok(Box::pin(futures::stream::iter(events)))
    }
}

/// Sets its flag when dropped.
struct DropFlag(Arc<AtomicBool>);

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Emits one finding, then never finishes.
struct StalledAnalysis {
    dropped: Arc<AtomicBool>,
}

#[async_trait]
impl AnalysisService for StalledAnalysis {
    async fn analyze(&self, _request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
        let guard = DropFlag(self.dropped.clone());
        let first = futures::stream::iter(vec![Ok::<_, AnalysisError>(finding(
            Severity::Warning,
            "first of many",
        ))]);
        let stream = first
            .chain(futures::stream::pending())
            .map(move |item| {
                let _alive = &guard;
                item
            });
        Ok(Box::pin(stream))
    }
}

// ── Harness ──────────────────────────────────────────────────────────────────

struct TestApp {
    server: TestServer,
    extractor: Arc<RecordingExtractor>,
    analysis: Arc<ScriptedAnalysis>,
    upload_dir: TempDir,
}

impl TestApp {
    fn new(extractor: RecordingExtractor, analysis: ScriptedAnalysis) -> Self {
        Self::with_limit(extractor, analysis, a11y_check::config::DEFAULT_MAX_UPLOAD_BYTES)
    }

    fn with_limit(extractor: RecordingExtractor, analysis: ScriptedAnalysis, max_upload_bytes: u64) -> Self {
        init_tracing();
        let upload_dir = tempfile::tempdir().expect("tempdir");
        let config = test_config(upload_dir.path(), max_upload_bytes);
        let extractor = Arc::new(extractor);
        let analysis = Arc::new(analysis);
        let state = AppState::new(config, extractor.clone(), analysis.clone());
        let server =
            TestServer::new(router(state).into_make_service()).expect("Failed to create test server");
        Self {
            server,
            extractor,
            analysis,
            upload_dir,
        }
    }

    fn leftover_uploads(&self) -> usize {
        count_files(self.upload_dir.path())
    }
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("a11y_check=debug")
        .with_test_writer()
        .try_init();
}

fn test_config(upload_dir: &Path, max_upload_bytes: u64) -> ServerConfig {
    ServerConfig::builder()
        .api_key("test-key")
        .upload_dir(upload_dir)
        .max_upload_bytes(max_upload_bytes)
        .build()
        .expect("valid config")
}

fn count_files(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

/// Serve the router on an ephemeral port for tests that need a real socket.
async fn spawn_http(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind test listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.expect("test server");
    });
    addr
}

/// Hand-built multipart body with one PDF `file` field.
fn raw_multipart(boundary: &str, check_type: &str) -> Vec<u8> {
    format!(
        "--{boundary}\r\n\
Content-Disposition: form-data; name=\"check_type\"\r\n\r\n\
{check_type}\r\n\
--{boundary}\r\n\
Content-Disposition: form-data; name=\"file\"; filename=\"thesis.pdf\"\r\n\
Content-Type: application/pdf\r\n\r\n\
%PDF-1.7\n%fake body\n\r\n\
--{boundary}--\r\n"
    )
    .into_bytes()
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    let waited = tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(waited.is_ok(), "timed out waiting for {what}");
}

fn pdf_form(check_type: &str) -> MultipartForm {
    let part = Part::bytes(b"%PDF-1.7\n%fake body\n".to_vec())
        .file_name("thesis.pdf")
        .mime_type("application/pdf");
    MultipartForm::new()
        .add_part("file", part)
        .add_text("check_type", check_type)
}

fn finding(severity: Severity, desc: &str) -> ReportEvent {
    ReportEvent::Finding(Finding::new(Category::Accessibility, severity, desc).with_page(2))
}

/// Split an SSE body into `(event name, JSON payload)` pairs.
fn parse_sse(body: &str) -> Vec<(String, serde_json::Value)> {
    let mut out = Vec::new();
    for block in body.split("\n\n") {
        let mut name = None;
        let mut data = String::new();
        for line in block.lines() {
            if let Some(v) = line.strip_prefix("event:") {
                name = Some(v.trim().to_string());
            } else if let Some(v) = line.strip_prefix("data:") {
                data.push_str(v.trim_start());
            }
        }
        if let Some(name) = name {
            let json = serde_json::from_str(&data).expect("event data is JSON");
            out.push((name, json));
        }
    }
    out
}

fn names(events: &[(String, serde_json::Value)]) -> Vec<&str> {
    events.iter().map(|(n, _)| n.as_str()).collect()
}

// ── Fixed endpoints ──────────────────────────────────────────────────────────

#[tokio::test]
async fn health_returns_fixed_body_without_touching_collaborators() {
    let app = TestApp::new(RecordingExtractor::default(), ScriptedAnalysis::new(vec![]));

    let resp = app.server.get("/health").await;
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.json::<serde_json::Value>(), serde_json::json!({"status": "healthy"}));

    let resp = app.server.get("/").await;
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert_eq!(resp.json::<serde_json::Value>()["status"], "ok");

    assert_eq!(app.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.analysis.calls.load(Ordering::SeqCst), 0);
}

// ── Streaming outcomes ───────────────────────────────────────────────────────

#[tokio::test]
async fn single_finding_then_complete() {
    let app = TestApp::new(
        RecordingExtractor::default(),
        ScriptedAnalysis::new(vec![Ok(finding(Severity::Critical, "Figure 1 has no alt text"))]),
    );

    let resp = app.server.post("/analyze").multipart(pdf_form("accessibility")).await;
    assert_eq!(resp.status_code(), StatusCode::OK);
    assert!(resp
        .header("content-type")
        .to_str()
        .unwrap()
        .starts_with("text/event-stream"));

    let events = parse_sse(&resp.text());
    assert_eq!(names(&events), vec!["finding", "complete"]);
    assert_eq!(events[0].1["severity"], "critical");
    assert_eq!(events[0].1["page"], 2);
    assert_eq!(events[1].1["findings"], 1);

    // The upload existed while it was extracted and is gone now.
    let seen = app.extractor.seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].1, "upload should exist during extraction");
    assert!(!seen[0].0.exists());
    assert_eq!(app.leftover_uploads(), 0);

    let requests = app.analysis.requests.lock().unwrap();
    assert_eq!(requests[0].check_type, CheckType::Accessibility);
    assert!(requests[0].structure_report.contains("thesis.pdf"));
}

#[tokio::test]
async fn events_keep_production_order() {
    let app = TestApp::new(
        RecordingExtractor::default(),
        ScriptedAnalysis::new(vec![
            Ok(ReportEvent::Summary("Mostly accessible.".into())),
            Ok(finding(Severity::Warning, "first")),
            Ok(finding(Severity::Suggestion, "second")),
            Ok(finding(Severity::Critical, "third")),
        ]),
    );

    let resp = app.server.post("/analyze").multipart(pdf_form("both")).await;
    let events = parse_sse(&resp.text());

    assert_eq!(
        names(&events),
        vec!["summary", "finding", "finding", "finding", "complete"]
    );
    let descriptions: Vec<&str> = events[1..4]
        .iter()
        .map(|(_, v)| v["description"].as_str().unwrap())
        .collect();
    assert_eq!(descriptions, vec!["first", "second", "third"]);
    assert_eq!(events[4].1["findings"], 3);
}

#[tokio::test]
async fn extracted_structure_reaches_the_analysis() {
    init_tracing();
    let upload_dir = tempfile::tempdir().unwrap();

    let mut doc = DocumentStructure::new("thesis.pdf", 1);
    doc.metadata.tagged = true;
    doc.push_heading(ElementKind::Heading, "Introduction", 1, Some(1));
    doc.push_image(ImageInfo {
        page: Some(1),
        has_alt_text: false,
        alt_text: None,
    });
    let extractor = Arc::new(RecordingExtractor {
        document: Some(doc),
        ..Default::default()
    });
    let reviewer = Arc::new(AltTextReviewer::default());
    let state = AppState::new(
        test_config(upload_dir.path(), a11y_check::config::DEFAULT_MAX_UPLOAD_BYTES),
        extractor,
        reviewer.clone(),
    );
    let server = TestServer::new(router(state).into_make_service()).unwrap();

    let resp = server.post("/analyze").multipart(pdf_form("accessibility")).await;
    let events = parse_sse(&resp.text());

    assert_eq!(names(&events), vec!["finding", "complete"]);
    assert_eq!(events[0].1["category"], "accessibility");
    assert_eq!(events[0].1["description"], "Image 1 is missing alt text");

    let reports = reviewer.reports.lock().unwrap();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].contains("(level 1): \"Introduction\" (page 1)"));
    assert!(reports[0].contains("- Image 1: NO CAPTION/ALT TEXT DETECTED (page 1)"));
    assert_eq!(count_files(upload_dir.path()), 0);
}

#[tokio::test]
async fn extraction_failure_is_single_error_event() {
    let app = TestApp::new(
        RecordingExtractor {
            fail: true,
            ..Default::default()
        },
        ScriptedAnalysis::new(vec![Ok(finding(Severity::Warning, "never sent"))]),
    );

    let resp = app.server.post("/analyze").multipart(pdf_form("formatting")).await;
    assert_eq!(resp.status_code(), StatusCode::OK);

    let events = parse_sse(&resp.text());
    assert_eq!(names(&events), vec!["error"]);
    assert_eq!(events[0].1["stage"], "extraction");
    assert!(events[0].1["message"].as_str().unwrap().contains("corrupt"));

    assert_eq!(app.analysis.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.leftover_uploads(), 0);
}

#[tokio::test]
async fn analysis_failure_after_findings_ends_with_error_only() {
    let app = TestApp::new(
        RecordingExtractor::default(),
        ScriptedAnalysis::new(vec![
            Ok(finding(Severity::Warning, "kept")),
            Err(AnalysisError::Api {
                status: None,
                message: "overloaded".into(),
            }),
        ]),
    );

    let resp = app.server.post("/analyze").multipart(pdf_form("both")).await;
    let events = parse_sse(&resp.text());

    assert_eq!(names(&events), vec!["finding", "error"]);
    assert_eq!(events[1].1["stage"], "analysis");
    assert!(events[1].1["message"].as_str().unwrap().contains("overloaded"));
    assert_eq!(app.leftover_uploads(), 0);
}

// ── Rejections ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_file_is_rejected_before_any_work() {
    let app = TestApp::new(RecordingExtractor::default(), ScriptedAnalysis::new(vec![]));

    let form = MultipartForm::new().add_text("check_type", "both");
    let resp = app.server.post("/analyze").multipart(form).await;

    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<serde_json::Value>()["code"], "missing_file");
    assert_eq!(app.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.analysis.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.leftover_uploads(), 0);
}

#[tokio::test]
async fn oversized_file_is_rejected() {
    let app = TestApp::with_limit(
        RecordingExtractor::default(),
        ScriptedAnalysis::new(vec![]),
        1024,
    );

    let mut body = b"%PDF-1.7\n".to_vec();
    body.resize(4096, b'x');
    let part = Part::bytes(body)
        .file_name("big.pdf")
        .mime_type("application/pdf");
    let form = MultipartForm::new().add_part("file", part);
    let resp = app.server.post("/analyze").multipart(form).await;

    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<serde_json::Value>()["code"], "file_too_large");
    assert_eq!(app.extractor.calls.load(Ordering::SeqCst), 0);
    assert_eq!(app.leftover_uploads(), 0);
}

#[tokio::test]
async fn unknown_check_type_is_rejected() {
    let app = TestApp::new(RecordingExtractor::default(), ScriptedAnalysis::new(vec![]));

    let resp = app.server.post("/analyze").multipart(pdf_form("spelling")).await;

    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<serde_json::Value>()["code"], "invalid_check_type");
    assert_eq!(app.extractor.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn non_pdf_name_is_rejected() {
    let app = TestApp::new(RecordingExtractor::default(), ScriptedAnalysis::new(vec![]));

    let part = Part::bytes(b"plain text".to_vec())
        .file_name("notes.txt")
        .mime_type("text/plain");
    let form = MultipartForm::new().add_part("file", part);
    let resp = app.server.post("/analyze").multipart(form).await;

    assert_eq!(resp.status_code(), StatusCode::BAD_REQUEST);
    assert_eq!(resp.json::<serde_json::Value>()["code"], "unsupported_file_type");
    assert_eq!(app.leftover_uploads(), 0);
}

// ── Disconnects ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn client_disconnect_stops_analysis_and_frees_upload() {
    init_tracing();
    let upload_dir = tempfile::tempdir().unwrap();
    let dropped = Arc::new(AtomicBool::new(false));
    let state = AppState::new(
        test_config(upload_dir.path(), a11y_check::config::DEFAULT_MAX_UPLOAD_BYTES),
        Arc::new(RecordingExtractor::default()),
        Arc::new(StalledAnalysis {
            dropped: dropped.clone(),
        }),
    );
    let addr = spawn_http(state).await;

    let boundary = "a11y-test-boundary";
    let mut resp = reqwest::Client::new()
        .post(format!("http://{addr}/analyze"))
        .header(
            "content-type",
            format!("multipart/form-data; boundary={boundary}"),
        )
        .body(raw_multipart(boundary, "accessibility"))
        .send()
        .await
        .expect("request sent");
    assert_eq!(resp.status().as_u16(), 200);

    // Read until the first finding arrives, then hang up.
    let mut seen = String::new();
    while !seen.contains("first of many") {
        let chunk = resp
            .chunk()
            .await
            .expect("body chunk")
            .expect("stream ended before the first finding");
        seen.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(!dropped.load(Ordering::SeqCst));
    drop(resp);

    wait_until("analysis stream to be dropped", || dropped.load(Ordering::SeqCst)).await;
    let dir = upload_dir.path().to_path_buf();
    wait_until("upload dir to empty", || count_files(&dir) == 0).await;
}
