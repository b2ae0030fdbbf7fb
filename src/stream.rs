//! The per-request pipeline task and its ordered event relay.
//!
//! ## Why a task and a channel?
//!
//! The SSE response body must start before extraction and analysis finish,
//! so the work runs in its own tokio task and hands events to the response
//! through a bounded `mpsc` channel. The channel preserves production order
//! and applies back-pressure when the client reads slowly.
//!
//! ## Guarantees
//!
//! - Report events reach the client in the order the backend produced them.
//! - Every run ends with exactly one terminal event, `complete` or `error`.
//! - The temporary upload is removed on every path: it is released as soon
//!   as extraction returns, and dropped with the task otherwise.
//! - When the client disconnects the task stops at its next suspension
//!   point and drops the in-flight analysis stream.

use crate::analysis::{AnalysisRequest, AnalysisService};
use crate::config::DEFAULT_MAX_CONTENT_CHARS;
use crate::error::PipelineError;
use crate::pipeline::extract::{extract_scoped, StructureExtractor};
use crate::pipeline::upload::{ScopedUpload, ValidatedUpload};
use crate::progress::{NoopObserver, Observer};
use crate::report::{ReportEvent, Stage, StreamEvent};
use futures::StreamExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

/// Capacity of the relay channel between the task and the response body.
pub const EVENT_BUFFER: usize = 32;

/// Collaborators and settings shared by every run.
#[derive(Clone)]
pub struct PipelineContext {
    extractor: Arc<dyn StructureExtractor>,
    analysis: Arc<dyn AnalysisService>,
    observer: Observer,
    upload_dir: Option<PathBuf>,
    max_content_chars: usize,
}

impl std::fmt::Debug for PipelineContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineContext")
            .field("extractor", &"<dyn StructureExtractor>")
            .field("analysis", &"<dyn AnalysisService>")
            .field("upload_dir", &self.upload_dir)
            .field("max_content_chars", &self.max_content_chars)
            .finish()
    }
}

impl PipelineContext {
    pub fn new(extractor: Arc<dyn StructureExtractor>, analysis: Arc<dyn AnalysisService>) -> Self {
        Self {
            extractor,
            analysis,
            observer: Arc::new(NoopObserver),
            upload_dir: None,
            max_content_chars: DEFAULT_MAX_CONTENT_CHARS,
        }
    }

    pub fn observer(mut self, observer: Observer) -> Self {
        self.observer = observer;
        self
    }

    /// Directory for temporary uploads. `None` uses the OS temp dir.
    pub fn upload_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.upload_dir = dir;
        self
    }

    pub fn max_content_chars(mut self, n: usize) -> Self {
        self.max_content_chars = n;
        self
    }
}

/// A running pipeline.
pub struct PipelineHandle {
    /// Events in order; the last one is terminal.
    pub events: ReceiverStream<StreamEvent>,
    /// The producer task. Dropping `events` makes it finish early.
    pub task: JoinHandle<()>,
}

/// Spawn the pipeline for one accepted upload.
pub fn run_pipeline(ctx: PipelineContext, upload: ValidatedUpload) -> PipelineHandle {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let task = tokio::spawn(async move {
        let file_name = upload.file_name.clone();
        tokio::select! {
            _ = tx.closed() => {
                info!(file = %file_name, "Client disconnected; analysis abandoned");
            }
            _ = drive(&ctx, upload, &tx) => {}
        }
    });
    PipelineHandle {
        events: ReceiverStream::new(rx),
        task,
    }
}

async fn drive(ctx: &PipelineContext, upload: ValidatedUpload, tx: &mpsc::Sender<StreamEvent>) {
    let started = Instant::now();
    info!(
        file = %upload.file_name,
        size = upload.bytes.len(),
        check_type = %upload.check_type,
        "Analysis started"
    );

    let terminal = match produce(ctx, upload, tx).await {
        Ok(Some(findings)) => {
            ctx.observer.on_complete(findings, started.elapsed());
            StreamEvent::Complete { findings }
        }
        // The client is gone; nobody is left to tell.
        Ok(None) => return,
        Err(e) => {
            let stage = e.stage();
            let message = e.to_string();
            error!(%stage, error = %message, "Pipeline failed");
            ctx.observer.on_error(stage, &message);
            StreamEvent::Error { stage, message }
        }
    };

    if tx.send(terminal).await.is_err() {
        debug!("Client disconnected before the terminal event");
    }
}

/// Run the stages, relaying report events. Returns the number of findings,
/// or `None` when the client disconnected mid-relay.
async fn produce(
    ctx: &PipelineContext,
    upload: ValidatedUpload,
    tx: &mpsc::Sender<StreamEvent>,
) -> Result<Option<usize>, PipelineError> {
    let check_type = upload.check_type;

    // ── Upload ───────────────────────────────────────────────────────────
    ctx.observer.on_stage_start(Stage::Upload);
    let t = Instant::now();
    let scoped = ScopedUpload::persist_async(upload.bytes, upload.file_name, ctx.upload_dir.clone())
        .await
        .map_err(PipelineError::Upload)?;
    ctx.observer.on_stage_complete(Stage::Upload, t.elapsed());

    // ── Extraction ───────────────────────────────────────────────────────
    ctx.observer.on_stage_start(Stage::Extraction);
    let t = Instant::now();
    let structure = extract_scoped(Arc::clone(&ctx.extractor), scoped).await?;
    ctx.observer.on_stage_complete(Stage::Extraction, t.elapsed());
    debug!(
        pages = structure.page_count,
        headings = structure.headings.len(),
        images = structure.images.len(),
        "Structure ready"
    );

    // ── Analysis ─────────────────────────────────────────────────────────
    ctx.observer.on_stage_start(Stage::Analysis);
    let t = Instant::now();
    let request = AnalysisRequest {
        check_type,
        structure_report: structure.to_prompt_report(ctx.max_content_chars),
    };
    let mut report = ctx.analysis.analyze(request).await?;

    let mut findings = 0usize;
    while let Some(item) = report.next().await {
        let event = item?;
        if let ReportEvent::Finding(_) = event {
            findings += 1;
            ctx.observer.on_finding(findings);
        }
        if tx.send(StreamEvent::from(event)).await.is_err() {
            return Ok(None);
        }
    }
    ctx.observer.on_stage_complete(Stage::Analysis, t.elapsed());

    Ok(Some(findings))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::ReportStream;
    use crate::error::{AnalysisError, ExtractionError};
    use crate::report::{Category, CheckType, Finding, Severity};
    use crate::structure::DocumentStructure;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::path::Path;
    use std::sync::Mutex;

    struct StubExtractor {
        fail: bool,
    }

    impl StructureExtractor for StubExtractor {
        fn extract(&self, _path: &Path, filename: &str) -> Result<DocumentStructure, ExtractionError> {
            if self.fail {
                Err(ExtractionError::NotAPdf {
                    magic: b"hello".to_vec(),
                })
            } else {
                Ok(DocumentStructure::new(filename, 1))
            }
        }
    }

    /// Emits `items`, then hangs forever if `hang` is set.
    struct StubAnalysis {
        items: Mutex<Option<Vec<Result<ReportEvent, AnalysisError>>>>,
        hang: bool,
    }

    impl StubAnalysis {
        fn new(items: Vec<Result<ReportEvent, AnalysisError>>) -> Self {
            Self {
                items: Mutex::new(Some(items)),
                hang: false,
            }
        }
    }

    #[async_trait]
    impl AnalysisService for StubAnalysis {
        async fn analyze(&self, _request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
            let items = self.items.lock().unwrap().take().unwrap_or_default();
            let head = futures::stream::iter(items);
            if self.hang {
                Ok(Box::pin(head.chain(futures::stream::pending())))
            } else {
                Ok(Box::pin(head))
            }
        }
    }

    fn finding(desc: &str) -> ReportEvent {
        ReportEvent::Finding(Finding::new(Category::Accessibility, Severity::Warning, desc))
    }

    fn upload() -> ValidatedUpload {
        ValidatedUpload {
            file_name: "doc.pdf".into(),
            content_type: Some("application/pdf".into()),
            bytes: Bytes::from_static(b"%PDF-1.7"),
            check_type: CheckType::Accessibility,
        }
    }

    async fn run(ctx: PipelineContext) -> Vec<StreamEvent> {
        let handle = run_pipeline(ctx, upload());
        let events: Vec<StreamEvent> = handle.events.collect().await;
        handle.task.await.unwrap();
        events
    }

    #[tokio::test]
    async fn relays_in_order_then_completes() {
        let dir = tempfile::tempdir().unwrap();
        let analysis = StubAnalysis::new(vec![
            Ok(ReportEvent::Summary("overall".into())),
            Ok(finding("one")),
            Ok(finding("two")),
            Ok(ReportEvent::Summary("recommendations".into())),
        ]);
        let ctx = PipelineContext::new(Arc::new(StubExtractor { fail: false }), Arc::new(analysis))
            .upload_dir(Some(dir.path().to_path_buf()));

        let events = run(ctx).await;
        let names: Vec<_> = events.iter().map(StreamEvent::name).collect();
        assert_eq!(names, vec!["summary", "finding", "finding", "summary", "complete"]);
        assert_eq!(events.last(), Some(&StreamEvent::Complete { findings: 2 }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn extraction_failure_is_single_terminal_error() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = PipelineContext::new(
            Arc::new(StubExtractor { fail: true }),
            Arc::new(StubAnalysis::new(vec![Ok(finding("unreachable"))])),
        )
        .upload_dir(Some(dir.path().to_path_buf()));

        let events = run(ctx).await;
        assert_eq!(events.len(), 1);
        assert!(matches!(
            events[0],
            StreamEvent::Error {
                stage: Stage::Extraction,
                ..
            }
        ));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn analysis_error_mid_stream_ends_the_run() {
        let analysis = StubAnalysis::new(vec![
            Ok(finding("one")),
            Err(AnalysisError::Transport("connection reset".into())),
            Ok(finding("never")),
        ]);
        let ctx = PipelineContext::new(Arc::new(StubExtractor { fail: false }), Arc::new(analysis));

        let events = run(ctx).await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].name(), "finding");
        match &events[1] {
            StreamEvent::Error { stage, message } => {
                assert_eq!(*stage, Stage::Analysis);
                assert!(message.contains("connection reset"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
    }

    #[tokio::test]
    async fn unwritable_upload_dir_fails_at_upload_stage() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let ctx = PipelineContext::new(
            Arc::new(StubExtractor { fail: false }),
            Arc::new(StubAnalysis::new(Vec::new())),
        )
        .upload_dir(Some(missing));

        let events = run(ctx).await;
        assert!(matches!(
            events.as_slice(),
            [StreamEvent::Error {
                stage: Stage::Upload,
                ..
            }]
        ));
    }

    #[tokio::test]
    async fn disconnect_stops_the_task_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let analysis = StubAnalysis {
            items: Mutex::new(Some(vec![Ok(finding("first"))])),
            hang: true,
        };
        let ctx = PipelineContext::new(Arc::new(StubExtractor { fail: false }), Arc::new(analysis))
            .upload_dir(Some(dir.path().to_path_buf()));

        let mut handle = run_pipeline(ctx, upload());
        let first = handle.events.next().await.unwrap();
        assert_eq!(first.name(), "finding");

        drop(handle.events);
        tokio::time::timeout(std::time::Duration::from_secs(5), handle.task)
            .await
            .expect("task should stop after disconnect")
            .unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
