//! Observer trait for pipeline stage events.
//!
//! The SSE relay in [`crate::stream`] reports every stage transition to an
//! [`Arc<dyn PipelineObserver>`]. The server uses [`TracingObserver`]; the
//! CLI `check` command drives a terminal spinner from the same events.
//!
//! # Why callbacks instead of reading the event stream?
//!
//! The event stream only carries what the client is allowed to see.
//! Stage starts and timings are operational detail: an observer receives
//! them without widening the wire format.
//!
//! # Example
//!
//! ```rust
//! use a11y_check::{PipelineObserver, Stage};
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct CountingObserver {
//!     findings: AtomicUsize,
//! }
//!
//! impl PipelineObserver for CountingObserver {
//!     fn on_finding(&self, _index: usize) {
//!         self.findings.fetch_add(1, Ordering::SeqCst);
//!     }
//! }
//!
//! let obs = CountingObserver { findings: AtomicUsize::new(0) };
//! obs.on_stage_start(Stage::Analysis);
//! obs.on_finding(1);
//! assert_eq!(obs.findings.load(Ordering::SeqCst), 1);
//! ```

use crate::report::Stage;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Called by the pipeline as one upload moves through its stages.
///
/// All methods default to no-ops so implementations override only what
/// they need. Calls for one upload are sequential; calls for different
/// uploads may be concurrent.
pub trait PipelineObserver: Send + Sync {
    /// A stage is about to run.
    fn on_stage_start(&self, stage: Stage) {
        let _ = stage;
    }

    /// A stage finished successfully.
    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        let _ = (stage, elapsed);
    }

    /// A finding was relayed to the client.
    ///
    /// # Arguments
    /// * `index`: 1-based position of the finding in the report
    fn on_finding(&self, index: usize) {
        let _ = index;
    }

    /// The run ended with a `complete` event.
    fn on_complete(&self, findings: usize, elapsed: Duration) {
        let _ = (findings, elapsed);
    }

    /// The run ended with an `error` event.
    fn on_error(&self, stage: Stage, message: &str) {
        let _ = (stage, message);
    }
}

/// Ignores every event.
pub struct NoopObserver;

impl PipelineObserver for NoopObserver {}

/// Logs stage transitions through `tracing`.
pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_stage_complete(&self, stage: Stage, elapsed: Duration) {
        info!(%stage, elapsed_ms = elapsed.as_millis() as u64, "Stage complete");
    }

    fn on_complete(&self, findings: usize, elapsed: Duration) {
        info!(findings, elapsed_ms = elapsed.as_millis() as u64, "Analysis complete");
    }

    fn on_error(&self, stage: Stage, message: &str) {
        warn!(%stage, error = message, "Analysis failed");
    }
}

/// Shared observer handle stored in the application state.
pub type Observer = Arc<dyn PipelineObserver>;
