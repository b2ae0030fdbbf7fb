//! Analysis backends: structure report in, stream of report events out.
//!
//! [`AnalysisService`] is the seam between the request pipeline and the
//! model. Two implementations ship:
//!
//! | Backend | When | Streaming |
//! |---------|------|-----------|
//! | [`anthropic::AnthropicAnalysis`] | `provider = "anthropic"` (default) | token-level, over SSE |
//! | [`provider::ProviderAnalysis`] | any other edgequake-llm provider | whole response, then decoded |
//!
//! Both decode the model's JSON Lines with
//! [`crate::pipeline::decode::FindingDecoder`], so the events a client sees
//! do not depend on the backend.
//!
//! Failures are never retried: a retry after findings were already sent
//! would duplicate them, and one before anything was sent would hold the
//! client's stream open with nothing to show.

pub mod anthropic;
pub mod provider;

use crate::config::ServerConfig;
use crate::error::AnalysisError;
use crate::report::{CheckType, ReportEvent};
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;
use std::sync::Arc;

/// Events from one analysis, in the order the model produced them.
///
/// The stream ends after the last event or after the first `Err`.
pub type ReportStream = Pin<Box<dyn Stream<Item = Result<ReportEvent, AnalysisError>> + Send>>;

/// One analysis job.
#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub check_type: CheckType,
    /// Markdown from [`crate::structure::DocumentStructure::to_prompt_report`].
    pub structure_report: String,
}

/// Runs the model over a structure report.
#[async_trait]
pub trait AnalysisService: Send + Sync {
    /// Start an analysis. Errors before the first event (bad credentials,
    /// HTTP status) are returned directly; later ones arrive in the stream.
    async fn analyze(&self, request: AnalysisRequest) -> Result<ReportStream, AnalysisError>;
}

/// Build the backend named by `config.analysis.provider`.
pub fn from_config(config: &ServerConfig) -> Result<Arc<dyn AnalysisService>, AnalysisError> {
    if config.uses_anthropic() {
        Ok(Arc::new(anthropic::AnthropicAnalysis::new(&config.analysis)?))
    } else {
        Ok(Arc::new(provider::ProviderAnalysis::new(&config.analysis)?))
    }
}
