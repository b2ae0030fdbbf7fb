//! Analysis through any edgequake-llm provider (OpenAI, Gemini, Ollama, ...).
//!
//! The provider returns the whole report at once, so findings reach the
//! client in one burst after the model finishes. The decoding is the same as
//! for the streaming backend.

use super::{AnalysisRequest, AnalysisService, ReportStream};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::pipeline::decode::decode_all;
use crate::prompts::{build_user_prompt, system_prompt};
use async_trait::async_trait;
use edgequake_llm::{ChatMessage, CompletionOptions, LLMProvider, ProviderFactory};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Wraps an `LLMProvider` created by the edgequake-llm factory.
pub struct ProviderAnalysis {
    provider: Arc<dyn LLMProvider>,
    provider_name: String,
    model: String,
    options: CompletionOptions,
    timeout_secs: u64,
}

impl std::fmt::Debug for ProviderAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderAnalysis")
            .field("provider", &self.provider_name)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl ProviderAnalysis {
    /// Create the provider named in `config`. API keys are read from the
    /// provider's usual environment variables (`OPENAI_API_KEY`, ...).
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let provider = ProviderFactory::create_llm_provider(&config.provider, &config.model)
            .map_err(|e| AnalysisError::ProviderNotConfigured {
                provider: config.provider.clone(),
                hint: format!("{e}"),
            })?;
        Ok(Self::with_provider(provider, config))
    }

    /// Use an already constructed provider.
    pub fn with_provider(provider: Arc<dyn LLMProvider>, config: &AnalysisConfig) -> Self {
        Self {
            provider,
            provider_name: config.provider.clone(),
            model: config.model.clone(),
            options: build_options(config),
            timeout_secs: config.timeout_secs,
        }
    }
}

/// System prompt plus the text-only structure report.
fn build_messages(request: &AnalysisRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage::system(system_prompt(request.check_type)),
        ChatMessage::user(build_user_prompt(
            request.check_type,
            &request.structure_report,
        )),
    ]
}

#[async_trait]
impl AnalysisService for ProviderAnalysis {
    async fn analyze(&self, request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
        let messages = build_messages(&request);

        info!(
            provider = %self.provider_name,
            model = %self.model,
            check_type = %request.check_type,
            "Starting analysis"
        );
        let start = Instant::now();

        let call = self.provider.chat(&messages, Some(&self.options));
        let response = tokio::time::timeout(Duration::from_secs(self.timeout_secs), call)
            .await
            .map_err(|_| AnalysisError::Timeout {
                secs: self.timeout_secs,
            })?
            .map_err(|e| classify_provider_error(&self.provider_name, &e.to_string()))?;

        debug!(
            "{} input tokens, {} output tokens, {:?}",
            response.prompt_tokens,
            response.completion_tokens,
            start.elapsed()
        );

        let events = decode_all(request.check_type, &response.content);
        Ok(Box::pin(futures::stream::iter(events.into_iter().map(Ok))))
    }
}

fn build_options(config: &AnalysisConfig) -> CompletionOptions {
    CompletionOptions {
        temperature: Some(config.temperature),
        max_tokens: Some(config.max_tokens as usize),
        ..Default::default()
    }
}

/// Best-effort mapping of a provider error message onto [`AnalysisError`].
fn classify_provider_error(provider: &str, message: &str) -> AnalysisError {
    let lower = message.to_ascii_lowercase();
    if lower.contains("401")
        || lower.contains("403")
        || lower.contains("unauthorized")
        || lower.contains("invalid api key")
        || lower.contains("authentication")
    {
        AnalysisError::Auth {
            provider: provider.to_string(),
            detail: message.to_string(),
        }
    } else if lower.contains("429") || lower.contains("rate limit") {
        AnalysisError::RateLimited {
            provider: provider.to_string(),
            retry_after_secs: None,
        }
    } else if lower.contains("timed out") || lower.contains("timeout") {
        AnalysisError::Transport(message.to_string())
    } else {
        AnalysisError::Api {
            status: None,
            message: message.to_string(),
        }
    }
}
