//! Native Anthropic Messages API client with token streaming.
//!
//! The request sets `"stream": true`; the response is Server-Sent Events.
//! Only these frames matter:
//!
//! | Event | Action |
//! |-------|--------|
//! | `content_block_delta` (`text_delta`) | text fed to the [`FindingDecoder`] |
//! | `message_delta` | `stop_reason` logged; `max_tokens` means a truncated report |
//! | `message_stop` | decoder flushed, stream ends |
//! | `error` | stream ends with [`AnalysisError::Api`] |
//!
//! Everything else (`message_start`, `ping`, block start/stop) is ignored.
//! A body that ends without `message_stop` is reported as malformed after
//! the findings decoded so far.

use super::{AnalysisRequest, AnalysisService, ReportStream};
use crate::config::AnalysisConfig;
use crate::error::AnalysisError;
use crate::pipeline::decode::FindingDecoder;
use crate::prompts::{build_user_prompt, system_prompt};
use crate::report::ReportEvent;
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, warn};

const API_VERSION: &str = "2023-06-01";
const PROVIDER: &str = "anthropic";

/// Streams findings from `POST {base_url}/v1/messages`.
#[derive(Clone)]
pub struct AnthropicAnalysis {
    client: reqwest::Client,
    api_key: String,
    model: String,
    messages_url: String,
    max_tokens: u32,
    temperature: f32,
    timeout_secs: u64,
}

impl std::fmt::Debug for AnthropicAnalysis {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnthropicAnalysis")
            .field("model", &self.model)
            .field("messages_url", &self.messages_url)
            .field("api_key", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    temperature: f32,
    stream: bool,
    system: &'a str,
    messages: Vec<MessageParam>,
}

#[derive(Debug, Serialize)]
struct MessageParam {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDelta {
    delta: Delta,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Delta {
    TextDelta { text: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    delta: MessageDeltaBody,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaBody {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

impl AnthropicAnalysis {
    pub fn new(config: &AnalysisConfig) -> Result<Self, AnalysisError> {
        let api_key = config
            .api_key
            .clone()
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| AnalysisError::ProviderNotConfigured {
                provider: PROVIDER.to_string(),
                hint: "Set ANTHROPIC_API_KEY in the environment or in .env.".to_string(),
            })?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| AnalysisError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            messages_url: format!("{}/v1/messages", config.base_url.trim_end_matches('/')),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl AnalysisService for AnthropicAnalysis {
    async fn analyze(&self, request: AnalysisRequest) -> Result<ReportStream, AnalysisError> {
        let user_prompt = build_user_prompt(request.check_type, &request.structure_report);
        let body = MessagesRequest {
            model: &self.model,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            stream: true,
            system: system_prompt(request.check_type),
            messages: vec![MessageParam {
                role: "user",
                content: user_prompt,
            }],
        };

        info!(
            model = %self.model,
            check_type = %request.check_type,
            report_chars = request.structure_report.len(),
            "Starting analysis"
        );

        let secs = self.timeout_secs;
        let response = self
            .client
            .post(&self.messages_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", API_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| transport_error(e, secs))?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse().ok());
            let text = response.text().await.unwrap_or_default();
            return Err(status_error(status, retry_after, &text));
        }

        let bytes = response
            .bytes_stream()
            .map(move |chunk| chunk.map_err(|e| transport_error(e, secs)));
        Ok(report_stream(bytes, FindingDecoder::new(request.check_type)))
    }
}

fn transport_error(e: reqwest::Error, secs: u64) -> AnalysisError {
    if e.is_timeout() {
        AnalysisError::Timeout { secs }
    } else {
        AnalysisError::Transport(e.to_string())
    }
}

/// Map a non-2xx response to an error, preferring the API's own message.
fn status_error(status: StatusCode, retry_after_secs: Option<u64>, body: &str) -> AnalysisError {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|env| format!("{}: {}", env.error.kind, env.error.message))
        .unwrap_or_else(|_| {
            let trimmed = body.trim();
            if trimmed.is_empty() {
                status.canonical_reason().unwrap_or("request failed").to_string()
            } else {
                trimmed.to_string()
            }
        });

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => AnalysisError::Auth {
            provider: PROVIDER.to_string(),
            detail: message,
        },
        StatusCode::TOO_MANY_REQUESTS => AnalysisError::RateLimited {
            provider: PROVIDER.to_string(),
            retry_after_secs,
        },
        _ => AnalysisError::Api {
            status: Some(status.as_u16()),
            message,
        },
    }
}

// ── SSE decoding ─────────────────────────────────────────────────────────

/// One dispatched Server-Sent Event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Splits a byte stream into SSE frames.
///
/// Lines are split on `\n` (with an optional `\r`), which never falls inside
/// a UTF-8 sequence, so chunk boundaries can land anywhere.
#[derive(Debug, Default)]
pub(crate) struct SseParser {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseParser {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw);
            let line = line.trim_end_matches(['\n', '\r']);

            if line.is_empty() {
                if let Some(frame) = self.dispatch() {
                    frames.push(frame);
                }
                continue;
            }
            if line.starts_with(':') {
                continue;
            }
            let (field, value) = match line.split_once(':') {
                Some((f, v)) => (f, v.strip_prefix(' ').unwrap_or(v)),
                None => (line, ""),
            };
            match field {
                "event" => self.event = Some(value.to_string()),
                "data" => self.data.push(value.to_string()),
                _ => {}
            }
        }
        frames
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame {
            event: event.unwrap_or_else(|| "message".to_string()),
            data,
        })
    }
}

/// What one frame did to the analysis.
#[derive(Debug, PartialEq)]
enum FrameOutcome {
    Continue,
    Stop,
}

fn apply_frame(
    frame: &SseFrame,
    decoder: &mut FindingDecoder,
    out: &mut VecDeque<ReportEvent>,
) -> Result<FrameOutcome, AnalysisError> {
    match frame.event.as_str() {
        "content_block_delta" => {
            let parsed: ContentBlockDelta = serde_json::from_str(&frame.data)
                .map_err(|e| AnalysisError::MalformedStream(format!("content_block_delta: {e}")))?;
            if let Delta::TextDelta { text } = parsed.delta {
                out.extend(decoder.push(&text));
            }
            Ok(FrameOutcome::Continue)
        }
        "message_delta" => {
            if let Ok(parsed) = serde_json::from_str::<MessageDelta>(&frame.data) {
                match parsed.delta.stop_reason.as_deref() {
                    Some("max_tokens") => warn!("Analysis hit max_tokens; report may be truncated"),
                    Some(reason) => debug!(stop_reason = reason, "Analysis finished"),
                    None => {}
                }
            }
            Ok(FrameOutcome::Continue)
        }
        "message_stop" => Ok(FrameOutcome::Stop),
        "error" => {
            let message = serde_json::from_str::<ErrorEnvelope>(&frame.data)
                .map(|env| format!("{}: {}", env.error.kind, env.error.message))
                .unwrap_or_else(|_| frame.data.clone());
            Err(AnalysisError::Api {
                status: None,
                message,
            })
        }
        _ => Ok(FrameOutcome::Continue),
    }
}

struct StreamState<S> {
    body: Pin<Box<S>>,
    parser: SseParser,
    decoder: Option<FindingDecoder>,
    pending: VecDeque<ReportEvent>,
    failure: Option<AnalysisError>,
    done: bool,
}

impl<S> StreamState<S> {
    fn flush(&mut self) {
        if let Some(decoder) = self.decoder.take() {
            self.pending.extend(decoder.finish());
        }
    }

    fn fail(&mut self, err: AnalysisError) {
        self.failure = Some(err);
        self.done = true;
    }
}

/// Turn an SSE byte stream into report events.
///
/// Events decoded before a failure are delivered first, then the failure.
pub(crate) fn report_stream<S>(body: S, decoder: FindingDecoder) -> ReportStream
where
    S: Stream<Item = Result<Bytes, AnalysisError>> + Send + 'static,
{
    let state = StreamState {
        body: Box::pin(body),
        parser: SseParser::default(),
        decoder: Some(decoder),
        pending: VecDeque::new(),
        failure: None,
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(event) = state.pending.pop_front() {
                return Some((Ok(event), state));
            }
            if let Some(err) = state.failure.take() {
                return Some((Err(err), state));
            }
            if state.done {
                return None;
            }

            match state.body.next().await {
                Some(Ok(chunk)) => {
                    for frame in state.parser.push(&chunk) {
                        let Some(decoder) = state.decoder.as_mut() else {
                            break;
                        };
                        match apply_frame(&frame, decoder, &mut state.pending) {
                            Ok(FrameOutcome::Continue) => {}
                            Ok(FrameOutcome::Stop) => {
                                state.flush();
                                state.done = true;
                                break;
                            }
                            Err(e) => {
                                state.flush();
                                state.fail(e);
                                break;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    state.flush();
                    state.fail(e);
                }
                None => {
                    state.flush();
                    state.fail(AnalysisError::MalformedStream(
                        "response ended before message_stop".to_string(),
                    ));
                }
            }
        }
    }))
}
