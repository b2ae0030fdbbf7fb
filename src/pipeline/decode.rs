//! Incremental decoder: model text deltas → [`ReportEvent`]s.
//!
//! The model is asked for JSON Lines (see [`crate::prompts::OUTPUT_CONTRACT`]),
//! but it streams arbitrary chunks: a delta may end mid-object or carry
//! several lines at once. [`FindingDecoder`] buffers until a newline, then
//! decodes each complete line, so a finding reaches the client as soon as
//! its line is finished.
//!
//! Models drift from the contract in predictable ways, and each is handled:
//!
//! | Drift | Handling |
//! |-------|----------|
//! | Wraps output in ```` ```json ```` fences | fence lines skipped |
//! | Emits a JSON array, one object per line | `[`, `]` and trailing `,` stripped |
//! | `"severity": "CRITICAL"`, `"page": "4"` | lenient field parsing |
//! | Omits `category` | taken from the check type, or from `wcag` |
//! | Writes prose instead of JSON | each paragraph becomes a summary, in place |

use crate::report::{Category, CheckType, Finding, ReportEvent, Severity};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;

static FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^```[A-Za-z0-9_-]*$").unwrap());

/// Buffers streamed text and yields report events per complete line.
#[derive(Debug)]
pub struct FindingDecoder {
    check_type: CheckType,
    buffer: String,
    prose: Vec<String>,
}

/// Permissive view of one output line.
#[derive(Debug, Deserialize)]
struct RawLine {
    #[serde(rename = "type", default)]
    kind: Option<String>,
    #[serde(default)]
    category: Option<String>,
    #[serde(default)]
    severity: Option<String>,
    #[serde(default)]
    page: Option<Value>,
    #[serde(default)]
    element: Option<String>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    fix: Option<String>,
    #[serde(default)]
    wcag: Option<Value>,
    #[serde(default)]
    text: Option<String>,
}

impl FindingDecoder {
    pub fn new(check_type: CheckType) -> Self {
        Self {
            check_type,
            buffer: String::new(),
            prose: Vec::new(),
        }
    }

    /// Feed one text delta; returns the events completed by it, in order.
    pub fn push(&mut self, delta: &str) -> Vec<ReportEvent> {
        self.buffer.push_str(delta);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.decode_line(&line, &mut events);
        }
        events
    }

    /// Flush the unterminated last line and any pending prose.
    pub fn finish(mut self) -> Vec<ReportEvent> {
        let mut events = Vec::new();
        let rest = std::mem::take(&mut self.buffer);
        self.decode_line(&rest, &mut events);
        self.flush_prose(&mut events);
        events
    }

    fn decode_line(&mut self, raw: &str, events: &mut Vec<ReportEvent>) {
        let line = raw.trim();
        // A blank line ends a prose paragraph.
        if line.is_empty() {
            self.flush_prose(events);
            return;
        }
        if FENCE.is_match(line) || line == "[" || line == "]" {
            return;
        }
        let candidate = line
            .trim_start_matches('[')
            .trim_end_matches(']')
            .trim_end_matches(',')
            .trim();

        if candidate.starts_with('{') {
            if let Ok(parsed) = serde_json::from_str::<RawLine>(candidate) {
                if let Some(event) = self.to_event(parsed) {
                    self.flush_prose(events);
                    events.push(event);
                    return;
                }
            }
        }

        self.prose.push(line.to_string());
    }

    /// Emit pending prose as one summary, keeping its place in the stream.
    fn flush_prose(&mut self, events: &mut Vec<ReportEvent>) {
        if !self.prose.is_empty() {
            events.push(ReportEvent::Summary(self.prose.join("\n")));
            self.prose.clear();
        }
    }

    fn to_event(&self, raw: RawLine) -> Option<ReportEvent> {
        let kind = raw.kind.as_deref().map(str::to_ascii_lowercase);
        let is_summary = match kind.as_deref() {
            Some("summary") | Some("assessment") | Some("recommendations") => true,
            Some(_) => false,
            None => raw.description.is_none() && raw.text.is_some(),
        };

        if is_summary {
            return raw
                .text
                .or(raw.description)
                .filter(|t| !t.trim().is_empty())
                .map(ReportEvent::Summary);
        }

        let description = raw.description.or(raw.text).filter(|d| !d.trim().is_empty())?;
        let wcag = raw.wcag.and_then(value_to_string);
        let category = raw
            .category
            .as_deref()
            .and_then(parse_category)
            .or_else(|| self.check_type.implied_category())
            .unwrap_or(if wcag.is_some() {
                Category::Accessibility
            } else {
                Category::Formatting
            });

        Some(ReportEvent::Finding(Finding {
            category,
            severity: raw
                .severity
                .as_deref()
                .and_then(Severity::parse_lenient)
                .unwrap_or_default(),
            page: raw.page.and_then(value_to_page),
            element: raw.element.filter(|e| !e.trim().is_empty()),
            description,
            fix: raw.fix.filter(|f| !f.trim().is_empty()),
            wcag,
        }))
    }
}

/// Decode a complete, non-streamed response in one pass.
pub fn decode_all(check_type: CheckType, text: &str) -> Vec<ReportEvent> {
    let mut decoder = FindingDecoder::new(check_type);
    let mut events = decoder.push(text);
    events.extend(decoder.finish());
    events
}

fn parse_category(s: &str) -> Option<Category> {
    let s = s.to_ascii_lowercase();
    if s.starts_with("access") || s == "a11y" {
        Some(Category::Accessibility)
    } else if s.starts_with("format") {
        Some(Category::Formatting)
    } else {
        None
    }
}

fn value_to_page(v: Value) -> Option<u32> {
    let page = match v {
        Value::Number(n) => n.as_u64().and_then(|p| u32::try_from(p).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    };
    page.filter(|&p| p > 0)
}

fn value_to_string(v: Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
