//! Report vocabulary shared by the analysis backends, the relay and the client.
//!
//! Two layers of events exist:
//!
//! * [`ReportEvent`]: what an [`crate::analysis::AnalysisService`] produces,
//!   findings and free-text summaries, nothing else.
//! * [`StreamEvent`]: what the client receives over SSE, every report event
//!   plus exactly one terminal `complete` or `error` event appended by
//!   [`crate::stream`].
//!
//! The JSON shape of a [`StreamEvent`] carries its own `type` tag so clients
//! that ignore the SSE `event:` line can still dispatch on the payload.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::UploadError;

// ── Check type ───────────────────────────────────────────────────────────

/// Which review the caller asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckType {
    /// WCAG 2.1 AA review of the document structure.
    Accessibility,
    /// Dissertation formatting review (margins, numbering, front matter).
    Formatting,
    /// Both reviews, findings grouped by category. (default)
    #[default]
    Both,
}

impl CheckType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckType::Accessibility => "accessibility",
            CheckType::Formatting => "formatting",
            CheckType::Both => "both",
        }
    }

    /// Human-readable task name used in the user prompt.
    pub fn task_label(&self) -> &'static str {
        match self {
            CheckType::Accessibility => "accessibility",
            CheckType::Formatting => "formatting",
            CheckType::Both => "accessibility and formatting",
        }
    }

    /// Category assumed for findings that omit one.
    ///
    /// `None` for [`CheckType::Both`], where the model must say which it is.
    pub fn implied_category(&self) -> Option<Category> {
        match self {
            CheckType::Accessibility => Some(Category::Accessibility),
            CheckType::Formatting => Some(Category::Formatting),
            CheckType::Both => None,
        }
    }
}

impl fmt::Display for CheckType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckType {
    type Err = UploadError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "accessibility" => Ok(CheckType::Accessibility),
            "formatting" => Ok(CheckType::Formatting),
            "both" => Ok(CheckType::Both),
            _ => Err(UploadError::InvalidCheckType {
                value: s.to_string(),
            }),
        }
    }
}

// ── Findings ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    Accessibility,
    Formatting,
}

/// How badly an issue affects the reader or the submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Content is inaccessible or the submission would be rejected.
    Critical,
    /// Significant impact, should be fixed.
    #[default]
    Warning,
    /// Improvement worth considering.
    Suggestion,
}

impl Severity {
    /// Lenient parse used on model output: accepts `CRITICAL`, `Critical`,
    /// `error`, `minor`, and similar spellings.
    pub fn parse_lenient(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "critical" | "error" | "high" | "blocker" => Some(Severity::Critical),
            "warning" | "warn" | "medium" | "major" => Some(Severity::Warning),
            "suggestion" | "info" | "low" | "minor" | "recommendation" => {
                Some(Severity::Suggestion)
            }
            _ => None,
        }
    }
}

/// One reported accessibility or formatting issue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Finding {
    pub category: Category,
    pub severity: Severity,
    /// 1-indexed page number, when the issue is tied to a page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Element the issue refers to, e.g. `Figure 3` or `Heading "Methods"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub element: Option<String>,
    pub description: String,
    /// Tool-agnostic remediation guidance.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
    /// WCAG success criterion, e.g. `1.1.1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wcag: Option<String>,
}

impl Finding {
    pub fn new(category: Category, severity: Severity, description: impl Into<String>) -> Self {
        Self {
            category,
            severity,
            page: None,
            element: None,
            description: description.into(),
            fix: None,
            wcag: None,
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_fix(mut self, fix: impl Into<String>) -> Self {
        self.fix = Some(fix.into());
        self
    }
}

// ── Events ───────────────────────────────────────────────────────────────

/// An item produced by an analysis backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ReportEvent {
    Finding(Finding),
    /// Overall assessment or general recommendations.
    Summary(String),
}

/// Pipeline stage; also names where a terminal error happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Upload,
    Extraction,
    Analysis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Stage::Upload => "upload",
            Stage::Extraction => "extraction",
            Stage::Analysis => "analysis",
        })
    }
}

/// One SSE frame sent to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    Finding(Finding),
    Summary { text: String },
    /// Terminal: analysis finished. `findings` counts the relayed findings.
    Complete { findings: usize },
    /// Terminal: the request failed at `stage`.
    Error { stage: Stage, message: String },
}

impl StreamEvent {
    /// SSE `event:` name; identical to the JSON `type` tag.
    pub fn name(&self) -> &'static str {
        match self {
            StreamEvent::Finding(_) => "finding",
            StreamEvent::Summary { .. } => "summary",
            StreamEvent::Complete { .. } => "complete",
            StreamEvent::Error { .. } => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete { .. } | StreamEvent::Error { .. })
    }
}

impl From<ReportEvent> for StreamEvent {
    fn from(event: ReportEvent) -> Self {
        match event {
            ReportEvent::Finding(f) => StreamEvent::Finding(f),
            ReportEvent::Summary(text) => StreamEvent::Summary { text },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn check_type_parses_case_insensitively() {
        assert_eq!("Accessibility".parse::<CheckType>().unwrap(), CheckType::Accessibility);
        assert_eq!(" formatting ".parse::<CheckType>().unwrap(), CheckType::Formatting);
        assert_eq!("BOTH".parse::<CheckType>().unwrap(), CheckType::Both);
    }

    #[test]
    fn check_type_rejects_unknown_value() {
        let err = "spelling".parse::<CheckType>().unwrap_err();
        assert!(matches!(err, UploadError::InvalidCheckType { ref value } if value == "spelling"));
    }

    #[test]
    fn check_type_defaults_to_both() {
        assert_eq!(CheckType::default(), CheckType::Both);
        assert_eq!(CheckType::Both.implied_category(), None);
        assert_eq!(CheckType::Formatting.implied_category(), Some(Category::Formatting));
    }

    #[test]
    fn severity_lenient_parse() {
        assert_eq!(Severity::parse_lenient("CRITICAL"), Some(Severity::Critical));
        assert_eq!(Severity::parse_lenient("Warning"), Some(Severity::Warning));
        assert_eq!(Severity::parse_lenient("minor"), Some(Severity::Suggestion));
        assert_eq!(Severity::parse_lenient("catastrophic"), None);
    }

    #[test]
    fn finding_event_is_tagged_flat() {
        let event = StreamEvent::Finding(
            Finding::new(Category::Accessibility, Severity::Critical, "missing alt text").with_page(3),
        );
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "finding");
        assert_eq!(json["category"], "accessibility");
        assert_eq!(json["severity"], "critical");
        assert_eq!(json["page"], 3);
        assert!(json.get("fix").is_none(), "absent fields are omitted: {json}");
    }

    #[test]
    fn terminal_events_serialize_with_type_tag() {
        let done = serde_json::to_value(StreamEvent::Complete { findings: 2 }).unwrap();
        assert_eq!(done, serde_json::json!({"type": "complete", "findings": 2}));

        let err = StreamEvent::Error {
            stage: Stage::Extraction,
            message: "not a PDF".into(),
        };
        assert_eq!(err.name(), "error");
        assert!(err.is_terminal());
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["stage"], "extraction");
    }

    #[test]
    fn report_event_converts_to_stream_event() {
        let s: StreamEvent = ReportEvent::Summary("Looks good overall.".into()).into();
        assert_eq!(s.name(), "summary");
        assert!(!s.is_terminal());
    }
}
