//! Document structure model and its prompt rendering.
//!
//! A [`DocumentStructure`] is what the extractor hands to the analysis
//! service: headings with levels, paragraphs, list items, tables with header
//! flags, images with alt-text presence, a reading-order outline, the plain
//! text, and document-level metadata. It lives for exactly one request.
//!
//! [`DocumentStructure::to_prompt_report`] renders it as Markdown for the
//! model. The structural sections are always complete; only the running
//! text is truncated.

use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Element text longer than this is cut and suffixed with `...`.
pub const TEXT_PREVIEW_CHARS: usize = 200;
/// Reading-order labels keep this many characters of element text.
pub const ORDER_PREVIEW_CHARS: usize = 50;
/// Reading-order entries listed in the prompt report.
pub const READING_ORDER_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementKind {
    Title,
    Heading,
    Paragraph,
    ListItem,
}

impl ElementKind {
    fn label(&self) -> &'static str {
        match self {
            ElementKind::Title => "Title",
            ElementKind::Heading => "Heading",
            ElementKind::Paragraph => "Paragraph",
            ElementKind::ListItem => "ListItem",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructureElement {
    pub kind: ElementKind,
    /// Truncated to [`TEXT_PREVIEW_CHARS`].
    pub text: String,
    /// Heading level 1–6; 1 for non-heading elements.
    pub level: u8,
    /// 1-indexed page, when known.
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableInfo {
    pub rows: usize,
    pub cols: usize,
    /// At least one header cell (`TH`) is marked.
    pub has_header: bool,
    pub page: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageInfo {
    pub page: Option<u32>,
    pub has_alt_text: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// `/Title` from the document information dictionary.
    pub title: Option<String>,
    pub author: Option<String>,
    /// Catalog `/Lang`, e.g. `en-US`.
    pub language: Option<String>,
    /// The catalog carries a logical structure tree.
    pub tagged: bool,
}

/// Where the element lists came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructureSource {
    /// Read from the PDF's tag tree: what assistive technology will see.
    Tagged,
    /// Inferred from font sizes and text layout.
    #[default]
    Layout,
}

/// Everything the analysis service needs to know about one document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentStructure {
    pub filename: String,
    pub page_count: usize,
    pub metadata: DocumentMetadata,
    pub source: StructureSource,
    pub headings: Vec<StructureElement>,
    pub paragraphs: Vec<StructureElement>,
    pub list_items: Vec<StructureElement>,
    pub tables: Vec<TableInfo>,
    pub images: Vec<ImageInfo>,
    /// Short labels like `H1: Introduction`, in document order.
    pub reading_order: Vec<String>,
    /// Plain text of the document, page by page.
    pub text: String,
}

impl DocumentStructure {
    pub fn new(filename: impl Into<String>, page_count: usize) -> Self {
        Self {
            filename: filename.into(),
            page_count,
            ..Default::default()
        }
    }

    /// Record a heading (or the document title, at level 1).
    pub fn push_heading(&mut self, kind: ElementKind, text: &str, level: u8, page: Option<u32>) {
        let level = level.clamp(1, 6);
        self.reading_order
            .push(format!("H{level}: {}", preview(text, ORDER_PREVIEW_CHARS)));
        self.headings.push(element(kind, text, level, page));
    }

    pub fn push_paragraph(&mut self, text: &str, page: Option<u32>) {
        self.reading_order
            .push(format!("P: {}", preview(text, ORDER_PREVIEW_CHARS)));
        self.paragraphs
            .push(element(ElementKind::Paragraph, text, 1, page));
    }

    pub fn push_list_item(&mut self, text: &str, page: Option<u32>) {
        self.reading_order
            .push(format!("LIST: {}", preview(text, ORDER_PREVIEW_CHARS)));
        self.list_items
            .push(element(ElementKind::ListItem, text, 1, page));
    }

    pub fn push_table(&mut self, table: TableInfo) {
        self.reading_order.push(format!(
            "TABLE: {}x{}{}",
            table.rows,
            table.cols,
            if table.has_header { "" } else { " (no header)" }
        ));
        self.tables.push(table);
    }

    pub fn push_image(&mut self, image: ImageInfo) {
        self.reading_order.push(match image.alt_text.as_deref() {
            Some(alt) => format!("FIGURE: {}", preview(alt, ORDER_PREVIEW_CHARS)),
            None => "FIGURE: (no alt text)".to_string(),
        });
        self.images.push(image);
    }

    /// Render the structure as a Markdown report for the analysis prompt.
    ///
    /// `max_content_chars` caps the document text section; a note states how
    /// much was kept so the model does not mistake truncation for missing
    /// content.
    pub fn to_prompt_report(&self, max_content_chars: usize) -> String {
        let mut out = String::new();
        let md = &self.metadata;

        // `write!` into a String cannot fail.
        let _ = writeln!(out, "# PDF STRUCTURAL ANALYSIS\n");
        let _ = writeln!(out, "**Filename:** {}", self.filename);
        let _ = writeln!(out, "**Pages:** {}\n", self.page_count);

        let _ = writeln!(out, "## Document Properties\n");
        let _ = writeln!(
            out,
            "- **Title:** {}",
            md.title.as_deref().unwrap_or("NOT SET")
        );
        let _ = writeln!(
            out,
            "- **Language:** {}",
            md.language.as_deref().unwrap_or("NOT SET")
        );
        if let Some(author) = md.author.as_deref() {
            let _ = writeln!(out, "- **Author:** {author}");
        }
        let _ = writeln!(
            out,
            "- **Tagged PDF:** {}\n",
            if md.tagged {
                "yes"
            } else {
                "NO (untagged; the structure below was inferred from visual layout)"
            }
        );

        let _ = writeln!(out, "## Document Structure Summary\n");
        let _ = writeln!(out, "- **Headings detected:** {}", self.headings.len());
        let _ = writeln!(out, "- **Paragraphs:** {}", self.paragraphs.len());
        let _ = writeln!(out, "- **List items:** {}", self.list_items.len());
        let _ = writeln!(out, "- **Tables:** {}", self.tables.len());
        let _ = writeln!(out, "- **Images:** {}\n", self.images.len());

        if !self.headings.is_empty() {
            let _ = writeln!(out, "## Heading Structure\n");
            for h in &self.headings {
                let indent = "  ".repeat(h.level.saturating_sub(1) as usize);
                let _ = writeln!(
                    out,
                    "{indent}- [{}] (level {}): \"{}\"{}",
                    h.kind.label(),
                    h.level,
                    h.text,
                    page_suffix(h.page)
                );
            }
            out.push('\n');
        }

        if !self.tables.is_empty() {
            let _ = writeln!(out, "## Tables\n");
            for (i, t) in self.tables.iter().enumerate() {
                let header = if t.has_header {
                    "has header row"
                } else {
                    "NO HEADER ROW DETECTED"
                };
                let _ = writeln!(
                    out,
                    "- Table {}: {} rows x {} cols, {header}{}",
                    i + 1,
                    t.rows,
                    t.cols,
                    page_suffix(t.page)
                );
            }
            out.push('\n');
        }

        if !self.images.is_empty() {
            let _ = writeln!(out, "## Images\n");
            for (i, img) in self.images.iter().enumerate() {
                let status = match img.alt_text.as_deref() {
                    Some(alt) if img.has_alt_text => format!("alt text: \"{}\"", preview(alt, TEXT_PREVIEW_CHARS)),
                    _ => "NO CAPTION/ALT TEXT DETECTED".to_string(),
                };
                let _ = writeln!(out, "- Image {}: {status}{}", i + 1, page_suffix(img.page));
            }
            out.push('\n');
        }

        let _ = writeln!(out, "## Reading Order (first {READING_ORDER_LIMIT} elements)\n");
        for (i, entry) in self.reading_order.iter().take(READING_ORDER_LIMIT).enumerate() {
            let _ = writeln!(out, "{}. {entry}", i + 1);
        }
        if self.reading_order.len() > READING_ORDER_LIMIT {
            let _ = writeln!(
                out,
                "... and {} more elements",
                self.reading_order.len() - READING_ORDER_LIMIT
            );
        }
        out.push('\n');

        let _ = writeln!(out, "## Document Content\n");
        let total = self.text.chars().count();
        if total <= max_content_chars {
            out.push_str(&self.text);
        } else {
            let kept: String = self.text.chars().take(max_content_chars).collect();
            out.push_str(&kept);
            let _ = write!(
                out,
                "\n\n... [Content truncated - showing first {} of {} characters]\n\
                 *Note: The structural metadata above (headings, tables, images) covers the COMPLETE document.*",
                group_thousands(max_content_chars),
                group_thousands(total)
            );
        }

        out
    }
}

fn element(kind: ElementKind, text: &str, level: u8, page: Option<u32>) -> StructureElement {
    StructureElement {
        kind,
        text: preview(text, TEXT_PREVIEW_CHARS),
        level,
        page,
    }
}

fn page_suffix(page: Option<u32>) -> String {
    match page {
        Some(p) => format!(" (page {p})"),
        None => String::new(),
    }
}

/// Collapse whitespace and cut to `max` characters, appending `...` when cut.
pub fn preview(text: &str, max: usize) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() <= max {
        collapsed
    } else {
        let mut s: String = collapsed.chars().take(max).collect();
        s.push_str("...");
        s
    }
}

fn group_thousands(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> DocumentStructure {
        let mut s = DocumentStructure::new("thesis.pdf", 2);
        s.metadata.title = Some("On Tides".into());
        s.metadata.tagged = true;
        s.source = StructureSource::Tagged;
        s.push_heading(ElementKind::Heading, "Introduction", 1, Some(1));
        s.push_heading(ElementKind::Heading, "Background", 2, Some(1));
        s.push_paragraph("The moon pulls the sea.", Some(1));
        s.push_table(TableInfo { rows: 3, cols: 2, has_header: false, page: Some(2) });
        s.push_image(ImageInfo { page: Some(2), has_alt_text: false, alt_text: None });
        s.text = "Introduction\nThe moon pulls the sea.".into();
        s
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let long = "é".repeat(300);
        let p = preview(&long, 200);
        assert_eq!(p.chars().count(), 203);
        assert!(p.ends_with("..."));
        assert_eq!(preview("  short   text ", 200), "short text");
    }

    #[test]
    fn push_helpers_build_reading_order() {
        let s = sample();
        assert_eq!(
            s.reading_order,
            vec![
                "H1: Introduction",
                "H2: Background",
                "P: The moon pulls the sea.",
                "TABLE: 3x2 (no header)",
                "FIGURE: (no alt text)",
            ]
        );
    }

    #[test]
    fn heading_level_is_clamped() {
        let mut s = DocumentStructure::new("a.pdf", 1);
        s.push_heading(ElementKind::Heading, "Deep", 9, None);
        assert_eq!(s.headings[0].level, 6);
    }

    #[test]
    fn report_flags_missing_header_and_alt_text() {
        let report = sample().to_prompt_report(15_000);
        assert!(report.starts_with("# PDF STRUCTURAL ANALYSIS"));
        assert!(report.contains("**Pages:** 2"));
        assert!(report.contains("- **Title:** On Tides"));
        assert!(report.contains("- **Language:** NOT SET"));
        assert!(report.contains("- [Heading] (level 1): \"Introduction\" (page 1)"));
        assert!(report.contains("  - [Heading] (level 2): \"Background\""));
        assert!(report.contains("- Table 1: 3 rows x 2 cols, NO HEADER ROW DETECTED (page 2)"));
        assert!(report.contains("- Image 1: NO CAPTION/ALT TEXT DETECTED (page 2)"));
        assert!(!report.contains("Content truncated"));
    }

    #[test]
    fn report_truncates_content_with_note() {
        let mut s = DocumentStructure::new("long.pdf", 1);
        s.text = "x".repeat(20_000);
        let report = s.to_prompt_report(15_000);
        assert!(report.contains("showing first 15,000 of 20,000 characters"));
        assert!(report.contains("covers the COMPLETE document"));
    }

    #[test]
    fn report_limits_reading_order() {
        let mut s = DocumentStructure::new("many.pdf", 1);
        for i in 0..60 {
            s.push_paragraph(&format!("para {i}"), Some(1));
        }
        let report = s.to_prompt_report(100);
        assert!(report.contains("50. P: para 49"));
        assert!(!report.contains("51. P:"));
        assert!(report.contains("... and 10 more elements"));
    }

    #[test]
    fn thousands_grouping() {
        assert_eq!(group_thousands(999), "999");
        assert_eq!(group_thousands(15_000), "15,000");
        assert_eq!(group_thousands(1_234_567), "1,234,567");
    }
}
