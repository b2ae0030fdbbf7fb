//! Structure extraction: uploaded PDF → [`DocumentStructure`].
//!
//! Two readers run over the same file:
//!
//! 1. **pdfium** supplies what is *on the page*: page count, document
//!    properties, the plain text, and every text run with its font size and
//!    position. Runs are grouped into blocks, and blocks set in a larger
//!    font than the body text become headings. Image objects become figures.
//! 2. **lopdf** supplies what assistive technology *reads*: the tag tree,
//!    `/Lang` and `/Alt` (see [`super::tags`]).
//!
//! When the document is tagged and the tree yields elements, those elements
//! are reported as-is, since they are what a screen reader announces.
//! Otherwise the layout inference stands in, and the report says so.
//!
//! ## Why spawn_blocking?
//!
//! pdfium is a C++ library with thread-local state and lopdf parsing is
//! CPU-bound. [`extract_scoped`] runs both on the blocking pool so the SSE
//! tasks of other requests keep moving.

use super::tags::{read_logical_structure, LogicalStructure, TaggedItem};
use super::upload::ScopedUpload;
use crate::error::ExtractionError;
use crate::structure::{DocumentMetadata, DocumentStructure, ElementKind, ImageInfo, StructureSource};
use once_cell::sync::Lazy;
use pdfium_render::prelude::*;
use regex::Regex;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A heading font must be at least this much larger than the body font.
const HEADING_SIZE_RATIO: f32 = 1.15;
/// Blocks longer than this are never headings, whatever their size.
const MAX_HEADING_CHARS: usize = 200;
/// Lines further apart than this many font sizes start a new block.
const BLOCK_GAP_RATIO: f32 = 1.8;

static LIST_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?:[•◦▪▫‣⁃●○■\-\*–]|\(?\d{1,3}[.)]|\(?[a-zA-Z][.)]|\(?[ivxlc]{1,5}[.)])\s+").unwrap()
});

/// Turns a PDF on disk into a [`DocumentStructure`].
///
/// Blocking. The service holds one behind an `Arc` and calls it through
/// [`extract_scoped`]; tests substitute their own.
pub trait StructureExtractor: Send + Sync {
    /// `filename` is the name the client uploaded, used in the report.
    fn extract(&self, path: &Path, filename: &str) -> Result<DocumentStructure, ExtractionError>;
}

/// Run `extractor` on the blocking pool, then delete the upload.
///
/// The upload is released inside the blocking task on every path, so the
/// temporary file is gone before the result is observed.
pub async fn extract_scoped(
    extractor: Arc<dyn StructureExtractor>,
    upload: ScopedUpload,
) -> Result<DocumentStructure, ExtractionError> {
    tokio::task::spawn_blocking(move || {
        let result = extractor.extract(upload.path(), upload.original_name());
        upload.release();
        result
    })
    .await
    .map_err(|e| ExtractionError::Internal(format!("Extraction task failed: {}", e)))?
}

// ── pdfium + lopdf extractor ─────────────────────────────────────────────

/// The production extractor.
#[derive(Debug, Clone, Default)]
pub struct PdfiumExtractor {
    pdfium_lib_path: Option<PathBuf>,
}

impl PdfiumExtractor {
    /// `pdfium_lib_path` pins a specific library; `None` uses the
    /// pdfium-auto cache, downloading on first use.
    pub fn new(pdfium_lib_path: Option<PathBuf>) -> Self {
        Self { pdfium_lib_path }
    }

    fn bind(&self) -> Result<Pdfium, ExtractionError> {
        let bound = match &self.pdfium_lib_path {
            Some(path) => pdfium_auto::bind_pdfium_from_path(path),
            None => pdfium_auto::bind_pdfium_silent(),
        };
        bound.map_err(|e| ExtractionError::EngineUnavailable(e.to_string()))
    }
}

impl StructureExtractor for PdfiumExtractor {
    fn extract(&self, path: &Path, filename: &str) -> Result<DocumentStructure, ExtractionError> {
        check_signature(path)?;

        let pdfium = self.bind()?;
        let document = pdfium.load_pdf_from_file(path, None).map_err(|e| {
            let err_str = format!("{:?}", e);
            if err_str.contains("Password") || err_str.contains("password") {
                ExtractionError::PasswordRequired
            } else {
                ExtractionError::Corrupt { detail: err_str }
            }
        })?;

        let page_count = document.pages().len() as usize;
        info!(file = filename, pages = page_count, "PDF loaded");

        let properties = document.metadata();
        let get_meta = |tag: PdfDocumentMetadataTagType| -> Option<String> {
            properties.get(tag).and_then(|t| {
                let v = t.value().trim().to_string();
                if v.is_empty() {
                    None
                } else {
                    Some(v)
                }
            })
        };
        let metadata = DocumentMetadata {
            title: get_meta(PdfDocumentMetadataTagType::Title),
            author: get_meta(PdfDocumentMetadataTagType::Author),
            language: None,
            tagged: false,
        };

        let mut layouts = Vec::with_capacity(page_count);
        for (index, page) in document.pages().iter().enumerate() {
            layouts.push(read_page_layout(&page, index as u32 + 1));
        }

        let logical = match lopdf::Document::load(path) {
            Ok(doc) => read_logical_structure(&doc),
            Err(e) => {
                warn!(file = filename, error = %e, "Tag tree unreadable; using layout only");
                LogicalStructure::default()
            }
        };

        let structure = assemble(filename, page_count, metadata, &layouts, logical);
        debug!(
            file = filename,
            source = ?structure.source,
            headings = structure.headings.len(),
            paragraphs = structure.paragraphs.len(),
            tables = structure.tables.len(),
            images = structure.images.len(),
            "Structure extracted"
        );
        Ok(structure)
    }
}

/// Reject anything that does not start with `%PDF` before pdfium sees it.
fn check_signature(path: &Path) -> Result<(), ExtractionError> {
    let mut magic = Vec::with_capacity(5);
    std::fs::File::open(path)?.take(5).read_to_end(&mut magic)?;
    if magic.starts_with(b"%PDF") {
        Ok(())
    } else {
        Err(ExtractionError::NotAPdf { magic })
    }
}

fn read_page_layout(page: &PdfPage, page_no: u32) -> PageLayout {
    let mut layout = PageLayout {
        page: page_no,
        ..Default::default()
    };

    for object in page.objects().iter() {
        if object.object_type() == PdfPageObjectType::Image {
            layout.image_count += 1;
            continue;
        }
        let Some(text_object) = object.as_text_object() else {
            continue;
        };
        let text = text_object.text();
        if text.trim().is_empty() {
            continue;
        }
        let Ok(bounds) = object.bounds() else {
            continue;
        };
        layout.runs.push(TextRun {
            text,
            font_size: text_object.scaled_font_size().value,
            top: bounds.top().value,
            left: bounds.left().value,
        });
    }

    match page.text() {
        Ok(text) => layout.text = text.all(),
        Err(e) => warn!(page = page_no, error = ?e, "Page text unavailable"),
    }
    layout
}

// ── Layout inference ─────────────────────────────────────────────────────

/// One pdfium text object, in PDF user space (y grows upwards).
#[derive(Debug, Clone, PartialEq)]
pub struct TextRun {
    pub text: String,
    pub font_size: f32,
    pub top: f32,
    pub left: f32,
}

/// Everything the layout pass needs from one page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PageLayout {
    /// 1-based page number.
    pub page: u32,
    pub runs: Vec<TextRun>,
    pub image_count: usize,
    /// Plain page text in pdfium's reading order.
    pub text: String,
}

/// A run of lines sharing one font size.
#[derive(Debug, Clone, PartialEq)]
struct Block {
    page: u32,
    size: f32,
    text: String,
}

/// Combine page layouts and the tag tree into the final structure.
pub fn assemble(
    filename: &str,
    page_count: usize,
    mut metadata: DocumentMetadata,
    layouts: &[PageLayout],
    logical: LogicalStructure,
) -> DocumentStructure {
    metadata.language = logical.language.clone();
    metadata.tagged = logical.tagged;
    if metadata.title.is_none() {
        metadata.title = logical.title.clone();
    }

    let mut structure = if logical.tagged && !logical.items.is_empty() {
        from_tags(filename, page_count, logical.items)
    } else {
        if logical.tagged {
            debug!(file = filename, "Tag tree is empty; inferring structure from layout");
        }
        infer_from_layout(filename, page_count, layouts)
    };

    structure.metadata = metadata;
    structure.text = layouts
        .iter()
        .filter(|l| !l.text.trim().is_empty())
        .map(|l| format!("[Page {}]\n{}", l.page, l.text.trim()))
        .collect::<Vec<_>>()
        .join("\n\n");
    structure
}

fn from_tags(filename: &str, page_count: usize, items: Vec<TaggedItem>) -> DocumentStructure {
    let mut s = DocumentStructure::new(filename, page_count);
    s.source = StructureSource::Tagged;
    for item in items {
        match item {
            TaggedItem::Heading {
                level,
                text,
                page,
                is_title,
            } => {
                let kind = if is_title {
                    ElementKind::Title
                } else {
                    ElementKind::Heading
                };
                s.push_heading(kind, &text, level, page);
            }
            TaggedItem::Paragraph { text, page } => s.push_paragraph(&text, page),
            TaggedItem::ListItem { text, page } => s.push_list_item(&text, page),
            TaggedItem::Table(table) => s.push_table(table),
            TaggedItem::Figure(image) => s.push_image(image),
        }
    }
    s
}

/// Infer headings, paragraphs and list items from font sizes.
pub fn infer_from_layout(filename: &str, page_count: usize, layouts: &[PageLayout]) -> DocumentStructure {
    let mut s = DocumentStructure::new(filename, page_count);
    s.source = StructureSource::Layout;

    let blocks: Vec<Block> = layouts.iter().flat_map(page_blocks).collect();
    let body = body_size(&blocks);
    let levels = heading_levels(&blocks, body);

    let mut title_seen = false;
    let mut next_block = blocks.iter().peekable();
    for layout in layouts {
        while let Some(block) = next_block.next_if(|b| b.page == layout.page) {
            let level = levels.get(&size_key(block.size)).copied();
            match level {
                Some(level) if block.text.chars().count() <= MAX_HEADING_CHARS => {
                    let kind = if level == 1 && block.page == 1 && !title_seen {
                        title_seen = true;
                        ElementKind::Title
                    } else {
                        ElementKind::Heading
                    };
                    s.push_heading(kind, &block.text, level, Some(block.page));
                }
                _ if LIST_MARKER.is_match(&block.text) => {
                    s.push_list_item(&block.text, Some(block.page))
                }
                _ => s.push_paragraph(&block.text, Some(block.page)),
            }
        }
        for _ in 0..layout.image_count {
            s.push_image(ImageInfo {
                page: Some(layout.page),
                has_alt_text: false,
                alt_text: None,
            });
        }
    }
    s
}

/// Group a page's runs into lines (shared baseline), then lines into blocks.
fn page_blocks(layout: &PageLayout) -> Vec<Block> {
    let mut runs: Vec<&TextRun> = layout.runs.iter().collect();
    runs.sort_by(|a, b| b.top.total_cmp(&a.top).then(a.left.total_cmp(&b.left)));

    // (top, size, runs)
    let mut lines: Vec<(f32, f32, Vec<&TextRun>)> = Vec::new();
    for run in runs {
        let tolerance = (run.font_size * 0.5).max(1.0);
        match lines.last_mut() {
            Some((top, size, members)) if (*top - run.top).abs() <= tolerance => {
                members.push(run);
                *size = size.max(run.font_size);
            }
            _ => lines.push((run.top, run.font_size, vec![run])),
        }
    }

    let mut blocks: Vec<Block> = Vec::new();
    let mut prev_top: Option<f32> = None;
    for (top, size, mut members) in lines {
        members.sort_by(|a, b| a.left.total_cmp(&b.left));
        let joined = members
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        let text = collapse_whitespace(&joined);
        if text.is_empty() {
            continue;
        }
        let continues = match (blocks.last(), prev_top) {
            (Some(last), Some(prev)) => {
                size_key(last.size) == size_key(size) && prev - top <= size * BLOCK_GAP_RATIO
            }
            _ => false,
        };
        // A list marker always opens a new block.
        if continues && !LIST_MARKER.is_match(&text) {
            if let Some(last) = blocks.last_mut() {
                last.text.push(' ');
                last.text.push_str(&text);
            }
        } else {
            blocks.push(Block {
                page: layout.page,
                size,
                text,
            });
        }
        prev_top = Some(top);
    }
    blocks
}

/// Font sizes compare at half-point granularity.
fn size_key(size: f32) -> i32 {
    (size * 2.0).round() as i32
}

/// The size carrying the most characters.
fn body_size(blocks: &[Block]) -> f32 {
    let mut chars: BTreeMap<i32, usize> = BTreeMap::new();
    for b in blocks {
        *chars.entry(size_key(b.size)).or_default() += b.text.chars().count();
    }
    chars
        .into_iter()
        .max_by_key(|&(key, count)| (count, -key))
        .map(|(key, _)| key as f32 / 2.0)
        .unwrap_or(0.0)
}

/// Map each heading-sized font to a level, largest first.
fn heading_levels(blocks: &[Block], body: f32) -> BTreeMap<i32, u8> {
    let threshold = body * HEADING_SIZE_RATIO;
    let mut sizes: Vec<i32> = blocks
        .iter()
        .filter(|b| body > 0.0 && b.size >= threshold)
        .map(|b| size_key(b.size))
        .collect();
    sizes.sort_unstable_by(|a, b| b.cmp(a));
    sizes.dedup();
    sizes
        .into_iter()
        .enumerate()
        .map(|(i, key)| (key, (i + 1).min(6) as u8))
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::structure::TableInfo;

    fn run(text: &str, size: f32, top: f32, left: f32) -> TextRun {
        TextRun {
            text: text.into(),
            font_size: size,
            top,
            left,
        }
    }

    fn page(no: u32, runs: Vec<TextRun>) -> PageLayout {
        PageLayout {
            page: no,
            runs,
            image_count: 0,
            text: String::new(),
        }
    }

    #[test]
    fn font_sizes_become_heading_levels() {
        let layouts = vec![
            page(
                1,
                vec![
                    run("A Study of Things", 24.0, 700.0, 72.0),
                    run("Chapter 1", 18.0, 650.0, 72.0),
                    run("This is the body text of the first chapter and", 12.0, 620.0, 72.0),
                    run("it continues on the next line.", 12.0, 606.0, 72.0),
                ],
            ),
            page(
                2,
                vec![
                    run("1.1 Background", 14.0, 700.0, 72.0),
                    run("More body text that is long enough to dominate.", 12.0, 680.0, 72.0),
                ],
            ),
        ];
        let s = infer_from_layout("t.pdf", 2, &layouts);
        assert_eq!(s.source, StructureSource::Layout);

        let headings: Vec<_> = s
            .headings
            .iter()
            .map(|h| (h.kind, h.text.as_str(), h.level, h.page))
            .collect();
        assert_eq!(
            headings,
            vec![
                (ElementKind::Title, "A Study of Things", 1, Some(1)),
                (ElementKind::Heading, "Chapter 1", 2, Some(1)),
                (ElementKind::Heading, "1.1 Background", 3, Some(2)),
            ]
        );
        assert_eq!(s.paragraphs.len(), 2);
        assert_eq!(
            s.paragraphs[0].text,
            "This is the body text of the first chapter and it continues on the next line."
        );
    }

    #[test]
    fn runs_on_one_baseline_join_left_to_right() {
        let layouts = vec![page(
            1,
            vec![
                run("world", 12.0, 500.2, 120.0),
                run("Hello", 12.0, 500.0, 72.0),
            ],
        )];
        let s = infer_from_layout("t.pdf", 1, &layouts);
        assert_eq!(s.paragraphs[0].text, "Hello world");
    }

    #[test]
    fn list_markers_start_list_items() {
        let layouts = vec![page(
            1,
            vec![
                run("Requirements:", 12.0, 700.0, 72.0),
                run("• first item", 12.0, 686.0, 80.0),
                run("2. second item", 12.0, 672.0, 80.0),
                run("(a) third item", 12.0, 658.0, 80.0),
            ],
        )];
        let s = infer_from_layout("t.pdf", 1, &layouts);
        let items: Vec<_> = s.list_items.iter().map(|i| i.text.as_str()).collect();
        assert_eq!(items, vec!["• first item", "2. second item", "(a) third item"]);
        assert_eq!(s.paragraphs.len(), 1);
    }

    #[test]
    fn large_but_long_blocks_stay_paragraphs() {
        let long = "word ".repeat(60);
        let layouts = vec![page(
            1,
            vec![
                run(&long, 16.0, 700.0, 72.0),
                run(&"body ".repeat(100), 12.0, 600.0, 72.0),
            ],
        )];
        let s = infer_from_layout("t.pdf", 1, &layouts);
        assert!(s.headings.is_empty());
        assert_eq!(s.paragraphs.len(), 2);
    }

    #[test]
    fn layout_images_have_no_alt_text() {
        let mut p = page(3, vec![run("Body", 12.0, 700.0, 72.0)]);
        p.image_count = 2;
        let s = infer_from_layout("t.pdf", 3, &[p]);
        assert_eq!(s.images.len(), 2);
        assert!(s.images.iter().all(|i| !i.has_alt_text && i.page == Some(3)));
        assert_eq!(s.reading_order.last().map(String::as_str), Some("FIGURE: (no alt text)"));
    }

    #[test]
    fn tagged_items_win_over_layout() {
        let layouts = vec![PageLayout {
            page: 1,
            runs: vec![run("Big", 30.0, 700.0, 72.0), run("small body", 10.0, 600.0, 72.0)],
            image_count: 1,
            text: "Big\nsmall body".into(),
        }];
        let logical = LogicalStructure {
            language: Some("en-US".into()),
            title: Some("Tagged Title".into()),
            tagged: true,
            marked: true,
            items: vec![
                TaggedItem::Heading {
                    level: 1,
                    text: "Introduction".into(),
                    page: Some(1),
                    is_title: false,
                },
                TaggedItem::Table(TableInfo {
                    rows: 3,
                    cols: 2,
                    has_header: true,
                    page: Some(1),
                }),
                TaggedItem::Figure(ImageInfo {
                    page: Some(1),
                    has_alt_text: true,
                    alt_text: Some("Bar chart".into()),
                }),
            ],
        };
        let s = assemble("t.pdf", 1, DocumentMetadata::default(), &layouts, logical);
        assert_eq!(s.source, StructureSource::Tagged);
        assert_eq!(s.headings.len(), 1);
        assert_eq!(s.headings[0].text, "Introduction");
        assert_eq!(s.tables.len(), 1);
        assert_eq!(s.images.len(), 1);
        assert!(s.images[0].has_alt_text);
        assert_eq!(s.metadata.language.as_deref(), Some("en-US"));
        assert_eq!(s.metadata.title.as_deref(), Some("Tagged Title"));
        assert!(s.metadata.tagged);
        assert_eq!(s.text, "[Page 1]\nBig\nsmall body");
    }

    #[test]
    fn empty_tag_tree_falls_back_to_layout() {
        let layouts = vec![page(1, vec![run("Only text", 12.0, 700.0, 72.0)])];
        let logical = LogicalStructure {
            tagged: true,
            ..Default::default()
        };
        let metadata = DocumentMetadata {
            title: Some("From Info".into()),
            ..Default::default()
        };
        let s = assemble("t.pdf", 1, metadata, &layouts, logical);
        assert_eq!(s.source, StructureSource::Layout);
        assert!(s.metadata.tagged);
        assert_eq!(s.metadata.title.as_deref(), Some("From Info"));
        assert_eq!(s.paragraphs.len(), 1);
    }

    #[test]
    fn rejects_files_without_pdf_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fake.pdf");
        std::fs::write(&path, b"PK\x03\x04 not a pdf").unwrap();
        let err = PdfiumExtractor::default().extract(&path, "fake.pdf").unwrap_err();
        assert!(matches!(err, ExtractionError::NotAPdf { ref magic } if magic == b"PK\x03\x04 "));
    }

    struct FixedExtractor;

    impl StructureExtractor for FixedExtractor {
        fn extract(&self, path: &Path, filename: &str) -> Result<DocumentStructure, ExtractionError> {
            assert!(path.exists());
            Ok(DocumentStructure::new(filename, 1))
        }
    }

    #[tokio::test]
    async fn extract_scoped_releases_upload() {
        let dir = tempfile::tempdir().unwrap();
        let upload = ScopedUpload::persist(b"%PDF-1.7", "doc.pdf", Some(dir.path())).unwrap();
        let s = extract_scoped(Arc::new(FixedExtractor), upload).await.unwrap();
        assert_eq!(s.filename, "doc.pdf");
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
