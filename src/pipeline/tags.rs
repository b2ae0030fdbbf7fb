//! Logical structure reader: the PDF tag tree as assistive technology sees it.
//!
//! pdfium-render exposes page layout but not the structure tree, so this
//! stage reads the document with lopdf and walks `/StructTreeRoot`
//! depth-first in document order:
//!
//! | Tag | Becomes |
//! |-----|---------|
//! | `H1`–`H6`, `H`, `Title` | heading (level from the tag, or section depth for `H`) |
//! | `P` | paragraph |
//! | `LI` | list item |
//! | `Table` | table: `TR` count, widest row, `TH` presence |
//! | `Figure` | image with its `/Alt` text |
//! | anything else | container, children walked |
//!
//! Custom tags are mapped through the tree's `/RoleMap` first. Element text
//! is `/ActualText` when present, otherwise the marked-content text the
//! element's MCIDs point at on its page.
//!
//! Everything here is best effort: a broken tree yields fewer items, never
//! an error the client sees. The extractor falls back to layout inference
//! when no items come back.

use crate::structure::{ImageInfo, TableInfo};
use lopdf::{Dictionary, Document, Encoding, Object, ObjectId};
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// Struct elements nested deeper than this are ignored.
const MAX_DEPTH: usize = 64;
/// Role-map indirections followed before giving up.
const MAX_ROLE_HOPS: usize = 8;

/// One element of the tag tree, in document order.
#[derive(Debug, Clone, PartialEq)]
pub enum TaggedItem {
    Heading {
        level: u8,
        text: String,
        page: Option<u32>,
        is_title: bool,
    },
    Paragraph { text: String, page: Option<u32> },
    ListItem { text: String, page: Option<u32> },
    Table(TableInfo),
    Figure(ImageInfo),
}

/// Document-level facts plus the tagged items.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogicalStructure {
    /// Catalog `/Lang`.
    pub language: Option<String>,
    /// `/Title` from the trailer's `/Info` dictionary.
    pub title: Option<String>,
    /// The catalog has a `/StructTreeRoot`.
    pub tagged: bool,
    /// `/MarkInfo << /Marked true >>`.
    pub marked: bool,
    pub items: Vec<TaggedItem>,
}

/// Read language, title and tag tree from a loaded document.
pub fn read_logical_structure(doc: &Document) -> LogicalStructure {
    let mut out = LogicalStructure {
        title: info_string(doc, b"Title"),
        ..Default::default()
    };

    let catalog = match doc.catalog() {
        Ok(c) => c,
        Err(e) => {
            warn!("PDF catalog unreadable, skipping tag tree: {e}");
            return out;
        }
    };

    out.language = catalog
        .get(b"Lang")
        .ok()
        .and_then(|o| text_of(doc, o))
        .filter(|l| !l.trim().is_empty());
    out.marked = deref_dict(doc, catalog.get(b"MarkInfo").ok())
        .and_then(|mi| mi.get(b"Marked").ok())
        .and_then(|m| m.as_bool().ok())
        .unwrap_or(false);

    let Some(root) = deref_dict(doc, catalog.get(b"StructTreeRoot").ok()) else {
        debug!("No StructTreeRoot: untagged PDF");
        return out;
    };
    out.tagged = true;

    let mut walker = Walker::new(doc, root);
    if let Ok(kids) = root.get(b"K") {
        walker.walk_kids(kids, None, 0, 0);
    }
    out.items = walker.items;
    debug!(items = out.items.len(), "Tag tree read");
    out
}

// ── Tree walk ────────────────────────────────────────────────────────────

struct Walker<'a> {
    doc: &'a Document,
    role_map: Option<&'a Dictionary>,
    page_numbers: HashMap<ObjectId, u32>,
    marked_text: HashMap<ObjectId, HashMap<i64, String>>,
    visited: HashSet<ObjectId>,
    items: Vec<TaggedItem>,
}

impl<'a> Walker<'a> {
    fn new(doc: &'a Document, root: &'a Dictionary) -> Self {
        Self {
            doc,
            role_map: deref_dict(doc, root.get(b"RoleMap").ok()),
            page_numbers: doc.get_pages().into_iter().map(|(n, id)| (id, n)).collect(),
            marked_text: HashMap::new(),
            visited: HashSet::new(),
            items: Vec::new(),
        }
    }

    fn walk_kids(&mut self, kids: &'a Object, page: Option<ObjectId>, depth: usize, section: u8) {
        match kids {
            Object::Array(arr) => {
                for kid in arr {
                    self.walk_node(kid, page, depth, section);
                }
            }
            other => self.walk_node(other, page, depth, section),
        }
    }

    fn walk_node(&mut self, node: &'a Object, page: Option<ObjectId>, depth: usize, section: u8) {
        if depth > MAX_DEPTH {
            warn!("Tag tree deeper than {MAX_DEPTH} levels, truncating");
            return;
        }
        let Some(elem) = self.struct_elem(node) else {
            return;
        };
        let page = elem
            .get(b"Pg")
            .ok()
            .and_then(|p| p.as_reference().ok())
            .or(page);
        let role = self.resolve_role(elem);
        let page_no = self.page_no(page);

        match role.as_str() {
            "Title" => {
                let text = self.element_text(elem, page);
                self.items.push(TaggedItem::Heading {
                    level: 1,
                    text,
                    page: page_no,
                    is_title: true,
                });
            }
            "H" | "H1" | "H2" | "H3" | "H4" | "H5" | "H6" => {
                let level = role[1..].parse::<u8>().unwrap_or(section.max(1));
                let text = self.element_text(elem, page);
                self.items.push(TaggedItem::Heading {
                    level,
                    text,
                    page: page_no,
                    is_title: false,
                });
            }
            "P" => {
                let text = self.element_text(elem, page);
                if !text.is_empty() {
                    self.items.push(TaggedItem::Paragraph {
                        text,
                        page: page_no,
                    });
                }
            }
            "LI" => {
                let text = self.element_text(elem, page);
                self.items.push(TaggedItem::ListItem {
                    text,
                    page: page_no,
                });
            }
            "Table" => {
                let mut shape = TableShape::default();
                self.measure_table(elem, depth, &mut shape);
                self.items.push(TaggedItem::Table(TableInfo {
                    rows: shape.rows,
                    cols: shape.cols,
                    has_header: shape.has_header,
                    page: page_no,
                }));
            }
            "Figure" => {
                let alt = elem
                    .get(b"Alt")
                    .ok()
                    .and_then(|a| text_of(self.doc, a))
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty());
                self.items.push(TaggedItem::Figure(ImageInfo {
                    page: page_no,
                    has_alt_text: alt.is_some(),
                    alt_text: alt,
                }));
            }
            container => {
                let section = if matches!(container, "Sect" | "Part" | "Chapter") {
                    section.saturating_add(1)
                } else {
                    section
                };
                if let Ok(kids) = elem.get(b"K") {
                    self.walk_kids(kids, page, depth + 1, section);
                }
            }
        }
    }

    /// Dereference `node` to a struct element, once per object.
    ///
    /// Integers (MCIDs) and `MCR`/`OBJR` references are content, not elements.
    fn struct_elem(&mut self, node: &'a Object) -> Option<&'a Dictionary> {
        let (id, obj) = self.doc.dereference(node).ok()?;
        if let Some(id) = id {
            if !self.visited.insert(id) {
                warn!(?id, "Tag tree cycle detected");
                return None;
            }
        }
        let dict = obj.as_dict().ok()?;
        match dict.get(b"Type").and_then(Object::as_name) {
            Ok(b"MCR") | Ok(b"OBJR") => None,
            _ if dict.has(b"S") => Some(dict),
            _ => None,
        }
    }

    fn resolve_role(&self, elem: &Dictionary) -> String {
        let mut role = elem
            .get(b"S")
            .and_then(Object::as_name)
            .map(|n| String::from_utf8_lossy(n).into_owned())
            .unwrap_or_default();
        for _ in 0..MAX_ROLE_HOPS {
            if is_standard_role(&role) {
                break;
            }
            let mapped = self
                .role_map
                .and_then(|rm| rm.get(role.as_bytes()).ok())
                .and_then(|o| o.as_name().ok())
                .map(|n| String::from_utf8_lossy(n).into_owned());
            match mapped {
                Some(next) if next != role => role = next,
                _ => break,
            }
        }
        role
    }

    fn measure_table(&mut self, elem: &'a Dictionary, depth: usize, shape: &mut TableShape) {
        let Ok(kids) = elem.get(b"K") else {
            return;
        };
        let kids: Vec<&'a Object> = match kids {
            Object::Array(arr) => arr.iter().collect(),
            other => vec![other],
        };
        for kid in kids {
            if depth > MAX_DEPTH {
                return;
            }
            let Some(child) = self.struct_elem(kid) else {
                continue;
            };
            match self.resolve_role(child).as_str() {
                "TR" => {
                    shape.rows += 1;
                    let mut cells = 0;
                    if let Ok(row_kids) = child.get(b"K") {
                        let row_kids: Vec<&'a Object> = match row_kids {
                            Object::Array(arr) => arr.iter().collect(),
                            other => vec![other],
                        };
                        for cell in row_kids {
                            let Some(cell) = self.struct_elem(cell) else {
                                continue;
                            };
                            match self.resolve_role(cell).as_str() {
                                "TH" => {
                                    cells += 1;
                                    shape.has_header = true;
                                }
                                "TD" => cells += 1,
                                _ => {}
                            }
                        }
                    }
                    shape.cols = shape.cols.max(cells);
                }
                // THead / TBody / TFoot
                _ => self.measure_table(child, depth + 1, shape),
            }
        }
    }

    fn page_no(&self, page: Option<ObjectId>) -> Option<u32> {
        page.and_then(|id| self.page_numbers.get(&id).copied())
    }

    /// `/ActualText`, else marked-content text, else `/Alt`, else `/T`.
    fn element_text(&mut self, elem: &'a Dictionary, page: Option<ObjectId>) -> String {
        if let Some(t) = elem.get(b"ActualText").ok().and_then(|o| text_of(self.doc, o)) {
            return normalise(&t);
        }
        let mut parts = Vec::new();
        let mut seen = HashSet::new();
        self.collect_marked_text(elem, page, 0, &mut parts, &mut seen);
        let text = normalise(&parts.join(" "));
        if !text.is_empty() {
            return text;
        }
        [b"Alt".as_slice(), b"T".as_slice()]
            .iter()
            .find_map(|k| elem.get(k).ok().and_then(|o| text_of(self.doc, o)))
            .map(|t| normalise(&t))
            .unwrap_or_default()
    }

    fn collect_marked_text(
        &mut self,
        elem: &'a Dictionary,
        page: Option<ObjectId>,
        depth: usize,
        parts: &mut Vec<String>,
        seen: &mut HashSet<ObjectId>,
    ) {
        if depth > MAX_DEPTH {
            return;
        }
        let Ok(kids) = elem.get(b"K") else {
            return;
        };
        let kids: Vec<&'a Object> = match kids {
            Object::Array(arr) => arr.iter().collect(),
            other => vec![other],
        };
        for kid in kids {
            match kid {
                Object::Integer(mcid) => {
                    if let Some(t) = self.mcid_text(page, *mcid) {
                        parts.push(t);
                    }
                }
                _ => {
                    let Ok((id, obj)) = self.doc.dereference(kid) else {
                        continue;
                    };
                    if let Some(id) = id {
                        if !seen.insert(id) {
                            continue;
                        }
                    }
                    let Ok(dict) = obj.as_dict() else {
                        continue;
                    };
                    let kid_page = dict
                        .get(b"Pg")
                        .ok()
                        .and_then(|p| p.as_reference().ok())
                        .or(page);
                    match dict.get(b"Type").and_then(Object::as_name) {
                        Ok(b"MCR") => {
                            if let Ok(mcid) = dict.get(b"MCID").and_then(Object::as_i64) {
                                if let Some(t) = self.mcid_text(kid_page, mcid) {
                                    parts.push(t);
                                }
                            }
                        }
                        Ok(b"OBJR") => {}
                        _ => {
                            if let Some(t) = dict.get(b"ActualText").ok().and_then(|o| text_of(self.doc, o)) {
                                parts.push(t);
                            } else {
                                self.collect_marked_text(dict, kid_page, depth + 1, parts, seen);
                            }
                        }
                    }
                }
            }
        }
    }

    fn mcid_text(&mut self, page: Option<ObjectId>, mcid: i64) -> Option<String> {
        let page = page?;
        if !self.marked_text.contains_key(&page) {
            let map = marked_content_text(self.doc, page);
            self.marked_text.insert(page, map);
        }
        self.marked_text
            .get(&page)
            .and_then(|m| m.get(&mcid))
            .cloned()
    }
}

#[derive(Debug, Default)]
struct TableShape {
    rows: usize,
    cols: usize,
    has_header: bool,
}

fn is_standard_role(role: &str) -> bool {
    matches!(
        role,
        "Document" | "Part" | "Art" | "Sect" | "Div" | "BlockQuote" | "Caption" | "TOC" | "TOCI"
            | "Index" | "NonStruct" | "Private" | "Title" | "H" | "H1" | "H2" | "H3" | "H4" | "H5"
            | "H6" | "P" | "L" | "LI" | "Lbl" | "LBody" | "Table" | "TR" | "TH" | "TD" | "THead"
            | "TBody" | "TFoot" | "Span" | "Quote" | "Note" | "Reference" | "BibEntry" | "Code"
            | "Link" | "Annot" | "Figure" | "Formula" | "Form"
    )
}

// ── Marked content ───────────────────────────────────────────────────────

/// Map each MCID on a page to the text shown inside its marked-content
/// sequence.
pub fn marked_content_text(doc: &Document, page_id: ObjectId) -> HashMap<i64, String> {
    let mut out: HashMap<i64, String> = HashMap::new();
    let content = match doc.get_and_decode_page_content(page_id) {
        Ok(c) => c,
        Err(e) => {
            debug!(?page_id, "Page content undecodable: {e}");
            return out;
        }
    };
    let fonts = doc.get_page_fonts(page_id).unwrap_or_default();
    let properties = page_properties(doc, page_id);
    let mut encodings: HashMap<Vec<u8>, Option<Encoding<'_>>> = HashMap::new();
    let mut current_font: Option<Vec<u8>> = None;
    let mut stack: Vec<Option<i64>> = Vec::new();

    for op in &content.operations {
        match op.operator.as_str() {
            "BDC" => {
                let mcid = op.operands.get(1).and_then(|props| match props {
                    Object::Dictionary(d) => d.get(b"MCID").and_then(Object::as_i64).ok(),
                    Object::Name(name) => properties
                        .and_then(|p| deref_dict(doc, p.get(name).ok()))
                        .and_then(|d| d.get(b"MCID").and_then(Object::as_i64).ok()),
                    _ => None,
                });
                stack.push(mcid);
            }
            "BMC" => stack.push(None),
            "EMC" => {
                stack.pop();
            }
            "Tf" => {
                current_font = op
                    .operands
                    .first()
                    .and_then(|o| o.as_name().ok())
                    .map(<[u8]>::to_vec);
            }
            "Tj" | "'" | "\"" | "TJ" => {
                let Some(mcid) = stack.iter().rev().find_map(|m| *m) else {
                    continue;
                };
                if let Some(name) = current_font.as_ref() {
                    if !encodings.contains_key(name) {
                        let enc = fonts
                            .get(name)
                            .filter(|f| f.type_is(b"Font"))
                            .and_then(|f| f.get_font_encoding(doc).ok());
                        encodings.insert(name.clone(), enc);
                    }
                }
                let encoding = current_font
                    .as_ref()
                    .and_then(|name| encodings.get(name))
                    .and_then(Option::as_ref);
                let mut text = String::new();
                for operand in &op.operands {
                    show_text(operand, encoding, &mut text);
                }
                let entry = out.entry(mcid).or_default();
                if !entry.is_empty() && matches!(op.operator.as_str(), "'" | "\"") {
                    entry.push(' ');
                }
                entry.push_str(&text);
            }
            "Td" | "TD" | "T*" => {
                if let Some(mcid) = stack.iter().rev().find_map(|m| *m) {
                    if let Some(entry) = out.get_mut(&mcid) {
                        if !entry.ends_with(' ') && !entry.is_empty() {
                            entry.push(' ');
                        }
                    }
                }
            }
            _ => {}
        }
    }

    for text in out.values_mut() {
        *text = normalise(text);
    }
    out
}

fn show_text(operand: &Object, encoding: Option<&Encoding<'_>>, out: &mut String) {
    match operand {
        Object::String(bytes, _) => {
            let decoded = encoding
                .and_then(|e| Document::decode_text(e, bytes).ok())
                .unwrap_or_else(|| String::from_utf8_lossy(bytes).into_owned());
            out.push_str(&decoded);
        }
        Object::Array(items) => {
            for item in items {
                match item {
                    // Large negative kerning is a word gap.
                    Object::Integer(i) if *i < -100 => out.push(' '),
                    Object::Real(r) if *r < -100.0 => out.push(' '),
                    other => show_text(other, encoding, out),
                }
            }
        }
        _ => {}
    }
}

fn page_properties(doc: &Document, page_id: ObjectId) -> Option<&Dictionary> {
    let page = doc.get_dictionary(page_id).ok()?;
    let resources = deref_dict(doc, page.get(b"Resources").ok())?;
    deref_dict(doc, resources.get(b"Properties").ok())
}

// ── Helpers ──────────────────────────────────────────────────────────────

fn deref_dict<'a>(doc: &'a Document, obj: Option<&'a Object>) -> Option<&'a Dictionary> {
    let (_, obj) = doc.dereference(obj?).ok()?;
    obj.as_dict().ok()
}

/// Decode a PDF text string (PDFDocEncoding or UTF-16BE with BOM).
fn text_of(doc: &Document, obj: &Object) -> Option<String> {
    let (_, obj) = doc.dereference(obj).ok()?;
    lopdf::decode_text_string(obj).ok()
}

fn info_string(doc: &Document, key: &[u8]) -> Option<String> {
    let info = deref_dict(doc, doc.trailer.get(b"Info").ok())?;
    info.get(key)
        .ok()
        .and_then(|o| text_of(doc, o))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn normalise(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}
