//! Pipeline stages for reviewing an uploaded PDF.
//!
//! Each submodule implements exactly one step, so each is testable on its
//! own and the extractor or the model backend can be swapped without
//! touching the others.
//!
//! ## Data Flow
//!
//! ```text
//! upload ──▶ extract ──▶ (report) ──▶ analysis ──▶ decode
//! (multipart) (pdfium+tags) (Markdown)  (LLM stream)  (findings)
//! ```
//!
//! 1. [`upload`]  validates the multipart request in memory, then persists
//!    the file to a temporary path that is removed on every exit
//! 2. [`extract`] reads layout with pdfium and tags with lopdf; runs in
//!    `spawn_blocking` because neither is async
//! 3. [`tags`]    walks the PDF structure tree for [`extract`]
//! 4. [`decode`]  turns streamed model text into findings line by line
//!
//! The orchestration that strings these together and emits SSE events lives
//! in [`crate::stream`].

pub mod decode;
pub mod extract;
pub mod tags;
pub mod upload;
