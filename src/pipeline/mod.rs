//! Pipeline stages for document-to-canonical-record extraction.
//!
//! Each submodule implements exactly one step, so each is independently
//! testable and replaceable.
//!
//! ## Data Flow
//!
//! ```text
//! input ──▶ render ──▶ encode ──▶ page ──▶ classify ──▶ merge ──▶ transform
//! (bytes)   (pdfium)   (base64)   (VLM)   (buckets)    (fold)    (LLM + rules)
//! ```
//!
//! 1. [`input`]     — read a local file or download a URL into memory
//! 2. [`render`]    — rasterise the first `max_pages` pages in `spawn_blocking`
//! 3. [`encode`]    — PNG-encode and base64-wrap each page image
//! 4. [`page`]      — one vision call per page, validated into a `PageExtraction`
//! 5. [`classify`]  — route each extraction to a canonical bucket
//! 6. [`merge`]     — fold each bucket's pages into one document
//! 7. [`transform`] — one text call per document, then [`postprocess`] rules
//!
//! [`llm`] holds the model-service seam plus retry and bounded-wait logic
//! shared by steps 4 and 7.

pub mod classify;
pub mod encode;
pub mod input;
pub mod llm;
pub mod merge;
pub mod page;
pub mod postprocess;
pub mod render;
pub mod transform;
