//! # edgequake-invoice
//!
//! Turn a scanned, multi-page business document (tax invoice, purchase
//! order, general-ledger voucher; Arabic, English, or both) into one
//! canonical JSON record ready for posting into an ERP backend.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF
//!  │
//!  ├─ 1. Input      resolve local file or download from URL
//!  ├─ 2. Render     rasterise the first N pages via pdfium (spawn_blocking)
//!  ├─ 3. Extract    concurrent vision calls: {document_type, data} per page
//!  ├─ 4. Classify   route each page to tax_invoice / purchase_order / gl_document
//!  ├─ 5. Merge      fold multi-page documents, concatenating line items
//!  ├─ 6. Transform  one text call → CanonicalInvoice, then deterministic rules
//!  └─ 7. Output     raw_extraction + final_output + stats
//! ```
//!
//! Per-page failures never abort the run; they are listed in
//! `raw_extraction.errors`. Only document-wide failures (no pages, every
//! page failed, transformation failed) return `Err`.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use edgequake_invoice::{extract_document, ExtractionConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Provider auto-detected from OPENAI_API_KEY / ANTHROPIC_API_KEY / GEMINI_API_KEY
//!     let config = ExtractionConfig::default();
//!     let output = extract_document("scan.pdf", &config).await?;
//!     println!("{}", serde_json::to_string_pretty(&output.final_output)?);
//!     eprintln!("{} page(s) failed", output.raw_extraction.errors.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `invoice2json` binary (clap + anyhow + tracing-subscriber) |

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod document;
pub mod error;
pub mod extract;
pub mod output;
pub mod pipeline;
pub mod posting;
pub mod progress;
pub mod prompts;
pub mod rules;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder};
pub use document::{CanonicalInvoice, DocumentType, LineItem, PageExtraction, PageImage};
pub use error::{PageError, PipelineError, PostingError};
pub use extract::{
    extract_and_post, extract_document, extract_from_bytes, extract_pages, extract_sync,
    extract_to_file,
};
pub use output::{ExtractionOutput, ExtractionStats, PipelineStage, RawExtraction};
pub use pipeline::llm::{ModelReply, ModelRequest, ModelService, ProviderService};
pub use pipeline::merge::{ConflictPolicy, PreferNonEmptyLonger};
pub use posting::{post_invoice, PostingConfig, PostingPayload, PostingReport};
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use rules::RuleTables;
