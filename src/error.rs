//! Error types for the edgequake-invoice library.
//!
//! Three error types reflect three distinct failure modes:
//!
//! * [`PipelineError`] — **Fatal**: the document cannot produce a canonical
//!   record at all (document cannot be opened, no pages, provider not
//!   configured, transformation failed). Returned as `Err(PipelineError)`
//!   from the top-level `extract*` functions.
//!
//! * [`PageError`] — **Non-fatal**: a single page failed extraction (API
//!   error, timeout, malformed JSON) but its siblings are fine. Recorded in
//!   [`crate::output::RawExtraction::errors`] next to the successful buckets.
//!
//! * [`PostingError`] — **Reported**: the downstream posting handshake
//!   failed. Folded into a [`crate::posting::PostingReport`] and never
//!   escalated, because the extraction result is already complete.

use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the edgequake-invoice library.
///
/// Page-level failures use [`PageError`] and are stored in the raw
/// extraction rather than propagated here.
#[derive(Debug, Error)]
pub enum PipelineError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The input string is not a valid file path or URL.
    #[error("Invalid input '{input}': not a file path or a valid HTTP/HTTPS URL")]
    InvalidInput { input: String },

    /// HTTP URL was syntactically valid but download failed.
    #[error("Failed to download '{url}': {reason}\nCheck your internet connection.")]
    DownloadFailed { url: String, reason: String },

    /// Download exceeded the configured timeout.
    #[error("Download timed out after {secs}s for '{url}'\nIncrease --download-timeout.")]
    DownloadTimeout { url: String, secs: u64 },

    /// The bytes were read, but they are not a PDF.
    #[error("Input is not a valid PDF: '{source_name}'\nFirst bytes: {magic:?}")]
    NotAPdf { source_name: String, magic: [u8; 4] },

    // ── Rasterisation errors ──────────────────────────────────────────────
    /// pdfium could not open the document.
    #[error("Failed to open document: {detail}")]
    DocumentOpenFailed { detail: String },

    /// PDF requires a password but none was provided.
    #[error("Document is encrypted and requires a password.\nProvide it with --password <PASSWORD>.")]
    PasswordRequired,

    /// A password was provided but it is wrong.
    #[error("Wrong password for encrypted document")]
    WrongPassword,

    /// The document opened but not a single page could be rasterised.
    #[error("No pages could be rasterised from the document")]
    NoPages,

    /// The configured provider is not initialised (missing API key etc.).
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Transformation errors ─────────────────────────────────────────────
    /// The text-transformation service returned an error after all retries.
    #[error("Transformation failed after {retries} retries: {detail}")]
    TransformFailed { retries: u32, detail: String },

    /// The text-transformation call exceeded its bounded wait.
    #[error("Transformation timed out after {secs}s")]
    TransformTimeout { secs: u64 },

    /// The service answered, but not with a single JSON object of the
    /// expected shape.
    #[error("Transformation returned malformed output: {detail}")]
    TransformMalformed { detail: String },

    // ── I/O errors ────────────────────────────────────────────────────────
    /// Could not create or write the output JSON file.
    #[error("Failed to write output file '{path}': {source}")]
    OutputWriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A rule-table file could not be read or parsed.
    #[error("Failed to load rule tables from '{path}': {detail}")]
    RulesLoadFailed { path: PathBuf, detail: String },

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// A non-fatal error for a single page.
///
/// The page is excluded from bucketing; every sibling page carries on.
#[derive(Debug, Clone, Error, serde::Serialize, serde::Deserialize)]
pub enum PageError {
    /// The page image could not be encoded for the request body.
    #[error("Page {page}: image encoding failed: {detail}")]
    EncodeFailed { page: usize, detail: String },

    /// Vision model call failed after retries.
    #[error("Page {page}: LLM call failed after {retries} retries: {detail}")]
    LlmFailed {
        page: usize,
        retries: u32,
        detail: String,
    },

    /// Vision model call exceeded its bounded wait.
    #[error("Page {page}: LLM call timed out after {secs}s")]
    Timeout { page: usize, secs: u64 },

    /// The response did not parse as a single JSON object.
    #[error("Page {page}: malformed extraction response: {detail}")]
    MalformedResponse { page: usize, detail: String },
}

impl PageError {
    /// 1-based page number the error belongs to.
    pub fn page(&self) -> usize {
        match self {
            PageError::EncodeFailed { page, .. }
            | PageError::LlmFailed { page, .. }
            | PageError::Timeout { page, .. }
            | PageError::MalformedResponse { page, .. } => *page,
        }
    }
}

/// Failure of the downstream posting handshake.
#[derive(Debug, Error)]
pub enum PostingError {
    /// No endpoint was configured.
    #[error("Posting endpoint is not configured")]
    NotConfigured,

    /// Transport-level failure (connect, TLS, timeout).
    #[error("Posting request to '{url}' failed: {detail}")]
    Request { url: String, detail: String },

    /// The read step succeeded but returned no anti-forgery token.
    #[error("Token fetch from '{url}' returned no x-csrf-token header (HTTP {status})")]
    MissingToken { url: String, status: u16 },

    /// The write step was answered with a non-success status.
    #[error("Posting rejected with HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}
