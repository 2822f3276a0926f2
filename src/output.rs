//! Result types returned by the orchestrator.

use crate::document::{CanonicalInvoice, DocumentType, ExtractionErrorRecord, FieldMap};
use crate::posting::PostingReport;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one document run.
///
/// ```text
/// START → RASTERIZING → EXTRACTING ─┬→ MERGING → TRANSFORMING → DONE
///              │                    └→ PARTIAL_FAILURE → MERGING
///              └→ FAILED                                  TRANSFORMING → FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStage {
    Start,
    Rasterizing,
    Extracting,
    PartialFailure,
    Merging,
    Transforming,
    Done,
    Failed,
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStage::Start => "START",
            PipelineStage::Rasterizing => "RASTERIZING",
            PipelineStage::Extracting => "EXTRACTING",
            PipelineStage::PartialFailure => "PARTIAL_FAILURE",
            PipelineStage::Merging => "MERGING",
            PipelineStage::Transforming => "TRANSFORMING",
            PipelineStage::Done => "DONE",
            PipelineStage::Failed => "FAILED",
        };
        f.write_str(s)
    }
}

/// Merged per-bucket documents plus the pages that did not make it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    pub tax_invoice: Option<FieldMap>,
    pub purchase_order: Option<FieldMap>,
    pub gl_document: Option<FieldMap>,

    /// One entry per page whose extraction failed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ExtractionErrorRecord>,

    /// Pages that parsed but matched no bucket.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unclassified_pages: Vec<usize>,
}

impl RawExtraction {
    pub fn bucket(&self, t: DocumentType) -> Option<&FieldMap> {
        match t {
            DocumentType::TaxInvoice => self.tax_invoice.as_ref(),
            DocumentType::PurchaseOrder => self.purchase_order.as_ref(),
            DocumentType::GlDocument => self.gl_document.as_ref(),
        }
    }

    pub fn set_bucket(&mut self, t: DocumentType, doc: Option<FieldMap>) {
        match t {
            DocumentType::TaxInvoice => self.tax_invoice = doc,
            DocumentType::PurchaseOrder => self.purchase_order = doc,
            DocumentType::GlDocument => self.gl_document = doc,
        }
    }
}

/// Timing and token accounting for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExtractionStats {
    /// Pages handed to the extractor (after the page cap).
    pub total_pages: usize,
    pub extracted_pages: usize,
    pub failed_pages: usize,
    pub unclassified_pages: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub render_duration_ms: u64,
    pub extract_duration_ms: u64,
    pub transform_duration_ms: u64,
    pub total_duration_ms: u64,
}

/// The complete result of one document run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionOutput {
    pub raw_extraction: RawExtraction,
    pub final_output: CanonicalInvoice,
    /// `DONE`, or `PARTIAL_FAILURE` when at least one page failed.
    pub stage: PipelineStage,
    pub stats: ExtractionStats,
    /// Outcome of the optional downstream post.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub posting: Option<PostingReport>,
}

impl ExtractionOutput {
    /// Whether any page failed extraction.
    pub fn is_partial(&self) -> bool {
        !self.raw_extraction.errors.is_empty()
    }

    /// Attach a posting sub-result. Never changes the extraction result.
    pub fn with_posting(mut self, report: PostingReport) -> Self {
        self.posting = Some(report);
        self
    }
}
