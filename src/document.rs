//! Data model shared by every pipeline stage.

use image::DynamicImage;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// A JSON object as produced by the models.
pub type FieldMap = Map<String, Value>;

/// The three canonical document buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    TaxInvoice,
    PurchaseOrder,
    GlDocument,
}

impl DocumentType {
    pub const ALL: [DocumentType; 3] = [
        DocumentType::TaxInvoice,
        DocumentType::PurchaseOrder,
        DocumentType::GlDocument,
    ];

    /// Bucket name as used in the raw extraction and the prompts.
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::TaxInvoice => "tax_invoice",
            DocumentType::PurchaseOrder => "purchase_order",
            DocumentType::GlDocument => "gl_document",
        }
    }

    /// Exact bucket-name lookup; anything else is not a bucket.
    pub fn from_bucket_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }
}

impl fmt::Display for DocumentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One rasterised page. Immutable once produced.
#[derive(Debug, Clone)]
pub struct PageImage {
    /// 1-based position in the source document.
    pub page_num: usize,
    pub image: DynamicImage,
}

/// What the vision model reported for one page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageExtraction {
    pub page_num: usize,
    /// Type label exactly as the model declared it (empty when absent).
    pub document_type: String,
    pub data: FieldMap,
    #[serde(default)]
    pub input_tokens: usize,
    #[serde(default)]
    pub output_tokens: usize,
}

/// A page that produced no extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionErrorRecord {
    pub page_index: usize,
    pub message: String,
}

impl From<&crate::error::PageError> for ExtractionErrorRecord {
    fn from(e: &crate::error::PageError) -> Self {
        Self {
            page_index: e.page(),
            message: e.to_string(),
        }
    }
}

/// One row of the canonical record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LineItem {
    pub invoice_doc_item: String,
    pub po_number: String,
    pub po_item: String,
    pub quantity: String,
    pub unit: String,
    pub item_amount: String,
    pub sheet_no: String,
}

/// The fixed downstream schema.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CanonicalInvoice {
    /// `YYYYMMDD`
    pub doc_date: String,
    /// `YYYYMMDD`
    pub posting_date: String,
    pub ref_docno: String,
    pub company_code: String,
    pub currency: String,
    pub gross_amount: String,
    pub items: Vec<LineItem>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn bucket_names_round_trip() {
        for t in DocumentType::ALL {
            assert_eq!(DocumentType::from_bucket_name(t.as_str()), Some(t));
        }
        assert_eq!(DocumentType::from_bucket_name("invoice"), None);
    }

    #[test]
    fn canonical_invoice_uses_downstream_field_names() {
        let inv = CanonicalInvoice {
            doc_date: "20240101".into(),
            items: vec![LineItem {
                invoice_doc_item: "000001".into(),
                sheet_no: "0123456789".into(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let v = serde_json::to_value(&inv).unwrap();
        assert_eq!(v["docDate"], "20240101");
        assert!(v.get("refDocno").is_some());
        assert!(v.get("companyCode").is_some());
        assert_eq!(v["items"][0]["invoiceDocItem"], "000001");
        assert_eq!(v["items"][0]["sheetNo"], "0123456789");
    }

    #[test]
    fn canonical_invoice_tolerates_missing_fields() {
        let inv: CanonicalInvoice =
            serde_json::from_value(json!({"docDate": "20240101", "items": [{}]})).unwrap();
        assert_eq!(inv.doc_date, "20240101");
        assert_eq!(inv.items.len(), 1);
        assert!(inv.items[0].po_number.is_empty());
    }
}
