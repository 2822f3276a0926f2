//! Lookup tables that encode one organisation's posting conventions.
//!
//! Line-item container names, document-type aliases, fallback keyword sets,
//! the purchase-order substitution table and the fixed header constants all
//! live in a single [`RuleTables`] value. It is injected through
//! [`crate::config::ExtractionConfig::rules`], so tests can swap in fixtures
//! and deployments can ship their own JSON file without recompiling.
//!
//! ```json
//! {
//!   "version": 1,
//!   "po_substitutions": { "45001234": "4500001234" }
//! }
//! ```
//!
//! Missing fields fall back to the built-in reference values.

use crate::document::DocumentType;
use crate::error::PipelineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Current schema version of the rule-table file.
pub const RULES_VERSION: u32 = 1;

/// One ordered keyword set used by the fallback classifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeywordSet {
    pub bucket: DocumentType,
    /// Lowercase terms; a page matches when any term occurs in its data.
    pub keywords: Vec<String>,
}

/// Versioned, injectable lookup tables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleTables {
    pub version: u32,

    /// Keys whose list values are concatenated across pages, compared
    /// case-insensitively.
    pub line_item_keys: Vec<String>,

    /// Lowercase declared type → canonical bucket name.
    pub type_aliases: BTreeMap<String, String>,

    /// Fallback keyword sets, tried in order; first match wins.
    pub keyword_sets: Vec<KeywordSet>,

    /// Exact purchase-order number corrections.
    pub po_substitutions: BTreeMap<String, String>,

    pub company_code: String,
    pub currency: String,

    /// Placeholder used by the posting payload when an item has no PO number.
    pub default_po_number: String,

    /// Digit count of the synthetic `sheetNo`.
    pub sheet_no_digits: usize,
}

impl Default for RuleTables {
    fn default() -> Self {
        let strings = |xs: &[&str]| xs.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        Self {
            version: RULES_VERSION,
            line_item_keys: strings(&[
                "items",
                "line_items",
                "lineitems",
                "line items",
                "invoice_items",
                "order_items",
                "products",
                "lines",
                "details",
                "الأصناف",
                "الاصناف",
                "البنود",
                "المنتجات",
                "التفاصيل",
            ]),
            type_aliases: [
                ("invoice", "tax_invoice"),
                ("po", "purchase_order"),
                ("accounting_document", "gl_document"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            keyword_sets: vec![
                KeywordSet {
                    bucket: DocumentType::TaxInvoice,
                    keywords: strings(&[
                        "فاتورة ضريبية",
                        "فاتورة",
                        "ضريبة القيمة المضافة",
                        "tax invoice",
                        "invoice",
                        "vat",
                    ]),
                },
                KeywordSet {
                    bucket: DocumentType::PurchaseOrder,
                    keywords: strings(&["أمر شراء", "امر شراء", "purchase order", "p.o."]),
                },
                KeywordSet {
                    bucket: DocumentType::GlDocument,
                    keywords: strings(&[
                        "قيد يومية",
                        "الأستاذ العام",
                        "مدين",
                        "دائن",
                        "ترحيل",
                        "general ledger",
                        "journal",
                        "posting",
                        "debit",
                        "credit",
                    ]),
                },
            ],
            po_substitutions: [
                ("45000123", "4500000123"),
                ("4500O00124", "4500000124"),
                ("450000125", "4500000125"),
            ]
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
            company_code: "2000".to_string(),
            currency: "SAR".to_string(),
            default_po_number: "4500000000".to_string(),
            sheet_no_digits: 10,
        }
    }
}

impl RuleTables {
    /// Load tables from a JSON file; absent fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, PipelineError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| PipelineError::RulesLoadFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_json_str(&text).map_err(|e| PipelineError::RulesLoadFailed {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })
    }

    /// Parse tables from JSON text.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let tables: RuleTables = serde_json::from_str(text)?;
        Ok(tables)
    }

    /// Whether `key` names a line-item container (case-insensitive).
    pub fn is_line_item_key(&self, key: &str) -> bool {
        let key = key.trim().to_lowercase();
        self.line_item_keys.iter().any(|k| k.to_lowercase() == key)
    }

    /// Apply the alias table to a lowercase declared type; identity otherwise.
    pub fn alias<'a>(&'a self, declared: &'a str) -> &'a str {
        self.type_aliases
            .get(declared)
            .map(String::as_str)
            .unwrap_or(declared)
    }

    /// Corrected PO number for a known-incorrect literal.
    pub fn substitute_po(&self, po: &str) -> Option<&str> {
        self.po_substitutions.get(po).map(String::as_str)
    }
}
