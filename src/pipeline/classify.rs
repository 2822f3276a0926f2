//! Bucketer: route a page extraction to one of the three canonical buckets.
//!
//! The model's declared type is trusted first. Keyword matching over the
//! serialised data is only a fallback for labels the alias table cannot map.
//! Classification is a pure function of the extraction and the rule tables.

use crate::document::{DocumentType, PageExtraction};
use crate::rules::RuleTables;
use tracing::{debug, warn};

/// Pick the bucket for `extraction`, or `None` when nothing matches.
pub fn classify(extraction: &PageExtraction, rules: &RuleTables) -> Option<DocumentType> {
    let declared = extraction.document_type.trim().to_lowercase();
    if let Some(t) = DocumentType::from_bucket_name(rules.alias(&declared)) {
        return Some(t);
    }

    match classify_by_keywords(extraction, rules) {
        Some(t) => {
            debug!(
                "Page {}: declared type '{}' unknown, keyword fallback chose {}",
                extraction.page_num, extraction.document_type, t
            );
            Some(t)
        }
        None => {
            warn!(
                "Page {}: unclassifiable (declared '{}'), excluded from all buckets",
                extraction.page_num, extraction.document_type
            );
            None
        }
    }
}

/// First keyword set with a term present in the page's data.
fn classify_by_keywords(extraction: &PageExtraction, rules: &RuleTables) -> Option<DocumentType> {
    let text = serde_json::to_string(&extraction.data)
        .unwrap_or_default()
        .to_lowercase();

    rules
        .keyword_sets
        .iter()
        .find(|set| {
            set.keywords
                .iter()
                .any(|k| !k.is_empty() && text.contains(&k.to_lowercase()))
        })
        .map(|set| set.bucket)
}
