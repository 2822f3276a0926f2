//! Prompts for the two model calls.
//!
//! Every prompt lives here so the wording can change without touching retry
//! or parsing logic, and so tests can inspect the rules the models are told
//! to follow. Callers override either prompt through
//! [`crate::config::ExtractionConfig`]; the constants are used only when no
//! override is set.

use crate::output::RawExtraction;
use crate::rules::RuleTables;

/// Instruction sent with every page image.
pub const EXTRACTION_PROMPT: &str = r#"You are an expert invoice OCR and document understanding AI.
The page image belongs to a business document written in Arabic, English, or both.

1. CLASSIFY
   Decide which ONE of these document types the page belongs to:
   - "tax_invoice"     (tax invoice / VAT invoice / فاتورة ضريبية)
   - "purchase_order"  (purchase order / أمر شراء)
   - "gl_document"     (general ledger / accounting / journal posting document / قيد)

2. EXTRACT
   - Capture ALL data visible on the page
   - Preserve original text exactly, in its original language
   - Do NOT translate anything
   - Do NOT invent values that are not on the page
   - Numbers must remain numbers
   - Put itemised rows in a list named "items"

3. OUTPUT FORMAT
   Return ONE valid JSON object only, shaped as:
   {"document_type": "<tax_invoice|purchase_order|gl_document>", "data": { ... }}
   No explanations, no markdown fences."#;

/// Instruction for the merged-document → canonical-record call.
///
/// `{company_code}` and `{currency}` are filled from the rule tables.
pub const TRANSFORM_PROMPT: &str = r#"You are an ERP integration assistant. You receive up to three merged documents
extracted from the same scanned file: "tax_invoice", "purchase_order" and
"gl_document". Any of them may be null.

Produce ONE JSON object with exactly this schema:
{
  "docDate": "YYYYMMDD",
  "postingDate": "YYYYMMDD",
  "refDocno": "string",
  "companyCode": "{company_code}",
  "currency": "{currency}",
  "grossAmount": "string",
  "items": [
    {
      "invoiceDocItem": "000001",
      "poNumber": "string",
      "poItem": "00010",
      "quantity": "string",
      "unit": "string",
      "itemAmount": "string",
      "sheetNo": "string"
    }
  ]
}

Rules:
1. companyCode is always "{company_code}" and currency is always "{currency}".
2. Convert every recognised date (any calendar format or language) to YYYYMMDD.
   If the posting date is absent, copy the document date.
3. invoiceDocItem is the 1-based line sequence, zero-padded to 6 digits.
4. poItem is the line's serial number times 10, zero-padded to 5 digits.
5. refDocno is the tax invoice number.
6. Monetary values carry no thousands separators.
7. Leave sheetNo empty when no service entry sheet number is present.
8. Return the JSON object only. No explanations, no markdown fences."#;

/// Render the transformation prompt with the configured constants.
pub fn transform_system_prompt(template: &str, rules: &RuleTables) -> String {
    template
        .replace("{company_code}", &rules.company_code)
        .replace("{currency}", &rules.currency)
}

/// User turn carrying the three bucket documents as JSON.
pub fn transform_user_message(raw: &RawExtraction) -> String {
    let payload = serde_json::json!({
        "tax_invoice": raw.tax_invoice,
        "purchase_order": raw.purchase_order,
        "gl_document": raw.gl_document,
    });
    let body = serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string());
    format!("Documents:\n\n{body}")
}
