//! Post-processing: validate model output and enforce the canonical rules.
//!
//! Even well-prompted models wrap JSON in ```` ```json ```` fences, answer
//! numbers where strings are required, forget zero padding, or "correct" the
//! company code. Everything here is deterministic and independent of the
//! model, so the downstream contract holds no matter what the model said.
//!
//! ## Rule Order
//!
//! [`apply_canonical_rules`] runs, in order:
//! 1. Generate a synthetic `sheetNo` where missing or empty
//! 2. Apply the exact-literal PO substitution table
//! 3. Force `companyCode` and `currency` to their constants
//! 4. Renumber `invoiceDocItem` and derive `poItem`
//! 5. Normalise `docDate` / `postingDate` to `YYYYMMDD`
//! 6. Strip thousands separators from monetary fields
//!
//! Substitution runs before numbering so a corrected PO keeps its position;
//! dates run after constants so a missing posting date copies the already
//! normalised document date.

use crate::document::{CanonicalInvoice, FieldMap, LineItem};
use crate::rules::RuleTables;
use chrono::NaiveDate;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::Regex;
use serde_json::Value;
use tracing::{debug, warn};

// ── JSON boundary ────────────────────────────────────────────────────────────

static RE_OUTER_FENCES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)^```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)\r?\n?```\s*$").unwrap());

/// Remove one pair of surrounding code fences, if present.
pub fn strip_code_fences(input: &str) -> &str {
    let trimmed = input.trim();
    match RE_OUTER_FENCES.captures(trimmed) {
        Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(trimmed),
        None => trimmed,
    }
}

/// Parse model output as exactly one JSON object.
pub fn parse_json_object(input: &str) -> Result<FieldMap, String> {
    let body = strip_code_fences(input);
    if body.is_empty() {
        return Err("empty response".to_string());
    }
    let value: Value = serde_json::from_str(body).map_err(|e| {
        format!(
            "invalid JSON ({}): {}",
            e,
            body.chars().take(120).collect::<String>()
        )
    })?;
    match value {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {}", json_kind(&other))),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

// ── Shape check ──────────────────────────────────────────────────────────────

const HEADER_FIELDS: [&str; 6] = [
    "docDate",
    "postingDate",
    "refDocno",
    "companyCode",
    "currency",
    "grossAmount",
];

const ITEM_FIELDS: [&str; 7] = [
    "invoiceDocItem",
    "poNumber",
    "poItem",
    "quantity",
    "unit",
    "itemAmount",
    "sheetNo",
];

/// Convert the transformer's JSON object into a [`CanonicalInvoice`].
///
/// Scalars are coerced to strings. `items` must be absent, null, or a list
/// of objects; anything else is a shape violation.
pub fn invoice_from_object(obj: &FieldMap) -> Result<CanonicalInvoice, String> {
    let items_value = obj
        .get("items")
        .or_else(|| obj.get("lineItems"))
        .unwrap_or(&Value::Null);

    let items = match items_value {
        Value::Null => Vec::new(),
        Value::Array(rows) => rows
            .iter()
            .enumerate()
            .map(|(i, row)| match row {
                Value::Object(fields) => Ok(line_item_from_object(fields)),
                other => Err(format!("items[{}] is {}, expected an object", i, json_kind(other))),
            })
            .collect::<Result<Vec<_>, _>>()?,
        other => return Err(format!("items is {}, expected a list", json_kind(other))),
    };

    let mut normalised = serde_json::Map::new();
    for json_key in HEADER_FIELDS {
        let v = obj.get(json_key).map(scalar_to_string).unwrap_or_default();
        normalised.insert(json_key.to_string(), Value::String(v));
    }
    let mut invoice: CanonicalInvoice =
        serde_json::from_value(Value::Object(normalised)).map_err(|e| e.to_string())?;
    invoice.items = items;
    Ok(invoice)
}

fn line_item_from_object(fields: &FieldMap) -> LineItem {
    let get = |k: &str| fields.get(k).map(scalar_to_string).unwrap_or_default();
    let [doc_item, po_number, po_item, quantity, unit, amount, sheet] = ITEM_FIELDS;
    LineItem {
        invoice_doc_item: get(doc_item),
        po_number: get(po_number),
        po_item: get(po_item),
        quantity: get(quantity),
        unit: get(unit),
        item_amount: get(amount),
        sheet_no: get(sheet),
    }
}

fn scalar_to_string(v: &Value) -> String {
    match v {
        Value::Null => String::new(),
        Value::String(s) => s.trim().to_string(),
        Value::Number(n) => n.to_string(),
        Value::Bool(b) => b.to_string(),
        other => other.to_string(),
    }
}

// ── Canonical rules ──────────────────────────────────────────────────────────

/// Apply every canonical rule in the documented order.
pub fn apply_canonical_rules(invoice: &mut CanonicalInvoice, rules: &RuleTables) {
    fill_sheet_numbers(&mut invoice.items, rules.sheet_no_digits);
    substitute_po_numbers(&mut invoice.items, rules);
    force_constants(invoice, rules);
    number_items(&mut invoice.items);
    normalise_dates(invoice);
    strip_monetary_separators(invoice);
}

// ── Rule 1: Synthetic sheet numbers ──────────────────────────────────────────

/// Random decimal string of exactly `digits` digits (leading zeros allowed).
pub fn generate_sheet_no(digits: usize) -> String {
    let mut rng = rand::rng();
    (0..digits.max(1))
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

fn fill_sheet_numbers(items: &mut [LineItem], digits: usize) {
    for item in items.iter_mut().filter(|i| i.sheet_no.trim().is_empty()) {
        item.sheet_no = generate_sheet_no(digits);
        debug!("Generated sheetNo {}", item.sheet_no);
    }
}

// ── Rule 2: PO substitution ──────────────────────────────────────────────────

fn substitute_po_numbers(items: &mut [LineItem], rules: &RuleTables) {
    for item in items.iter_mut() {
        if let Some(fixed) = rules.substitute_po(&item.po_number) {
            debug!("Substituted PO {} → {}", item.po_number, fixed);
            item.po_number = fixed.to_string();
        }
    }
}

// ── Rule 3: Constants ────────────────────────────────────────────────────────

fn force_constants(invoice: &mut CanonicalInvoice, rules: &RuleTables) {
    if invoice.company_code != rules.company_code || invoice.currency != rules.currency {
        debug!(
            "Overriding companyCode/currency {}/{} with {}/{}",
            invoice.company_code, invoice.currency, rules.company_code, rules.currency
        );
    }
    invoice.company_code = rules.company_code.clone();
    invoice.currency = rules.currency.clone();
}

// ── Rule 4: Numbering ────────────────────────────────────────────────────────

fn number_items(items: &mut [LineItem]) {
    for (i, item) in items.iter_mut().enumerate() {
        let seq = i + 1;
        item.invoice_doc_item = format!("{:06}", seq);
        item.po_item = derive_po_item(&item.po_item, seq);
    }
}

/// `poItem` = line serial × 10, zero-padded to 5 digits.
///
/// The model's own value is untrusted (it may be unscaled, already scaled,
/// out of position, or not a number at all), so it only feeds a debug line.
pub fn derive_po_item(existing: &str, sequence: usize) -> String {
    let derived = format!("{:05}", sequence.saturating_mul(10));
    let given = ascii_digits(existing.trim());
    if !given.is_empty() && given != derived {
        debug!("poItem '{}' on line {} replaced by {}", given, sequence, derived);
    }
    derived
}

// ── Rule 5: Dates ────────────────────────────────────────────────────────────

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d", "%Y/%m/%d", "%Y.%m.%d", "%d/%m/%Y", "%d-%m-%Y", "%d.%m.%Y", "%d %b %Y",
    "%d %B %Y", "%d-%b-%Y", "%b %d, %Y", "%B %d, %Y", "%b %d %Y", "%B %d %Y",
];

/// Convert a recognised date representation to `YYYYMMDD`.
///
/// Day-first is tried before month-first for slash dates, matching the
/// documents this library targets.
pub fn normalise_date(raw: &str) -> Option<String> {
    let s = ascii_digits(raw.trim());
    if s.is_empty() {
        return None;
    }

    if s.len() == 8 && s.bytes().all(|b| b.is_ascii_digit()) {
        let (y, m, d) = (&s[0..4], &s[4..6], &s[6..8]);
        return NaiveDate::from_ymd_opt(y.parse().ok()?, m.parse().ok()?, d.parse().ok()?)
            .map(|date| date.format("%Y%m%d").to_string());
    }

    // ISO timestamps: keep the date part only.
    let date_part = match s.split_once('T') {
        Some((head, _)) if head.len() == 10 => head,
        _ => s.as_str(),
    };

    DATE_FORMATS
        .iter()
        .find_map(|fmt| NaiveDate::parse_from_str(date_part, fmt).ok())
        .map(|date| date.format("%Y%m%d").to_string())
}

fn normalise_dates(invoice: &mut CanonicalInvoice) {
    match normalise_date(&invoice.doc_date) {
        Some(d) => invoice.doc_date = d,
        None if !invoice.doc_date.is_empty() => {
            warn!("Unrecognised docDate '{}', kept as-is", invoice.doc_date)
        }
        None => {}
    }

    if invoice.posting_date.trim().is_empty() {
        invoice.posting_date = invoice.doc_date.clone();
        return;
    }
    match normalise_date(&invoice.posting_date) {
        Some(d) => invoice.posting_date = d,
        None => warn!(
            "Unrecognised postingDate '{}', kept as-is",
            invoice.posting_date
        ),
    }
}

// ── Rule 6: Monetary separators ──────────────────────────────────────────────

/// Remove thousands separators (ASCII and Arabic) and unify the decimal mark.
pub fn strip_amount_separators(raw: &str) -> String {
    ascii_digits(raw.trim())
        .chars()
        .filter_map(|c| match c {
            ',' | '\u{066C}' | '\u{00A0}' | '\u{202F}' | '\'' | ' ' => None,
            '\u{066B}' => Some('.'),
            other => Some(other),
        })
        .collect()
}

fn strip_monetary_separators(invoice: &mut CanonicalInvoice) {
    invoice.gross_amount = strip_amount_separators(&invoice.gross_amount);
    for item in invoice.items.iter_mut() {
        item.item_amount = strip_amount_separators(&item.item_amount);
    }
}

/// Map Arabic-Indic and Extended Arabic-Indic digits to ASCII.
pub fn ascii_digits(input: &str) -> String {
    input
        .chars()
        .map(|c| match c {
            '\u{0660}'..='\u{0669}' => char::from(b'0' + (c as u32 - 0x0660) as u8),
            '\u{06F0}'..='\u{06F9}' => char::from(b'0' + (c as u32 - 0x06F0) as u8),
            other => other,
        })
        .collect()
}
