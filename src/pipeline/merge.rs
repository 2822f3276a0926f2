//! Merger: fold every page of one bucket into a single logical document.
//!
//! Line-item containers are concatenated in page order and never
//! overwritten. Every other key is reconciled by a [`ConflictPolicy`]; the
//! default, [`PreferNonEmptyLonger`], is a best-effort heuristic and can be
//! replaced without touching the fold itself.

use crate::document::FieldMap;
use crate::rules::RuleTables;
use serde_json::map::Entry;
use serde_json::Value;
use std::sync::Arc;

/// Decides whether an incoming scalar replaces the accumulated one.
///
/// Only consulted when the key already exists, the values differ, and the
/// incoming value is non-null.
pub trait ConflictPolicy: Send + Sync {
    fn should_replace(&self, key: &str, existing: &Value, incoming: &Value) -> bool;
}

/// Replace falsy/empty values; between two strings the strictly longer one
/// wins; otherwise the first value seen stays.
#[derive(Debug, Clone, Copy, Default)]
pub struct PreferNonEmptyLonger;

impl ConflictPolicy for PreferNonEmptyLonger {
    fn should_replace(&self, _key: &str, existing: &Value, incoming: &Value) -> bool {
        if is_falsy(existing) {
            return true;
        }
        match (existing, incoming) {
            (Value::String(old), Value::String(new)) => {
                new.chars().count() > old.chars().count()
            }
            _ => false,
        }
    }
}

/// Shared handle stored in the config.
pub type SharedConflictPolicy = Arc<dyn ConflictPolicy>;

/// Null, false, zero, and empty strings/lists/objects.
pub fn is_falsy(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Bool(b) => !b,
        Value::Number(n) => n.as_f64() == Some(0.0),
        Value::String(s) => s.is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
    }
}

/// Merge the pages of one bucket, in page order.
///
/// Empty input yields `None`; a single page is returned unchanged.
pub fn merge_pages(
    pages: Vec<FieldMap>,
    rules: &RuleTables,
    policy: &dyn ConflictPolicy,
) -> Option<FieldMap> {
    match pages.len() {
        0 => None,
        1 => pages.into_iter().next(),
        _ => Some(pages.into_iter().fold(FieldMap::new(), |mut acc, page| {
            merge_into(&mut acc, page, rules, policy);
            acc
        })),
    }
}

fn merge_into(acc: &mut FieldMap, page: FieldMap, rules: &RuleTables, policy: &dyn ConflictPolicy) {
    for (key, incoming) in page {
        if rules.is_line_item_key(&key) {
            append_line_items(acc, key, incoming);
            continue;
        }

        match acc.entry(key) {
            Entry::Vacant(slot) => {
                slot.insert(incoming);
            }
            Entry::Occupied(mut slot) => {
                let replace = !incoming.is_null()
                    && *slot.get() != incoming
                    && policy.should_replace(slot.key(), slot.get(), &incoming);
                if replace {
                    slot.insert(incoming);
                }
            }
        }
    }
}

/// Append `incoming` under `key`, converting the slot to a list if needed.
fn append_line_items(acc: &mut FieldMap, key: String, incoming: Value) {
    let slot = acc.entry(key).or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        let previous = slot.take();
        *slot = Value::Array(if previous.is_null() {
            Vec::new()
        } else {
            vec![previous]
        });
    }
    if let Value::Array(list) = slot {
        match incoming {
            Value::Array(rows) => list.extend(rows),
            Value::Null => {}
            single => list.push(single),
        }
    }
}
