//! Extracted records with typed, ordered fields.
//!
//! Extractors report loose JSON values; before a record enters the
//! pipeline's result set each value is validated against the declared type
//! of its field in the resolved output profile. A value that fails its
//! declared type is dropped (the renderer's default/placeholder rules then
//! apply) rather than silently passed through as text.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::collab::RawRecord;
use crate::profile::{FieldKind, OutputProfile};

/// Date shapes accepted from extractors, tried in order.
const DATE_INPUT_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y/%m/%d", "%d.%m.%Y"];

/// One typed field value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Text(String),
    Number(Decimal),
    Date(NaiveDate),
    Boolean(bool),
}

impl FieldValue {
    pub fn kind(&self) -> FieldKind {
        match self {
            FieldValue::Text(_) => FieldKind::Text,
            FieldValue::Number(_) => FieldKind::Number,
            FieldValue::Date(_) => FieldKind::Date,
            FieldValue::Boolean(_) => FieldKind::Boolean,
        }
    }

    /// Validates a loose JSON value against a declared kind. Returns `None`
    /// when the value is null, structurally unusable, or fails the declared
    /// type.
    pub fn coerce(raw: &serde_json::Value, kind: FieldKind) -> Option<FieldValue> {
        match kind {
            FieldKind::Text => match raw {
                serde_json::Value::String(s) => Some(FieldValue::Text(s.clone())),
                serde_json::Value::Number(n) => Some(FieldValue::Text(n.to_string())),
                serde_json::Value::Bool(b) => Some(FieldValue::Text(b.to_string())),
                _ => None,
            },
            FieldKind::Number => match raw {
                serde_json::Value::Number(n) => n.to_string().parse().ok().map(FieldValue::Number),
                serde_json::Value::String(s) => parse_decimal(s).map(FieldValue::Number),
                _ => None,
            },
            FieldKind::Date => match raw {
                serde_json::Value::String(s) => parse_date(s).map(FieldValue::Date),
                _ => None,
            },
            FieldKind::Boolean => match raw {
                serde_json::Value::Bool(b) => Some(FieldValue::Boolean(*b)),
                serde_json::Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
                    "true" | "yes" => Some(FieldValue::Boolean(true)),
                    "false" | "no" => Some(FieldValue::Boolean(false)),
                    _ => None,
                },
                serde_json::Value::Number(n) => match n.as_i64() {
                    Some(0) => Some(FieldValue::Boolean(false)),
                    Some(1) => Some(FieldValue::Boolean(true)),
                    _ => None,
                },
                _ => None,
            },
        }
    }

    /// Canonical string form before transforms are applied. Dates use the
    /// profile's `date_format`.
    pub fn render_base(&self, date_format: &str) -> String {
        match self {
            FieldValue::Text(s) => s.clone(),
            FieldValue::Number(n) => n.to_string(),
            FieldValue::Date(d) => format_date(*d, date_format),
            FieldValue::Boolean(b) => b.to_string(),
        }
    }
}

/// Formats a date without panicking on format strings that ask for fields a
/// plain date does not carry (e.g. `%H`); those fall back to ISO.
pub(crate) fn format_date(date: NaiveDate, format: &str) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    if write!(out, "{}", date.format(format)).is_ok() {
        out
    } else {
        log::warn!("Date format '{format}' is not renderable for a plain date; using ISO");
        date.format("%Y-%m-%d").to_string()
    }
}

/// Accepts extractor formatting quirks: currency symbols, thousands
/// separators, surrounding whitespace.
fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .chars()
        .filter(|c| !matches!(c, '$' | '€' | ',' | ' '))
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    cleaned.parse().ok()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    for format in DATE_INPUT_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, format) {
            return Some(date);
        }
    }
    // RFC3339 timestamps: take the date part.
    if trimmed.len() >= 10 {
        if let Ok(date) = NaiveDate::parse_from_str(&trimmed[..10], "%Y-%m-%d") {
            return Some(date);
        }
    }
    None
}

/// Insertion-ordered field name → value mapping. Order matters for
/// deterministic rendering, so this is a thin wrapper over a vector rather
/// than a hash map.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldMap {
    entries: Vec<(String, FieldValue)>,
}

impl FieldMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces in place; replacing keeps the original position.
    pub fn insert(&mut self, name: impl Into<String>, value: FieldValue) {
        let name = name.into();
        match self.entries.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl FromIterator<(String, FieldValue)> for FieldMap {
    fn from_iter<T: IntoIterator<Item = (String, FieldValue)>>(iter: T) -> Self {
        let mut map = FieldMap::new();
        for (name, value) in iter {
            map.insert(name, value);
        }
        map
    }
}

/// One extracted logical entity tied to a page.
///
/// While a unit is being processed, `original_page_no` holds the unit-local
/// 1-based page number as reported by the extractor; consolidation rewrites
/// it to the absolute page number using the unit's page-range offset.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub original_page_no: u32,
    pub field_map: FieldMap,
    pub confidence_score: f64,
}

impl Record {
    /// Builds a typed record from raw extractor output, validating each
    /// value against the profile's field descriptors. Fields unknown to the
    /// profile are kept as text; they are never rendered but remain
    /// inspectable.
    pub fn from_raw(raw: &RawRecord, profile: &OutputProfile, unit_confidence: f64) -> Self {
        let mut field_map = FieldMap::new();
        for (name, value) in &raw.fields {
            if value.is_null() {
                continue;
            }
            let kind = profile.field(name).map(|f| f.kind).unwrap_or_default();
            match FieldValue::coerce(value, kind) {
                Some(typed) => field_map.insert(name.clone(), typed),
                None => log::warn!(
                    "Dropping field '{}' on page {}: value {} does not satisfy declared type {:?}",
                    name,
                    raw.page_no,
                    value,
                    kind
                ),
            }
        }

        Self {
            original_page_no: raw.page_no,
            field_map,
            confidence_score: raw.confidence_score.unwrap_or(unit_confidence),
        }
    }
}
