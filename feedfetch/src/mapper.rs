//! Helpers shared by the feed normalizers.

use feedstore::Record;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map as JsonMap, Value as JsonValue};

static WHITESPACE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("whitespace pattern"));
static CVE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)CVE-\d{4}-\d{4,7}").expect("cve pattern"));

/// Upload stamp applied to every normalized record.
pub fn today() -> String {
    chrono::Utc::now().format("%Y-%m-%d").to_string()
}

/// Collapses whitespace; blank text becomes `None`. Nested values are
/// rendered as compact JSON.
pub fn clean_text(value: &JsonValue) -> Option<String> {
    let raw = match value {
        JsonValue::Null => return None,
        JsonValue::String(s) => s.clone(),
        JsonValue::Bool(b) => b.to_string(),
        JsonValue::Number(n) => n.to_string(),
        nested => serde_json::to_string(nested).ok()?,
    };
    clean_str(&raw)
}

pub fn clean_str(raw: &str) -> Option<String> {
    let cleaned = WHITESPACE_RE.replace_all(raw, " ").trim().to_string();
    (!cleaned.is_empty()).then_some(cleaned)
}

/// Lists become `;`-joined text of their non-blank items.
pub fn join_list(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::Array(items) => {
            let parts: Vec<String> = items.iter().filter_map(clean_text).collect();
            (!parts.is_empty()).then(|| parts.join(";"))
        }
        other => clean_text(other),
    }
}

/// First CVE identifier in `text`, uppercased.
pub fn find_cve(text: &str) -> Option<String> {
    CVE_RE.find(text).map(|m| m.as_str().to_uppercase())
}

/// Value of the first alias present, matched exactly and then ignoring case.
pub fn lookup<'a>(entry: &'a JsonMap<String, JsonValue>, aliases: &[&str]) -> Option<&'a JsonValue> {
    aliases.iter().find_map(|alias| {
        entry.get(*alias).or_else(|| {
            entry
                .iter()
                .find(|(key, _)| key.eq_ignore_ascii_case(alias))
                .map(|(_, value)| value)
        })
    })
}

/// Sets `name` when a value is present.
pub fn set_text(record: &mut Record, name: &str, value: Option<String>) {
    if let Some(value) = value {
        record.set(name, value);
    }
}
