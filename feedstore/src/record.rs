use crate::value::FieldValue;
use serde::{Deserialize, Serialize};
use serde_json::{Map as JsonMap, Value as JsonValue};
use std::collections::BTreeMap;

pub const NATURAL_KEY: &str = "natural_key";
pub const SURROGATE_ID: &str = "surrogate_id";
pub const CONTENT_HASH: &str = "content_hash";
pub const UPLOADED_DATE: &str = "uploaded_date";

/// Field names the engine interprets; everything else is opaque payload.
pub const RESERVED_FIELDS: [&str; 4] = [NATURAL_KEY, SURROGATE_ID, CONTENT_HASH, UPLOADED_DATE];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_FIELDS.contains(&name)
}

/// A normalized feed record.
///
/// Serialized flat: the reserved slots sit next to the payload fields, which
/// is the shape persisted in baseline snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Record {
    #[serde(default)]
    pub natural_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surrogate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uploaded_date: Option<String>,
    #[serde(flatten)]
    pub fields: BTreeMap<String, FieldValue>,
}

/// Names of the store attributes that carry a record's identity.
///
/// For natural-key feeds both names are the same attribute (e.g. `cveID`).
/// Surrogate feeds partition on the minted id (`id`) and keep the natural key
/// in a second attribute (`module_id`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyLayout {
    pub key_attribute: String,
    pub natural_key_attribute: String,
}

impl KeyLayout {
    pub fn natural(attribute: impl Into<String>) -> Self {
        let attribute = attribute.into();
        Self {
            key_attribute: attribute.clone(),
            natural_key_attribute: attribute,
        }
    }

    pub fn surrogate(
        key_attribute: impl Into<String>,
        natural_key_attribute: impl Into<String>,
    ) -> Self {
        Self {
            key_attribute: key_attribute.into(),
            natural_key_attribute: natural_key_attribute.into(),
        }
    }

    pub fn uses_surrogate(&self) -> bool {
        self.key_attribute != self.natural_key_attribute
    }

    /// Attributes that hold identity rather than content.
    pub fn identity_attributes(&self) -> [&str; 2] {
        [self.key_attribute.as_str(), self.natural_key_attribute.as_str()]
    }
}

impl Record {
    pub fn new(natural_key: impl Into<String>) -> Self {
        Self {
            natural_key: natural_key.into().trim().to_string(),
            ..Default::default()
        }
    }

    pub fn with_field(mut self, name: &str, value: impl Into<FieldValue>) -> Self {
        self.set(name, value);
        self
    }

    /// Sets a field, routing reserved names to their dedicated slots.
    ///
    /// `content_hash` is derived by the engine and is never taken from input.
    pub fn set(&mut self, name: &str, value: impl Into<FieldValue>) {
        let value = value.into();
        match name {
            NATURAL_KEY => self.natural_key = identity_text(&value).unwrap_or_default(),
            SURROGATE_ID => self.surrogate_id = identity_text(&value),
            UPLOADED_DATE => self.uploaded_date = identity_text(&value),
            CONTENT_HASH => {
                log::debug!("Ignoring supplied content_hash for '{}'", self.natural_key);
            }
            _ => {
                self.fields.insert(name.to_string(), value);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Text of a field if present and non-blank.
    pub fn text(&self, name: &str) -> Option<String> {
        self.fields
            .get(name)
            .and_then(FieldValue::normalize_for_store)
            .map(|v| v.to_string())
    }

    pub fn has_natural_key(&self) -> bool {
        !self.natural_key.trim().is_empty()
    }

    /// The value the record is partitioned under in the store.
    pub fn store_key(&self) -> &str {
        self.surrogate_id.as_deref().unwrap_or(&self.natural_key)
    }

    /// Renders the record as a store item.
    ///
    /// Values go through store normalization; attributes that normalize to
    /// nothing are omitted instead of being written as empty strings.
    pub fn to_item(&self, layout: &KeyLayout) -> JsonMap<String, JsonValue> {
        let mut item = JsonMap::new();
        for (name, value) in &self.fields {
            if let Some(normalized) = value.normalize_for_store() {
                item.insert(name.clone(), field_to_json(&normalized));
            }
        }
        item.insert(
            layout.natural_key_attribute.clone(),
            JsonValue::String(self.natural_key.clone()),
        );
        if layout.uses_surrogate() {
            if let Some(id) = &self.surrogate_id {
                item.insert(layout.key_attribute.clone(), JsonValue::String(id.clone()));
            }
        }
        if let Some(hash) = &self.content_hash {
            item.insert(CONTENT_HASH.to_string(), JsonValue::String(hash.clone()));
        }
        if let Some(date) = &self.uploaded_date {
            item.insert(UPLOADED_DATE.to_string(), JsonValue::String(date.clone()));
        }
        item
    }

    /// Rebuilds a record from a store item written by [`Record::to_item`].
    pub fn from_item(item: &JsonMap<String, JsonValue>, layout: &KeyLayout) -> Self {
        let text_of = |name: &str| {
            item.get(name)
                .map(FieldValue::from_json)
                .and_then(|v| identity_text(&v))
        };

        let mut record = Record {
            natural_key: text_of(&layout.natural_key_attribute).unwrap_or_default(),
            surrogate_id: if layout.uses_surrogate() {
                text_of(&layout.key_attribute)
            } else {
                None
            },
            content_hash: text_of(CONTENT_HASH),
            uploaded_date: text_of(UPLOADED_DATE),
            fields: BTreeMap::new(),
        };

        for (name, value) in item {
            if is_reserved(name) || layout.identity_attributes().contains(&name.as_str()) {
                continue;
            }
            record.fields.insert(name.clone(), FieldValue::from_json(value));
        }
        record
    }
}

/// Trimmed text of a value used as an identifier, without numeric coercion.
fn identity_text(value: &FieldValue) -> Option<String> {
    match value {
        FieldValue::Null => None,
        other => {
            let text = other.to_string();
            let trimmed = text.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
    }
}

fn field_to_json(value: &FieldValue) -> JsonValue {
    match value {
        FieldValue::Null => JsonValue::Null,
        FieldValue::Bool(b) => JsonValue::Bool(*b),
        FieldValue::Integer(i) => JsonValue::from(*i),
        FieldValue::Float(f) => serde_json::Number::from_f64(*f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        FieldValue::Text(s) => JsonValue::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserved_names_route_to_slots() {
        let record = Record::new("MOD-1")
            .with_field("uploaded_date", "2025-01-02")
            .with_field("content_hash", "forged")
            .with_field("rank", "excellent");
        assert_eq!(record.uploaded_date.as_deref(), Some("2025-01-02"));
        assert!(record.content_hash.is_none());
        assert_eq!(record.fields.len(), 1);
    }

    #[test]
    fn test_item_round_trip_with_surrogate_layout() {
        let layout = KeyLayout::surrogate("id", "module_id");
        let mut record = Record::new("exploit/unix/ftp")
            .with_field("rank", "excellent")
            .with_field("rport", "21")
            .with_field("notes", "  ");
        record.surrogate_id = Some("META-2025-000001".into());

        let item = record.to_item(&layout);
        assert_eq!(item["id"], "META-2025-000001");
        assert_eq!(item["module_id"], "exploit/unix/ftp");
        assert_eq!(item["rport"], 21);
        assert!(!item.contains_key("notes"));

        let back = Record::from_item(&item, &layout);
        assert_eq!(back.natural_key, record.natural_key);
        assert_eq!(back.surrogate_id, record.surrogate_id);
        assert_eq!(back.store_key(), "META-2025-000001");
        assert_eq!(back.get("rank"), Some(&FieldValue::Text("excellent".into())));
    }

    #[test]
    fn test_baseline_serialization_is_flat() {
        let record = Record::new("CVE-2024-1").with_field("sev", "high");
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["natural_key"], "CVE-2024-1");
        assert_eq!(json["sev"], "high");
        assert!(json.get("surrogate_id").is_none());

        let parsed: Record = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, record);
    }
}
