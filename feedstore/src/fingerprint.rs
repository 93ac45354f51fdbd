use crate::record::{is_reserved, KeyLayout, Record};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;

const FIELD_DELIMITER: &[u8] = b"\x1f";

/// SHA-256 over `name=token` pairs. Callers pass names in sorted order, so
/// the order in which a normalizer inserted fields never matters.
fn digest<'a>(record: &Record, names: impl Iterator<Item = &'a str>) -> String {
    let mut hasher = Sha256::new();
    for (i, name) in names.enumerate() {
        if i > 0 {
            hasher.update(FIELD_DELIMITER);
        }
        let token = record
            .get(name)
            .map(|value| value.canonical_token())
            .unwrap_or_default();
        hasher.update(name.as_bytes());
        hasher.update(b"=");
        hasher.update(token.as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Per-feed fingerprinting rules.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    canonical_fields: Option<Vec<String>>,
    excluded: BTreeSet<String>,
}

impl Fingerprinter {
    /// `canonical_fields = None` hashes every non-empty payload field.
    pub fn new(canonical_fields: Option<Vec<String>>, layout: &KeyLayout) -> Self {
        let excluded = layout
            .identity_attributes()
            .iter()
            .map(|s| s.to_string())
            .collect();
        Self {
            canonical_fields,
            excluded,
        }
    }

    fn is_hashed(&self, name: &str) -> bool {
        !is_reserved(name) && !self.excluded.contains(name)
    }

    pub fn fingerprint(&self, record: &Record) -> String {
        match &self.canonical_fields {
            Some(fields) => {
                let names: BTreeSet<&str> = fields
                    .iter()
                    .map(String::as_str)
                    .filter(|name| self.is_hashed(name))
                    .collect();
                digest(record, names.into_iter())
            }
            None => {
                let names = record
                    .fields
                    .iter()
                    .filter(|(name, value)| {
                        self.is_hashed(name) && !value.canonical_token().is_empty()
                    })
                    .map(|(name, _)| name.as_str());
                digest(record, names)
            }
        }
    }

    /// Computes the fingerprint and caches it on the record.
    pub fn stamp(&self, record: &mut Record) -> String {
        let hash = self.fingerprint(record);
        record.content_hash = Some(hash.clone());
        hash
    }
}
