use async_trait::async_trait;
use feedstore::Record;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::client::RawSource;
use crate::error::Result;
use crate::fetcher::FeedFetcher;
use crate::mapper::{clean_text, find_cve, lookup, set_text, today};

pub const CISA_KEV_URL: &str =
    "https://www.cisa.gov/sites/default/files/feeds/known_exploited_vulnerabilities.json";

const LIST_KEYS: [&str; 4] = [
    "vulnerabilities",
    "knownExploitedVulnerabilities",
    "knownExploitedVulnerabilitiesList",
    "items",
];

/// Output field and the source names it may appear under.
const FIELDS: [(&str, &[&str]); 10] = [
    ("vendorProject", &["vendorProject", "vendor", "vendor_project", "vendorName"]),
    ("product", &["product", "productName", "products"]),
    ("vulnerabilityName", &["vulnerabilityName", "vulnerability_name", "vulnName"]),
    ("dateAdded", &["dateAdded", "date_added", "datePublished"]),
    ("shortDescription", &["shortDescription", "short_description"]),
    ("requiredAction", &["requiredAction", "required_action"]),
    ("dueDate", &["dueDate", "due_date"]),
    ("knownRansomwareCampaignUse", &["knownRansomwareCampaignUse"]),
    ("notes", &["notes", "note", "reference"]),
    ("cwes", &["cwes", "cwe"]),
];

const KEY_ALIASES: [&str; 4] = ["cveID", "cve", "vulnerabilityID", "cveId"];

fn looks_like_entry(value: &JsonValue) -> bool {
    value
        .as_object()
        .is_some_and(|o| ["cveID", "cve", "vulnerabilityID"].iter().any(|k| o.contains_key(*k)))
}

fn objects(items: &[JsonValue]) -> Vec<&JsonMap<String, JsonValue>> {
    items.iter().filter_map(JsonValue::as_object).collect()
}

fn locate_entries(raw: &JsonValue) -> Vec<&JsonMap<String, JsonValue>> {
    match raw {
        JsonValue::Array(items) => objects(items),
        JsonValue::Object(map) => {
            if let Some(items) = LIST_KEYS.iter().find_map(|k| map.get(*k)?.as_array()) {
                return objects(items);
            }
            if let Some(items) = map.values().find_map(|v| {
                v.as_array()
                    .filter(|items| items.first().is_some_and(looks_like_entry))
            }) {
                return objects(items);
            }
            map.values()
                .filter_map(JsonValue::as_object)
                .filter(|o| o.keys().any(|k| k.to_lowercase().starts_with("cve")))
                .collect()
        }
        _ => Vec::new(),
    }
}

/// Normalizes a KEV catalog. Entries with no recoverable CVE id are dropped.
pub fn normalize(raw: &JsonValue, uploaded_date: &str) -> Vec<Record> {
    let mut records = Vec::new();
    for entry in locate_entries(raw) {
        let key = lookup(entry, &KEY_ALIASES)
            .and_then(clean_text)
            .or_else(|| {
                entry
                    .values()
                    .find_map(|v| find_cve(&serde_json::to_string(v).unwrap_or_default()))
            });
        let Some(key) = key else {
            log::debug!("Dropping KEV entry without a CVE id");
            continue;
        };

        let mut record = Record::new(key);
        for (field, aliases) in FIELDS {
            set_text(&mut record, field, lookup(entry, aliases).and_then(clean_text));
        }
        record.uploaded_date = Some(uploaded_date.to_string());
        records.push(record);
    }
    records
}

pub struct CisaFetcher {
    source: RawSource,
}

impl CisaFetcher {
    pub fn new(source: RawSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl FeedFetcher for CisaFetcher {
    fn name(&self) -> &'static str {
        "cisa"
    }

    async fn fetch(&self) -> Result<Vec<Record>> {
        let text = self.source.read().await?;
        let raw: JsonValue = serde_json::from_str(&text)?;
        let records = normalize(&raw, &today());
        log::info!("Normalized {} KEV entries from {}", records.len(), self.source.describe());
        Ok(records)
    }
}
