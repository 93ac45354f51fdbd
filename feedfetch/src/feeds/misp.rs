use async_trait::async_trait;
use feedstore::Record;
use serde_json::{Map as JsonMap, Value as JsonValue};

use crate::client::RawSource;
use crate::error::Result;
use crate::fetcher::FeedFetcher;
use crate::mapper::{clean_text, set_text, today};

pub const MISP_THREAT_ACTOR_URL: &str =
    "https://raw.githubusercontent.com/MISP/misp-galaxy/main/clusters/threat-actor.json";

const PASSTHROUGH_FIELDS: [&str; 4] = ["type", "name", "category", "namespace"];

fn as_list(value: &JsonValue) -> Vec<&JsonValue> {
    match value {
        JsonValue::Null => Vec::new(),
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => map.values().collect(),
        other => vec![other],
    }
}

fn is_cluster_map(map: &JsonMap<String, JsonValue>) -> bool {
    let sample: Vec<&JsonValue> = map.values().take(6).collect();
    !sample.is_empty()
        && sample.iter().all(|v| v.is_object())
        && sample.iter().any(|v| {
            ["uuid", "value", "name"]
                .iter()
                .any(|k| v.get(*k).is_some())
        })
}

/// Finds the cluster objects in the known galaxy layouts, most specific first.
fn locate_clusters(raw: &JsonValue) -> Vec<&JsonMap<String, JsonValue>> {
    let candidates: Vec<&JsonValue> = match raw {
        JsonValue::Array(_) => as_list(raw),
        JsonValue::Object(map) => {
            let mut found = Vec::new();
            for key in ["clusters", "value"] {
                if let Some(value) = map.get(key) {
                    found = as_list(value);
                    if !found.is_empty() {
                        break;
                    }
                }
            }
            if found.is_empty() && is_cluster_map(map) {
                found = as_list(raw);
            }
            if found.is_empty() {
                if let Some(data) = map.get("data") {
                    found = as_list(data);
                }
            }
            if found.is_empty() {
                if let Some(items) = map.values().find_map(|v| {
                    v.as_array()
                        .filter(|items| items.first().is_some_and(JsonValue::is_object))
                }) {
                    found = items.iter().collect();
                }
            }
            found
        }
        _ => Vec::new(),
    };
    candidates.into_iter().filter_map(JsonValue::as_object).collect()
}

fn first_text(cluster: &JsonMap<String, JsonValue>, names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| cluster.get(*name).and_then(clean_text))
}

/// Flattens one cluster; `None` when it carries no usable identifier.
fn flatten(cluster: &JsonMap<String, JsonValue>, uploaded_date: &str) -> Option<Record> {
    let uuid = first_text(cluster, &["uuid", "id", "value"])?;
    let mut record = Record::new(uuid);

    set_text(&mut record, "description", cluster.get("description").and_then(clean_text));
    set_text(&mut record, "related", cluster.get("related").and_then(clean_text));
    set_text(&mut record, "value", first_text(cluster, &["value", "name", "title"]));
    set_text(&mut record, "meta.refs", cluster.get("refs").and_then(clean_text));
    set_text(&mut record, "tags", cluster.get("tags").and_then(clean_text));
    set_text(&mut record, "meta.synonyms", cluster.get("synonyms").and_then(clean_text));

    if let Some(JsonValue::Object(meta)) = cluster.get("meta") {
        for (key, value) in meta {
            set_text(&mut record, &format!("meta.{key}"), clean_text(value));
        }
    }
    for name in PASSTHROUGH_FIELDS {
        set_text(&mut record, name, cluster.get(name).and_then(clean_text));
    }

    record.uploaded_date = Some(uploaded_date.to_string());
    Some(record)
}

/// Normalizes a galaxy cluster file into one record per cluster.
pub fn normalize(raw: &JsonValue, uploaded_date: &str) -> Vec<Record> {
    let clusters = locate_clusters(raw);
    if clusters.is_empty() {
        log::warn!("No clusters found in galaxy payload");
    }
    clusters
        .into_iter()
        .filter_map(|cluster| flatten(cluster, uploaded_date))
        .collect()
}

pub struct MispFetcher {
    source: RawSource,
}

impl MispFetcher {
    pub fn new(source: RawSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl FeedFetcher for MispFetcher {
    fn name(&self) -> &'static str {
        "misp"
    }

    async fn fetch(&self) -> Result<Vec<Record>> {
        let text = self.source.read().await?;
        let raw: JsonValue = serde_json::from_str(&text)?;
        let records = normalize(&raw, &today());
        log::info!("Flattened {} clusters from {}", records.len(), self.source.describe());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_flattens_galaxy_clusters() {
        let raw = json!({
            "name": "Threat Actor",
            "type": "threat-actor",
            "values": [],
            "clusters": [
                {
                    "uuid": "7cdff317-a673-4474-84ec-4f1754947823",
                    "value": "APT1",
                    "description": "PLA Unit 61398",
                    "meta": {
                        "country": "CN",
                        "refs": ["https://a", "https://b"],
                        "synonyms": ["Comment Crew"]
                    },
                    "related": [{"dest-uuid": "x", "type": "similar"}]
                }
            ]
        });
        let records = normalize(&raw, "2025-05-21");
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.natural_key, "7cdff317-a673-4474-84ec-4f1754947823");
        assert_eq!(record.text("value").as_deref(), Some("APT1"));
        assert_eq!(record.text("meta.country").as_deref(), Some("CN"));
        assert_eq!(
            record.text("meta.refs").as_deref(),
            Some("[\"https://a\",\"https://b\"]")
        );
        assert_eq!(
            record.text("related").as_deref(),
            Some("[{\"dest-uuid\":\"x\",\"type\":\"similar\"}]")
        );
        assert!(record.get("uuid").is_none());
    }

    #[test]
    fn test_keyed_object_and_identifier_fallbacks() {
        let raw = json!({
            "a": {"value": "Lazarus", "name": "ignored"},
            "b": {"id": "id-2", "title": "Turla"},
            "c": {"description": "no identifier"}
        });
        let records = normalize(&raw, "2025-05-21");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].natural_key, "Lazarus");
        assert_eq!(records[1].natural_key, "id-2");
        assert_eq!(records[1].text("value").as_deref(), Some("Turla"));
    }

    #[test]
    fn test_top_level_list() {
        let raw = json!([{"uuid": "u-1", "value": "X"}, "junk"]);
        let records = normalize(&raw, "2025-05-21");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].uploaded_date.as_deref(), Some("2025-05-21"));
    }
}
