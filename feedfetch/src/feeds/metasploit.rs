use async_trait::async_trait;
use feedstore::Record;
use serde_json::Value as JsonValue;

use crate::client::RawSource;
use crate::error::{FetchError, Result};
use crate::fetcher::FeedFetcher;
use crate::mapper::{clean_text, find_cve, join_list, set_text, today};

pub const METASPLOIT_METADATA_URL: &str =
    "https://raw.githubusercontent.com/rapid7/metasploit-framework/master/db/modules_metadata_base.json";

/// Scalar fields copied as cleaned text: (output name, source name).
const TEXT_FIELDS: [(&str, &str); 7] = [
    ("module_name", "name"),
    ("rank", "rank"),
    ("type", "type"),
    ("description", "description"),
    ("path", "path"),
    ("rport", "rport"),
    ("mod_time", "mod_time"),
];

static NULL: JsonValue = JsonValue::Null;

/// List fields joined with `;`.
const LIST_FIELDS: [&str; 5] = ["aliases", "author", "references", "platform", "autofilter_services"];

/// Normalizes the module metadata map (`module key -> metadata`).
pub fn normalize(raw: &JsonValue, uploaded_date: &str) -> Result<Vec<Record>> {
    let modules = raw.as_object().ok_or_else(|| {
        FetchError::Shape("module metadata must be an object keyed by module".into())
    })?;

    let mut records = Vec::with_capacity(modules.len());
    for (module_key, meta) in modules {
        let mut record = Record::new(module_key.as_str());
        if !record.has_natural_key() {
            continue;
        }
        let field = |name: &str| meta.get(name).unwrap_or(&NULL);

        for (output, source) in TEXT_FIELDS {
            set_text(&mut record, output, clean_text(field(source)));
        }
        for name in LIST_FIELDS {
            set_text(&mut record, name, join_list(field(name)));
        }
        set_text(
            &mut record,
            "fullname",
            clean_text(field("fullname")).or_else(|| Some(module_key.clone())),
        );
        set_text(
            &mut record,
            "ref_name",
            clean_text(field("ref_name")).or_else(|| Some(module_key.clone())),
        );

        let cve = record.text("references").as_deref().and_then(find_cve);
        set_text(&mut record, "cve_id", cve);

        record.uploaded_date = Some(uploaded_date.to_string());
        records.push(record);
    }
    Ok(records)
}

pub struct MetasploitFetcher {
    source: RawSource,
}

impl MetasploitFetcher {
    pub fn new(source: RawSource) -> Self {
        Self { source }
    }
}

#[async_trait]
impl FeedFetcher for MetasploitFetcher {
    fn name(&self) -> &'static str {
        "metasploit"
    }

    async fn fetch(&self) -> Result<Vec<Record>> {
        let text = self.source.read().await?;
        let raw: JsonValue = serde_json::from_str(&text)?;
        let records = normalize(&raw, &today())?;
        log::info!("Normalized {} modules from {}", records.len(), self.source.describe());
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalizes_module_metadata() {
        let raw = json!({
            "exploit_unix/ftp/vsftpd_234_backdoor": {
                "name": "VSFTPD v2.3.4 Backdoor Command Execution",
                "fullname": "exploit/unix/ftp/vsftpd_234_backdoor",
                "aliases": [],
                "rank": 600,
                "type": "exploit",
                "author": ["hdm <x@metasploit.com>", "MC <mc@metasploit.com>"],
                "description": "This module exploits\n  a malicious backdoor",
                "references": ["OSVDB-73573", "URL-http://example", "CVE-2011-2523"],
                "platform": "unix",
                "autofilter_services": ["ftp"],
                "rport": 21,
                "path": "/modules/exploits/unix/ftp/vsftpd_234_backdoor.rb",
                "ref_name": "unix/ftp/vsftpd_234_backdoor",
                "mod_time": "2020-09-22 02:53:51 +0000"
            }
        });

        let records = normalize(&raw, "2025-05-21").unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.natural_key, "exploit_unix/ftp/vsftpd_234_backdoor");
        assert_eq!(
            record.text("author").as_deref(),
            Some("hdm <x@metasploit.com>;MC <mc@metasploit.com>")
        );
        assert_eq!(record.text("cve_id").as_deref(), Some("CVE-2011-2523"));
        assert_eq!(record.text("description").as_deref(), Some("This module exploits a malicious backdoor"));
        assert_eq!(record.text("rank").as_deref(), Some("600"));
        assert_eq!(record.text("rport").as_deref(), Some("21"));
        assert!(record.get("aliases").is_none());
        assert_eq!(record.text("mod_time").as_deref(), Some("2020-09-22 02:53:51 +0000"));
    }

    #[test]
    fn test_defaults_names_to_module_key() {
        let raw = json!({"auxiliary_scanner/x": {"references": ["URL-only"]}});
        let records = normalize(&raw, "2025-05-21").unwrap();
        assert_eq!(records[0].text("fullname").as_deref(), Some("auxiliary_scanner/x"));
        assert_eq!(records[0].text("ref_name").as_deref(), Some("auxiliary_scanner/x"));
        assert!(records[0].get("cve_id").is_none());
    }

    #[test]
    fn test_rejects_non_object_payload() {
        assert!(matches!(
            normalize(&json!([1, 2]), "2025-05-21"),
            Err(FetchError::Shape(_))
        ));
    }
}
