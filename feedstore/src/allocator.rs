//! Surrogate identifiers of the form `<PREFIX>-<partition>-<seq>`.
//!
//! Ids sort lexicographically within a partition because the sequence is
//! zero-padded, and two partitions can never collide because the partition
//! is part of the id.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

use crate::record::Record;

pub const DEFAULT_SEQUENCE_WIDTH: usize = 6;

static LEADING_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\d{4})[-/]").expect("leading year pattern is valid"));
static ANY_YEAR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{4})").expect("year pattern is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedId {
    pub partition: String,
    pub sequence: u64,
}

/// Parses `id` if it was minted under `prefix`.
pub fn parse_id(prefix: &str, id: &str) -> Option<ParsedId> {
    let rest = id.strip_prefix(prefix)?.strip_prefix('-')?;
    let (partition, seq) = rest.rsplit_once('-')?;
    if partition.is_empty() || seq.is_empty() || !seq.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(ParsedId {
        partition: partition.to_string(),
        sequence: seq.parse().ok()?,
    })
}

pub fn format_id(prefix: &str, partition: &str, sequence: u64, width: usize) -> String {
    format!("{prefix}-{partition}-{sequence:0width$}")
}

/// The next id for `partition` given every id known to exist.
pub fn allocate<'a>(
    prefix: &str,
    existing_ids: impl IntoIterator<Item = &'a String>,
    partition: &str,
) -> String {
    IdAllocator::seeded(prefix, DEFAULT_SEQUENCE_WIDTH, existing_ids).allocate(partition)
}

/// Ids held by the live store, indexed by the natural key of their items.
pub struct LiveIds<'a> {
    live: &'a HashMap<String, String>,
    by_natural: HashMap<&'a str, &'a str>,
}

impl<'a> LiveIds<'a> {
    /// `live` maps each stored id to the natural key its item carries.
    pub fn new(live: &'a HashMap<String, String>) -> Self {
        let mut by_natural: HashMap<&str, &str> = HashMap::new();
        for (id, natural) in live {
            by_natural
                .entry(natural.as_str())
                .and_modify(|held| {
                    if id.as_str() < *held {
                        *held = id.as_str();
                    }
                })
                .or_insert(id.as_str());
        }
        Self { live, by_natural }
    }

    /// The id to keep for `natural_key`: its baseline id while the store
    /// still holds it, otherwise the id of a stored item already carrying
    /// that natural key. `None` means a fresh id must be minted.
    pub fn reuse(&self, baseline_id: Option<&str>, natural_key: &str) -> Option<String> {
        baseline_id
            .filter(|id| self.live.contains_key(*id))
            .or_else(|| self.by_natural.get(natural_key).copied())
            .map(str::to_string)
    }
}

/// Stateful allocator for one run.
///
/// Seeded once with every id known to the store or the baseline, then hands
/// out ids strictly sequentially per partition.
#[derive(Debug)]
pub struct IdAllocator {
    prefix: String,
    width: usize,
    high_water: HashMap<String, u64>,
}

impl IdAllocator {
    pub fn new(prefix: impl Into<String>, width: usize) -> Self {
        Self {
            prefix: prefix.into(),
            width,
            high_water: HashMap::new(),
        }
    }

    pub fn seeded<'a>(
        prefix: impl Into<String>,
        width: usize,
        known_ids: impl IntoIterator<Item = &'a String>,
    ) -> Self {
        let mut allocator = Self::new(prefix, width);
        for id in known_ids {
            allocator.observe(id);
        }
        allocator
    }

    /// Records an id as taken.
    pub fn observe(&mut self, id: &str) {
        if let Some(parsed) = parse_id(&self.prefix, id) {
            let entry = self.high_water.entry(parsed.partition).or_insert(0);
            *entry = (*entry).max(parsed.sequence);
        }
    }

    pub fn allocate(&mut self, partition: &str) -> String {
        let next = self.high_water.get(partition).copied().unwrap_or(0) + 1;
        self.high_water.insert(partition.to_string(), next);
        let id = format_id(&self.prefix, partition, next, self.width);
        log::debug!("Allocated surrogate id {id}");
        id
    }
}

/// Best-effort year extraction from a free-form date string.
pub fn extract_year(raw: &str) -> Option<i32> {
    let s = raw.trim();
    if s.is_empty() {
        return None;
    }
    if let Some(caps) = LEADING_YEAR_RE.captures(s) {
        if let Ok(year) = caps[1].parse() {
            return Some(year);
        }
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S %z") {
        return Some(dt.year());
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%SZ"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(dt.year());
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(date.year());
    }
    ANY_YEAR_RE
        .captures(s)
        .and_then(|caps| caps[1].parse().ok())
}

/// Partition (year) for a record: the first of `partition_fields` that yields
/// a year, else `fallback_year`.
pub fn derive_partition(
    record: &Record,
    partition_fields: &[String],
    fallback_year: i32,
) -> String {
    partition_fields
        .iter()
        .find_map(|field| {
            let raw = if field == crate::record::UPLOADED_DATE {
                record.uploaded_date.clone()
            } else {
                record.get(field).map(|v| v.to_string())
            };
            raw.as_deref().and_then(extract_year)
        })
        .unwrap_or(fallback_year)
        .to_string()
}
