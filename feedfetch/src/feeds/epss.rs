//! FIRST EPSS scores, fetched incrementally in rate-limited batches.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feedstore::Record;
use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::client::RawSource;
use crate::error::{FetchError, Result};
use crate::fetcher::FeedFetcher;
use crate::mapper::{clean_str, clean_text, set_text, today};

pub const EPSS_API_URL: &str = "https://api.first.org/data/v1/epss";
pub const EPSS_BATCH_SIZE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
pub struct EpssScore {
    pub cve: String,
    #[serde(default)]
    pub epss: Option<JsonValue>,
    #[serde(default)]
    pub percentile: Option<JsonValue>,
    #[serde(default)]
    pub date: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EpssPage {
    #[serde(default)]
    data: Vec<EpssScore>,
}

/// Answer to one batched score query.
#[derive(Debug)]
pub enum EpssResponse {
    Scores(Vec<EpssScore>),
    /// HTTP 429; the batch should be retried after a cooldown.
    RateLimited,
    /// Any other non-success status.
    Rejected(u16),
}

#[async_trait]
pub trait EpssApi: Send + Sync {
    async fn query(&self, cves: &[String]) -> Result<EpssResponse>;
}

pub struct FirstEpssClient {
    http: reqwest::Client,
    base_url: String,
}

impl FirstEpssClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self::with_base_url(http, EPSS_API_URL)
    }

    pub fn with_base_url(http: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl EpssApi for FirstEpssClient {
    async fn query(&self, cves: &[String]) -> Result<EpssResponse> {
        let response = self
            .http
            .get(&self.base_url)
            .query(&[("cve", cves.join(","))])
            .send()
            .await?;
        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Ok(EpssResponse::RateLimited);
        }
        if !status.is_success() {
            return Ok(EpssResponse::Rejected(status.as_u16()));
        }
        let page: EpssPage = response.json().await?;
        Ok(EpssResponse::Scores(page.data))
    }
}

/// Pacing of requests against the scoring API.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Pause after every request.
    pub delay: Duration,
    /// Pause after a 429 before retrying the same batch.
    pub cooldown: Duration,
    /// Consecutive 429s tolerated before the run stops asking.
    pub max_cooldowns: u32,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(60),
            cooldown: Duration::from_secs(120),
            max_cooldowns: 5,
        }
    }
}

/// CVE ids from the `id` column of a CSV export, in file order, deduplicated.
pub fn parse_cve_list(text: &str) -> Result<Vec<String>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_reader(text.as_bytes());
    let column = reader
        .headers()?
        .iter()
        .position(|name| name.trim().trim_start_matches('\u{feff}') == "id")
        .ok_or_else(|| FetchError::InvalidParam("CVE list has no 'id' column".into()))?;

    let mut seen = HashSet::new();
    let mut cves = Vec::new();
    for row in reader.records() {
        let row = row?;
        if let Some(cve) = row.get(column).and_then(clean_str) {
            if seen.insert(cve.clone()) {
                cves.push(cve);
            }
        }
    }
    Ok(cves)
}

pub fn score_to_record(score: &EpssScore, uploaded_date: &str) -> Record {
    let mut record = Record::new(score.cve.as_str());
    set_text(&mut record, "epss", score.epss.as_ref().and_then(clean_text));
    set_text(&mut record, "percentile", score.percentile.as_ref().and_then(clean_text));
    set_text(&mut record, "date", score.date.as_deref().and_then(clean_str));
    record.uploaded_date = Some(uploaded_date.to_string());
    record
}

/// Fetches scores for CVEs not already synchronized.
pub struct EpssFetcher {
    api: Arc<dyn EpssApi>,
    cve_list: RawSource,
    known: HashSet<String>,
    batch_size: usize,
    rate_limit: RateLimit,
}

impl EpssFetcher {
    pub fn new(api: Arc<dyn EpssApi>, cve_list: RawSource) -> Self {
        Self {
            api,
            cve_list,
            known: HashSet::new(),
            batch_size: EPSS_BATCH_SIZE,
            rate_limit: RateLimit::default(),
        }
    }

    /// CVEs to skip, typically the keys of the last baseline.
    pub fn skipping(mut self, known: HashSet<String>) -> Self {
        self.known = known;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Queries `remaining` batch by batch. A rate-limited batch is retried
    /// after the cooldown; any other failure leaves it for the next run.
    pub async fn collect_scores(&self, remaining: &[String]) -> Vec<EpssScore> {
        let mut scores = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut offset = 0;
        let mut cooldowns = 0;
        let batches = remaining.len().div_ceil(self.batch_size);

        while offset < remaining.len() {
            let end = (offset + self.batch_size).min(remaining.len());
            let batch = &remaining[offset..end];
            let number = offset / self.batch_size + 1;

            match self.api.query(batch).await {
                Ok(EpssResponse::RateLimited) => {
                    cooldowns += 1;
                    if cooldowns > self.rate_limit.max_cooldowns {
                        log::warn!(
                            "Still rate limited after {} cooldowns; leaving {} CVEs for the next run",
                            self.rate_limit.max_cooldowns,
                            remaining.len() - offset
                        );
                        break;
                    }
                    log::warn!("Rate limit exceeded; sleeping {:?}", self.rate_limit.cooldown);
                    tokio::time::sleep(self.rate_limit.cooldown).await;
                    continue;
                }
                Ok(EpssResponse::Scores(page)) => {
                    let before = scores.len();
                    for score in page {
                        if seen.insert(score.cve.clone()) {
                            scores.push(score);
                        }
                    }
                    log::info!(
                        "Batch {}/{}: {} scores (total {})",
                        number,
                        batches,
                        scores.len() - before,
                        scores.len()
                    );
                }
                Ok(EpssResponse::Rejected(status)) => {
                    log::warn!("Batch {}/{} rejected with HTTP {}", number, batches, status);
                }
                Err(e) => {
                    log::warn!("Batch {}/{} failed: {}", number, batches, e);
                }
            }
            cooldowns = 0;
            offset = end;
            tokio::time::sleep(self.rate_limit.delay).await;
        }
        scores
    }
}

#[async_trait]
impl FeedFetcher for EpssFetcher {
    fn name(&self) -> &'static str {
        "epss"
    }

    async fn fetch(&self) -> Result<Vec<Record>> {
        let all = parse_cve_list(&self.cve_list.read().await?)?;
        let remaining: Vec<String> = all
            .iter()
            .filter(|cve| !self.known.contains(*cve))
            .cloned()
            .collect();
        log::info!(
            "{} CVEs listed, {} already scored, {} remaining",
            all.len(),
            all.len() - remaining.len(),
            remaining.len()
        );
        if remaining.is_empty() {
            return Ok(Vec::new());
        }

        let uploaded_date = today();
        let records = self
            .collect_scores(&remaining)
            .await
            .iter()
            .map(|score| score_to_record(score, &uploaded_date))
            .collect();
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    struct MockEpssApi {
        responses: Mutex<VecDeque<Result<EpssResponse>>>,
        queries: Mutex<Vec<Vec<String>>>,
    }

    impl MockEpssApi {
        fn new(responses: Vec<Result<EpssResponse>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                queries: Mutex::new(Vec::new()),
            }
        }

        fn queries(&self) -> Vec<Vec<String>> {
            self.queries.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl EpssApi for MockEpssApi {
        async fn query(&self, cves: &[String]) -> Result<EpssResponse> {
            self.queries.lock().unwrap().push(cves.to_vec());
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(EpssResponse::Rejected(500)))
        }
    }

    fn score(cve: &str, epss: &str) -> EpssScore {
        EpssScore {
            cve: cve.to_string(),
            epss: Some(JsonValue::String(epss.to_string())),
            percentile: Some(JsonValue::String("0.5".into())),
            date: Some("2025-05-21".into()),
        }
    }

    fn fast() -> RateLimit {
        RateLimit {
            delay: Duration::from_millis(1),
            cooldown: Duration::from_millis(1),
            max_cooldowns: 2,
        }
    }

    fn cves(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_cve_list() {
        let csv = "\u{feff}id,description\nCVE-2024-1,\"a, quoted\"\n\nCVE-2024-2,x\nCVE-2024-1,dup\n";
        assert_eq!(parse_cve_list(csv).unwrap(), cves(&["CVE-2024-1", "CVE-2024-2"]));
        assert!(parse_cve_list("cve\nCVE-1").is_err());
        assert!(parse_cve_list("").is_err());
    }

    #[test]
    fn test_parse_cve_list_keeps_quoted_newlines_in_their_field() {
        let csv = "id,description\nCVE-2024-1,\"multi\nline \"\"quoted\"\"\"\nCVE-2024-2,x\n";
        assert_eq!(parse_cve_list(csv).unwrap(), cves(&["CVE-2024-1", "CVE-2024-2"]));
    }

    #[tokio::test]
    async fn test_rate_limited_batch_is_retried() {
        let api = Arc::new(MockEpssApi::new(vec![
            Ok(EpssResponse::Scores(vec![score("CVE-1", "0.1"), score("CVE-2", "0.2")])),
            Ok(EpssResponse::RateLimited),
            Ok(EpssResponse::Scores(vec![score("CVE-3", "0.3")])),
        ]));
        let fetcher = EpssFetcher::new(api.clone(), RawSource::file("unused.csv"))
            .with_batch_size(2)
            .with_rate_limit(fast());

        let scores = fetcher
            .collect_scores(&cves(&["CVE-1", "CVE-2", "CVE-3"]))
            .await;
        assert_eq!(scores.len(), 3);
        let queries = api.queries();
        assert_eq!(queries.len(), 3);
        assert_eq!(queries[1], queries[2]);
        assert_eq!(queries[2], cves(&["CVE-3"]));
    }

    #[tokio::test]
    async fn test_failed_batches_are_skipped() {
        let api = Arc::new(MockEpssApi::new(vec![
            Ok(EpssResponse::Rejected(503)),
            Err(FetchError::Shape("bad body".into())),
            Ok(EpssResponse::Scores(vec![score("CVE-3", "0.3")])),
        ]));
        let fetcher = EpssFetcher::new(api.clone(), RawSource::file("unused.csv"))
            .with_batch_size(1)
            .with_rate_limit(fast());

        let scores = fetcher
            .collect_scores(&cves(&["CVE-1", "CVE-2", "CVE-3"]))
            .await;
        assert_eq!(scores.len(), 1);
        assert_eq!(scores[0].cve, "CVE-3");
    }

    #[tokio::test]
    async fn test_gives_up_after_repeated_rate_limits() {
        let api = Arc::new(MockEpssApi::new(vec![
            Ok(EpssResponse::RateLimited),
            Ok(EpssResponse::RateLimited),
            Ok(EpssResponse::RateLimited),
        ]));
        let fetcher = EpssFetcher::new(api.clone(), RawSource::file("unused.csv"))
            .with_rate_limit(fast());

        let scores = fetcher.collect_scores(&cves(&["CVE-1"])).await;
        assert!(scores.is_empty());
        assert_eq!(api.queries().len(), 3);
    }

    #[tokio::test]
    async fn test_fetch_skips_known_cves() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("all_cves.csv");
        std::fs::write(&path, "id\nCVE-2024-1\nCVE-2024-2\n").unwrap();

        let api = Arc::new(MockEpssApi::new(vec![Ok(EpssResponse::Scores(vec![score(
            "CVE-2024-2",
            "0.00043",
        )]))]));
        let fetcher = EpssFetcher::new(api.clone(), RawSource::file(&path))
            .skipping(HashSet::from(["CVE-2024-1".to_string()]))
            .with_rate_limit(fast());

        let records = fetcher.fetch().await.unwrap();
        assert_eq!(api.queries(), vec![cves(&["CVE-2024-2"])]);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].natural_key, "CVE-2024-2");
        assert_eq!(records[0].text("epss").as_deref(), Some("0.00043"));
        assert_eq!(records[0].text("date").as_deref(), Some("2025-05-21"));
    }
}
