use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use feedstore::Record;

use crate::client::{http_client, RawSource};
use crate::error::{FetchError, Result};
use crate::feeds::cisa::{CisaFetcher, CISA_KEV_URL};
use crate::feeds::epss::{EpssFetcher, FirstEpssClient};
use crate::feeds::metasploit::{MetasploitFetcher, METASPLOIT_METADATA_URL};
use crate::feeds::misp::{MispFetcher, MISP_THREAT_ACTOR_URL};

/// Produces the current normalized records of one feed.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    fn name(&self) -> &'static str;
    async fn fetch(&self) -> Result<Vec<Record>>;
}

/// How to build a fetcher for one run.
#[derive(Debug, Clone, Default)]
pub struct FetchParams {
    /// Local payload to read instead of downloading. For `epss` this is the
    /// CSV list of CVE ids and is required.
    pub input: Option<PathBuf>,
    /// Overrides the feed's default download URL.
    pub url: Option<String>,
    /// Receives a dated copy of each download.
    pub archive_dir: Option<PathBuf>,
    /// Keys already synchronized; only `epss` uses them.
    pub known_keys: HashSet<String>,
}

impl FetchParams {
    fn source(&self, default_url: &str) -> Result<RawSource> {
        if let Some(path) = &self.input {
            return Ok(RawSource::file(path));
        }
        let url = self.url.as_deref().unwrap_or(default_url);
        let source = RawSource::url(http_client()?, url);
        Ok(match &self.archive_dir {
            Some(dir) => source.archive_to(dir),
            None => source,
        })
    }
}

pub const FEED_NAMES: [&str; 4] = ["cisa", "metasploit", "misp", "epss"];

pub fn build_fetcher(feed: &str, params: FetchParams) -> Result<Box<dyn FeedFetcher>> {
    let fetcher: Box<dyn FeedFetcher> = match feed {
        "cisa" => Box::new(CisaFetcher::new(params.source(CISA_KEV_URL)?)),
        "metasploit" => Box::new(MetasploitFetcher::new(params.source(METASPLOIT_METADATA_URL)?)),
        "misp" => Box::new(MispFetcher::new(params.source(MISP_THREAT_ACTOR_URL)?)),
        "epss" => {
            let list = params.input.clone().ok_or_else(|| {
                FetchError::InvalidParam("epss needs a CSV list of CVE ids as input".into())
            })?;
            let client = match &params.url {
                Some(url) => FirstEpssClient::with_base_url(http_client()?, url.clone()),
                None => FirstEpssClient::new(http_client()?),
            };
            Box::new(
                EpssFetcher::new(Arc::new(client), RawSource::file(list))
                    .skipping(params.known_keys),
            )
        }
        other => return Err(FetchError::UnknownFeed(other.to_string())),
    };
    Ok(fetcher)
}
