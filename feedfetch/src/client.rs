use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{FetchError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Shared HTTP client for all feed downloads.
pub fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .user_agent(concat!("feedsync/", env!("CARGO_PKG_VERSION")))
        .build()?;
    Ok(client)
}

/// Where a feed's raw payload comes from.
#[derive(Debug, Clone)]
pub enum RawSource {
    Http {
        client: reqwest::Client,
        url: String,
        /// Directory receiving a dated copy of each download.
        archive_dir: Option<PathBuf>,
    },
    File(PathBuf),
}

impl RawSource {
    pub fn url(client: reqwest::Client, url: impl Into<String>) -> Self {
        RawSource::Http {
            client,
            url: url.into(),
            archive_dir: None,
        }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        RawSource::File(path.into())
    }

    pub fn archive_to(self, dir: impl Into<PathBuf>) -> Self {
        match self {
            RawSource::Http { client, url, .. } => RawSource::Http {
                client,
                url,
                archive_dir: Some(dir.into()),
            },
            other => other,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            RawSource::Http { url, .. } => url.clone(),
            RawSource::File(path) => path.display().to_string(),
        }
    }

    pub async fn read(&self) -> Result<String> {
        match self {
            RawSource::File(path) => {
                log::info!("Reading raw feed from {}", path.display());
                Ok(tokio::fs::read_to_string(path).await?)
            }
            RawSource::Http {
                client,
                url,
                archive_dir,
            } => {
                log::info!("Downloading {}", url);
                let response = client.get(url).send().await?;
                if !response.status().is_success() {
                    return Err(FetchError::Status {
                        status: response.status().as_u16(),
                        url: url.clone(),
                    });
                }
                let body = response.text().await?;
                log::info!("Downloaded {} bytes from {}", body.len(), url);
                if let Some(dir) = archive_dir {
                    archive(dir, &body).await;
                }
                Ok(body)
            }
        }
    }
}

/// Keeps a `YYYY-MM-DD.json` copy of a download. Best effort.
async fn archive(dir: &Path, body: &str) {
    let path = dir.join(format!("{}.json", chrono::Utc::now().format("%Y-%m-%d")));
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        tokio::fs::write(&path, body).await
    }
    .await;
    if let Err(e) = result {
        log::warn!("Could not archive download to {}: {}", path.display(), e);
    }
}
