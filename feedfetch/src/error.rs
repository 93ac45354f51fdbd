use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("upstream returned HTTP {status} for {url}")]
    Status { status: u16, url: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("unexpected feed shape: {0}")]
    Shape(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("unknown feed: {0}")]
    UnknownFeed(String),
}

pub type Result<T> = std::result::Result<T, FetchError>;
