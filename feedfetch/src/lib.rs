//! Downloaders and normalizers for the supported threat-intelligence feeds.
//!
//! Each feed turns its upstream payload into flat [`feedstore::Record`]s keyed
//! by the feed's natural identifier, ready for reconciliation.

pub mod client;
pub mod error;
pub mod feeds;
pub mod fetcher;
pub mod mapper;

pub use crate::client::{http_client, RawSource};
pub use crate::error::{FetchError, Result};
pub use crate::fetcher::{build_fetcher, FeedFetcher, FetchParams, FEED_NAMES};
