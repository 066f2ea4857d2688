use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use url::Url;

use crate::{
    FeedError, Result, DEFAULT_LISTING_URL, DEFAULT_PER_PAGE,
    DEFAULT_PREFETCH_DISTANCE, DEFAULT_USER_AGENT,
};

/// Settings of a feed: where pages come from and how eagerly the
/// controller fetches.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FeedConfig {
    /// Listing endpoint, queried with `per_page` and `since`
    pub listing_url: Url,
    pub per_page: u32,
    /// A row whose id equals `loaded - prefetch_distance` triggers the
    /// next page
    pub prefetch_distance: u64,
    /// `None` keeps every avatar for the lifetime of the feed
    pub cache_capacity: Option<usize>,
    /// `None` lets every visible row download at once
    pub max_concurrent_downloads: Option<usize>,
    pub request_timeout_secs: Option<u64>,
    pub user_agent: String,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            listing_url: Url::parse(DEFAULT_LISTING_URL)
                .expect("default listing url is valid"),
            per_page: DEFAULT_PER_PAGE,
            prefetch_distance: DEFAULT_PREFETCH_DISTANCE,
            cache_capacity: None,
            max_concurrent_downloads: None,
            request_timeout_secs: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl FeedConfig {
    /// Load a configuration from a JSON file, missing fields take their
    /// default values.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        log::debug!("Loading feed config from {}", path.as_ref().display());
        let bytes = fs::read(path.as_ref())?;
        let config: FeedConfig = serde_json::from_slice(&bytes)
            .map_err(|e| FeedError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.per_page == 0 {
            return Err(FeedError::Config(
                "per_page must be greater than zero".to_owned(),
            ));
        }
        if self.cache_capacity == Some(0) {
            return Err(FeedError::Config(
                "cache_capacity must be greater than zero".to_owned(),
            ));
        }
        if self.max_concurrent_downloads == Some(0) {
            return Err(FeedError::Config(
                "max_concurrent_downloads must be greater than zero"
                    .to_owned(),
            ));
        }
        let too_many = self
            .max_concurrent_downloads
            .map_or(false, |n| n > Semaphore::MAX_PERMITS);
        if too_many {
            return Err(FeedError::Config(format!(
                "max_concurrent_downloads must not exceed {}",
                Semaphore::MAX_PERMITS
            )));
        }
        if self.request_timeout_secs == Some(0) {
            return Err(FeedError::Config(
                "request_timeout_secs must be greater than zero".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn cache_limit(&self) -> Option<NonZeroUsize> {
        self.cache_capacity.and_then(NonZeroUsize::new)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_secs.map(Duration::from_secs)
    }
}
