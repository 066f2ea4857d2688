use std::future::Future;

use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use url::Url;

use crate::config::FeedConfig;
use crate::record::{Avatar, Cursor, Record};
use crate::{FeedError, Result};

/// Transport behind a feed: one call per listing page, one per avatar.
///
/// The controller spawns every returned future on its own task and drops
/// it when the fetch gets cancelled, so implementations must not detach
/// work that outlives the future.
pub trait FeedSource: Send + Sync + 'static {
    fn fetch_page(
        &self,
        cursor: Cursor,
    ) -> impl Future<Output = Result<Vec<Record>>> + Send;

    fn fetch_image(
        &self,
        uri: &str,
    ) -> impl Future<Output = Result<Avatar>> + Send;
}

/// [`FeedSource`] reading a JSON listing over HTTP and decoding avatars
/// with the `image` crate.
pub struct HttpSource {
    client: reqwest::Client,
    listing_url: Url,
    per_page: u32,
}

impl HttpSource {
    pub fn new(config: &FeedConfig) -> Result<Self> {
        config.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&config.user_agent)
                .map_err(|e| FeedError::Config(e.to_string()))?,
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder().default_headers(headers);
        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        Ok(Self {
            client: builder.build()?,
            listing_url: config.listing_url.clone(),
            per_page: config.per_page,
        })
    }

    /// `<listing>?per_page=<N>&since=<cursor>`
    pub fn page_url(&self, cursor: Cursor) -> Url {
        let mut url = self.listing_url.clone();
        url.query_pairs_mut()
            .append_pair("per_page", &self.per_page.to_string())
            .append_pair("since", &cursor.since.to_string());
        url
    }
}

impl FeedSource for HttpSource {
    async fn fetch_page(&self, cursor: Cursor) -> Result<Vec<Record>> {
        let url = self.page_url(cursor);
        log::debug!("http: fetching page {}", url);

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        decode_page(&bytes)
    }

    async fn fetch_image(&self, uri: &str) -> Result<Avatar> {
        let url = Url::parse(uri).map_err(|e| {
            FeedError::Transport(format!("invalid avatar url {}: {}", uri, e))
        })?;
        log::trace!("http: fetching avatar {}", url);

        let bytes = self
            .client
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        // Decoding is CPU bound, keep it off the runtime workers
        tokio::task::spawn_blocking(move || decode_image(&bytes)).await?
    }
}

/// A page is admitted whole or not at all.
pub fn decode_page(bytes: &[u8]) -> Result<Vec<Record>> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn decode_image(bytes: &[u8]) -> Result<Avatar> {
    let image = image::load_from_memory(bytes)?;
    Ok(Avatar::new(image))
}
