use std::fmt;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use tracing::debug;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),
    #[error("invalid JSON body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// HTTP client whose requests share a single per-second quota.
#[derive(Clone)]
pub struct RateLimitedClient {
    client: Client,
    limiter: Arc<DirectLimiter>,
}

impl fmt::Debug for RateLimitedClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitedClient").finish_non_exhaustive()
    }
}

impl RateLimitedClient {
    pub fn new(client: Client, requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(nonzero!(1u32));
        Self {
            client,
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    pub fn with_timeout(timeout: Duration, requests_per_second: u32) -> Result<Self, HttpError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::new(client, requests_per_second))
    }

    /// GET `url` with `query` once the quota allows and decode the JSON body.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &Url,
        query: &[(&str, String)],
    ) -> Result<T, HttpError> {
        self.limiter.until_ready().await;
        let resp = self.client.get(url.clone()).query(query).send().await?;
        let status = resp.status();
        if !status.is_success() {
            debug!(%status, %url, "explorer request rejected");
            return Err(HttpError::Status(status));
        }
        let bytes = resp.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
