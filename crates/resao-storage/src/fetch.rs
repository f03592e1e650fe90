//! JSON feed download with bounded retries on transient failures.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use thiserror::Error;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Doubles from `base_delay` per retry. A server-supplied `Retry-After` wins over the
    /// doubling; both are capped at `max_delay`.
    pub fn delay_for(&self, retry: usize, retry_after: Option<Duration>) -> Duration {
        let delay = retry_after.unwrap_or_else(|| {
            let factor = 1u32.checked_shl(retry as u32).unwrap_or(u32::MAX);
            self.base_delay.saturating_mul(factor)
        });
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct FeedFetchConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub retry: RetryPolicy,
}

impl Default for FeedFetchConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedFeed {
    /// URL after redirects.
    pub url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("feed {url} answered http {status}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    fn is_transient(&self) -> bool {
        match self {
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 429,
            Self::Request { source, .. } => source.is_timeout() || source.is_connect(),
        }
    }
}

/// Downloads a scraper service's JSON feed.
#[derive(Debug, Clone)]
pub struct FeedFetcher {
    client: reqwest::Client,
    retry: RetryPolicy,
}

impl FeedFetcher {
    pub fn new(config: FeedFetchConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building feed http client")?;
        Ok(Self {
            client,
            retry: config.retry,
        })
    }

    pub async fn fetch(&self, run_id: Uuid, url: &str) -> Result<FetchedFeed, FetchError> {
        let span = info_span!("feed_fetch", %run_id, url);
        async {
            let mut retry = 0;
            loop {
                let (err, retry_after) = match self.attempt(url).await {
                    Ok(feed) => return Ok(feed),
                    Err(failure) => failure,
                };
                if !err.is_transient() || retry >= self.retry.max_retries {
                    return Err(err);
                }
                let delay = self.retry.delay_for(retry, retry_after);
                warn!(
                    retry = retry + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "feed fetch failed, retrying"
                );
                tokio::time::sleep(delay).await;
                retry += 1;
            }
        }
        .instrument(span)
        .await
    }

    async fn attempt(&self, url: &str) -> Result<FetchedFeed, (FetchError, Option<Duration>)> {
        let response = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| {
                let url = url.to_string();
                (FetchError::Request { url, source }, None)
            })?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            let retry_after = retry_after(response.headers());
            let err = FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            };
            return Err((err, retry_after));
        }
        match response.bytes().await {
            Ok(body) => Ok(FetchedFeed {
                url: final_url,
                body: body.to_vec(),
            }),
            Err(source) => Err((FetchError::Request { url: final_url, source }, None)),
        }
    }
}

/// Only the delay-seconds form; an HTTP-date falls back to the policy's doubling.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_doubles_and_respects_the_cap() {
        let policy = RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for(0, None), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1, None), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40, None), Duration::from_millis(350));
        assert_eq!(policy.delay_for(0, Some(Duration::ZERO)), Duration::ZERO);
        assert_eq!(
            policy.delay_for(0, Some(Duration::from_secs(120))),
            Duration::from_millis(350)
        );
    }

    #[test]
    fn retry_after_reads_delay_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, "7".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
