//! HTTP client for downloading page resources

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::Client;
use reqwest::header::{CONTENT_TYPE, REFERER, USER_AGENT};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Hosts that must receive no `User-Agent` header. Font CDNs answer with
/// browser-specific CSS when they see one.
const USER_AGENT_EXEMPT_HOSTS: &[&str] = &["fonts.googleapis.com", "fonts.gstatic.com"];

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Too many redirects")]
    TooManyRedirects,
}

pub type Result<T> = std::result::Result<T, FetchError>;

/// Raw outcome of a resource GET. Non-2xx statuses are data, not errors.
#[derive(Debug, Clone)]
pub struct FetchedResource {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Bytes,
}

impl FetchedResource {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<FetchedResource>;
}

/// Whether the `User-Agent` header is withheld for this URL
pub fn omits_user_agent(url: &str) -> bool {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_ascii_lowercase))
        .is_some_and(|host| USER_AGENT_EXEMPT_HOSTS.contains(&host.as_str()))
}

/// HTTP fetcher configuration
#[derive(Debug, Clone)]
pub struct FetcherConfig {
    pub request_timeout: Duration,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_delay: Duration::from_millis(250),
        }
    }
}

impl From<&crate::config::Config> for FetcherConfig {
    fn from(config: &crate::config::Config) -> Self {
        Self {
            request_timeout: config.resources.fetch_timeout.into(),
            max_retries: config.resources.max_retries,
            retry_delay: config.http.retry_delay.into(),
        }
    }
}

/// reqwest-backed resource fetcher
pub struct HttpResourceFetcher {
    client: Client,
    config: FetcherConfig,
}

impl HttpResourceFetcher {
    pub fn new(config: FetcherConfig) -> Result<Self> {
        // No default User-Agent: it is set per request, or deliberately omitted
        let client = Client::builder()
            .timeout(config.request_timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    async fn fetch_once(
        &self,
        url: &str,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<FetchedResource> {
        debug!(url, "Fetching resource");

        let mut request = self.client.get(url);
        if let Some(ua) = user_agent.filter(|_| !omits_user_agent(url)) {
            request = request.header(USER_AGENT, ua);
        }
        if let Some(referer) = referer {
            request = request.header(REFERER, referer);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                FetchError::Timeout
            } else if e.is_redirect() {
                FetchError::TooManyRedirects
            } else if e.is_builder() {
                FetchError::InvalidUrl(url.to_string())
            } else {
                FetchError::RequestFailed(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let body = response
            .bytes()
            .await
            .map_err(|e| FetchError::RequestFailed(format!("Failed to read body: {}", e)))?;

        debug!(url, status, size = body.len(), "Resource fetched");

        Ok(FetchedResource {
            status,
            content_type,
            body,
        })
    }
}

#[async_trait]
impl ResourceFetcher for HttpResourceFetcher {
    async fn fetch(
        &self,
        url: &str,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<FetchedResource> {
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.fetch_once(url, user_agent, referer).await {
                Ok(fetched) => {
                    if attempt > 1 {
                        debug!(url, attempt, "Fetch succeeded after retry");
                    }
                    return Ok(fetched);
                }
                Err(e @ (FetchError::InvalidUrl(_) | FetchError::TooManyRedirects)) => return Err(e),
                Err(e) => {
                    if attempt > self.config.max_retries {
                        warn!(url, attempt, error = %e, "Fetch failed after retries");
                        return Err(e);
                    }

                    warn!(url, attempt, error = %e, "Fetch failed, retrying");

                    tokio::time::sleep(retry_backoff(self.config.retry_delay, attempt)).await;
                }
            }
        }
    }
}

/// Longest wait between two fetch attempts
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);

/// Exponential backoff from `base` after the `attempt`th failure, capped at
/// [`MAX_RETRY_BACKOFF`]
fn retry_backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
    base.saturating_mul(factor).min(MAX_RETRY_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetcher_config_defaults() {
        let config = FetcherConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 2);
    }

    #[test]
    fn test_font_cdn_hosts_omit_user_agent() {
        assert!(omits_user_agent("https://fonts.googleapis.com/css?family=Roboto"));
        assert!(omits_user_agent("https://FONTS.GSTATIC.COM/s/roboto/v1/a.woff2"));
        assert!(!omits_user_agent("https://cdn.example.com/fonts.googleapis.com.css"));
        assert!(!omits_user_agent("https://example.com/style.css"));
    }

    #[test]
    fn test_retry_backoff_doubles_then_caps() {
        let base = Duration::from_millis(100);
        assert_eq!(retry_backoff(base, 1), Duration::from_millis(100));
        assert_eq!(retry_backoff(base, 2), Duration::from_millis(200));
        assert_eq!(retry_backoff(base, 4), Duration::from_millis(800));
        assert_eq!(retry_backoff(base, 12), MAX_RETRY_BACKOFF);

        // Far past the point where the doubling overflows
        assert_eq!(retry_backoff(base, 40), MAX_RETRY_BACKOFF);
        assert_eq!(retry_backoff(Duration::MAX, u32::MAX), MAX_RETRY_BACKOFF);
    }
}
