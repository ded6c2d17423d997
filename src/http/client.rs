//! Request executor for the visual-diff server and the render grid.
//!
//! Every call goes through [`LongRunningHttpClient::execute`], which retries
//! connection failures a bounded number of times and waits out 503
//! (account concurrency) responses on a separate, unbounded schedule.
//! [`LongRunningHttpClient::execute_long_task`] adds the 202/Location
//! polling protocol on top.

use super::backoff::{ConcurrencyBackoff, PollDelay, RetryPolicy};
use super::error::{HttpError, Result};
use super::framing::{self, FRAMED_CONTENT_TYPE};
use crate::config::{Config, PollConfig};
use crate::observability::Metrics;
use bytes::Bytes;
use reqwest::header::{CONTENT_TYPE, HeaderMap, LOCATION};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const EYES_EXPECT_HEADER: &str = "Eyes-Expect";
pub const EYES_EXPECT_VALUE: &str = "202+location";
pub const EYES_DATE_HEADER: &str = "Eyes-Date";

const STATUS_CONCURRENCY_BLOCKED: u16 = 503;
const STATUS_ACCEPTED: u16 = 202;
const STATUS_CREATED: u16 = 201;
const STATUS_OK: u16 = 200;
const STATUS_GONE: u16 = 410;

/// Current time as an RFC 1123 HTTP date
pub fn rfc1123_now() -> String {
    chrono::Utc::now()
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

#[derive(Debug, Clone, Default)]
pub enum RequestBody {
    #[default]
    Empty,
    Json(serde_json::Value),
    /// JSON document plus raw image, sent as one framed binary body
    Framed {
        json: serde_json::Value,
        image: Bytes,
    },
    Raw {
        content_type: String,
        content: Bytes,
    },
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: Vec::new(),
            query: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self::new(Method::POST, url)
    }

    pub fn put(url: impl Into<String>) -> Self {
        Self::new(Method::PUT, url)
    }

    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }

    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, value: serde_json::Value) -> Self {
        self.body = RequestBody::Json(value);
        self
    }

    pub fn framed(mut self, json: serde_json::Value, image: Bytes) -> Self {
        self.body = RequestBody::Framed { json, image };
        self
    }

    pub fn raw(mut self, content_type: impl Into<String>, content: Bytes) -> Self {
        self.body = RequestBody::Raw {
            content_type: content_type.into(),
            content,
        };
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(n, _)| n.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// Fail with [`HttpError::UnexpectedStatus`] unless the status is 2xx
    pub fn error_for_status(self) -> Result<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(self.into_unexpected())
        }
    }

    pub fn into_unexpected(self) -> HttpError {
        HttpError::UnexpectedStatus {
            status: self.status,
            body: self.text(),
            url: self.url,
        }
    }

    /// `Location` header resolved against the request URL
    fn location(&self) -> Result<String> {
        let raw = self
            .header(LOCATION.as_str())
            .ok_or(HttpError::MissingLocation { status: self.status })?;
        let base = url::Url::parse(&self.url).map_err(|e| HttpError::InvalidLocation(e.to_string()))?;
        base.join(raw)
            .map(String::from)
            .map_err(|e| HttpError::InvalidLocation(format!("{raw}: {e}")))
    }
}

/// Client-wide retry, backoff and polling settings
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub concurrency_backoff: Vec<Duration>,
    pub long_task: PollConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for ClientConfig {
    fn from(config: &Config) -> Self {
        Self {
            request_timeout: config.http.request_timeout.into(),
            retry: RetryPolicy::new(config.http.max_retries, config.http.retry_delay.into()),
            concurrency_backoff: config
                .http
                .concurrency_backoff
                .iter()
                .copied()
                .map(Duration::from)
                .collect(),
            long_task: config.http.long_task,
        }
    }
}

enum SendFailure {
    Transient(String),
    Fatal(HttpError),
}

pub struct LongRunningHttpClient {
    client: Client,
    config: ClientConfig,
    metrics: Arc<Metrics>,
    default_headers: Vec<(String, String)>,
    default_query: Vec<(String, String)>,
}

impl LongRunningHttpClient {
    pub fn new(config: ClientConfig, metrics: Arc<Metrics>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            config,
            metrics,
            default_headers: Vec::new(),
            default_query: Vec::new(),
        })
    }

    /// Header sent on every request made by this client, polls included
    pub fn with_default_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.push((name.into(), value.into()));
        self
    }

    /// Query parameter sent on every request made by this client, polls included
    pub fn with_default_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_query.push((name.into(), value.into()));
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Send `request`, retrying connection failures and 503 responses.
    ///
    /// 503 answers never count against the retry policy, and one in between
    /// two connection failures starts their count over. Any other status,
    /// success or not, is returned to the caller.
    pub async fn execute(&self, request: &HttpRequest) -> Result<HttpResponse> {
        let mut backoff = ConcurrencyBackoff::new(self.config.concurrency_backoff.clone());
        let mut failures = 0;

        loop {
            match self.send_once(request).await {
                Ok(response) if response.status == STATUS_CONCURRENCY_BLOCKED => {
                    // The server answered; only back-to-back transport failures count
                    failures = 0;
                    let delay = backoff.next_delay();
                    self.metrics.concurrency_backoff();
                    warn!(
                        url = %request.url,
                        attempt = backoff.attempts(),
                        delay_ms = delay.as_millis() as u64,
                        "Account concurrency limit reached, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Ok(response) => {
                    if failures > 0 {
                        debug!(url = %request.url, failures, "Request succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(SendFailure::Fatal(e)) => return Err(e),
                Err(SendFailure::Transient(message)) => {
                    failures += 1;
                    if !self.config.retry.allows_retry(failures) {
                        warn!(url = %request.url, attempts = failures, error = %message, "Request failed after retries");
                        return Err(HttpError::TransientNetwork {
                            attempts: failures,
                            message,
                        });
                    }

                    warn!(url = %request.url, attempt = failures, error = %message, "Request failed, retrying");
                    tokio::time::sleep(self.config.retry.delay).await;
                }
            }
        }
    }

    /// Run `request` as a long-running task.
    ///
    /// The first request announces `Eyes-Expect: 202+location`. A 202 answer
    /// switches to polling its `Location`; 200 means still running, 201 points
    /// at the result, which is fetched and then deleted. 410 at any step is
    /// fatal. A non-202 first answer is returned as-is.
    pub async fn execute_long_task(&self, request: HttpRequest) -> Result<HttpResponse> {
        let first = request
            .clone()
            .header(EYES_EXPECT_HEADER, EYES_EXPECT_VALUE)
            .header(EYES_DATE_HEADER, rfc1123_now());

        let response = self.execute(&first).await?;
        match response.status {
            STATUS_ACCEPTED => {}
            STATUS_GONE => {
                return Err(HttpError::LongTaskExpired { url: request.url });
            }
            _ => return Ok(response),
        }

        let mut location = response.location()?;
        let mut delay = PollDelay::from(&self.config.long_task);
        info!(url = %request.url, location = %location, "Long-running task accepted, polling");

        loop {
            let wait = delay.next_delay();
            debug!(location = %location, delay_ms = wait.as_millis() as u64, "Waiting before poll");
            tokio::time::sleep(wait).await;

            let poll = self.execute(&HttpRequest::get(&location)).await?;
            match poll.status {
                STATUS_OK | STATUS_ACCEPTED => {
                    if poll.header(LOCATION.as_str()).is_some() {
                        location = poll.location()?;
                    }
                }
                STATUS_CREATED => {
                    let result_url = poll.location()?;
                    return self.fetch_and_delete(&result_url).await;
                }
                STATUS_GONE => {
                    warn!(location = %location, "Long-running task expired");
                    return Err(HttpError::LongTaskExpired { url: location });
                }
                _ => return Err(poll.into_unexpected()),
            }
        }
    }

    async fn fetch_and_delete(&self, result_url: &str) -> Result<HttpResponse> {
        let result = self.execute(&HttpRequest::get(result_url)).await?;
        if result.status == STATUS_GONE {
            return Err(HttpError::LongTaskExpired {
                url: result_url.to_string(),
            });
        }

        match self.execute(&HttpRequest::delete(result_url)).await {
            Ok(deleted) if !deleted.is_success() => {
                warn!(url = result_url, status = deleted.status, "Failed to delete long-task result");
            }
            Err(e) => warn!(url = result_url, error = %e, "Failed to delete long-task result"),
            Ok(_) => debug!(url = result_url, "Long-task result deleted"),
        }

        Ok(result)
    }

    async fn send_once(&self, request: &HttpRequest) -> std::result::Result<HttpResponse, SendFailure> {
        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .query(&self.default_query)
            .query(&request.query);

        for (name, value) in self.default_headers.iter().chain(&request.headers) {
            builder = builder.header(name, value);
        }

        builder = match &request.body {
            RequestBody::Empty => builder,
            RequestBody::Json(value) => {
                let body = serde_json::to_vec(value).map_err(|e| SendFailure::Fatal(e.into()))?;
                builder.header(CONTENT_TYPE, mime::APPLICATION_JSON.as_ref()).body(body)
            }
            RequestBody::Framed { json, image } => {
                let json = serde_json::to_vec(json).map_err(|e| SendFailure::Fatal(e.into()))?;
                let body = framing::encode(&json, image).map_err(|e| SendFailure::Fatal(e.into()))?;
                builder.header(CONTENT_TYPE, FRAMED_CONTENT_TYPE).body(body)
            }
            RequestBody::Raw { content_type, content } => {
                let builder = if request.has_header(CONTENT_TYPE.as_str()) {
                    builder
                } else {
                    builder.header(CONTENT_TYPE, content_type)
                };
                builder.body(content.clone())
            }
        };

        debug!(method = %request.method, url = %request.url, "Sending request");

        let response = builder.send().await.map_err(|e| {
            if e.is_builder() {
                SendFailure::Fatal(HttpError::Transport(e.to_string()))
            } else {
                SendFailure::Transient(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let url = response.url().to_string();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| SendFailure::Transient(format!("Failed to read body: {}", e)))?;

        debug!(url = %url, status, size = body.len(), "Response received");

        Ok(HttpResponse {
            status,
            url,
            headers,
            body,
        })
    }
}
