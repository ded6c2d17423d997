use crate::humanize::{ByteSize, HumanDuration};
use serde::{Deserialize, Serialize};

/// Top-level configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub render: RenderConfig,
    #[serde(default)]
    pub matching: MatchConfig,
    #[serde(default)]
    pub resources: ResourcesConfig,
}

/// Visual-diff server connection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_url")]
    pub url: String,
    /// API key (loaded from environment, not from config file)
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            url: default_server_url(),
            api_key: None,
            agent_id: default_agent_id(),
        }
    }
}

fn default_server_url() -> String {
    "https://eyesapi.applitools.com".to_string()
}

fn default_agent_id() -> String {
    format!("visualgrid/{}", env!("CARGO_PKG_VERSION"))
}

/// Exponential poll delay: starts at `initial_delay`, multiplied by `factor`
/// after every poll, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct PollConfig {
    #[serde(default = "default_poll_initial")]
    pub initial_delay: HumanDuration,
    #[serde(default = "default_poll_factor")]
    pub factor: f64,
    #[serde(default = "default_poll_max")]
    pub max_delay: HumanDuration,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            initial_delay: default_poll_initial(),
            factor: default_poll_factor(),
            max_delay: default_poll_max(),
        }
    }
}

fn default_poll_initial() -> HumanDuration {
    HumanDuration::from_millis(500)
}

fn default_poll_factor() -> f64 {
    1.5
}

fn default_poll_max() -> HumanDuration {
    HumanDuration::from_secs(5)
}

/// Outbound HTTP retry and long-task policy
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,
    /// Attempts after the first one for connection-level failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay: HumanDuration,
    /// Delays applied to successive 503 responses; the last one repeats
    #[serde(default = "default_concurrency_backoff")]
    pub concurrency_backoff: Vec<HumanDuration>,
    #[serde(default)]
    pub long_task: PollConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_delay: default_retry_delay(),
            concurrency_backoff: default_concurrency_backoff(),
            long_task: PollConfig::default(),
        }
    }
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> HumanDuration {
    HumanDuration::from_millis(500)
}

fn default_concurrency_backoff() -> Vec<HumanDuration> {
    [2, 4, 8, 16, 32]
        .into_iter()
        .map(HumanDuration::from_secs)
        .collect()
}

/// Render grid scheduling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RenderConfig {
    /// Max simultaneous render jobs
    #[serde(default = "default_render_concurrency")]
    pub concurrency: usize,
    /// Max simultaneous visual-diff sessions for the account
    #[serde(default = "default_session_concurrency")]
    pub session_concurrency: usize,
    #[serde(default)]
    pub poll: PollConfig,
    #[serde(default = "default_render_timeout")]
    pub timeout: HumanDuration,
    #[serde(default = "default_max_resubmits")]
    pub max_resubmits: u32,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            concurrency: default_render_concurrency(),
            session_concurrency: default_session_concurrency(),
            poll: PollConfig::default(),
            timeout: default_render_timeout(),
            max_resubmits: default_max_resubmits(),
        }
    }
}

fn default_render_concurrency() -> usize {
    5
}

fn default_session_concurrency() -> usize {
    20
}

fn default_render_timeout() -> HumanDuration {
    HumanDuration::from_secs(300)
}

fn default_max_resubmits() -> u32 {
    3
}

/// Match-window retry loop
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MatchConfig {
    #[serde(default = "default_retry_timeout")]
    pub retry_timeout: HumanDuration,
    #[serde(default = "default_match_interval")]
    pub match_interval: HumanDuration,
    #[serde(default)]
    pub run_once_on_timeout: bool,
    /// Ceiling for a single match-window submission
    #[serde(default = "default_match_request_timeout")]
    pub request_timeout: HumanDuration,
}

impl Default for MatchConfig {
    fn default() -> Self {
        Self {
            retry_timeout: default_retry_timeout(),
            match_interval: default_match_interval(),
            run_once_on_timeout: false,
            request_timeout: default_match_request_timeout(),
        }
    }
}

fn default_retry_timeout() -> HumanDuration {
    HumanDuration::from_secs(2)
}

fn default_match_interval() -> HumanDuration {
    HumanDuration::from_millis(500)
}

fn default_match_request_timeout() -> HumanDuration {
    HumanDuration::from_secs(300)
}

/// Page resource fetching
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResourcesConfig {
    #[serde(default = "default_max_resource_bytes")]
    pub max_resource_bytes: ByteSize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: HumanDuration,
    #[serde(default = "default_fetch_retries")]
    pub max_retries: u32,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            max_resource_bytes: default_max_resource_bytes(),
            fetch_timeout: default_fetch_timeout(),
            max_retries: default_fetch_retries(),
        }
    }
}

fn default_max_resource_bytes() -> ByteSize {
    ByteSize(15 * 1024 * 1024)
}

fn default_fetch_timeout() -> HumanDuration {
    HumanDuration::from_secs(30)
}

fn default_fetch_retries() -> u32 {
    2
}
