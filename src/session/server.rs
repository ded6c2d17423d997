//! Visual-diff server API

use crate::config::Config;
use crate::http::{ClientConfig, HttpError, HttpRequest, LongRunningHttpClient};
use crate::matching::{MatchResult, MatchSubmitter, MatchWindowData};
use crate::observability::Metrics;
use crate::render::RenderInfo;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

pub const AGENT_HEADER: &str = "x-applitools-eyes-client";
pub const API_KEY_PARAM: &str = "apiKey";

const RUNNING_SESSIONS_PATH: &str = "api/sessions/running";
const RENDER_INFO_PATH: &str = "api/sessions/renderinfo";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("API key is not configured (set VISUALGRID_API_KEY)")]
    MissingApiKey,

    #[error(transparent)]
    Http(#[from] HttpError),
}

pub type Result<T> = std::result::Result<T, SessionError>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchInfo {
    pub id: String,
    pub name: Option<String>,
}

/// What the server needs to open a test session
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStartInfo {
    pub agent_id: String,
    pub app_id_or_name: String,
    pub scenario_id_or_name: String,
    pub batch_info: BatchInfo,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunningSession {
    pub id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    #[serde(default)]
    pub baseline_id: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub is_new: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResults {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub steps: u32,
    #[serde(default)]
    pub matches: u32,
    #[serde(default)]
    pub mismatches: u32,
    #[serde(default)]
    pub missing: u32,
    #[serde(default)]
    pub is_new: bool,
    #[serde(default)]
    pub is_aborted: bool,
    #[serde(default)]
    pub url: Option<String>,
}

impl TestResults {
    pub fn is_passed(&self) -> bool {
        self.status.as_deref() == Some("Passed")
    }
}

/// Session operations the runner depends on
#[async_trait]
pub trait SessionApi: Send + Sync {
    async fn start_session(&self, start: &SessionStartInfo) -> Result<RunningSession>;

    async fn stop_session(
        &self,
        session: &RunningSession,
        aborted: bool,
        update_baseline: bool,
    ) -> Result<TestResults>;

    async fn match_window(
        &self,
        session: &RunningSession,
        data: &MatchWindowData,
    ) -> std::result::Result<MatchResult, HttpError>;
}

pub struct ServerConnector {
    client: LongRunningHttpClient,
    server_url: String,
    agent_id: String,
}

impl ServerConnector {
    pub fn new(config: &Config, metrics: Arc<Metrics>) -> Result<Self> {
        let api_key = config
            .server
            .api_key
            .clone()
            .ok_or(SessionError::MissingApiKey)?;

        let client = LongRunningHttpClient::new(ClientConfig::from(config), metrics)?
            .with_default_query(API_KEY_PARAM, api_key)
            .with_default_header(AGENT_HEADER, config.server.agent_id.clone());

        Ok(Self {
            client,
            server_url: config.server.url.trim_end_matches('/').to_string(),
            agent_id: config.server.agent_id.clone(),
        })
    }

    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.server_url, path)
    }

    fn session_endpoint(&self, session: &RunningSession) -> String {
        self.endpoint(&format!("{RUNNING_SESSIONS_PATH}/{}", session.id))
    }

    /// Render service location and credentials
    pub async fn render_info(&self) -> Result<RenderInfo> {
        let response = self
            .client
            .execute(&HttpRequest::get(self.endpoint(RENDER_INFO_PATH)))
            .await?
            .error_for_status()?;
        Ok(response.json()?)
    }
}

#[async_trait]
impl SessionApi for ServerConnector {
    async fn start_session(&self, start: &SessionStartInfo) -> Result<RunningSession> {
        let mut start = start.clone();
        if start.agent_id.is_empty() {
            start.agent_id = self.agent_id.clone();
        }

        let body = serde_json::json!({ "startInfo": start });
        let response = self
            .client
            .execute_long_task(HttpRequest::post(self.endpoint(RUNNING_SESSIONS_PATH)).json(body))
            .await?
            .error_for_status()?;

        let session: RunningSession = response.json()?;
        info!(session_id = %session.id, is_new = session.is_new, "Session started");
        Ok(session)
    }

    async fn stop_session(
        &self,
        session: &RunningSession,
        aborted: bool,
        update_baseline: bool,
    ) -> Result<TestResults> {
        let request = HttpRequest::delete(self.session_endpoint(session))
            .query("aborted", aborted.to_string())
            .query("updateBaseline", update_baseline.to_string());

        let response = self
            .client
            .execute_long_task(request)
            .await?
            .error_for_status()?;

        let results: TestResults = response.json()?;
        info!(session_id = %session.id, aborted, status = ?results.status, "Session stopped");
        Ok(results)
    }

    async fn match_window(
        &self,
        session: &RunningSession,
        data: &MatchWindowData,
    ) -> std::result::Result<MatchResult, HttpError> {
        let json = serde_json::to_value(data)?;
        let request = HttpRequest::post(self.session_endpoint(session));
        let request = match &data.app_output.screenshot {
            Some(image) => request.framed(json, image.clone()),
            None => request.json(json),
        };

        self.client
            .execute_long_task(request)
            .await?
            .error_for_status()?
            .json()
    }
}

/// Match submitter bound to one running session
pub struct SessionMatcher {
    api: Arc<dyn SessionApi>,
    session: RunningSession,
}

impl SessionMatcher {
    pub fn new(api: Arc<dyn SessionApi>, session: RunningSession) -> Self {
        Self { api, session }
    }
}

#[async_trait]
impl MatchSubmitter for SessionMatcher {
    async fn submit(&self, data: &MatchWindowData) -> std::result::Result<MatchResult, HttpError> {
        self.api.match_window(&self.session, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_key() -> Config {
        let mut config = Config::default();
        config.server.url = "https://server.test/".to_string();
        config.server.api_key = Some("secret".to_string());
        config
    }

    #[test]
    fn test_missing_api_key_is_rejected() {
        let result = ServerConnector::new(&Config::default(), Arc::new(Metrics::new()));
        assert!(matches!(result, Err(SessionError::MissingApiKey)));
    }

    #[test]
    fn test_endpoints() {
        let connector = ServerConnector::new(&config_with_key(), Arc::new(Metrics::new())).unwrap();
        let session = RunningSession {
            id: "abc".to_string(),
            ..RunningSession::default()
        };

        assert_eq!(
            connector.endpoint(RENDER_INFO_PATH),
            "https://server.test/api/sessions/renderinfo"
        );
        assert_eq!(
            connector.session_endpoint(&session),
            "https://server.test/api/sessions/running/abc"
        );
    }

    #[test]
    fn test_start_info_wire_format() {
        let start = SessionStartInfo {
            agent_id: "visualgrid/test".to_string(),
            app_id_or_name: "shop".to_string(),
            scenario_id_or_name: "checkout".to_string(),
            batch_info: BatchInfo {
                id: "b1".to_string(),
                name: Some("nightly".to_string()),
            },
            ..SessionStartInfo::default()
        };
        let json = serde_json::to_value(&start).unwrap();
        assert_eq!(json["appIdOrName"], "shop");
        assert_eq!(json["scenarioIdOrName"], "checkout");
        assert_eq!(json["batchInfo"]["id"], "b1");
        assert!(json.get("environment").is_none());
    }

    #[test]
    fn test_test_results_parse() {
        let results: TestResults =
            serde_json::from_str(r#"{"status":"Passed","steps":2,"matches":2,"isNew":false}"#).unwrap();
        assert!(results.is_passed());
        assert_eq!(results.steps, 2);
    }
}
