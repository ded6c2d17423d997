//! Test orchestration over the render grid
//!
//! A [`RunningTest`] holds one visual-diff session per browser
//! configuration. Each `check` resolves the page resources once, renders
//! every browser in one scheduler call and then runs the match loop per
//! browser, resolving results in the order the checks were issued.

use super::abort::AbortSignal;
use super::sequencer::{CheckSequencer, SequenceTicket};
use super::server::{RunningSession, SessionApi, SessionError, SessionMatcher, SessionStartInfo, TestResults};
use crate::http::HttpError;
use crate::matching::{
    CaptureError, ImageMatchSettings, MatchAttempt, MatchError, MatchSettings, MatchWindowTask, RenderCapture,
};
use crate::observability::Metrics;
use crate::render::{
    BrowserInfo, DomSnapshot, PoolSlot, RenderError, RenderRequest, RenderScheduler, RenderStatus,
    RenderStatusResult,
};
use crate::resources::ResolveError;
use futures::future::join_all;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

/// Stage of a check at which it failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStage {
    Open,
    Resolve,
    Render,
    Poll,
    Submit,
    Close,
}

impl fmt::Display for CheckStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Open => "open",
            Self::Resolve => "resolve",
            Self::Render => "render",
            Self::Poll => "poll",
            Self::Submit => "submit",
            Self::Close => "close",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CheckFailure {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Render(#[from] RenderError),
    #[error(transparent)]
    Match(#[from] MatchError),
    #[error("failed to serialize DOM snapshot: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("test was aborted")]
    Aborted,
}

fn status_suffix(status: &Option<RenderStatus>) -> String {
    status
        .map(|s| format!(" (last render status: {s:?})"))
        .unwrap_or_default()
}

#[derive(Debug, Error)]
#[error("check failed at {stage} stage{}: {source}", status_suffix(.last_status))]
pub struct CheckError {
    pub stage: CheckStage,
    pub last_status: Option<RenderStatus>,
    #[source]
    pub source: CheckFailure,
}

impl CheckError {
    fn new(stage: CheckStage, source: impl Into<CheckFailure>) -> Self {
        Self {
            stage,
            last_status: None,
            source: source.into(),
        }
    }

    fn aborted(stage: CheckStage) -> Self {
        Self::new(stage, CheckFailure::Aborted)
    }

    fn from_render(error: RenderError) -> Self {
        let stage = match error {
            RenderError::Timeout { .. } => CheckStage::Poll,
            _ => CheckStage::Render,
        };
        Self {
            stage,
            last_status: error.last_status(),
            source: error.into(),
        }
    }

    fn from_match(error: MatchError) -> Self {
        match error {
            MatchError::Capture(CaptureError::Render(render)) => Self::from_render(render),
            MatchError::Submit(HttpError::LongTaskExpired { .. }) | MatchError::Timeout { .. } => {
                Self::new(CheckStage::Poll, error)
            }
            MatchError::Aborted => Self::aborted(CheckStage::Submit),
            other => Self::new(CheckStage::Submit, other),
        }
    }

    pub fn is_aborted(&self) -> bool {
        matches!(self.source, CheckFailure::Aborted | CheckFailure::Render(RenderError::Aborted))
    }
}

pub type Result<T> = std::result::Result<T, CheckError>;

/// Per-check options
#[derive(Debug, Clone, Default)]
pub struct CheckSettings {
    pub tag: String,
    pub match_settings: ImageMatchSettings,
    /// Milliseconds; missing or negative means the configured default
    pub retry_timeout_ms: Option<i64>,
    pub region_selectors: Vec<String>,
    pub visual_grid_options: Option<serde_json::Value>,
    pub user_agent: Option<String>,
}

/// One browser configuration of a running test
struct BrowserSession {
    browser: BrowserInfo,
    session: RunningSession,
    sequencer: CheckSequencer,
    _slot: PoolSlot,
}

/// Shared entry point: opens tests against one scheduler and server
pub struct VisualGridRunner {
    scheduler: Arc<RenderScheduler>,
    api: Arc<dyn SessionApi>,
    settings: MatchSettings,
    metrics: Arc<Metrics>,
    agent_id: String,
}

impl VisualGridRunner {
    pub fn new(
        scheduler: Arc<RenderScheduler>,
        api: Arc<dyn SessionApi>,
        settings: MatchSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            scheduler,
            api,
            settings,
            metrics,
            agent_id: format!("visualgrid/{}", env!("CARGO_PKG_VERSION")),
        }
    }

    pub fn with_agent_id(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn scheduler(&self) -> &Arc<RenderScheduler> {
        &self.scheduler
    }

    /// Open one session per browser. Each session holds a session slot
    /// until the test is closed or dropped.
    ///
    /// Slots for every browser are taken together before any session
    /// starts. If a session fails to start, the ones already started are
    /// stopped as aborted.
    pub async fn open(&self, start: SessionStartInfo, browsers: Vec<BrowserInfo>) -> Result<RunningTest> {
        let slots = self
            .scheduler
            .acquire_sessions(browsers.len())
            .await
            .map_err(|e| CheckError::new(CheckStage::Open, e))?;
        let mut sessions = Vec::with_capacity(browsers.len());

        for (browser, slot) in browsers.into_iter().zip(slots) {
            let session = match self.api.start_session(&start).await {
                Ok(session) => session,
                Err(e) => {
                    warn!(error = %e, started = sessions.len(), "Failed to open browser session");
                    self.abandon(&sessions).await;
                    return Err(CheckError::new(CheckStage::Open, e));
                }
            };

            info!(session_id = %session.id, browser = browser.browser_name(), "Browser session opened");
            sessions.push(Arc::new(BrowserSession {
                browser,
                session,
                sequencer: CheckSequencer::new(),
                _slot: slot,
            }));
        }

        Ok(RunningTest {
            scheduler: Arc::clone(&self.scheduler),
            api: Arc::clone(&self.api),
            settings: self.settings.clone(),
            metrics: Arc::clone(&self.metrics),
            agent_id: self.agent_id.clone(),
            abort: AbortSignal::new(),
            sessions,
        })
    }

    async fn abandon(&self, sessions: &[Arc<BrowserSession>]) {
        let stops = sessions.iter().map(|s| self.api.stop_session(&s.session, true, false));
        for (session, stopped) in sessions.iter().zip(join_all(stops).await) {
            if let Err(e) = stopped {
                warn!(session_id = %session.session.id, error = %e, "Failed to abort browser session");
            }
        }
    }
}

pub struct RunningTest {
    scheduler: Arc<RenderScheduler>,
    api: Arc<dyn SessionApi>,
    settings: MatchSettings,
    metrics: Arc<Metrics>,
    agent_id: String,
    abort: AbortSignal,
    sessions: Vec<Arc<BrowserSession>>,
}

impl RunningTest {
    pub fn abort_signal(&self) -> AbortSignal {
        self.abort.clone()
    }

    /// Stop starting new renders and match retries. Calls already on the
    /// wire finish; `close` then stops the sessions as aborted.
    pub fn abort(&self) {
        info!(sessions = self.sessions.len(), "Aborting test");
        self.abort.abort();
    }

    pub fn session_ids(&self) -> Vec<String> {
        self.sessions.iter().map(|s| s.session.id.clone()).collect()
    }

    /// Check a page snapshot in every browser; one result per browser, in
    /// browser order
    pub async fn check(&self, snapshot: DomSnapshot, settings: CheckSettings) -> Vec<Result<MatchAttempt>> {
        // Tickets are taken before any await so results follow issue order
        let tickets: Vec<SequenceTicket> = self.sessions.iter().map(|s| s.sequencer.ticket()).collect();

        let renders = match self.render_all(&snapshot, &settings).await {
            Ok(renders) => renders,
            Err(e) => {
                warn!(url = %snapshot.url, error = %e, "Check failed before matching");
                return self
                    .sessions
                    .iter()
                    .map(|_| {
                        Err(CheckError {
                            stage: e.stage,
                            last_status: e.last_status,
                            source: clone_failure(&e),
                        })
                    })
                    .collect();
            }
        };

        let matches = self
            .sessions
            .iter()
            .zip(tickets)
            .zip(renders)
            .map(|((session, ticket), (request, status))| {
                self.match_one(Arc::clone(session), ticket, request, status, &settings)
            });

        join_all(matches).await
    }

    async fn render_all(
        &self,
        snapshot: &DomSnapshot,
        settings: &CheckSettings,
    ) -> Result<Vec<(RenderRequest, std::result::Result<RenderStatusResult, RenderError>)>> {
        if self.abort.is_aborted() {
            return Err(CheckError::aborted(CheckStage::Resolve));
        }

        let resources = self
            .scheduler
            .resolver()
            .resolve(
                &snapshot.resource_urls,
                snapshot.resources.clone(),
                settings.user_agent.as_deref(),
                Some(snapshot.url.as_str()),
            )
            .await
            .map_err(|e| CheckError::new(CheckStage::Resolve, e))?;

        let dom = snapshot
            .to_resource(&resources)
            .map_err(|e| CheckError::new(CheckStage::Resolve, e))?;

        let requests: Vec<RenderRequest> = self
            .sessions
            .iter()
            .map(|s| {
                let mut request = RenderRequest::new(dom.clone(), resources.clone(), s.browser.clone());
                request.region_selectors = settings.region_selectors.clone();
                request.options = settings.visual_grid_options.clone();
                request.user_agent = settings.user_agent.clone();
                request.agent_id = self.agent_id.clone();
                request
            })
            .collect();

        let statuses = self.scheduler.submit_and_wait(requests.clone(), &self.abort).await;
        Ok(requests.into_iter().zip(statuses).collect())
    }

    async fn match_one(
        &self,
        session: Arc<BrowserSession>,
        mut ticket: SequenceTicket,
        request: RenderRequest,
        status: std::result::Result<RenderStatusResult, RenderError>,
        settings: &CheckSettings,
    ) -> Result<MatchAttempt> {
        ticket.wait_turn().await;

        let status = status.map_err(CheckError::from_render)?;
        if self.abort.is_aborted() {
            return Err(CheckError::aborted(CheckStage::Submit));
        }

        let capture = RenderCapture::new(Arc::clone(&self.scheduler), request, self.abort.clone())
            .with_first_render(status);
        let submitter = Arc::new(SessionMatcher::new(Arc::clone(&self.api), session.session.clone()));
        let task = MatchWindowTask::new(
            submitter,
            self.settings.clone(),
            Arc::clone(&self.metrics),
            self.abort.clone(),
        );

        let attempt = task
            .check(&capture, &settings.tag, &settings.match_settings, settings.retry_timeout_ms)
            .await
            .map_err(CheckError::from_match)?;

        info!(
            session_id = %session.session.id,
            tag = %settings.tag,
            as_expected = attempt.as_expected(),
            position = ticket.position(),
            "Check resolved"
        );
        Ok(attempt)
    }

    /// Stop every session and release the session slots. Sessions are
    /// stopped as aborted when the test was aborted.
    pub async fn close(self, update_baseline: bool) -> Vec<Result<TestResults>> {
        let aborted = self.abort.is_aborted();
        let stops = self.sessions.iter().map(|s| {
            let api = Arc::clone(&self.api);
            async move {
                api.stop_session(&s.session, aborted, update_baseline && !aborted)
                    .await
                    .map_err(|e| CheckError::new(CheckStage::Close, e))
            }
        });

        let results = join_all(stops).await;
        info!(sessions = results.len(), aborted, "Test closed");
        results
    }
}

/// Failures shared by every browser of a check that failed before matching
fn clone_failure(error: &CheckError) -> CheckFailure {
    match &error.source {
        CheckFailure::Render(e) => CheckFailure::Render(e.clone()),
        CheckFailure::Resolve(e) => CheckFailure::Resolve(e.clone()),
        CheckFailure::Aborted => CheckFailure::Aborted,
        other => CheckFailure::Render(RenderError::Resolve(other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::{FakeGrid, StaticFetcher, test_resolver};
    use crate::render::SchedulerConfig;
    use crate::matching::MatchResult;
    use crate::matching::MatchWindowData;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeSessions {
        started: AtomicUsize,
        stopped: Mutex<Vec<(String, bool, bool)>>,
        matched: Mutex<Vec<(String, String)>>,
        slow_tag: Option<&'static str>,
        start_delay: Option<Duration>,
        fail_start_at: Option<usize>,
    }

    #[async_trait::async_trait]
    impl SessionApi for FakeSessions {
        async fn start_session(&self, _start: &SessionStartInfo) -> std::result::Result<RunningSession, SessionError> {
            let n = self.started.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.start_delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail_start_at == Some(n) {
                return Err(SessionError::MissingApiKey);
            }
            Ok(RunningSession {
                id: format!("s{n}"),
                ..RunningSession::default()
            })
        }

        async fn stop_session(
            &self,
            session: &RunningSession,
            aborted: bool,
            update_baseline: bool,
        ) -> std::result::Result<TestResults, SessionError> {
            self.stopped
                .lock()
                .unwrap()
                .push((session.id.clone(), aborted, update_baseline));
            Ok(TestResults {
                status: Some(if aborted { "Aborted" } else { "Passed" }.to_string()),
                is_aborted: aborted,
                ..TestResults::default()
            })
        }

        async fn match_window(
            &self,
            session: &RunningSession,
            data: &MatchWindowData,
        ) -> std::result::Result<MatchResult, HttpError> {
            if self.slow_tag == Some(data.tag.as_str()) {
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            self.matched
                .lock()
                .unwrap()
                .push((session.id.clone(), data.tag.clone()));
            Ok(MatchResult {
                as_expected: true,
                window_id: None,
            })
        }
    }

    fn runner(grid: FakeGrid, api: Arc<FakeSessions>) -> VisualGridRunner {
        let mut config = SchedulerConfig::default();
        config.poll.initial_delay = crate::config::HumanDuration::from_millis(5);
        config.session_concurrency = 2;

        let fetcher = StaticFetcher::default().with("https://s.test/style.css", "text/css", "body{margin:0}");
        let scheduler = Arc::new(RenderScheduler::new(
            Arc::new(grid),
            Arc::new(test_resolver(fetcher)),
            config,
            Arc::new(Metrics::new()),
        ));
        let settings = MatchSettings {
            default_retry_timeout: Duration::from_millis(50),
            match_interval: Duration::from_millis(10),
            run_once_on_timeout: false,
            request_timeout: Duration::from_secs(1),
        };

        VisualGridRunner::new(scheduler, api, settings, Arc::new(Metrics::new()))
    }

    fn browsers() -> Vec<BrowserInfo> {
        vec![
            BrowserInfo::desktop("chrome", 800, 600),
            BrowserInfo::device("iPhone X"),
        ]
    }

    fn snapshot() -> DomSnapshot {
        DomSnapshot {
            url: "https://s.test/".to_string(),
            cdt: serde_json::json!([{ "nodeType": 9 }]),
            resource_urls: vec!["https://s.test/style.css".to_string()],
            ..DomSnapshot::default()
        }
    }

    fn settings(tag: &str) -> CheckSettings {
        CheckSettings {
            tag: tag.to_string(),
            ..CheckSettings::default()
        }
    }

    #[tokio::test]
    async fn test_check_renders_every_browser_once() {
        let api = Arc::new(FakeSessions::default());
        let runner = runner(FakeGrid::new(), Arc::clone(&api));

        let test = runner
            .open(SessionStartInfo::default(), browsers())
            .await
            .unwrap();
        assert_eq!(test.session_ids(), vec!["s0", "s1"]);

        let results = test.check(snapshot(), settings("home")).await;
        assert_eq!(results.len(), 2);
        for result in &results {
            let attempt = result.as_ref().unwrap();
            assert!(attempt.as_expected());
            assert_eq!(attempt.submissions, 1);
        }
        assert_eq!(api.matched.lock().unwrap().len(), 2);

        let closed = test.close(true).await;
        assert!(closed.iter().all(|r| r.as_ref().unwrap().is_passed()));
        let stopped = api.stopped.lock().unwrap().clone();
        assert_eq!(stopped.len(), 2);
        assert!(stopped.iter().all(|(_, aborted, update)| !aborted && *update));
    }

    #[tokio::test]
    async fn test_results_follow_issue_order() {
        let api = Arc::new(FakeSessions {
            slow_tag: Some("first"),
            ..FakeSessions::default()
        });
        let runner = runner(FakeGrid::new(), Arc::clone(&api));
        let test = runner
            .open(SessionStartInfo::default(), vec![BrowserInfo::desktop("chrome", 800, 600)])
            .await
            .unwrap();

        let (first, second) = tokio::join!(
            test.check(snapshot(), settings("first")),
            test.check(snapshot(), settings("second")),
        );
        assert!(first[0].is_ok());
        assert!(second[0].is_ok());

        let tags: Vec<String> = api
            .matched
            .lock()
            .unwrap()
            .iter()
            .map(|(_, tag)| tag.clone())
            .collect();
        assert_eq!(tags, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_abort_fails_checks_and_stops_as_aborted() {
        let api = Arc::new(FakeSessions::default());
        let runner = runner(FakeGrid::new(), Arc::clone(&api));
        let test = runner.open(SessionStartInfo::default(), browsers()).await.unwrap();

        test.abort();
        let results = test.check(snapshot(), settings("home")).await;
        assert_eq!(results.len(), 2);
        for result in results {
            let err = result.unwrap_err();
            assert!(err.is_aborted());
            assert_eq!(err.stage, CheckStage::Resolve);
        }
        assert!(api.matched.lock().unwrap().is_empty());

        test.close(true).await;
        let stopped = api.stopped.lock().unwrap().clone();
        assert!(stopped.iter().all(|(_, aborted, update)| *aborted && !update));
    }

    #[tokio::test]
    async fn test_render_failure_reports_stage_and_status() {
        let api = Arc::new(FakeSessions::default());
        let runner = runner(FakeGrid::new().reject("https://s.test/"), Arc::clone(&api));
        let test = runner
            .open(SessionStartInfo::default(), vec![BrowserInfo::desktop("chrome", 800, 600)])
            .await
            .unwrap();

        let results = test.check(snapshot(), settings("home")).await;
        let err = results.into_iter().next().unwrap().unwrap_err();
        assert_eq!(err.stage, CheckStage::Render);
        assert_eq!(err.last_status, Some(RenderStatus::Error));
        assert!(err.to_string().contains("render stage"));
        assert!(api.matched.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_session_slots_released_on_close() {
        let api = Arc::new(FakeSessions::default());
        let runner = runner(FakeGrid::new(), api);

        let test = runner.open(SessionStartInfo::default(), browsers()).await.unwrap();
        let stats = runner.scheduler().session_pool().stats();
        assert_eq!(stats.in_use(), 2);
        assert_eq!(stats.available, 0);

        test.close(false).await;
        let stats = runner.scheduler().session_pool().stats();
        assert_eq!(stats.in_use(), 0);
        assert_eq!(stats.available, 2);
    }

    #[tokio::test]
    async fn test_concurrent_opens_share_the_session_pool() {
        let api = Arc::new(FakeSessions {
            start_delay: Some(Duration::from_millis(20)),
            ..FakeSessions::default()
        });
        let runner = runner(FakeGrid::new(), Arc::clone(&api));

        // Each test needs the whole pool; one waits for the other to close
        let run = || async {
            let test = runner.open(SessionStartInfo::default(), browsers()).await.unwrap();
            tokio::time::sleep(Duration::from_millis(10)).await;
            test.close(false).await
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(3), async { tokio::join!(run(), run()) })
            .await
            .unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 2);
        assert_eq!(api.started.load(Ordering::SeqCst), 4);
        assert_eq!(api.stopped.lock().unwrap().len(), 4);
        assert_eq!(runner.scheduler().session_pool().stats().in_use(), 0);
    }

    #[tokio::test]
    async fn test_open_larger_than_pool_fails() {
        let api = Arc::new(FakeSessions::default());
        let runner = runner(FakeGrid::new(), Arc::clone(&api));

        let mut three = browsers();
        three.push(BrowserInfo::desktop("firefox", 800, 600));
        let err = runner.open(SessionStartInfo::default(), three).await.err().unwrap();
        assert_eq!(err.stage, CheckStage::Open);
        assert_eq!(api.started.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_open_aborts_started_sessions() {
        let api = Arc::new(FakeSessions {
            fail_start_at: Some(1),
            ..FakeSessions::default()
        });
        let runner = runner(FakeGrid::new(), Arc::clone(&api));

        let err = runner.open(SessionStartInfo::default(), browsers()).await.err().unwrap();
        assert_eq!(err.stage, CheckStage::Open);
        assert!(matches!(err.source, CheckFailure::Session(SessionError::MissingApiKey)));

        let stopped = api.stopped.lock().unwrap().clone();
        assert_eq!(stopped, vec![("s0".to_string(), true, false)]);

        let stats = runner.scheduler().session_pool().stats();
        assert_eq!(stats.in_use(), 0);
        assert_eq!(stats.available, 2);
    }
}
