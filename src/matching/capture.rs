//! Screenshot sources for the match loop

use super::model::AppOutput;
use crate::driver::{DriverError, SpecDriver};
use crate::render::{RenderError, RenderRequest, RenderScheduler, RenderStatusResult};
use crate::session::AbortSignal;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("render failed: {0}")]
    Render(#[from] RenderError),

    #[error("driver failed: {0}")]
    Driver(#[from] DriverError),

    #[error("render {render_id} finished without an image")]
    MissingImage { render_id: String },
}

/// Produces a fresh capture of the application state on every call
#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    async fn capture(&self) -> Result<AppOutput, CaptureError>;
}

/// Capture backed by the render grid.
///
/// The first call can consume a render that was already scheduled for the
/// check; every later call renders the snapshot again.
pub struct RenderCapture {
    scheduler: Arc<RenderScheduler>,
    request: RenderRequest,
    abort: AbortSignal,
    title: Option<String>,
    first: Mutex<Option<RenderStatusResult>>,
}

impl RenderCapture {
    pub fn new(scheduler: Arc<RenderScheduler>, request: RenderRequest, abort: AbortSignal) -> Self {
        Self {
            scheduler,
            request,
            abort,
            title: None,
            first: Mutex::new(None),
        }
    }

    pub fn with_first_render(self, status: RenderStatusResult) -> Self {
        Self {
            first: Mutex::new(Some(status)),
            ..self
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    async fn render(&self) -> Result<RenderStatusResult, CaptureError> {
        let mut request = self.request.clone();
        request.render_id = None;

        debug!(url = %request.url, browser = request.browser.browser_name(), "Re-rendering for capture");
        let mut results = self.scheduler.submit_and_wait(vec![request], &self.abort).await;
        Ok(results.pop().unwrap_or(Err(RenderError::Aborted))?)
    }
}

#[async_trait]
impl ScreenshotProvider for RenderCapture {
    async fn capture(&self) -> Result<AppOutput, CaptureError> {
        let precomputed = self.first.lock().await.take();
        let status = match precomputed {
            Some(status) => status,
            None => self.render().await?,
        };

        let render_id = status.render_id.clone().unwrap_or_default();
        let screenshot_url = status
            .image_location
            .ok_or(CaptureError::MissingImage { render_id })?;

        Ok(AppOutput {
            title: self.title.clone(),
            screenshot_url: Some(screenshot_url),
            dom_url: status.dom_location,
            screenshot: None,
        })
    }
}

/// Capture taken directly from the browser through a driver
pub struct DriverCapture {
    driver: Arc<dyn SpecDriver>,
}

impl DriverCapture {
    pub fn new(driver: Arc<dyn SpecDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl ScreenshotProvider for DriverCapture {
    async fn capture(&self) -> Result<AppOutput, CaptureError> {
        let screenshot = self.driver.take_screenshot().await?;
        let title = self.driver.title().await?;

        Ok(AppOutput {
            title,
            screenshot: Some(screenshot),
            ..AppOutput::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::testing::ScriptedDriver;
    use crate::observability::Metrics;
    use crate::render::testing::{FakeGrid, StaticFetcher, snapshot_request, test_resolver};
    use crate::render::{BrowserInfo, RenderStatus, SchedulerConfig};

    fn scheduler(grid: Arc<FakeGrid>) -> Arc<RenderScheduler> {
        let mut config = SchedulerConfig::default();
        config.poll.initial_delay = crate::config::HumanDuration::from_millis(5);
        Arc::new(RenderScheduler::new(
            grid,
            Arc::new(test_resolver(StaticFetcher::default())),
            config,
            Arc::new(Metrics::new()),
        ))
    }

    #[tokio::test]
    async fn test_first_capture_uses_precomputed_render() {
        let grid = Arc::new(FakeGrid::new());
        let request = snapshot_request("https://s.test/", BrowserInfo::desktop("chrome", 800, 600));

        let mut first = RenderStatusResult::pending("r-pre");
        first.status = RenderStatus::Rendered;
        first.image_location = Some("https://grid.test/img/r-pre".to_string());

        let capture = RenderCapture::new(scheduler(Arc::clone(&grid)), request, AbortSignal::new())
            .with_first_render(first)
            .with_title("Home");

        let output = capture.capture().await.unwrap();
        assert_eq!(output.screenshot_url.as_deref(), Some("https://grid.test/img/r-pre"));
        assert_eq!(output.title.as_deref(), Some("Home"));
        assert_eq!(grid.snapshot().render_calls, 0);

        let output = capture.capture().await.unwrap();
        assert_eq!(output.screenshot_url.as_deref(), Some("https://grid.test/img/r0"));
        assert_eq!(grid.snapshot().render_calls, 1);
    }

    #[tokio::test]
    async fn test_render_failure_surfaces() {
        let grid = Arc::new(FakeGrid::new().reject("https://s.test/"));
        let request = snapshot_request("https://s.test/", BrowserInfo::desktop("chrome", 800, 600));
        let capture = RenderCapture::new(scheduler(grid), request, AbortSignal::new());

        let err = capture.capture().await.unwrap_err();
        assert!(matches!(err, CaptureError::Render(RenderError::Server { .. })));
    }

    #[tokio::test]
    async fn test_driver_capture() {
        let driver = Arc::new(ScriptedDriver::new(serde_json::Value::Null));
        let capture = DriverCapture::new(driver.clone());

        let output = capture.capture().await.unwrap();
        assert_eq!(output.title.as_deref(), Some("Scripted"));
        assert_eq!(output.screenshot.as_deref(), Some(&b"\x89PNG"[..]));
        assert_eq!(driver.screenshots.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
