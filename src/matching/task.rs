//! Match-window retry loop
//!
//! A check captures the application and asks the server to compare it
//! against the baseline. While the retry timeout lasts, submissions are
//! sent with `ignoreMismatch=true` so an unsettled page leaves no failure
//! behind; the loop stops at the first match. If it never matches, one last
//! submission with `ignoreMismatch=false` records the real verdict.

use super::capture::{CaptureError, ScreenshotProvider};
use super::model::{ImageMatchSettings, MatchAttempt, MatchResult, MatchWindowData};
use crate::config::MatchConfig;
use crate::http::HttpError;
use crate::observability::Metrics;
use crate::session::AbortSignal;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("capture failed: {0}")]
    Capture(#[from] CaptureError),

    #[error("match submission failed: {0}")]
    Submit(#[from] HttpError),

    #[error("match submission timed out after {elapsed:?}")]
    Timeout { elapsed: Duration },

    #[error("check aborted")]
    Aborted,
}

pub type Result<T> = std::result::Result<T, MatchError>;

/// Sends one match-window request for an open session
#[async_trait]
pub trait MatchSubmitter: Send + Sync {
    async fn submit(&self, data: &MatchWindowData) -> std::result::Result<MatchResult, HttpError>;
}

#[derive(Debug, Clone)]
pub struct MatchSettings {
    pub default_retry_timeout: Duration,
    pub match_interval: Duration,
    pub run_once_on_timeout: bool,
    /// Ceiling on a single submission
    pub request_timeout: Duration,
}

impl Default for MatchSettings {
    fn default() -> Self {
        Self::from(&MatchConfig::default())
    }
}

impl From<&MatchConfig> for MatchSettings {
    fn from(config: &MatchConfig) -> Self {
        Self {
            default_retry_timeout: config.retry_timeout.into(),
            match_interval: config.match_interval.into(),
            run_once_on_timeout: config.run_once_on_timeout,
            request_timeout: config.request_timeout.into(),
        }
    }
}

impl MatchSettings {
    /// Requested retry timeout in milliseconds; missing or negative values
    /// fall back to the default
    pub fn retry_timeout(&self, requested_ms: Option<i64>) -> Duration {
        match requested_ms {
            Some(ms) if ms >= 0 => Duration::from_millis(ms as u64),
            _ => self.default_retry_timeout,
        }
    }
}

pub struct MatchWindowTask {
    submitter: Arc<dyn MatchSubmitter>,
    settings: MatchSettings,
    metrics: Arc<Metrics>,
    abort: AbortSignal,
}

impl MatchWindowTask {
    pub fn new(
        submitter: Arc<dyn MatchSubmitter>,
        settings: MatchSettings,
        metrics: Arc<Metrics>,
        abort: AbortSignal,
    ) -> Self {
        Self {
            submitter,
            settings,
            metrics,
            abort,
        }
    }

    /// Run one check to a verdict.
    ///
    /// A mismatch is a normal outcome and comes back as `Ok` with
    /// `as_expected == false`.
    pub async fn check(
        &self,
        capture: &dyn ScreenshotProvider,
        tag: &str,
        match_settings: &ImageMatchSettings,
        retry_timeout_ms: Option<i64>,
    ) -> Result<MatchAttempt> {
        let timeout = self.settings.retry_timeout(retry_timeout_ms);
        let started = Instant::now();
        let mut submissions = 0;

        if self.settings.run_once_on_timeout {
            debug!(tag, timeout_ms = timeout.as_millis() as u64, "Waiting full timeout before single match");
            if !self.abort.sleep(timeout).await {
                return Err(MatchError::Aborted);
            }
            return self
                .attempt(capture, tag, match_settings, false, started, &mut submissions)
                .await;
        }

        if timeout.is_zero() {
            return self
                .attempt(capture, tag, match_settings, false, started, &mut submissions)
                .await;
        }

        loop {
            if submissions > 0 && !self.abort.sleep(self.settings.match_interval).await {
                return Err(MatchError::Aborted);
            }

            let attempt = self
                .attempt(capture, tag, match_settings, true, started, &mut submissions)
                .await?;
            if attempt.as_expected() {
                info!(tag, submissions, "Match settled");
                return Ok(attempt);
            }

            if started.elapsed() >= timeout {
                break;
            }
            debug!(tag, submissions, elapsed_ms = started.elapsed().as_millis() as u64, "Mismatch, retrying");
        }

        let attempt = self
            .attempt(capture, tag, match_settings, false, started, &mut submissions)
            .await?;
        if !attempt.as_expected() {
            warn!(tag, submissions, "Mismatch recorded after retry timeout");
        }
        Ok(attempt)
    }

    async fn attempt(
        &self,
        capture: &dyn ScreenshotProvider,
        tag: &str,
        match_settings: &ImageMatchSettings,
        ignore_mismatch: bool,
        started: Instant,
        submissions: &mut u32,
    ) -> Result<MatchAttempt> {
        if self.abort.is_aborted() {
            return Err(MatchError::Aborted);
        }

        let app_output = capture.capture().await?;
        let data = MatchWindowData::new(app_output, tag, match_settings, ignore_mismatch);

        let submit_started = Instant::now();
        let result = tokio::time::timeout(self.settings.request_timeout, self.submitter.submit(&data))
            .await
            .map_err(|_| MatchError::Timeout {
                elapsed: submit_started.elapsed(),
            })??;

        *submissions += 1;
        self.metrics.match_submitted();
        debug!(tag, ignore_mismatch, as_expected = result.as_expected, "Match submitted");

        Ok(MatchAttempt {
            app_output: data.app_output,
            result,
            elapsed: started.elapsed(),
            submissions: *submissions,
        })
    }
}
