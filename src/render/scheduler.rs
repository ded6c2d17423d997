//! Render job scheduling
//!
//! [`RenderScheduler::submit_and_wait`] takes a render slot per job, batches
//! jobs into `/render` calls, polls every outstanding render id with one
//! `/render-status` call per round and answers `need-more-resources` by
//! resolving and uploading what the grid is missing before resubmitting
//! that single job. A job's slot lives inside the job, so it is released
//! once, whenever the job reaches a result.

use super::grid::RenderGrid;
use super::model::{RenderRequest, RenderStatus, RenderStatusResult, RunningRender};
use super::pool::{ConcurrencyPool, PoolSlot};
use super::uploader::ResourceUploader;
use crate::config::{PollConfig, RenderConfig};
use crate::http::{HttpError, PollDelay};
use crate::observability::Metrics;
use crate::resources::{Resource, ResourceResolver};
use crate::session::AbortSignal;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Error)]
pub enum RenderError {
    #[error("Render grid request failed: {0}")]
    Http(Arc<HttpError>),

    #[error("Render {render_id} timed out after {elapsed:?}")]
    Timeout { render_id: String, elapsed: Duration },

    #[error("Render aborted")]
    Aborted,

    #[error("Failed to resolve missing resources: {0}")]
    Resolve(String),

    #[error("Render {render_id} still missing resources after {resubmits} resubmissions")]
    TooManyResubmits { render_id: String, resubmits: u32 },

    #[error("Render {render_id} failed: {message}")]
    Server { render_id: String, message: String },

    #[error("{0}")]
    Pool(String),
}

impl RenderError {
    /// Last status the grid reported before the failure, when known
    pub fn last_status(&self) -> Option<RenderStatus> {
        match self {
            Self::Timeout { .. } => Some(RenderStatus::Rendering),
            Self::TooManyResubmits { .. } => Some(RenderStatus::NeedMoreResources),
            Self::Server { .. } => Some(RenderStatus::Error),
            _ => None,
        }
    }

    pub fn render_id(&self) -> Option<&str> {
        match self {
            Self::Timeout { render_id, .. }
            | Self::TooManyResubmits { render_id, .. }
            | Self::Server { render_id, .. } => Some(render_id),
            _ => None,
        }
    }
}

impl From<HttpError> for RenderError {
    fn from(e: HttpError) -> Self {
        Self::Http(Arc::new(e))
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub concurrency: usize,
    pub session_concurrency: usize,
    pub poll: PollConfig,
    pub timeout: Duration,
    pub max_resubmits: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self::from(&RenderConfig::default())
    }
}

impl From<&RenderConfig> for SchedulerConfig {
    fn from(config: &RenderConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            session_concurrency: config.session_concurrency,
            poll: config.poll,
            timeout: config.timeout.into(),
            max_resubmits: config.max_resubmits,
        }
    }
}

struct Job {
    index: usize,
    request: RenderRequest,
    slot: Option<PoolSlot>,
    render_id: Option<String>,
    resubmits: u32,
    started: Option<Instant>,
}

impl Job {
    fn label(&self) -> String {
        self.render_id
            .clone()
            .unwrap_or_else(|| self.request.id.to_string())
    }
}

/// Where a job goes after a grid call
enum Next {
    Poll(Job),
    Resubmit(Job),
    Done(Job, Result<RenderStatusResult>),
}

pub struct RenderScheduler {
    grid: Arc<dyn RenderGrid>,
    resolver: Arc<ResourceResolver>,
    uploader: ResourceUploader,
    render_pool: ConcurrencyPool,
    session_pool: ConcurrencyPool,
    config: SchedulerConfig,
    metrics: Arc<Metrics>,
}

impl RenderScheduler {
    pub fn new(
        grid: Arc<dyn RenderGrid>,
        resolver: Arc<ResourceResolver>,
        config: SchedulerConfig,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            uploader: ResourceUploader::new(Arc::clone(&grid)),
            render_pool: ConcurrencyPool::new("render", config.concurrency),
            session_pool: ConcurrencyPool::new("session", config.session_concurrency),
            grid,
            resolver,
            config,
            metrics,
        }
    }

    pub fn render_pool(&self) -> &ConcurrencyPool {
        &self.render_pool
    }

    pub fn session_pool(&self) -> &ConcurrencyPool {
        &self.session_pool
    }

    pub fn resolver(&self) -> &Arc<ResourceResolver> {
        &self.resolver
    }

    /// Wait for `count` visual-diff session slots, taken in one step; held
    /// by the caller until its sessions end
    pub async fn acquire_sessions(&self, count: usize) -> Result<Vec<PoolSlot>> {
        self.session_pool
            .acquire_many(count)
            .await
            .map_err(|e| RenderError::Pool(e.to_string()))
    }

    /// Render every request and wait for each to finish.
    ///
    /// One result per request, in request order. Failures of one render do
    /// not affect the others.
    pub async fn submit_and_wait(
        &self,
        requests: Vec<RenderRequest>,
        abort: &AbortSignal,
    ) -> Vec<Result<RenderStatusResult>> {
        let mut results: Vec<Option<Result<RenderStatusResult>>> = requests.iter().map(|_| None).collect();
        let mut waiting: VecDeque<Job> = requests
            .into_iter()
            .enumerate()
            .map(|(index, request)| Job {
                index,
                request,
                slot: None,
                render_id: None,
                resubmits: 0,
                started: None,
            })
            .collect();
        let mut ready: Vec<Job> = Vec::new();
        let mut outstanding: Vec<Job> = Vec::new();
        let mut delay = PollDelay::from(&self.config.poll);

        while !(waiting.is_empty() && ready.is_empty() && outstanding.is_empty()) {
            if abort.is_aborted() {
                let dropped = waiting.len() + ready.len() + outstanding.len();
                info!(dropped, "Render batch aborted");
                for job in waiting.drain(..).chain(ready.drain(..)).chain(outstanding.drain(..)) {
                    results[job.index] = Some(Err(RenderError::Aborted));
                }
                break;
            }

            // Block for a slot only when nothing else needs attention
            while !waiting.is_empty() {
                let slot = if ready.is_empty() && outstanding.is_empty() {
                    tokio::select! {
                        slot = self.render_pool.acquire() => match slot {
                            Ok(slot) => slot,
                            Err(e) => {
                                for job in waiting.drain(..) {
                                    results[job.index] = Some(Err(RenderError::Pool(e.to_string())));
                                }
                                break;
                            }
                        },
                        _ = abort.aborted() => break,
                    }
                } else {
                    match self.render_pool.try_acquire() {
                        Some(slot) => slot,
                        None => break,
                    }
                };

                if let Some(mut job) = waiting.pop_front() {
                    job.slot = Some(slot);
                    ready.push(job);
                }
            }

            if abort.is_aborted() {
                continue;
            }

            if !ready.is_empty() {
                let batch = std::mem::take(&mut ready);
                for next in self.submit_batch(batch).await {
                    settle(next, &mut results, &mut ready, &mut outstanding);
                }
                delay = PollDelay::from(&self.config.poll);
                continue;
            }

            if outstanding.is_empty() {
                continue;
            }

            let wait = delay.next_delay();
            if !abort.sleep(wait).await {
                continue;
            }

            let polled = std::mem::take(&mut outstanding);
            for next in self.poll_outstanding(polled).await {
                settle(next, &mut results, &mut ready, &mut outstanding);
            }
        }

        results
            .into_iter()
            .map(|r| r.unwrap_or(Err(RenderError::Aborted)))
            .collect()
    }

    async fn submit_batch(&self, batch: Vec<Job>) -> Vec<Next> {
        let mut nexts = Vec::with_capacity(batch.len());
        let mut submittable = Vec::with_capacity(batch.len());

        for job in batch {
            if job.started.is_none() {
                if let Err(e) = self.upload_bundle(&job.request).await {
                    nexts.push(Next::Done(job, Err(e)));
                    continue;
                }
            }
            submittable.push(job);
        }

        if submittable.is_empty() {
            return nexts;
        }

        let requests: Vec<RenderRequest> = submittable.iter().map(|j| j.request.clone()).collect();
        self.metrics.renders_submitted(requests.len());
        info!(count = requests.len(), "Submitting renders");

        match self.grid.render(&requests).await {
            Ok(running) => {
                for (job, running) in submittable.into_iter().zip(running) {
                    nexts.push(self.after_submit(job, running).await);
                }
            }
            Err(e) => {
                warn!(error = %e, count = submittable.len(), "Render submission failed");
                let e = Arc::new(e);
                nexts.extend(
                    submittable
                        .into_iter()
                        .map(|job| Next::Done(job, Err(RenderError::Http(Arc::clone(&e))))),
                );
            }
        }

        nexts
    }

    async fn after_submit(&self, mut job: Job, running: RunningRender) -> Next {
        job.started.get_or_insert_with(Instant::now);
        if let Some(id) = &running.render_id {
            job.render_id = Some(id.clone());
        }

        match running.render_status {
            RenderStatus::NeedMoreResources => {
                match self
                    .supply_missing(&mut job, &running.need_more_resources, running.need_more_dom)
                    .await
                {
                    Ok(()) => Next::Resubmit(job),
                    Err(e) => Next::Done(job, Err(e)),
                }
            }
            RenderStatus::Error => {
                let render_id = job.label();
                Next::Done(
                    job,
                    Err(RenderError::Server {
                        render_id,
                        message: "render rejected by grid".to_string(),
                    }),
                )
            }
            RenderStatus::Rendering | RenderStatus::Rendered => match &job.render_id {
                Some(render_id) => {
                    debug!(render_id = %render_id, "Render accepted");
                    Next::Poll(job)
                }
                None => {
                    let render_id = job.label();
                    Next::Done(
                        job,
                        Err(RenderError::Server {
                            render_id,
                            message: "grid returned no render id".to_string(),
                        }),
                    )
                }
            },
        }
    }

    async fn poll_outstanding(&self, jobs: Vec<Job>) -> Vec<Next> {
        let ids: Vec<String> = jobs.iter().filter_map(|j| j.render_id.clone()).collect();
        self.metrics.render_status_polled();
        debug!(count = ids.len(), "Polling render status");

        let mut statuses: HashMap<String, RenderStatusResult> = match self.grid.render_status(&ids).await {
            Ok(statuses) => statuses
                .into_iter()
                .filter_map(|s| Some((s.render_id.clone()?, s)))
                .collect(),
            Err(e) => {
                warn!(error = %e, count = jobs.len(), "Render status poll failed");
                let e = Arc::new(e);
                return jobs
                    .into_iter()
                    .map(|job| Next::Done(job, Err(RenderError::Http(Arc::clone(&e)))))
                    .collect();
            }
        };

        let mut nexts = Vec::with_capacity(jobs.len());
        for mut job in jobs {
            let render_id = job.label();
            let status = statuses.remove(&render_id);

            let next = match status {
                Some(status) if status.status == RenderStatus::Rendered => {
                    info!(render_id = %render_id, "Render finished");
                    Next::Done(job, Ok(status))
                }
                Some(status) if status.status == RenderStatus::Error => {
                    let message = status.error.unwrap_or_else(|| "unknown render error".to_string());
                    warn!(render_id = %render_id, error = %message, "Render failed");
                    Next::Done(job, Err(RenderError::Server { render_id, message }))
                }
                Some(status) if status.status == RenderStatus::NeedMoreResources => {
                    let missing = status.need_more_resources.unwrap_or_default();
                    match self.supply_missing(&mut job, &missing, false).await {
                        Ok(()) => Next::Resubmit(job),
                        Err(e) => Next::Done(job, Err(e)),
                    }
                }
                _ => {
                    let elapsed = job.started.map(|s| s.elapsed()).unwrap_or_default();
                    if elapsed >= self.config.timeout {
                        warn!(render_id = %render_id, elapsed_ms = elapsed.as_millis() as u64, "Render timed out");
                        Next::Done(job, Err(RenderError::Timeout { render_id, elapsed }))
                    } else {
                        Next::Poll(job)
                    }
                }
            };
            nexts.push(next);
        }

        nexts
    }

    /// Resolve and upload what the grid asked for, then mark the job for
    /// resubmission under the same render id
    async fn supply_missing(&self, job: &mut Job, missing: &[String], need_dom: bool) -> Result<()> {
        job.resubmits += 1;
        let render_id = job.label();
        if job.resubmits > self.config.max_resubmits {
            warn!(render_id = %render_id, resubmits = job.resubmits, "Render keeps asking for resources");
            return Err(RenderError::TooManyResubmits {
                render_id,
                resubmits: job.resubmits - 1,
            });
        }

        let unknown: Vec<String> = missing
            .iter()
            .filter(|url| !job.request.resources.contains_key(url.as_str()))
            .cloned()
            .collect();

        if !unknown.is_empty() {
            info!(render_id = %render_id, count = unknown.len(), "Resolving resources requested by grid");
            let resolved = self
                .resolver
                .resolve(
                    &unknown,
                    HashMap::new(),
                    job.request.user_agent.as_deref(),
                    Some(job.request.url.as_str()),
                )
                .await
                .map_err(|e| RenderError::Resolve(e.to_string()))?;
            job.request.resources.extend(resolved);
        }

        let mut needed: Vec<&Resource> = missing
            .iter()
            .filter_map(|url| job.request.resources.get(url))
            .map(|r| r.as_ref())
            .collect();
        if need_dom {
            needed.push(&job.request.dom);
        }

        for resource in needed {
            self.grid.put_resource(resource, job.render_id.as_deref()).await?;
        }

        job.request.render_id = job.render_id.clone();
        debug!(render_id = %render_id, resubmits = job.resubmits, "Render ready for resubmission");
        Ok(())
    }

    async fn upload_bundle(&self, request: &RenderRequest) -> Result<()> {
        let resources = request
            .resources
            .values()
            .map(Arc::as_ref)
            .chain(std::iter::once(&request.dom));
        let sent = self.uploader.ensure_all(resources, None).await?;
        if sent > 0 {
            debug!(url = %request.url, sent, "Uploaded render resources");
        }
        Ok(())
    }
}

fn settle(
    next: Next,
    results: &mut [Option<Result<RenderStatusResult>>],
    ready: &mut Vec<Job>,
    outstanding: &mut Vec<Job>,
) {
    match next {
        Next::Poll(job) => outstanding.push(job),
        Next::Resubmit(job) => ready.push(job),
        // Dropping the job releases its slot
        Next::Done(job, result) => results[job.index] = Some(result),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::model::BrowserInfo;
    use crate::render::testing::{FakeGrid, StaticFetcher, snapshot_request, test_resolver};
    use std::sync::atomic::Ordering;

    fn config(concurrency: usize) -> SchedulerConfig {
        SchedulerConfig {
            concurrency,
            session_concurrency: 4,
            poll: PollConfig {
                initial_delay: crate::config::HumanDuration::from_millis(5),
                factor: 1.5,
                max_delay: crate::config::HumanDuration::from_millis(20),
            },
            timeout: Duration::from_secs(5),
            max_resubmits: 2,
        }
    }

    fn scheduler(grid: Arc<FakeGrid>, fetcher: StaticFetcher, config: SchedulerConfig) -> RenderScheduler {
        RenderScheduler::new(grid, Arc::new(test_resolver(fetcher)), config, Arc::new(Metrics::new()))
    }

    fn requests(n: usize) -> Vec<RenderRequest> {
        (0..n)
            .map(|i| snapshot_request(&format!("https://s.test/page{i}"), BrowserInfo::desktop("chrome", 800, 600)))
            .collect()
    }

    #[tokio::test]
    async fn test_batch_renders_and_polls_together() {
        let grid = Arc::new(FakeGrid::new().polls_to_render(2));
        let scheduler = scheduler(Arc::clone(&grid), StaticFetcher::default(), config(5));

        let results = scheduler.submit_and_wait(requests(3), &AbortSignal::new()).await;

        assert_eq!(results.len(), 3);
        for (i, result) in results.iter().enumerate() {
            let status = result.as_ref().unwrap();
            assert_eq!(status.status, RenderStatus::Rendered);
            assert_eq!(status.image_location.as_deref(), Some(format!("https://grid.test/img/r{i}").as_str()));
        }

        let state = grid.snapshot();
        assert_eq!(state.render_calls, 1);
        assert!(!state.status_calls.is_empty());
        assert_eq!(state.status_calls[0].len(), 3);

        let stats = scheduler.render_pool().stats();
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.released, 3);
    }

    #[tokio::test]
    async fn test_render_concurrency_is_bounded() {
        let grid = Arc::new(FakeGrid::new().polls_to_render(3));
        let scheduler = Arc::new(scheduler(Arc::clone(&grid), StaticFetcher::default(), config(2)));

        let mut handles = Vec::new();
        for i in 0..10 {
            let scheduler = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move {
                let request = snapshot_request(
                    &format!("https://s.test/check{i}"),
                    BrowserInfo::desktop("chrome", 800, 600),
                );
                scheduler.submit_and_wait(vec![request], &AbortSignal::new()).await
            }));
        }

        for handle in handles {
            let results = handle.await.unwrap();
            assert!(results[0].is_ok());
        }

        assert!(grid.max_active.load(Ordering::SeqCst) <= 2);
        assert!(grid.max_active.load(Ordering::SeqCst) >= 1);
        let stats = scheduler.render_pool().stats();
        assert_eq!(stats.acquired, 10);
        assert_eq!(stats.released, 10);
        assert_eq!(stats.available, 2);
    }

    #[tokio::test]
    async fn test_need_more_resources_resubmits_only_that_render() {
        let grid = Arc::new(
            FakeGrid::new()
                .polls_to_render(1)
                .need_more("https://s.test/page1", &["https://s.test/late.png"]),
        );
        let fetcher = StaticFetcher::default().with("https://s.test/late.png", "image/png", "PNG");
        let scheduler = scheduler(Arc::clone(&grid), fetcher, config(5));

        let results = scheduler.submit_and_wait(requests(3), &AbortSignal::new()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let state = grid.snapshot();
        assert_eq!(state.submitted.len(), 4);
        let resubmitted: Vec<_> = state.submitted.iter().filter(|r| r.render_id.is_some()).collect();
        assert_eq!(resubmitted.len(), 1);
        assert_eq!(resubmitted[0].url, "https://s.test/page1");
        assert!(resubmitted[0].resources.contains_key("https://s.test/late.png"));
        assert!(state.put_urls.contains(&"https://s.test/late.png".to_string()));
        assert_eq!(scheduler.render_pool().stats().released, 3);
    }

    #[tokio::test]
    async fn test_need_more_while_polling_resubmits_only_that_render() {
        let grid = Arc::new(
            FakeGrid::new()
                .polls_to_render(1)
                .need_more_on_poll("https://s.test/page0", &["https://s.test/late.png"]),
        );
        let fetcher = StaticFetcher::default().with("https://s.test/late.png", "image/png", "PNG");
        let scheduler = scheduler(Arc::clone(&grid), fetcher, config(5));

        let results = scheduler.submit_and_wait(requests(2), &AbortSignal::new()).await;
        assert_eq!(
            results[0].as_ref().unwrap().image_location.as_deref(),
            Some("https://grid.test/img/r0")
        );
        assert!(results[1].is_ok());

        let state = grid.snapshot();
        assert_eq!(state.submitted.len(), 3);
        let resubmitted: Vec<_> = state.submitted.iter().filter(|r| r.render_id.is_some()).collect();
        assert_eq!(resubmitted.len(), 1);
        assert_eq!(resubmitted[0].url, "https://s.test/page0");
        assert_eq!(resubmitted[0].render_id.as_deref(), Some("r0"));
        assert!(resubmitted[0].resources.contains_key("https://s.test/late.png"));
        assert!(state.put_urls.contains(&"https://s.test/late.png".to_string()));

        let stats = scheduler.render_pool().stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
    }

    #[tokio::test]
    async fn test_resubmission_is_capped() {
        let grid = Arc::new(
            FakeGrid::new()
                .need_more("https://s.test/page0", &["https://s.test/late.png"])
                .need_more_forever(),
        );
        let fetcher = StaticFetcher::default().with("https://s.test/late.png", "image/png", "PNG");
        let scheduler = scheduler(Arc::clone(&grid), fetcher, config(5));

        let results = scheduler.submit_and_wait(requests(1), &AbortSignal::new()).await;

        match &results[0] {
            Err(RenderError::TooManyResubmits { resubmits, .. }) => assert_eq!(*resubmits, 2),
            other => panic!("expected TooManyResubmits, got {other:?}"),
        }
        assert_eq!(grid.snapshot().submitted.len(), 3);
        assert_eq!(scheduler.render_pool().stats().in_use(), 0);
    }

    #[tokio::test]
    async fn test_render_timeout_releases_slot() {
        let grid = Arc::new(FakeGrid::new().never_finish());
        let mut config = config(1);
        config.timeout = Duration::from_millis(60);
        let scheduler = scheduler(Arc::clone(&grid), StaticFetcher::default(), config);

        let results = scheduler.submit_and_wait(requests(2), &AbortSignal::new()).await;

        for result in &results {
            let err = result.as_ref().unwrap_err();
            assert!(matches!(err, RenderError::Timeout { .. }));
            assert_eq!(err.last_status(), Some(RenderStatus::Rendering));
        }
        let stats = scheduler.render_pool().stats();
        assert_eq!(stats.acquired, 2);
        assert_eq!(stats.released, 2);
    }

    #[tokio::test]
    async fn test_grid_error_status_fails_single_render() {
        let grid = Arc::new(FakeGrid::new().polls_to_render(1).reject("https://s.test/page1"));
        let scheduler = scheduler(Arc::clone(&grid), StaticFetcher::default(), config(5));

        let results = scheduler.submit_and_wait(requests(2), &AbortSignal::new()).await;

        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(RenderError::Server { .. })));
        assert_eq!(scheduler.render_pool().stats().in_use(), 0);
    }

    #[tokio::test]
    async fn test_aborted_signal_submits_nothing() {
        let grid = Arc::new(FakeGrid::new());
        let scheduler = scheduler(Arc::clone(&grid), StaticFetcher::default(), config(5));
        let abort = AbortSignal::new();
        abort.abort();

        let results = scheduler.submit_and_wait(requests(3), &abort).await;

        assert!(results.iter().all(|r| matches!(r, Err(RenderError::Aborted))));
        assert_eq!(grid.snapshot().render_calls, 0);
        assert_eq!(scheduler.render_pool().stats().in_use(), 0);
    }

    #[tokio::test]
    async fn test_abort_while_polling_releases_slots() {
        let grid = Arc::new(FakeGrid::new().never_finish());
        let scheduler = Arc::new(scheduler(Arc::clone(&grid), StaticFetcher::default(), config(2)));
        let abort = AbortSignal::new();

        let handle = {
            let scheduler = Arc::clone(&scheduler);
            let abort = abort.clone();
            tokio::spawn(async move { scheduler.submit_and_wait(requests(4), &abort).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        abort.abort();
        let results = handle.await.unwrap();

        assert!(results.iter().all(|r| matches!(r, Err(RenderError::Aborted))));
        assert_eq!(grid.snapshot().render_calls, 1);
        let stats = scheduler.render_pool().stats();
        assert_eq!(stats.acquired, stats.released);
        assert_eq!(stats.available, 2);
    }

    #[tokio::test]
    async fn test_resources_are_uploaded_before_render() {
        let grid = Arc::new(FakeGrid::new().polls_to_render(1));
        let scheduler = scheduler(Arc::clone(&grid), StaticFetcher::default(), config(5));

        let results = scheduler.submit_and_wait(requests(2), &AbortSignal::new()).await;
        assert!(results.iter().all(|r| r.is_ok()));

        let state = grid.snapshot();
        // Shared stylesheet once, plus one DOM document per page
        assert_eq!(state.put_urls.len(), 3);
        assert_eq!(
            state.put_urls.iter().filter(|u| u.ends_with("style.css")).count(),
            1
        );
    }
}
