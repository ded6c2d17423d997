//! In-memory render grid and fetcher used by unit tests

use super::grid::RenderGrid;
use super::model::{BrowserInfo, DomSnapshot, RenderRequest, RenderStatus, RenderStatusResult, RunningRender};
use crate::http::Result;
use crate::observability::Metrics;
use crate::resources::{
    FetchError, FetchedResource, Resource, ResourceCache, ResourceFetcher, ResourceMap, ResourceResolver,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct GridState {
    pub render_calls: usize,
    pub submitted: Vec<RenderRequest>,
    pub status_calls: Vec<Vec<String>>,
    pub put_urls: Vec<String>,
    pub stored: HashSet<String>,
    next_id: usize,
    polls: HashMap<String, (String, u32)>,
    asked_on_poll: HashSet<String>,
}

#[derive(Default)]
pub struct FakeGrid {
    state: Mutex<GridState>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
    polls_to_render: u32,
    never_finish: bool,
    need_more: HashMap<String, Vec<String>>,
    need_more_forever: bool,
    need_more_on_poll: HashMap<String, Vec<String>>,
    reject: HashSet<String>,
    upload_delay: Option<Duration>,
    uploads_active: AtomicUsize,
    pub max_uploads: AtomicUsize,
}

impl FakeGrid {
    pub fn new() -> Self {
        Self {
            polls_to_render: 1,
            ..Self::default()
        }
    }

    pub fn polls_to_render(mut self, polls: u32) -> Self {
        self.polls_to_render = polls;
        self
    }

    pub fn never_finish(mut self) -> Self {
        self.never_finish = true;
        self
    }

    /// First submission of `page_url` answers need-more-resources for `missing`
    pub fn need_more(mut self, page_url: &str, missing: &[&str]) -> Self {
        self.need_more.insert(
            page_url.to_string(),
            missing.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    pub fn need_more_forever(mut self) -> Self {
        self.need_more_forever = true;
        self
    }

    /// First status poll of a render of `page_url` answers
    /// need-more-resources for `missing`
    pub fn need_more_on_poll(mut self, page_url: &str, missing: &[&str]) -> Self {
        self.need_more_on_poll.insert(
            page_url.to_string(),
            missing.iter().map(|m| m.to_string()).collect(),
        );
        self
    }

    /// Hold each resource lookup for `delay` so overlapping uploads show up
    /// in `max_uploads`
    pub fn upload_delay(mut self, delay: Duration) -> Self {
        self.upload_delay = Some(delay);
        self
    }

    pub fn reject(mut self, page_url: &str) -> Self {
        self.reject.insert(page_url.to_string());
        self
    }

    pub fn snapshot(&self) -> GridState {
        self.state.lock().unwrap().clone()
    }
}

#[async_trait]
impl RenderGrid for FakeGrid {
    async fn render(&self, requests: &[RenderRequest]) -> Result<Vec<RunningRender>> {
        let mut state = self.state.lock().unwrap();
        state.render_calls += 1;

        let mut running = Vec::with_capacity(requests.len());
        for request in requests {
            state.submitted.push(request.clone());
            let render_id = request.render_id.clone().unwrap_or_else(|| {
                let id = format!("r{}", state.next_id);
                state.next_id += 1;
                id
            });

            let missing = self.need_more.get(&request.url).filter(|_| {
                request.render_id.is_none() || self.need_more_forever
            });
            if let Some(missing) = missing {
                running.push(RunningRender {
                    render_id: Some(render_id),
                    render_status: RenderStatus::NeedMoreResources,
                    need_more_resources: missing.clone(),
                    need_more_dom: false,
                });
                continue;
            }

            state.polls.insert(render_id.clone(), (request.url.clone(), 0));
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            running.push(RunningRender {
                render_id: Some(render_id),
                render_status: RenderStatus::Rendering,
                need_more_resources: Vec::new(),
                need_more_dom: false,
            });
        }

        Ok(running)
    }

    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<RenderStatusResult>> {
        let mut state = self.state.lock().unwrap();
        state.status_calls.push(render_ids.to_vec());

        let mut statuses = Vec::with_capacity(render_ids.len());
        for id in render_ids {
            let mut status = RenderStatusResult::pending(id.clone());
            let Some((url, polls)) = state.polls.get_mut(id) else {
                statuses.push(status);
                continue;
            };
            *polls += 1;
            let (url, polls) = (url.clone(), *polls);

            if let Some(missing) = self.need_more_on_poll.get(&url) {
                if state.asked_on_poll.insert(id.clone()) {
                    status.status = RenderStatus::NeedMoreResources;
                    status.need_more_resources = Some(missing.clone());
                    state.polls.remove(id);
                    self.active.fetch_sub(1, Ordering::SeqCst);
                    statuses.push(status);
                    continue;
                }
            }

            if self.reject.contains(url.as_str()) {
                status.status = RenderStatus::Error;
                status.error = Some("browser crashed".to_string());
            } else if !self.never_finish && polls >= self.polls_to_render {
                status.status = RenderStatus::Rendered;
                status.image_location = Some(format!("https://grid.test/img/{id}"));
            }

            if status.status.is_terminal() {
                state.polls.remove(id);
                self.active.fetch_sub(1, Ordering::SeqCst);
            }
            statuses.push(status);
        }

        Ok(statuses)
    }

    async fn has_resource(&self, hash: &str, _render_id: Option<&str>) -> Result<bool> {
        if let Some(delay) = self.upload_delay {
            let now = self.uploads_active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_uploads.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(delay).await;
            self.uploads_active.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(self.state.lock().unwrap().stored.contains(hash))
    }

    async fn put_resource(&self, resource: &Resource, _render_id: Option<&str>) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.put_urls.push(resource.url.clone());
        if let Some(hash) = &resource.hash {
            state.stored.insert(hash.clone());
        }
        Ok(())
    }
}

/// Fetcher serving fixed bodies; unknown URLs fail like a dead host
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, (&'static str, &'static str)>,
    pub fetches: AtomicUsize,
}

impl StaticFetcher {
    pub fn with(mut self, url: &str, content_type: &'static str, body: &'static str) -> Self {
        self.pages.insert(url.to_string(), (content_type, body));
        self
    }
}

#[async_trait]
impl ResourceFetcher for StaticFetcher {
    async fn fetch(
        &self,
        url: &str,
        _user_agent: Option<&str>,
        _referer: Option<&str>,
    ) -> std::result::Result<FetchedResource, FetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        match self.pages.get(url) {
            Some((content_type, body)) => Ok(FetchedResource {
                status: 200,
                content_type: Some(content_type.to_string()),
                body: Bytes::from_static(body.as_bytes()),
            }),
            None => Err(FetchError::RequestFailed("connection refused".to_string())),
        }
    }
}

pub fn test_resolver(fetcher: StaticFetcher) -> ResourceResolver {
    ResourceResolver::new(
        Arc::new(ResourceCache::new()),
        Arc::new(fetcher),
        Arc::new(Metrics::new()),
        1024 * 1024,
    )
}

/// Render request for a page with one shared stylesheet
pub fn snapshot_request(url: &str, browser: BrowserInfo) -> RenderRequest {
    let mut resources = ResourceMap::new();
    resources.insert(
        "https://s.test/style.css".to_string(),
        Arc::new(Resource::from_content(
            "https://s.test/style.css",
            "text/css",
            Bytes::from_static(b"body{margin:0}"),
            Vec::new(),
        )),
    );

    let snapshot = DomSnapshot {
        url: url.to_string(),
        cdt: serde_json::json!([{ "nodeType": 9, "documentURL": url }]),
        ..DomSnapshot::default()
    };
    let dom = snapshot
        .to_resource(&resources)
        .expect("snapshot serializes");
    RenderRequest::new(dom, resources, browser)
}
