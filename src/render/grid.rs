//! Render grid API

use super::model::{RenderInfo, RenderRequest, RenderStatusResult, RunningRender};
use crate::http::{HttpError, HttpRequest, LongRunningHttpClient, Result};
use crate::resources::{HASH_FORMAT, Resource};
use async_trait::async_trait;
use std::collections::HashMap;
use tracing::debug;

pub const AUTH_HEADER: &str = "X-Auth-Token";

/// Operations the scheduler and uploader need from the render grid
#[async_trait]
pub trait RenderGrid: Send + Sync {
    /// Submit a batch; one `RunningRender` per request, in request order
    async fn render(&self, requests: &[RenderRequest]) -> Result<Vec<RunningRender>>;

    /// Status of every id in one call, in id order
    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<RenderStatusResult>>;

    /// Whether the grid already stores content with this hash
    async fn has_resource(&self, hash: &str, render_id: Option<&str>) -> Result<bool>;

    async fn put_resource(&self, resource: &Resource, render_id: Option<&str>) -> Result<()>;
}

/// Render grid over HTTP, authenticated with the render-info access token
pub struct HttpRenderGrid {
    client: LongRunningHttpClient,
    service_url: String,
}

impl HttpRenderGrid {
    pub fn new(client: LongRunningHttpClient, info: &RenderInfo) -> Self {
        Self {
            client: client.with_default_header(AUTH_HEADER, info.access_token.clone()),
            service_url: info.service_url.trim_end_matches('/').to_string(),
        }
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.service_url, path.trim_start_matches('/'))
    }

    fn resource_request(&self, request: HttpRequest, render_id: Option<&str>) -> HttpRequest {
        match render_id {
            Some(id) => request.query("render-id", id),
            None => request,
        }
    }
}

#[async_trait]
impl RenderGrid for HttpRenderGrid {
    async fn render(&self, requests: &[RenderRequest]) -> Result<Vec<RunningRender>> {
        let body = serde_json::to_value(requests.iter().map(RenderRequest::to_wire).collect::<Vec<_>>())?;
        debug!(count = requests.len(), "Submitting render batch");

        let response = self
            .client
            .execute(&HttpRequest::post(self.endpoint("render")).json(body))
            .await?
            .error_for_status()?;

        let running: Vec<RunningRender> = response.json()?;
        if running.len() != requests.len() {
            return Err(HttpError::UnexpectedStatus {
                status: response.status,
                url: response.url,
                body: format!("expected {} renders, got {}", requests.len(), running.len()),
            });
        }
        Ok(running)
    }

    async fn render_status(&self, render_ids: &[String]) -> Result<Vec<RenderStatusResult>> {
        let response = self
            .client
            .execute(&HttpRequest::post(self.endpoint("render-status")).json(serde_json::json!(render_ids)))
            .await?
            .error_for_status()?;

        // The grid answers null for ids it has not registered yet
        let statuses: Vec<Option<RenderStatusResult>> = response.json()?;
        let mut by_position: HashMap<usize, RenderStatusResult> = statuses
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| s.map(|s| (i, s)))
            .collect();

        Ok(render_ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                let mut status = by_position
                    .remove(&i)
                    .unwrap_or_else(|| RenderStatusResult::pending(id.clone()));
                status.render_id.get_or_insert_with(|| id.clone());
                status
            })
            .collect())
    }

    async fn has_resource(&self, hash: &str, render_id: Option<&str>) -> Result<bool> {
        let url = self.endpoint(&format!("resources/{HASH_FORMAT}/{hash}"));
        let response = self
            .client
            .execute(&self.resource_request(HttpRequest::head(url), render_id))
            .await?;

        match response.status {
            200 => Ok(true),
            404 => Ok(false),
            _ => Err(response.into_unexpected()),
        }
    }

    async fn put_resource(&self, resource: &Resource, render_id: Option<&str>) -> Result<()> {
        let (Some(hash), Some(content)) = (&resource.hash, &resource.content) else {
            return Ok(());
        };

        let url = self.endpoint(&format!("resources/{HASH_FORMAT}/{hash}"));
        let request = HttpRequest::put(url).raw(resource.content_type.clone(), content.clone());
        self.client
            .execute(&self.resource_request(request, render_id))
            .await?
            .error_for_status()?;

        debug!(url = %resource.url, hash = %hash, size = content.len(), "Resource uploaded");
        Ok(())
    }
}
