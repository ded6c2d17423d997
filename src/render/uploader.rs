use super::grid::RenderGrid;
use crate::http::Result;
use crate::resources::Resource;
use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Uploads in flight at once for a single `ensure_all` call
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 8;

/// Puts resource content on the grid, once per hash for the life of the uploader
pub struct ResourceUploader {
    grid: Arc<dyn RenderGrid>,
    uploaded: Mutex<HashSet<String>>,
    concurrency: usize,
}

impl ResourceUploader {
    pub fn new(grid: Arc<dyn RenderGrid>) -> Self {
        Self {
            grid,
            uploaded: Mutex::new(HashSet::new()),
            concurrency: DEFAULT_UPLOAD_CONCURRENCY,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Make sure the grid holds `resource`. Error placeholders carry no
    /// content and are skipped. Returns whether bytes were sent.
    pub async fn ensure(&self, resource: &Resource, render_id: Option<&str>) -> Result<bool> {
        let Some(hash) = resource.hash.as_deref() else {
            return Ok(false);
        };

        if self.uploaded.lock().await.contains(hash) {
            return Ok(false);
        }

        let sent = if self.grid.has_resource(hash, render_id).await? {
            debug!(url = %resource.url, hash, "Grid already has resource");
            false
        } else {
            self.grid.put_resource(resource, render_id).await?;
            true
        };

        self.uploaded.lock().await.insert(hash.to_string());
        Ok(sent)
    }

    /// Upload every resource, at most `concurrency` at a time; returns how
    /// many were sent. Stops at the first failure.
    pub async fn ensure_all<'a, I>(&self, resources: I, render_id: Option<&str>) -> Result<usize>
    where
        I: IntoIterator<Item = &'a Resource>,
    {
        let pending: Vec<_> = resources.into_iter().map(|r| self.ensure(r, render_id)).collect();
        let mut uploads = stream::iter(pending).buffer_unordered(self.concurrency);

        let mut sent = 0;
        while let Some(result) = uploads.next().await {
            if result? {
                sent += 1;
            }
        }
        Ok(sent)
    }

    pub async fn is_uploaded(&self, hash: &str) -> bool {
        self.uploaded.lock().await.contains(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::testing::FakeGrid;
    use bytes::Bytes;

    fn png(url: &str, body: &'static [u8]) -> Resource {
        Resource::from_content(url, "image/png", Bytes::from_static(body), Vec::new())
    }

    #[tokio::test]
    async fn test_same_hash_is_sent_once() {
        let grid = Arc::new(FakeGrid::new());
        let uploader = ResourceUploader::new(grid.clone());

        // Identical bytes under two URLs share one hash
        let a = png("https://s.test/a.png", b"same");
        let b = png("https://s.test/b.png", b"same");

        assert!(uploader.ensure(&a, None).await.unwrap());
        assert!(!uploader.ensure(&b, None).await.unwrap());
        assert!(uploader.is_uploaded(a.hash.as_deref().unwrap()).await);
        assert_eq!(grid.snapshot().put_urls, vec!["https://s.test/a.png".to_string()]);
    }

    #[tokio::test]
    async fn test_error_resources_are_skipped() {
        let grid = Arc::new(FakeGrid::new());
        let uploader = ResourceUploader::new(grid.clone());

        let gone = Resource::error("https://s.test/gone.png", 404);
        let ok = png("https://s.test/ok.png", b"ok");

        let sent = uploader.ensure_all([&gone, &ok], None).await.unwrap();
        assert_eq!(sent, 1);
        assert_eq!(grid.snapshot().put_urls.len(), 1);
    }

    #[tokio::test]
    async fn test_uploads_in_flight_are_bounded() {
        let grid = Arc::new(FakeGrid::new().upload_delay(std::time::Duration::from_millis(10)));
        let uploader = ResourceUploader::new(grid.clone()).with_concurrency(3);

        let resources: Vec<Resource> = (0..12)
            .map(|i| {
                Resource::from_content(
                    format!("https://s.test/{i}.png"),
                    "image/png",
                    Bytes::from(format!("image {i}")),
                    Vec::new(),
                )
            })
            .collect();

        let sent = uploader.ensure_all(&resources, None).await.unwrap();
        assert_eq!(sent, 12);
        assert_eq!(grid.snapshot().put_urls.len(), 12);

        let max = grid.max_uploads.load(std::sync::atomic::Ordering::SeqCst);
        assert!(max <= 3, "{max} uploads in flight");
        assert!(max >= 2);
    }
}
