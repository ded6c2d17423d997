use super::cache::{CacheOutcome, ResourceCache};
use super::fetcher::ResourceFetcher;
use super::model::{DEFAULT_CONTENT_TYPE, DependencyKind, RawResource, Resource};
use super::parse::{extract_dependencies, normalize_url};
use crate::observability::Metrics;
use futures::future::join_all;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Status recorded when a fetch fails below HTTP (connection, DNS, timeout)
pub const NETWORK_FAILURE_STATUS: u16 = 504;

/// Status recorded when a body exceeds the size cap
pub const TOO_LARGE_STATUS: u16 = 413;

#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("Invalid resource url: {0}")]
    InvalidUrl(String),
}

pub type Result<T> = std::result::Result<T, ResolveError>;

/// Resolved resources keyed by absolute URL
pub type ResourceMap = BTreeMap<String, Arc<Resource>>;

/// Builds the dependency closure of a page's resources.
///
/// Nested references are walked breadth-first with a worklist and a
/// visited set scoped to one `resolve` call, so import cycles terminate and
/// each URL is handled once per call.
pub struct ResourceResolver {
    cache: Arc<ResourceCache>,
    fetcher: Arc<dyn ResourceFetcher>,
    metrics: Arc<Metrics>,
    max_resource_bytes: usize,
}

impl ResourceResolver {
    pub fn new(
        cache: Arc<ResourceCache>,
        fetcher: Arc<dyn ResourceFetcher>,
        metrics: Arc<Metrics>,
        max_resource_bytes: usize,
    ) -> Self {
        Self {
            cache,
            fetcher,
            metrics,
            max_resource_bytes,
        }
    }

    pub fn cache(&self) -> &Arc<ResourceCache> {
        &self.cache
    }

    /// Resolve `resource_urls` and everything they reference.
    ///
    /// `pre_resources` are stored as-is without fetching and their own
    /// references are not expanded. A URL the cache already holds content
    /// for keeps that content. Fetch failures become error resources;
    /// only an unparseable top-level URL fails the call.
    pub async fn resolve(
        &self,
        resource_urls: &[String],
        pre_resources: HashMap<String, RawResource>,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Result<ResourceMap> {
        let mut resolved = ResourceMap::new();
        let mut visited: HashSet<String> = HashSet::new();

        for (url, raw) in pre_resources {
            let url = normalize_url(&url).unwrap_or(url);
            let resource = Resource::from_content(url.clone(), raw.content_type, raw.content, Vec::new());
            let resource = self.cache.get_or_insert(resource).await;
            visited.insert(url.clone());
            resolved.insert(url, resource);
        }

        let mut queue = VecDeque::new();
        for raw in resource_urls {
            if url::Url::parse(raw.trim()).is_err() {
                return Err(ResolveError::InvalidUrl(raw.clone()));
            }
            match normalize_url(raw) {
                Some(url) if visited.insert(url.clone()) => queue.push_back(url),
                Some(_) => {}
                None => debug!(url = %raw, "Skipping unsupported resource url"),
            }
        }

        while !queue.is_empty() {
            let wave: Vec<String> = queue.drain(..).collect();
            let results = join_all(
                wave.iter()
                    .map(|url| self.resolve_one(url, user_agent, referer)),
            )
            .await;

            for resource in results {
                for dep in &resource.dependency_urls {
                    if visited.insert(dep.clone()) {
                        queue.push_back(dep.clone());
                    }
                }
                resolved.insert(resource.url.clone(), resource);
            }
        }

        info!(
            requested = resource_urls.len(),
            resolved = resolved.len(),
            "Resources resolved"
        );

        Ok(resolved)
    }

    async fn resolve_one(
        &self,
        url: &str,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Arc<Resource> {
        let (resource, outcome) = self
            .cache
            .get_or_fetch(url, || self.fetch_resource(url, user_agent, referer))
            .await;

        match outcome {
            CacheOutcome::Fetched => self.metrics.resource_fetched(),
            CacheOutcome::Hit | CacheOutcome::Joined => self.metrics.resource_cache_hit(),
        }

        resource
    }

    async fn fetch_resource(
        &self,
        url: &str,
        user_agent: Option<&str>,
        referer: Option<&str>,
    ) -> Resource {
        let fetched = match self.fetcher.fetch(url, user_agent, referer).await {
            Ok(fetched) => fetched,
            Err(e) => {
                warn!(url, error = %e, "Resource fetch failed, using placeholder");
                return Resource::error(url, NETWORK_FAILURE_STATUS);
            }
        };

        if !fetched.is_success() {
            warn!(url, status = fetched.status, "Resource responded with error status");
            return Resource::error(url, fetched.status);
        }

        if fetched.body.len() > self.max_resource_bytes {
            warn!(
                url,
                size = fetched.body.len(),
                limit = self.max_resource_bytes,
                "Resource exceeds size limit"
            );
            return Resource::error(url, TOO_LARGE_STATUS);
        }

        let content_type = fetched
            .content_type
            .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());

        let dependencies = match DependencyKind::from_content_type(&content_type) {
            Some(kind) => {
                let body = String::from_utf8_lossy(&fetched.body);
                extract_dependencies(kind, url, &body)
            }
            None => Vec::new(),
        };

        if !dependencies.is_empty() {
            debug!(url, count = dependencies.len(), "Found nested resources");
        }

        Resource::from_content(url, content_type, fetched.body, dependencies)
    }
}
