//! Process-wide resource cache with single-flight fetch deduplication.

use super::model::Resource;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::debug;

/// How a cache lookup was satisfied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    /// Entry was already resolved
    Hit,
    /// Another caller was fetching the same URL; its result was shared
    Joined,
    /// This caller performed the fetch
    Fetched,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<String, Arc<Resource>>,
    dependencies: HashMap<String, Vec<String>>,
}

impl CacheState {
    fn store(&mut self, resource: Resource) -> Arc<Resource> {
        let resource = Arc::new(resource);
        self.dependencies
            .insert(resource.url.clone(), resource.dependency_urls.clone());
        self.entries.insert(resource.url.clone(), Arc::clone(&resource));
        resource
    }
}

type Flight = Arc<OnceCell<Arc<Resource>>>;

/// Resolved resources keyed by URL, plus each URL's dependency list.
///
/// Construct one per process (or per test) and share it by `Arc`. An entry
/// is written once and never re-fetched for the life of the cache.
#[derive(Debug, Default)]
pub struct ResourceCache {
    state: Mutex<CacheState>,
    in_flight: Mutex<HashMap<String, Flight>>,
}

impl ResourceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, url: &str) -> Option<Arc<Resource>> {
        self.state.lock().await.entries.get(url).cloned()
    }

    pub async fn dependencies(&self, url: &str) -> Option<Vec<String>> {
        self.state.lock().await.dependencies.get(url).cloned()
    }

    pub async fn contains(&self, url: &str) -> bool {
        self.state.lock().await.entries.contains_key(url)
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Store a resource and its dependency list in one write
    pub async fn insert(&self, resource: Resource) -> Arc<Resource> {
        let mut state = self.state.lock().await;
        state.store(resource)
    }

    /// Like [`insert`](Self::insert), but an entry that already has content
    /// stays as it is and is returned instead. Error placeholders are
    /// replaced.
    pub async fn get_or_insert(&self, resource: Resource) -> Arc<Resource> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state.entries.get(&resource.url).filter(|r| r.hash.is_some()) {
            return Arc::clone(existing);
        }
        state.store(resource)
    }

    /// Return the cached resource for `url`, or run `fetch` exactly once
    /// across all concurrent callers and cache its output.
    pub async fn get_or_fetch<F, Fut>(&self, url: &str, fetch: F) -> (Arc<Resource>, CacheOutcome)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Resource>,
    {
        if let Some(hit) = self.get(url).await {
            return (hit, CacheOutcome::Hit);
        }

        let (flight, owner) = {
            let mut in_flight = self.in_flight.lock().await;
            // The owner writes the entry before leaving the in-flight map, so a
            // re-check here closes the gap between the miss above and this lock.
            if let Some(hit) = self.get(url).await {
                return (hit, CacheOutcome::Hit);
            }
            match in_flight.get(url) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let flight: Flight = Arc::new(OnceCell::new());
                    in_flight.insert(url.to_string(), Arc::clone(&flight));
                    (flight, true)
                }
            }
        };

        if !owner {
            debug!(url, "Joining in-flight fetch");
        }

        let mut ran_fetch = false;
        let resource = flight
            .get_or_init(|| {
                ran_fetch = true;
                let pending = fetch();
                async move {
                    let resource = pending.await;
                    self.insert(resource).await
                }
            })
            .await
            .clone();

        if ran_fetch {
            self.in_flight.lock().await.remove(url);
        }

        let outcome = if ran_fetch {
            CacheOutcome::Fetched
        } else {
            CacheOutcome::Joined
        };
        (resource, outcome)
    }
}
