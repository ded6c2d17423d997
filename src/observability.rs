//! Counters and tracing setup

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "visualgrid=info";

/// Install the global fmt subscriber, honouring `RUST_LOG`.
///
/// Only binaries call this; library code just emits events.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Metrics handle shared by the resolver, scheduler and match loop
#[derive(Debug, Default)]
pub struct Metrics {
    resources_fetched: AtomicU64,
    resource_cache_hits: AtomicU64,
    renders_submitted: AtomicU64,
    render_status_polls: AtomicU64,
    match_submissions: AtomicU64,
    concurrency_backoffs: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resource_fetched(&self) {
        self.resources_fetched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "resources_fetched", "Metric incremented");
    }

    pub fn resource_cache_hit(&self) {
        self.resource_cache_hits.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "resource_cache_hits", "Metric incremented");
    }

    pub fn renders_submitted(&self, count: usize) {
        self.renders_submitted
            .fetch_add(count as u64, Ordering::Relaxed);
        tracing::trace!(counter = "renders_submitted", count, "Metric incremented");
    }

    pub fn render_status_polled(&self) {
        self.render_status_polls.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "render_status_polls", "Metric incremented");
    }

    pub fn match_submitted(&self) {
        self.match_submissions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "match_submissions", "Metric incremented");
    }

    pub fn concurrency_backoff(&self) {
        self.concurrency_backoffs.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(counter = "concurrency_backoffs", "Metric incremented");
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            resources_fetched: self.resources_fetched.load(Ordering::Relaxed),
            resource_cache_hits: self.resource_cache_hits.load(Ordering::Relaxed),
            renders_submitted: self.renders_submitted.load(Ordering::Relaxed),
            render_status_polls: self.render_status_polls.load(Ordering::Relaxed),
            match_submissions: self.match_submissions.load(Ordering::Relaxed),
            concurrency_backoffs: self.concurrency_backoffs.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub resources_fetched: u64,
    pub resource_cache_hits: u64,
    pub renders_submitted: u64,
    pub render_status_polls: u64,
    pub match_submissions: u64,
    pub concurrency_backoffs: u64,
}
