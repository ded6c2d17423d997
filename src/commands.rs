use crate::cli::{RenderInfoArgs, ResolveArgs};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use visualgrid::config::Config;
use visualgrid::observability::Metrics;
use visualgrid::resources::{FetcherConfig, HttpResourceFetcher, ResourceCache, ResourceResolver};
use visualgrid::session::ServerConnector;

type AnyError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub async fn resolve(config: &Config, args: ResolveArgs) -> Result<(), AnyError> {
    let metrics = Arc::new(Metrics::new());
    let fetcher = HttpResourceFetcher::new(FetcherConfig::from(config))?;
    let resolver = ResourceResolver::new(
        Arc::new(ResourceCache::new()),
        Arc::new(fetcher),
        Arc::clone(&metrics),
        config.resources.max_resource_bytes.as_usize(),
    );

    let resources = resolver
        .resolve(
            &args.urls,
            HashMap::new(),
            args.user_agent.as_deref(),
            args.referer.as_deref(),
        )
        .await?;

    let listing: Vec<serde_json::Value> = resources
        .values()
        .map(|resource| {
            serde_json::json!({
                "url": resource.url,
                "contentType": resource.content_type,
                "hash": resource.hash,
                "size": resource.size(),
                "errorStatusCode": resource.error_status_code,
                "dependencies": resource.dependency_urls,
            })
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&listing)?);

    let stats = metrics.snapshot();
    info!(
        resources = listing.len(),
        fetched = stats.resources_fetched,
        cache_hits = stats.resource_cache_hits,
        "Resolve finished"
    );
    Ok(())
}

pub async fn render_info(config: &Config, args: RenderInfoArgs) -> Result<(), AnyError> {
    let connector = ServerConnector::new(config, Arc::new(Metrics::new()))?;
    let mut render_info = connector.render_info().await?;

    if !args.show_token {
        render_info.access_token = mask(&render_info.access_token);
    }

    println!("{}", serde_json::to_string_pretty(&render_info)?);
    Ok(())
}

fn mask(token: &str) -> String {
    let visible: String = token.chars().take(4).collect();
    format!("{visible}***")
}
