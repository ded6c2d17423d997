//! Page resource collection
//!
//! Fetches the resources a captured page references, follows nested
//! references in CSS and SVG, and keeps everything in a shared cache so a
//! URL is downloaded at most once per process.

pub mod cache;
pub mod fetcher;
pub mod model;
pub mod parse;
pub mod resolver;

pub use cache::{CacheOutcome, ResourceCache};
pub use fetcher::{FetchError, FetchedResource, FetcherConfig, HttpResourceFetcher, ResourceFetcher};
pub use model::{CDT_CONTENT_TYPE, HASH_FORMAT, RawResource, Resource, ResourceRef, content_hash};
pub use resolver::{ResolveError, ResourceMap, ResourceResolver};
