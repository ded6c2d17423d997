//! Extraction of nested resource references from CSS and SVG bodies.

use super::model::DependencyKind;
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;
use url::Url;

static CSS_COMMENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("valid css comment regex"));

static CSS_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)url\(\s*(?:"([^"]*)"|'([^']*)'|([^)"'\s]*))\s*\)"#).expect("valid css url regex")
});

static CSS_IMPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)@import\s+(?:"([^"]*)"|'([^']*)')"#).expect("valid css import regex")
});

static SVG_IMAGE_HREF: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)<(?:image|feImage)\b[^>]*?\s(?:xlink:)?href\s*=\s*(?:"([^"]*)"|'([^']*)')"#)
        .expect("valid svg href regex")
});

/// Absolute, fetchable dependency URLs referenced by a CSS or SVG body.
///
/// Relative references resolve against `base_url`. References with schemes
/// other than http(s) (`data:`, `blob:`, `javascript:`...) are dropped, and
/// fragments are stripped. Order of first appearance is kept.
pub fn extract_dependencies(kind: DependencyKind, base_url: &str, body: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base_url) else {
        return Vec::new();
    };

    let raw = match kind {
        DependencyKind::Css => css_references(body),
        DependencyKind::Svg => {
            let mut refs = svg_image_references(body);
            refs.extend(css_references(body));
            refs
        }
    };

    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(|href| absolutize(&base, href))
        .filter(|url| url != base.as_str())
        .filter(|url| seen.insert(url.clone()))
        .collect()
}

fn first_capture(caps: &regex::Captures<'_>) -> Option<String> {
    (1..caps.len())
        .find_map(|i| caps.get(i))
        .map(|m| m.as_str().trim().to_string())
}

fn css_references(css: &str) -> Vec<String> {
    let css = CSS_COMMENT.replace_all(css, "");

    let mut refs: Vec<(usize, String)> = CSS_IMPORT
        .captures_iter(&css)
        .filter_map(|caps| Some((caps.get(0)?.start(), first_capture(&caps)?)))
        .collect();
    refs.extend(
        CSS_URL
            .captures_iter(&css)
            .filter_map(|caps| Some((caps.get(0)?.start(), first_capture(&caps)?))),
    );
    refs.sort_by_key(|(pos, _)| *pos);

    refs.into_iter().map(|(_, href)| href).collect()
}

fn svg_image_references(svg: &str) -> Vec<String> {
    SVG_IMAGE_HREF
        .captures_iter(svg)
        .filter_map(|caps| first_capture(&caps))
        .collect()
}

/// Resolve `href` against `base`, keeping only http(s) targets
pub fn absolutize(base: &Url, href: &str) -> Option<String> {
    let href = href.trim();
    if href.is_empty() || href.starts_with('#') {
        return None;
    }

    let mut url = base.join(href).ok()?;
    if !is_supported_scheme(url.scheme()) {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

/// Normalise a top-level URL the same way nested references are normalised
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !is_supported_scheme(url.scheme()) {
        return None;
    }
    url.set_fragment(None);
    Some(url.to_string())
}

fn is_supported_scheme(scheme: &str) -> bool {
    scheme == "http" || scheme == "https"
}
