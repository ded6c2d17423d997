use bytes::Bytes;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Content type the render grid expects for serialized DOM snapshots
pub const CDT_CONTENT_TYPE: &str = "x-applitools-html/cdt";

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

pub const HASH_FORMAT: &str = "sha256";

/// Hex-encoded SHA-256 of `content`
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    hex::encode(hasher.finalize())
}

/// Resource kinds whose bodies reference further resources
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependencyKind {
    Css,
    Svg,
}

impl DependencyKind {
    /// Classify a `Content-Type` value. Parameters such as `charset` are ignored.
    pub fn from_content_type(content_type: &str) -> Option<Self> {
        let media: mime::Mime = content_type.parse().ok()?;
        match (media.type_(), media.subtype().as_str()) {
            (mime::TEXT, "css") => Some(Self::Css),
            (mime::IMAGE, "svg") if media.suffix() == Some(mime::XML) => Some(Self::Svg),
            _ => None,
        }
    }
}

/// A resolved page resource.
///
/// The hash is the resource identity; a resource is never mutated after it
/// has been built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    pub url: String,
    pub content_type: String,
    pub hash: Option<String>,
    pub content: Option<Bytes>,
    pub error_status_code: Option<u16>,
    pub dependency_urls: Vec<String>,
}

impl Resource {
    pub fn from_content(
        url: impl Into<String>,
        content_type: impl Into<String>,
        content: Bytes,
        dependency_urls: Vec<String>,
    ) -> Self {
        Self {
            url: url.into(),
            content_type: content_type.into(),
            hash: Some(content_hash(&content)),
            content: Some(content),
            error_status_code: None,
            dependency_urls,
        }
    }

    /// Placeholder for a resource the page references but that could not be fetched
    pub fn error(url: impl Into<String>, status: u16) -> Self {
        Self {
            url: url.into(),
            content_type: DEFAULT_CONTENT_TYPE.to_string(),
            hash: None,
            content: None,
            error_status_code: Some(status),
            dependency_urls: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_status_code.is_some()
    }

    pub fn size(&self) -> usize {
        self.content.as_ref().map_or(0, Bytes::len)
    }

    /// Wire descriptor used inside render requests
    pub fn to_ref(&self) -> ResourceRef {
        match (&self.hash, self.error_status_code) {
            (Some(hash), None) => ResourceRef::Content {
                hash_format: HASH_FORMAT.to_string(),
                hash: hash.clone(),
                content_type: self.content_type.clone(),
            },
            (_, status) => ResourceRef::Error {
                error_status_code: status.unwrap_or(0),
            },
        }
    }
}

/// Resource content already known to the caller (captured in the browser)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResource {
    pub content_type: String,
    pub content: Bytes,
}

impl RawResource {
    pub fn new(content_type: impl Into<String>, content: impl Into<Bytes>) -> Self {
        Self {
            content_type: content_type.into(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResourceRef {
    #[serde(rename_all = "camelCase")]
    Content {
        hash_format: String,
        hash: String,
        content_type: String,
    },
    #[serde(rename_all = "camelCase")]
    Error { error_status_code: u16 },
}
