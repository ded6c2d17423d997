use thiserror::Error;

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("Failed to build request: {0}")]
    Transport(String),

    #[error("Network error after {attempts} attempts: {message}")]
    TransientNetwork { attempts: u32, message: String },

    #[error("Long-running task expired: {url}")]
    LongTaskExpired { url: String },

    #[error("Unexpected HTTP {status} from {url}: {body}")]
    UnexpectedStatus { status: u16, url: String, body: String },

    #[error("HTTP {status} response without Location header")]
    MissingLocation { status: u16 },

    #[error("Invalid Location header: {0}")]
    InvalidLocation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Framing error: {0}")]
    Framing(#[from] super::framing::FramingError),
}

impl HttpError {
    /// HTTP status carried by the error, if the server answered at all
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::UnexpectedStatus { status, .. } | Self::MissingLocation { status } => Some(*status),
            Self::LongTaskExpired { .. } => Some(410),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, HttpError>;
