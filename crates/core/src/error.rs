//! Error taxonomy

use std::io;

use folio_cache::PageNumber;

/// Failure reported by a [`PageFetcher`](crate::PageFetcher)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FetchError {
    #[error("network error: {0}")]
    Network(String),
    #[error("fetch timed out")]
    Timeout,
    /// Not a failure; the result is dropped silently
    #[error("fetch canceled")]
    Canceled,
}

/// Failure reported by a [`PageRenderer`](crate::PageRenderer)
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("decode error: {0}")]
    Decode(String),
    #[error("render canceled")]
    Canceled,
}

/// Persistent per-page error surfaced to the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PageError {
    #[error("fetch failed after {attempts} attempts: {cause}")]
    FetchFailed { attempts: u32, cause: FetchError },
    #[error("render failed: {0}")]
    RenderFailed(RenderError),
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error("conflicting settings: {0}")]
    Conflict(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl ConfigError {
    pub(crate) fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ViewerError {
    #[error("page {page} is out of range (document has {page_count} pages)")]
    InvalidPage { page: PageNumber, page_count: u32 },
    #[error("invalid zoom scale {0}")]
    InvalidScale(f32),
    #[error("document metadata unavailable: {0}")]
    Metadata(FetchError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("viewer has stopped")]
    Stopped,
}

pub type ViewerResult<T> = Result<T, ViewerError>;
