//! Collaborator interfaces
//!
//! The viewer never touches the network or a rasterizer directly. It is handed
//! a page fetcher, a page renderer and a metadata provider, each returning
//! boxed futures so the control loop can spawn and abort them.

use std::fmt;

use folio_cache::{PageNumber, PagePayload};
use folio_scheduler::{CancellationToken, RenderParams};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::error::{FetchError, RenderError};

/// Identifies the document a session is viewing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(id.as_ref().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Intrinsic page size in points.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PageDimensions {
    pub width: f32,
    pub height: f32,
}

/// What the metadata provider knows about a document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentInfo {
    pub page_count: u32,
    /// Per-page dimensions, indexed by `page - 1`; may be empty if unknown
    #[serde(default)]
    pub page_dimensions: Vec<PageDimensions>,
}

impl DocumentInfo {
    /// A document of `page_count` pages with unknown dimensions.
    pub fn with_page_count(page_count: u32) -> Self {
        Self {
            page_count,
            page_dimensions: Vec::new(),
        }
    }

    pub fn dimensions(&self, page: PageNumber) -> Option<PageDimensions> {
        let index = usize::try_from(page.checked_sub(1)?).ok()?;
        self.page_dimensions.get(index).copied()
    }

    /// `true` for pages `1..=page_count`.
    pub fn contains(&self, page: PageNumber) -> bool {
        page >= 1 && page <= self.page_count
    }
}

/// Fetches a page's bytes from wherever the document lives.
pub trait PageFetcher: Send + Sync + 'static {
    /// Fetch one page. `token` is cancelled when the result is no longer
    /// wanted; honouring it is optional.
    fn fetch(
        &self,
        document: &DocumentId,
        page: PageNumber,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<PagePayload, FetchError>>;
}

/// Turns page bytes into a displayable resource.
pub trait PageRenderer: Send + Sync + 'static {
    /// The rendered resource held in a render slot
    type Output: Clone + Send + 'static;

    fn render(
        &self,
        page: PageNumber,
        payload: PagePayload,
        params: RenderParams,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<Self::Output, RenderError>>;
}

/// Supplies the page count and page dimensions.
pub trait DocumentMetadata: Send + Sync + 'static {
    fn document_info(&self, document: &DocumentId) -> BoxFuture<'static, Result<DocumentInfo, FetchError>>;
}
