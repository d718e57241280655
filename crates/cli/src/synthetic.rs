//! Stand-in collaborators that sleep instead of doing I/O.

use std::time::Duration;

use folio_core::{
    CancellationToken, DocumentId, DocumentInfo, DocumentMetadata, FetchError, PageDimensions,
    PageFetcher, PageNumber, PagePayload, PageRenderer, RenderError, RenderParams,
};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;

/// US Letter in points
const LETTER: PageDimensions = PageDimensions {
    width: 612.0,
    height: 792.0,
};

pub struct SyntheticFetcher {
    pub latency: Duration,
    pub payload_size: usize,
    /// Pages that always fail with a network error
    pub failing: Vec<PageNumber>,
}

impl PageFetcher for SyntheticFetcher {
    fn fetch(
        &self,
        _document: &DocumentId,
        page: PageNumber,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<PagePayload, FetchError>> {
        let latency = self.latency;
        let size = self.payload_size;
        let fails = self.failing.contains(&page);
        async move {
            tokio::time::sleep(latency).await;
            if token.is_cancelled() {
                return Err(FetchError::Canceled);
            }
            if fails {
                return Err(FetchError::Network(format!("page {page} unavailable")));
            }
            Ok(PagePayload::from(vec![(page % 251) as u8; size]))
        }
        .boxed()
    }
}

/// What the synthetic renderer produces
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderedPage {
    pub page: PageNumber,
    pub width_px: u32,
    pub height_px: u32,
}

pub struct SyntheticRenderer {
    pub latency: Duration,
}

impl PageRenderer for SyntheticRenderer {
    type Output = RenderedPage;

    fn render(
        &self,
        page: PageNumber,
        _payload: PagePayload,
        params: RenderParams,
        token: CancellationToken,
    ) -> BoxFuture<'static, Result<RenderedPage, RenderError>> {
        let latency = self.latency;
        async move {
            tokio::time::sleep(latency).await;
            if token.is_cancelled() {
                return Err(RenderError::Canceled);
            }
            let (width, height) = match params.rotation.degrees() {
                90 | 270 => (LETTER.height, LETTER.width),
                _ => (LETTER.width, LETTER.height),
            };
            Ok(RenderedPage {
                page,
                width_px: (width * params.scale).round() as u32,
                height_px: (height * params.scale).round() as u32,
            })
        }
        .boxed()
    }
}

pub struct SyntheticMetadata {
    pub page_count: u32,
}

impl DocumentMetadata for SyntheticMetadata {
    fn document_info(&self, _document: &DocumentId) -> BoxFuture<'static, Result<DocumentInfo, FetchError>> {
        let info = DocumentInfo {
            page_count: self.page_count,
            page_dimensions: vec![LETTER; self.page_count as usize],
        };
        async move { Ok(info) }.boxed()
    }
}
