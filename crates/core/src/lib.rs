//! Folio Core Library
//!
//! Viewport-driven page caching and fetch/render scheduling for a progressive
//! document viewer.
//!
//! [`ViewerSession`] is the synchronous state machine that owns the cache,
//! the render slots and both schedulers. [`ViewerRuntime`] runs a session on
//! tokio against a [`PageFetcher`], a [`PageRenderer`] and a
//! [`DocumentMetadata`] provider, and hands back a [`ViewerHandle`].

pub mod config;
pub mod error;
pub mod runtime;
pub mod session;
pub mod source;
pub mod stats;

pub use config::ViewerConfig;
pub use error::{ConfigError, FetchError, PageError, RenderError, ViewerError, ViewerResult};
pub use runtime::{ViewerHandle, ViewerRuntime};
pub use session::{Effect, PageStatus, ScrollSample, Step, ViewerEvent, ViewerSession};
pub use source::{DocumentId, DocumentInfo, DocumentMetadata, PageDimensions, PageFetcher, PageRenderer};
pub use stats::{CacheSummary, FetchSummary, RenderSummary, ScrollSummary, SessionStats, SlotSummary};

pub use folio_cache::{CacheBound, PageNumber, PagePayload};
pub use folio_scheduler::{CancellationToken, PriorityBand, RenderParams, Rotation, ScrollClass};
