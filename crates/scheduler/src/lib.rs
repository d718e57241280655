//! Folio Scheduler Library
//!
//! Band-ordered, single-flight scheduling of page fetches and renders.
//!
//! Work is organized by priority band (visible pages, pages ahead in the
//! scroll direction, immediate neighbours, idle prefetch) and admitted in band
//! order with FIFO ordering within each band. Each page has at most one live
//! task per scheduler; cancelled in-flight tasks keep their concurrency slot
//! until their completion is reported.
//!
//! # Example
//!
//! ```
//! use std::time::Instant;
//! use folio_scheduler::{FetchOutcome, FetchScheduler, PriorityBand, RetryPolicy};
//!
//! let mut fetches = FetchScheduler::new(4, RetryPolicy::default());
//! let now = Instant::now();
//!
//! fetches.request(7, PriorityBand::Visible, now);
//! fetches.request(8, PriorityBand::Directional, now);
//!
//! for admission in fetches.admit() {
//!     // hand admission.page and admission.token to the fetcher ...
//!     let outcome = fetches.complete(admission.id, true, now);
//!     assert!(matches!(outcome, FetchOutcome::Delivered { .. }));
//! }
//! ```

mod board;
mod cancel;
mod fetch;
mod priority;
mod render;
mod scroll;
mod viewport;

pub use board::{
    Admission, BoardStats, Cancellation, Finish, RequestOutcome, Task, TaskBoard, TaskState,
};
pub use cancel::CancellationToken;
pub use fetch::{FetchOutcome, FetchScheduler, FetchStats, RetryPolicy};
pub use priority::{PriorityBand, TaskId};
pub use render::{
    Invalidation, RenderAdmission, RenderOutcome, RenderParams, RenderRecord, RenderScheduler,
    RenderStats,
};
pub use scroll::{
    ClassifierConfig, ScrollClass, ScrollClassifier, ScrollDirection, ScrollState,
    ScrollTransition,
};
pub use viewport::{BandCalculator, PrefetchPolicy, Rotation, ViewportWindow};
