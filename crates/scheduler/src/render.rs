//! Render scheduling and invalidation
//!
//! Render tasks are stamped with the [`RenderParams`] current at admission. A
//! result produced under older parameters is never recorded as current, so a
//! zoom or rotation change can never leave a page showing a mismatched render.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::time::Instant;

use folio_cache::PageNumber;

use crate::board::{BoardStats, Cancellation, Finish, RequestOutcome, Task, TaskBoard, TaskState};
use crate::cancel::CancellationToken;
use crate::priority::{PriorityBand, TaskId};
use crate::viewport::Rotation;

/// Parameters a render is produced under
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderParams {
    pub scale: f32,
    pub rotation: Rotation,
}

impl Default for RenderParams {
    fn default() -> Self {
        Self {
            scale: 1.0,
            rotation: Rotation::default(),
        }
    }
}

/// Render state of one page
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct RenderRecord {
    /// Parameters of the render currently shown, if any
    pub rendered: Option<RenderParams>,
    /// Parameters of a render superseded by a zoom or rotation change
    pub stale_from: Option<RenderParams>,
    /// Set when the page lost its render and must be rendered from scratch
    pub needs_reload: bool,
}

/// A render task moved to InFlight
#[derive(Debug, Clone)]
pub struct RenderAdmission {
    pub id: TaskId,
    pub page: PageNumber,
    pub priority: PriorityBand,
    /// Parameters the render must use
    pub params: RenderParams,
    pub token: CancellationToken,
}

/// Result of reporting a render completion
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RenderOutcome {
    /// The render matches current parameters and is now the page's render
    Rendered { page: PageNumber, params: RenderParams },
    /// The render used superseded parameters and was dropped
    Stale { page: PageNumber },
    /// The renderer failed; the page will not be retried automatically
    Failed { page: PageNumber },
    /// The task was cancelled in flight
    Discarded { page: PageNumber },
    /// No admitted task has this id
    Unknown,
}

/// What a parameter change did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Invalidation {
    /// Pages queued for a re-render at the new parameters
    pub requeued: Vec<(PageNumber, PriorityBand)>,
    /// Pages far from the viewport whose render was dropped
    pub torn_down: Vec<PageNumber>,
    /// In-flight renders aborted
    pub aborted: Vec<Cancellation>,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.torn_down.is_empty() && self.aborted.is_empty()
    }
}

/// Render counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderStats {
    pub board: BoardStats,
    pub rendered: u64,
    pub stale_results: u64,
    pub invalidations: u64,
    pub torn_down: u64,
    pub failed_pages: usize,
}

/// Render task scheduler
#[derive(Debug)]
pub struct RenderScheduler {
    board: TaskBoard,
    params: RenderParams,
    stamped: HashMap<TaskId, RenderParams>,
    records: HashMap<PageNumber, RenderRecord>,
    failed: HashSet<PageNumber>,
    rendered: u64,
    stale_results: u64,
    invalidations: u64,
    torn_down: u64,
}

impl RenderScheduler {
    pub fn new(max_concurrency: usize, params: RenderParams) -> Self {
        Self {
            board: TaskBoard::new(max_concurrency),
            params,
            stamped: HashMap::new(),
            records: HashMap::new(),
            failed: HashSet::new(),
            rendered: 0,
            stale_results: 0,
            invalidations: 0,
            torn_down: 0,
        }
    }

    /// Parameters new renders are admitted with.
    pub fn params(&self) -> RenderParams {
        self.params
    }

    /// `true` if `page` has no render at the current parameters and no task.
    ///
    /// Pages whose last render failed are excluded until [`retry`](Self::retry).
    pub fn needs_render(&self, page: PageNumber) -> bool {
        if self.failed.contains(&page) || self.board.is_active(page) {
            return false;
        }
        !self.is_current(page)
    }

    /// `true` if the page shows a render at the current parameters.
    pub fn is_current(&self, page: PageNumber) -> bool {
        self.records.get(&page).is_some_and(|record| {
            record.rendered == Some(self.params) && record.stale_from.is_none() && !record.needs_reload
        })
    }

    /// Request a render. Returns `None` for pages whose last render failed.
    pub fn request(&mut self, page: PageNumber, priority: PriorityBand, now: Instant) -> Option<RequestOutcome> {
        if self.failed.contains(&page) {
            return None;
        }
        Some(self.board.request(page, priority, now))
    }

    /// Clear a failure and request the page again.
    pub fn retry(&mut self, page: PageNumber, priority: PriorityBand, now: Instant) -> RequestOutcome {
        self.failed.remove(&page);
        self.board.request(page, priority, now)
    }

    pub fn reprioritize(&mut self, page: PageNumber, priority: PriorityBand) -> bool {
        self.board.reprioritize(page, priority)
    }

    /// Admit queued renders, stamping each with the current parameters.
    pub fn admit(&mut self) -> Vec<RenderAdmission> {
        let params = self.params;
        self.board
            .admit()
            .into_iter()
            .map(|admission| {
                self.stamped.insert(admission.id, params);
                tracing::debug!(
                    target: "folio::render",
                    page = admission.page,
                    task = admission.id,
                    band = %admission.priority,
                    scale = params.scale,
                    rotation = %params.rotation,
                    "render admitted"
                );
                RenderAdmission {
                    id: admission.id,
                    page: admission.page,
                    priority: admission.priority,
                    params,
                    token: admission.token,
                }
            })
            .collect()
    }

    /// Report the completion of an admitted render.
    pub fn complete(&mut self, id: TaskId, succeeded: bool) -> RenderOutcome {
        let stamped = self.stamped.remove(&id);
        match self.board.finish(id, succeeded) {
            Finish::Unknown(_) => RenderOutcome::Unknown,
            Finish::Discarded { page, .. } => RenderOutcome::Discarded { page },
            Finish::Completed(task) => {
                let page = task.page;
                match stamped {
                    Some(params) if params == self.params => {
                        let record = self.records.entry(page).or_default();
                        record.rendered = Some(params);
                        record.stale_from = None;
                        record.needs_reload = false;
                        self.rendered += 1;
                        RenderOutcome::Rendered { page, params }
                    }
                    _ => {
                        self.stale_results += 1;
                        tracing::debug!(target: "folio::render", page, "render under old parameters dropped");
                        RenderOutcome::Stale { page }
                    }
                }
            }
            Finish::Failed(task) => {
                self.failed.insert(task.page);
                tracing::warn!(target: "folio::render", page = task.page, "render failed");
                RenderOutcome::Failed { page: task.page }
            }
        }
    }

    /// Release an admitted render without recording a failure.
    pub fn abandon(&mut self, id: TaskId) -> Option<PageNumber> {
        self.stamped.remove(&id);
        match self.board.finish(id, false) {
            Finish::Failed(task) => Some(task.page),
            _ => None,
        }
    }

    /// Switch to new parameters.
    ///
    /// Every in-flight render is aborted. Rendered or pending pages that still
    /// have a band (per `band_of`) are re-queued at it, nearest to
    /// `current_page` first within a band; pages without a band lose their
    /// render and are marked for reload.
    pub fn invalidate<F>(
        &mut self,
        params: RenderParams,
        current_page: PageNumber,
        band_of: F,
        now: Instant,
    ) -> Invalidation
    where
        F: Fn(PageNumber) -> Option<PriorityBand>,
    {
        if params == self.params {
            return Invalidation::default();
        }
        self.params = params;
        self.invalidations += 1;

        let mut invalidation = Invalidation {
            aborted: self.board.cancel_where(|task| task.state == TaskState::InFlight),
            ..Invalidation::default()
        };

        let pages: BTreeSet<PageNumber> = self
            .records
            .keys()
            .copied()
            .chain(self.board.tasks().map(|task| task.page))
            .chain(invalidation.aborted.iter().map(|c| c.page))
            .collect();

        let mut banded = Vec::new();
        for page in pages {
            match band_of(page) {
                Some(band) => {
                    if let Some(record) = self.records.get_mut(&page) {
                        if record.rendered.is_some() {
                            record.stale_from = record.rendered;
                        }
                    }
                    banded.push((page, band));
                }
                None => {
                    self.board.cancel(page);
                    if let Some(record) = self.records.get_mut(&page) {
                        if record.rendered.is_some() {
                            record.rendered = None;
                            record.stale_from = None;
                            record.needs_reload = true;
                            self.torn_down += 1;
                            invalidation.torn_down.push(page);
                        }
                    }
                }
            }
        }

        banded.sort_by_key(|(page, band)| (Reverse(*band), page.abs_diff(current_page), *page));
        for (page, band) in banded {
            if self.failed.contains(&page) {
                continue;
            }
            if !self.board.reprioritize(page, band) {
                self.board.request(page, band, now);
            }
            invalidation.requeued.push((page, band));
        }

        tracing::debug!(
            target: "folio::render",
            scale = params.scale,
            rotation = %params.rotation,
            requeued = invalidation.requeued.len(),
            torn_down = invalidation.torn_down.len(),
            aborted = invalidation.aborted.len(),
            "render parameters changed"
        );
        invalidation
    }

    pub fn cancel(&mut self, page: PageNumber) -> Option<Cancellation> {
        self.board.cancel(page)
    }

    pub fn cancel_where<F>(&mut self, predicate: F) -> Vec<Cancellation>
    where
        F: Fn(&Task) -> bool,
    {
        self.board.cancel_where(predicate)
    }

    pub fn cancel_all(&mut self) -> Vec<Cancellation> {
        self.board.cancel_all()
    }

    /// Mark `page` as having lost its render.
    pub fn mark_needs_reload(&mut self, page: PageNumber) {
        let record = self.records.entry(page).or_default();
        record.rendered = None;
        record.stale_from = None;
        record.needs_reload = true;
    }

    /// Drop all render state for `page`.
    pub fn forget(&mut self, page: PageNumber) -> Option<Cancellation> {
        self.records.remove(&page);
        self.failed.remove(&page);
        self.board.cancel(page)
    }

    pub fn record(&self, page: PageNumber) -> Option<&RenderRecord> {
        self.records.get(&page)
    }

    pub fn needs_reload(&self, page: PageNumber) -> bool {
        self.records.get(&page).is_some_and(|record| record.needs_reload)
    }

    pub fn has_failed(&self, page: PageNumber) -> bool {
        self.failed.contains(&page)
    }

    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.board.set_max_concurrency(max_concurrency);
    }

    pub fn stats(&self) -> RenderStats {
        RenderStats {
            board: self.board.stats(),
            rendered: self.rendered,
            stale_results: self.stale_results,
            invalidations: self.invalidations,
            torn_down: self.torn_down,
            failed_pages: self.failed.len(),
        }
    }
}
