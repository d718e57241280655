//! Viewer session state
//!
//! [`ViewerSession`] owns the page cache, the render slot pool, both
//! schedulers and the scroll classifier. Each entry point runs as one atomic
//! step and returns a [`Step`]: effects for whoever drives the session to
//! carry out, and events for the presentation layer.
//!
//! The session never spawns anything itself. A `StartFetch` effect must
//! eventually be answered with [`ViewerSession::on_fetch_complete`], and an
//! `AbortFetch` effect with a `FetchError::Canceled` completion for the same
//! task; the same holds for renders.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use folio_cache::{CacheBound, PageCache, PageNumber, PagePayload, RenderSlotPool, SlotGrant};
use folio_scheduler::{
    BandCalculator, Cancellation, CancellationToken, FetchOutcome, FetchScheduler, PriorityBand,
    RenderOutcome, RenderParams, RenderScheduler, Rotation, ScrollClass, ScrollClassifier, ScrollState,
    TaskBoard, TaskId, TaskState, ViewportWindow,
};
use serde::Serialize;
use tracing::{debug, info, trace, warn};

use crate::config::ViewerConfig;
use crate::error::{FetchError, PageError, RenderError, ViewerError, ViewerResult};
use crate::source::{DocumentId, DocumentInfo};
use crate::stats::{SessionStats, SlotSummary};

/// A scroll position sample attached to a viewport change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScrollSample {
    pub at: Instant,
}

/// Work the session asks its driver to perform
#[derive(Debug, Clone)]
pub enum Effect {
    StartFetch {
        task: TaskId,
        page: PageNumber,
        token: CancellationToken,
    },
    /// Stop a running fetch and report it back as canceled
    AbortFetch { task: TaskId, page: PageNumber },
    StartRender {
        task: TaskId,
        page: PageNumber,
        payload: PagePayload,
        params: RenderParams,
        token: CancellationToken,
    },
    /// Stop a running render and report it back as canceled
    AbortRender { task: TaskId, page: PageNumber },
}

/// Notification for the presentation layer
#[derive(Debug, Clone, PartialEq)]
pub enum ViewerEvent {
    /// The page's payload is now cached
    PageReady { page: PageNumber },
    PageFailed { page: PageNumber, error: PageError },
    /// A render at `params` is attached to the page's slot
    RenderReady { page: PageNumber, params: RenderParams },
    RenderFailed { page: PageNumber, error: PageError },
    Evicted { page: PageNumber },
    /// The page lost its render and must be rendered again before display
    NeedsReload { page: PageNumber },
}

/// Where a page stands from the fetch side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStatus {
    Cached,
    Queued,
    Loading,
    RetryPending,
    Failed,
    Missing,
}

/// Output of one session step
#[derive(Debug, Default)]
pub struct Step {
    pub effects: Vec<Effect>,
    pub events: Vec<ViewerEvent>,
}

impl Step {
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty() && self.events.is_empty()
    }

    fn abort_fetches(&mut self, cancellations: &[Cancellation]) {
        self.effects.extend(
            cancellations
                .iter()
                .filter(|c| c.was_in_flight)
                .map(|c| Effect::AbortFetch {
                    task: c.id,
                    page: c.page,
                }),
        );
    }

    fn abort_renders(&mut self, cancellations: &[Cancellation]) {
        self.effects.extend(
            cancellations
                .iter()
                .filter(|c| c.was_in_flight)
                .map(|c| Effect::AbortRender {
                    task: c.id,
                    page: c.page,
                }),
        );
    }
}

/// Control state for viewing one document.
///
/// `R` is the rendered resource type held in render slots.
pub struct ViewerSession<R> {
    document: DocumentId,
    info: DocumentInfo,
    config: ViewerConfig,
    cache: PageCache,
    slots: RenderSlotPool<R>,
    fetches: FetchScheduler,
    renders: RenderScheduler,
    classifier: ScrollClassifier,
    bands: BandCalculator,
    window: ViewportWindow,
    errors: BTreeMap<PageNumber, PageError>,
    /// Explicitly requested pages whose fetch has not been admitted yet
    pinned: BTreeSet<PageNumber>,
    stopped: bool,
}

impl<R> ViewerSession<R> {
    /// Build a session for `document`. The viewport starts on page 1.
    pub fn new(config: ViewerConfig, document: DocumentId, info: DocumentInfo) -> ViewerResult<Self> {
        config.validate()?;
        let bound = config.cache_bound()?;

        let window = ViewportWindow::new(1);
        let mut cache = PageCache::new(bound);
        cache.set_focus(window.current_page, window.visible_pages.iter().copied());

        let slots = match config.render_slot_count {
            Some(count) => RenderSlotPool::fixed(count),
            None => RenderSlotPool::unbounded(),
        };
        let params = RenderParams {
            scale: window.zoom_scale,
            rotation: window.rotation,
        };

        info!(
            target: "folio::session",
            document = %document,
            pages = info.page_count,
            "session started"
        );

        Ok(Self {
            fetches: FetchScheduler::new(config.max_concurrent_fetches, config.retry_policy()),
            renders: RenderScheduler::new(config.max_concurrent_rerenders, params),
            classifier: ScrollClassifier::new(config.classifier_config()),
            bands: BandCalculator::new(config.prefetch_policy(), info.page_count),
            document,
            info,
            config,
            cache,
            slots,
            window,
            errors: BTreeMap::new(),
            pinned: BTreeSet::new(),
            stopped: false,
        })
    }

    /// The viewport moved.
    ///
    /// With a `sample` the move counts toward scroll velocity; without one it
    /// is treated as a jump and the classifier restarts from `current_page`.
    /// Visible pages parked after an overflow eviction become fetchable again.
    pub fn on_viewport_changed(
        &mut self,
        current_page: PageNumber,
        visible_pages: impl IntoIterator<Item = PageNumber>,
        sample: Option<ScrollSample>,
        now: Instant,
    ) -> ViewerResult<Step> {
        self.ensure_running()?;
        self.check_page(current_page)?;
        let visible: BTreeSet<PageNumber> = visible_pages.into_iter().collect();
        for &page in &visible {
            self.check_page(page)?;
        }

        self.window.current_page = current_page;
        self.window.visible_pages = visible;
        self.cache
            .set_focus(current_page, self.window.visible_pages.iter().copied());

        match sample {
            Some(sample) => {
                self.classifier.on_sample(current_page, sample.at);
            }
            None => self.classifier.seed(current_page),
        }

        self.fetches.unpark_all();
        let mut step = Step::default();
        self.reconcile(now, &mut step);
        Ok(step)
    }

    /// New zoom factor. Rendered output is invalidated, fetched payloads stay.
    pub fn on_zoom_changed(&mut self, scale: f32, now: Instant) -> ViewerResult<Step> {
        self.ensure_running()?;
        if !scale.is_finite() || scale <= 0.0 {
            return Err(ViewerError::InvalidScale(scale));
        }
        self.window.zoom_scale = scale;
        Ok(self.apply_render_params(now))
    }

    /// Degrees are normalized to 0, 90, 180 or 270.
    pub fn on_rotation_changed(&mut self, degrees: i32, now: Instant) -> ViewerResult<Step> {
        self.ensure_running()?;
        self.window.rotation = Rotation::from_degrees(degrees);
        Ok(self.apply_render_params(now))
    }

    /// Cached payload for `page`, counted as a cache hit or miss.
    pub fn get_page(&mut self, page: PageNumber) -> Option<PagePayload> {
        self.cache.get(page)
    }

    /// Explicit fetch trigger, such as a jump to a page.
    ///
    /// Clears a surfaced fetch failure, restarts the attempt count and
    /// supersedes a pending retry. Cached pages are left alone. Until its fetch
    /// is admitted the request is pinned: viewport changes neither cancel it
    /// nor move it to a lower band. Fast scrolling still cancels it.
    pub fn request_page(
        &mut self,
        page: PageNumber,
        priority: PriorityBand,
        now: Instant,
    ) -> ViewerResult<Step> {
        self.ensure_running()?;
        self.check_page(page)?;

        let mut step = Step::default();
        if self.cache.contains(page) {
            return Ok(step);
        }
        if self.fetch_failed(page) {
            self.errors.remove(&page);
        }
        self.fetches.reset_attempts(page);
        let outcome = self.fetches.request(page, priority, now);
        if self.fetches.board().state(page) == Some(TaskState::Queued) {
            self.pinned.insert(page);
        }
        debug!(target: "folio::session", page, band = %priority, ?outcome, "page requested");
        self.pump(&mut step);
        Ok(step)
    }

    /// Clear a render failure (or a fetch failure) for `page` and try again.
    pub fn retry_render(&mut self, page: PageNumber, now: Instant) -> ViewerResult<Step> {
        self.ensure_running()?;
        self.check_page(page)?;

        let mut step = Step::default();
        self.errors.remove(&page);
        let band = self.band_of(page).unwrap_or(PriorityBand::Visible);

        if self.cache.contains(page) {
            if self.bind_slot(page, &mut step) {
                self.renders.retry(page, band, now);
            } else {
                // Drop the failure; the page is rendered once a slot frees up.
                if let Some(cancellation) = self.renders.forget(page) {
                    step.abort_renders(&[cancellation]);
                }
            }
        } else {
            self.fetches.reset_attempts(page);
            self.fetches.request(page, band, now);
        }

        self.pump(&mut step);
        Ok(step)
    }

    /// A fetch started by `StartFetch` finished.
    pub fn on_fetch_complete(
        &mut self,
        task: TaskId,
        result: Result<PagePayload, FetchError>,
        now: Instant,
    ) -> Step {
        let mut step = Step::default();
        match result {
            Ok(payload) => match self.fetches.complete(task, true, now) {
                FetchOutcome::Delivered { page } => self.store(page, payload, now, &mut step),
                outcome => trace!(target: "folio::session", task, ?outcome, "fetch result ignored"),
            },
            Err(FetchError::Canceled) => {
                if let Some(page) = self.fetches.abandon(task) {
                    debug!(target: "folio::session", page, task, "fetch canceled by fetcher");
                }
            }
            Err(cause) => match self.fetches.complete(task, false, now) {
                FetchOutcome::Exhausted { page, attempts } => {
                    let error = PageError::FetchFailed { attempts, cause };
                    self.errors.insert(page, error.clone());
                    step.events.push(ViewerEvent::PageFailed { page, error });
                }
                FetchOutcome::RetryScheduled { page, attempts, .. } => {
                    debug!(target: "folio::session", page, attempts, %cause, "fetch failed, will retry");
                }
                _ => {}
            },
        }

        if !self.stopped {
            self.pump(&mut step);
        }
        step
    }

    /// A render started by `StartRender` finished.
    pub fn on_render_complete(
        &mut self,
        task: TaskId,
        result: Result<R, RenderError>,
        now: Instant,
    ) -> Step {
        let mut step = Step::default();
        match result {
            Ok(output) => match self.renders.complete(task, true) {
                RenderOutcome::Rendered { page, params } => match self.slots.attach(page, output) {
                    Ok(_) => {
                        if matches!(self.errors.get(&page), Some(PageError::RenderFailed(_))) {
                            self.errors.remove(&page);
                        }
                        step.events.push(ViewerEvent::RenderReady { page, params });
                    }
                    Err(_) => {
                        debug!(target: "folio::session", page, "render arrived after slot was lost");
                        self.renders.mark_needs_reload(page);
                    }
                },
                RenderOutcome::Stale { page } => {
                    if let Some(band) = self.band_of(page) {
                        if self.cache.contains(page) {
                            self.start_render(page, band, now, &mut step);
                        }
                    }
                }
                _ => {}
            },
            Err(RenderError::Canceled) => {
                if let Some(page) = self.renders.abandon(task) {
                    debug!(target: "folio::session", page, task, "render canceled by renderer");
                }
            }
            Err(cause) => {
                if let RenderOutcome::Failed { page } = self.renders.complete(task, false) {
                    let error = PageError::RenderFailed(cause);
                    self.errors.insert(page, error.clone());
                    step.events.push(ViewerEvent::RenderFailed { page, error });
                }
            }
        }

        if !self.stopped {
            self.pump(&mut step);
        }
        step
    }

    /// Fire whatever is due at `now`: the idle debounce and fetch retries.
    pub fn on_timer(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        if self.stopped {
            return step;
        }

        if let Some(transition) = self.classifier.poll(now) {
            debug!(
                target: "folio::session",
                from = %transition.from,
                to = %transition.to,
                "scroll settled"
            );
            self.reconcile(now, &mut step);
        }

        let scroll = self.classifier.state();
        let bands = self.bands;
        let window = &self.window;
        let cache = &self.cache;
        let resubmitted = self.fetches.resubmit_due(now, |page| {
            if cache.contains(page) {
                None
            } else {
                bands.band_for(page, window, &scroll)
            }
        });
        if !resubmitted.is_empty() {
            debug!(target: "folio::session", count = resubmitted.len(), "retries resubmitted");
        }

        self.pump(&mut step);
        step
    }

    /// When [`on_timer`](Self::on_timer) next has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.stopped {
            return None;
        }
        [self.classifier.idle_deadline(), self.fetches.next_retry_due()]
            .into_iter()
            .flatten()
            .min()
    }

    /// Pause or resume slot reclamation around a zoom gesture.
    ///
    /// Pages that could not get a slot while paused are rendered on resume.
    pub fn set_zoom_in_progress(&mut self, in_progress: bool, now: Instant) -> Step {
        let mut step = Step::default();
        if in_progress {
            self.slots.pause_reclamation();
        } else {
            self.slots.resume_reclamation();
            if !self.stopped {
                self.schedule_visible_renders(now, &mut step);
                self.pump(&mut step);
            }
        }
        step
    }

    /// Evict every non-visible page outside the keep window.
    pub fn on_memory_pressure(&mut self) -> Step {
        let mut step = Step::default();
        let victims: Vec<PageNumber> = self
            .cache
            .evictable_candidates(self.window.current_page, self.config.keep_window_radius)
            .into_iter()
            .filter(|&page| !self.window.is_visible(page))
            .collect();
        for &page in &victims {
            self.cache.remove(page);
        }
        self.release_evicted(&victims, &mut step);
        info!(target: "folio::session", evicted = victims.len(), "memory pressure handled");
        step
    }

    /// Change the cache bound, evicting down to it immediately.
    ///
    /// Visible pages evicted by a bound smaller than the visible set are
    /// re-queued and parked until the viewport changes.
    pub fn set_cache_bound(&mut self, bound: CacheBound, now: Instant) -> Step {
        let mut step = Step::default();
        let evicted = self.cache.set_bound(bound);
        self.release_evicted(&evicted, &mut step);
        self.park_visible(&evicted, now);
        match bound {
            CacheBound::Entries(n) => {
                self.config.max_cache_entries = Some(n);
                self.config.max_cache_bytes = None;
            }
            CacheBound::Bytes(n) => {
                self.config.max_cache_entries = None;
                self.config.max_cache_bytes = Some(n);
            }
        }
        step
    }

    /// Adopt new document metadata, dropping pages that no longer exist.
    pub fn relayout(&mut self, info: DocumentInfo, now: Instant) -> ViewerResult<Step> {
        self.ensure_running()?;
        let mut step = Step::default();
        let page_count = info.page_count;
        let previous = self.info.page_count;
        self.info = info;
        self.bands.set_page_count(page_count);

        let gone: Vec<PageNumber> = self
            .cache
            .pages()
            .into_iter()
            .filter(|&page| page > page_count)
            .collect();
        for &page in &gone {
            self.cache.remove(page);
        }
        self.release_evicted(&gone, &mut step);

        let fetches = self.fetches.cancel_where(|task| task.page > page_count);
        step.abort_fetches(&fetches);
        let renders = self.renders.cancel_where(|task| task.page > page_count);
        step.abort_renders(&renders);
        self.errors.retain(|&page, _| page <= page_count);
        self.pinned.retain(|&page| page <= page_count);
        self.fetches.unpark_all();

        if page_count > 0 {
            self.window.current_page = self.window.current_page.clamp(1, page_count);
            self.window.visible_pages.retain(|&page| page <= page_count);
            if self.window.visible_pages.is_empty() {
                self.window.visible_pages.insert(self.window.current_page);
            }
        }
        self.cache.set_focus(
            self.window.current_page,
            self.window.visible_pages.iter().copied(),
        );

        info!(target: "folio::session", previous, page_count, "layout recalculated");
        self.reconcile(now, &mut step);
        Ok(step)
    }

    /// Cancel all outstanding work. Later mutating calls fail with
    /// [`ViewerError::Stopped`].
    pub fn shutdown(&mut self) -> Step {
        let mut step = Step::default();
        if self.stopped {
            return step;
        }
        self.stopped = true;
        let fetches = self.fetches.cancel_all();
        step.abort_fetches(&fetches);
        let renders = self.renders.cancel_all();
        step.abort_renders(&renders);
        info!(
            target: "folio::session",
            document = %self.document,
            aborted = step.effects.len(),
            "session stopped"
        );
        step
    }

    /// Where `page` stands on the fetch side. Parked pages report Queued.
    pub fn page_status(&self, page: PageNumber) -> PageStatus {
        if self.cache.contains(page) {
            return PageStatus::Cached;
        }
        match self.fetches.board().state(page) {
            Some(TaskState::Queued) => PageStatus::Queued,
            Some(TaskState::InFlight) => PageStatus::Loading,
            _ if self.fetches.retry_pending(page) => PageStatus::RetryPending,
            _ if self.fetch_failed(page) => PageStatus::Failed,
            _ => PageStatus::Missing,
        }
    }

    /// Rendered resource attached to the page's slot.
    pub fn rendered(&self, page: PageNumber) -> Option<&R> {
        self.slots.resource(page)
    }

    pub fn page_error(&self, page: PageNumber) -> Option<&PageError> {
        self.errors.get(&page)
    }

    /// Counter snapshot across every component.
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            cache: self.cache.stats().into(),
            fetch: self.fetches.stats().into(),
            render: self.renders.stats().into(),
            slots: SlotSummary::new(self.slots.stats(), self.config.render_slot_count),
            scroll: self.classifier.state().into(),
            failed_pages: self.errors.keys().copied().collect(),
        }
    }

    pub fn document(&self) -> &DocumentId {
        &self.document
    }

    pub fn info(&self) -> &DocumentInfo {
        &self.info
    }

    pub fn config(&self) -> &ViewerConfig {
        &self.config
    }

    pub fn window(&self) -> &ViewportWindow {
        &self.window
    }

    pub fn scroll_state(&self) -> ScrollState {
        self.classifier.state()
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub fn slots(&self) -> &RenderSlotPool<R> {
        &self.slots
    }

    pub fn fetches(&self) -> &FetchScheduler {
        &self.fetches
    }

    pub fn renders(&self) -> &RenderScheduler {
        &self.renders
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    fn ensure_running(&self) -> ViewerResult<()> {
        if self.stopped {
            return Err(ViewerError::Stopped);
        }
        Ok(())
    }

    fn check_page(&self, page: PageNumber) -> ViewerResult<()> {
        if !self.info.contains(page) {
            return Err(ViewerError::InvalidPage {
                page,
                page_count: self.info.page_count,
            });
        }
        Ok(())
    }

    fn fetch_failed(&self, page: PageNumber) -> bool {
        matches!(self.errors.get(&page), Some(PageError::FetchFailed { .. }))
    }

    fn band_of(&self, page: PageNumber) -> Option<PriorityBand> {
        self.bands
            .band_for(page, &self.window, &self.classifier.state())
    }

    /// Bring tasks in line with the current window and scroll state.
    fn reconcile(&mut self, now: Instant, step: &mut Step) {
        let scroll = self.classifier.state();
        let fast = scroll.classification == ScrollClass::Fast;
        let bands = self.bands;
        let window = &self.window;

        let pinned = &self.pinned;

        // While scrolling fast only visible work survives, even mid-flight.
        let unwanted = |page: PageNumber, state: TaskState| {
            if fast {
                !window.is_visible(page)
            } else {
                state == TaskState::Queued && bands.band_for(page, window, &scroll).is_none()
            }
        };
        // Explicit requests keep their band until admitted, except under fast scroll.
        let fetches = self.fetches.cancel_where(|task| {
            (fast || !pinned.contains(&task.page)) && unwanted(task.page, task.state)
        });
        let renders = self.renders.cancel_where(|task| unwanted(task.page, task.state));

        let mut fetch_bands = queued_bands(self.fetches.board(), &bands, window, &scroll);
        fetch_bands.retain(|(page, _)| !pinned.contains(page));
        let render_bands = queued_bands(self.renders.board(), &bands, window, &scroll);

        let wanted = bands.wanted(window, &scroll);

        if !fetches.is_empty() || !renders.is_empty() {
            debug!(
                target: "folio::session",
                fetches = fetches.len(),
                renders = renders.len(),
                class = %scroll.classification,
                "unwanted tasks canceled"
            );
        }
        step.abort_fetches(&fetches);
        step.abort_renders(&renders);
        for cancellation in &fetches {
            self.pinned.remove(&cancellation.page);
        }

        for (page, band) in fetch_bands {
            self.fetches.reprioritize(page, band);
        }
        for (page, band) in render_bands {
            self.renders.reprioritize(page, band);
        }

        for (page, band) in wanted {
            if self.cache.contains(page) || self.fetch_failed(page) || self.fetches.retry_pending(page) {
                continue;
            }
            self.fetches.request(page, band, now);
        }

        self.schedule_visible_renders(now, step);
        self.pump(step);
    }

    /// Queue renders for visible cached pages that lack a current render.
    fn schedule_visible_renders(&mut self, now: Instant, step: &mut Step) {
        let mut candidates = self.slots.take_waiting();
        candidates.extend(self.window.visible_pages.iter().copied());

        let mut seen = BTreeSet::new();
        for page in candidates {
            if !seen.insert(page) {
                continue;
            }
            if self.window.is_visible(page) && self.cache.contains(page) && self.renders.needs_render(page) {
                self.start_render(page, PriorityBand::Visible, now, step);
            }
        }
    }

    fn start_render(&mut self, page: PageNumber, band: PriorityBand, now: Instant, step: &mut Step) -> bool {
        if !self.bind_slot(page, step) {
            return false;
        }
        self.renders.request(page, band, now).is_some()
    }

    /// Make sure `page` holds a render slot, reclaiming one if allowed.
    fn bind_slot(&mut self, page: PageNumber, step: &mut Step) -> bool {
        let focus = self.window.focus();
        let Some(SlotGrant { reclaimed, .. }) =
            self.slots.acquire(page, &focus, self.config.keep_window_radius)
        else {
            return false;
        };

        if let Some(reclaimed) = reclaimed {
            let victim = reclaimed.page;
            if let Some(cancellation) = self.renders.cancel(victim) {
                step.abort_renders(&[cancellation]);
            }
            self.renders.mark_needs_reload(victim);
            step.events.push(ViewerEvent::NeedsReload { page: victim });
        }
        true
    }

    /// Admit queued work and turn admissions into start effects.
    fn pump(&mut self, step: &mut Step) {
        for admission in self.fetches.admit() {
            self.pinned.remove(&admission.page);
            step.effects.push(Effect::StartFetch {
                task: admission.id,
                page: admission.page,
                token: admission.token,
            });
        }

        for admission in self.renders.admit() {
            match self.cache.peek(admission.page) {
                Some(payload) => step.effects.push(Effect::StartRender {
                    task: admission.id,
                    page: admission.page,
                    payload: payload.clone(),
                    params: admission.params,
                    token: admission.token,
                }),
                None => {
                    warn!(target: "folio::session", page = admission.page, "render admitted without a payload");
                    self.renders.cancel(admission.page);
                    self.renders.complete(admission.id, false);
                }
            }
        }
    }

    fn store(&mut self, page: PageNumber, payload: PagePayload, now: Instant, step: &mut Step) {
        let evicted = match self.cache.put(page, payload) {
            Ok(evicted) => evicted,
            Err(error) => {
                warn!(target: "folio::session", %error, "payload not cached");
                return;
            }
        };

        let kept = !evicted.contains(&page);
        self.release_evicted(&evicted, step);
        self.park_visible(&evicted, now);
        if !kept {
            debug!(target: "folio::session", page, "fetched page was the farthest, dropped");
            return;
        }

        self.errors.remove(&page);
        step.events.push(ViewerEvent::PageReady { page });
        if self.window.is_visible(page) && self.renders.needs_render(page) {
            self.start_render(page, PriorityBand::Visible, now, step);
        }
    }

    /// Keep evicted visible pages requested without fetching them again.
    ///
    /// Only overflow eviction removes a visible page, and refetching it would
    /// evict another visible page in turn. The page is queued and parked so it
    /// is never left unrequested; the next viewport change releases it.
    fn park_visible(&mut self, evicted: &[PageNumber], now: Instant) {
        for &page in evicted {
            if !self.window.is_visible(page) {
                continue;
            }
            self.fetches.request(page, PriorityBand::Visible, now);
            if self.fetches.park(page) {
                debug!(target: "folio::session", page, "visible page evicted on overflow, parked");
            }
        }
    }

    /// Release everything tied to pages that left the cache.
    fn release_evicted(&mut self, pages: &[PageNumber], step: &mut Step) {
        for &page in pages {
            self.slots.release_page(page);
            if let Some(cancellation) = self.renders.forget(page) {
                step.abort_renders(&[cancellation]);
            }
            if matches!(self.errors.get(&page), Some(PageError::RenderFailed(_))) {
                self.errors.remove(&page);
            }
            debug!(target: "folio::session", page, "page evicted");
            step.events.push(ViewerEvent::Evicted { page });
        }
    }

    fn apply_render_params(&mut self, now: Instant) -> Step {
        let mut step = Step::default();
        let params = RenderParams {
            scale: self.window.zoom_scale,
            rotation: self.window.rotation,
        };

        let scroll = self.classifier.state();
        let bands = self.bands;
        let window = &self.window;
        let cache = &self.cache;
        let invalidation = self.renders.invalidate(
            params,
            window.current_page,
            |page| {
                if cache.contains(page) {
                    bands.band_for(page, window, &scroll)
                } else {
                    None
                }
            },
            now,
        );

        step.abort_renders(&invalidation.aborted);
        for &page in &invalidation.torn_down {
            self.slots.release_page(page);
            step.events.push(ViewerEvent::NeedsReload { page });
        }
        for &(page, _) in &invalidation.requeued {
            if self.slots.slot_of(page).is_none() && !self.bind_slot(page, &mut step) {
                self.renders.cancel(page);
            }
        }

        self.pump(&mut step);
        step
    }
}

/// Current band of every queued task that still has one.
fn queued_bands(
    board: &TaskBoard,
    bands: &BandCalculator,
    window: &ViewportWindow,
    scroll: &ScrollState,
) -> Vec<(PageNumber, PriorityBand)> {
    board
        .tasks()
        .filter(|task| task.state == TaskState::Queued)
        .filter_map(|task| bands.band_for(task.page, window, scroll).map(|band| (task.page, band)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    /// Drives a session the way the runtime does, but synchronously.
    struct Harness {
        session: ViewerSession<String>,
        now: Instant,
        fetches: VecDeque<(TaskId, PageNumber)>,
        renders: VecDeque<(TaskId, PageNumber, RenderParams)>,
        started_fetches: Vec<PageNumber>,
        started_renders: Vec<PageNumber>,
        events: Vec<ViewerEvent>,
    }

    impl Harness {
        fn new(config: ViewerConfig, page_count: u32) -> Self {
            let session = ViewerSession::new(
                config,
                DocumentId::from("test.pdf"),
                DocumentInfo::with_page_count(page_count),
            )
            .unwrap();
            Self {
                session,
                now: Instant::now(),
                fetches: VecDeque::new(),
                renders: VecDeque::new(),
                started_fetches: Vec::new(),
                started_renders: Vec::new(),
                events: Vec::new(),
            }
        }

        fn apply(&mut self, step: Step) {
            self.events.extend(step.events);
            for effect in step.effects {
                match effect {
                    Effect::StartFetch { task, page, .. } => {
                        self.fetches.push_back((task, page));
                        self.started_fetches.push(page);
                    }
                    Effect::AbortFetch { task, .. } => {
                        self.fetches.retain(|(id, _)| *id != task);
                        let step = self
                            .session
                            .on_fetch_complete(task, Err(FetchError::Canceled), self.now);
                        self.apply(step);
                    }
                    Effect::StartRender {
                        task, page, params, ..
                    } => {
                        self.renders.push_back((task, page, params));
                        self.started_renders.push(page);
                    }
                    Effect::AbortRender { task, .. } => {
                        self.renders.retain(|(id, _, _)| *id != task);
                        let step = self
                            .session
                            .on_render_complete(task, Err(RenderError::Canceled), self.now);
                        self.apply(step);
                    }
                }
            }
        }

        fn viewport(&mut self, current: PageNumber, visible: &[PageNumber], scrolling: bool) {
            let sample = scrolling.then_some(ScrollSample { at: self.now });
            let step = self
                .session
                .on_viewport_changed(current, visible.iter().copied(), sample, self.now)
                .unwrap();
            self.apply(step);
        }

        fn request(&mut self, page: PageNumber, band: PriorityBand) {
            let step = self.session.request_page(page, band, self.now).unwrap();
            self.apply(step);
        }

        fn complete_fetch(&mut self, index: usize, result: Result<(), FetchError>) {
            let Some((task, page)) = self.fetches.remove(index) else {
                return;
            };
            let result = result.map(|()| PagePayload::from(vec![page as u8; 64]));
            let step = self.session.on_fetch_complete(task, result, self.now);
            self.apply(step);
        }

        fn fail_fetch(&mut self, page: PageNumber, error: FetchError) {
            let index = self.fetches.iter().position(|(_, p)| *p == page).unwrap();
            self.complete_fetch(index, Err(error));
        }

        fn complete_render(&mut self, index: usize, result: Result<(), RenderError>) {
            let Some((task, page, params)) = self.renders.remove(index) else {
                return;
            };
            let result = result.map(|()| format!("page {page} at {}x", params.scale));
            let step = self.session.on_render_complete(task, result, self.now);
            self.apply(step);
        }

        fn settle(&mut self) {
            loop {
                if !self.fetches.is_empty() {
                    self.complete_fetch(0, Ok(()));
                } else if !self.renders.is_empty() {
                    self.complete_render(0, Ok(()));
                } else {
                    break;
                }
            }
        }

        fn settle_fetches(&mut self) {
            while !self.fetches.is_empty() {
                self.complete_fetch(0, Ok(()));
            }
        }

        fn advance(&mut self, ms: u64) {
            self.now += Duration::from_millis(ms);
            let step = self.session.on_timer(self.now);
            self.apply(step);
        }

        fn cached(&self) -> Vec<PageNumber> {
            self.session.cache().pages()
        }
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let config = ViewerConfig::default().with_max_concurrent_fetches(0);
        let result = ViewerSession::<String>::new(
            config,
            DocumentId::from("a.pdf"),
            DocumentInfo::with_page_count(3),
        );
        assert!(matches!(result, Err(ViewerError::Config(_))));
    }

    #[test]
    fn test_cache_settles_on_nearest_pages() {
        let config = ViewerConfig::default()
            .with_max_cache_entries(5)
            .with_keep_window_radius(2);
        let mut h = Harness::new(config, 100);
        h.viewport(10, &[10], false);

        for page in 1..=20 {
            h.request(page, PriorityBand::Idle);
            h.settle();
        }

        assert_eq!(h.cached(), vec![8, 9, 10, 11, 12]);
        assert!(h.session.cache().len() <= 5);
    }

    #[test]
    fn test_duplicate_request_fetches_once() {
        let mut h = Harness::new(ViewerConfig::default(), 100);
        h.viewport(1, &[1], false);
        h.started_fetches.clear();

        h.request(7, PriorityBand::Neighbor);
        h.request(7, PriorityBand::Neighbor);

        assert_eq!(h.started_fetches.iter().filter(|&&p| p == 7).count(), 1);
        assert_eq!(h.session.page_status(7), PageStatus::Loading);
    }

    #[test]
    fn test_fast_scroll_then_idle_fetches_landing_window() {
        let mut h = Harness::new(ViewerConfig::default(), 200);
        h.viewport(50, &[50], true);

        let mut went_fast = false;
        for page in 51..=80 {
            h.now += Duration::from_millis(20);
            h.viewport(page, &[page], true);

            if h.session.scroll_state().classification == ScrollClass::Fast {
                went_fast = true;
                let window = h.session.window();
                assert!(h.session.fetches().board().tasks().all(|t| window.is_visible(t.page)));
                assert!(h.fetches.iter().all(|(_, p)| *p == page));
            }
        }
        assert!(went_fast);

        h.advance(150);
        assert_eq!(h.session.scroll_state().classification, ScrollClass::Idle);
        h.settle();

        let cached = h.cached();
        for page in 78..=82 {
            assert!(cached.contains(&page), "page {page} missing from {cached:?}");
        }
        assert!(cached.iter().all(|&p| p >= 78));
    }

    #[test]
    fn test_zoom_rerenders_visible_first_and_tears_down_far_pages() {
        let config = ViewerConfig::default().with_max_concurrent_rerenders(1);
        let mut h = Harness::new(config, 100);

        h.viewport(40, &[40], false);
        h.settle();
        assert!(h.session.rendered(40).is_some());

        h.viewport(4, &[3, 4, 5], false);
        h.settle();
        h.viewport(4, &[4], false);
        h.settle();
        assert!(h.cached().contains(&40));

        h.started_renders.clear();
        h.events.clear();
        let step = h.session.on_zoom_changed(2.0, h.now).unwrap();
        h.apply(step);
        h.settle();

        assert_eq!(h.started_renders, vec![4, 3, 5]);
        assert!(h.events.contains(&ViewerEvent::NeedsReload { page: 40 }));
        assert!(h.session.renders().needs_reload(40));
        assert!(h.session.rendered(40).is_none());
        assert!(h.cached().contains(&40));
        assert_eq!(h.session.rendered(4).map(String::as_str), Some("page 4 at 2x"));
    }

    #[test]
    fn test_zoom_rejects_bad_scale() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        assert!(matches!(
            h.session.on_zoom_changed(0.0, h.now),
            Err(ViewerError::InvalidScale(_))
        ));
        assert!(h.session.on_zoom_changed(f32::NAN, h.now).is_err());
    }

    #[test]
    fn test_rotation_normalizes_and_rerenders() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        h.viewport(1, &[1], false);
        h.settle();

        h.started_renders.clear();
        let step = h.session.on_rotation_changed(-90, h.now).unwrap();
        h.apply(step);
        assert_eq!(h.session.window().rotation.degrees(), 270);
        assert_eq!(h.started_renders, vec![1]);
    }

    #[test]
    fn test_fetch_retries_then_surfaces_failure() {
        let config = ViewerConfig::default().with_retry(2, 100, 1000);
        let mut h = Harness::new(config, 10);
        h.viewport(1, &[1], false);

        h.fail_fetch(1, FetchError::Timeout);
        assert_eq!(h.session.page_status(1), PageStatus::RetryPending);
        assert_eq!(h.session.next_deadline(), Some(h.now + Duration::from_millis(100)));

        h.started_fetches.clear();
        h.advance(100);
        assert_eq!(h.started_fetches, vec![1]);

        h.fail_fetch(1, FetchError::Network("reset".into()));
        assert_eq!(h.session.page_status(1), PageStatus::Failed);
        assert!(h.events.iter().any(|e| matches!(
            e,
            ViewerEvent::PageFailed {
                page: 1,
                error: PageError::FetchFailed { attempts: 2, .. }
            }
        )));

        // Other pages are unaffected.
        h.settle();
        assert!(h.cached().contains(&2));

        // A failed page is not refetched by viewport changes alone.
        h.started_fetches.clear();
        h.viewport(1, &[1], false);
        assert!(!h.started_fetches.contains(&1));

        h.request(1, PriorityBand::Visible);
        assert_eq!(h.started_fetches, vec![1]);
        assert!(h.session.page_error(1).is_none());
    }

    #[test]
    fn test_fetcher_cancel_is_not_an_attempt() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        h.viewport(1, &[1], false);
        h.fail_fetch(1, FetchError::Canceled);

        assert_eq!(h.session.fetches().attempts(1), 0);
        assert_eq!(h.session.page_status(1), PageStatus::Missing);
        assert!(h.events.is_empty());

        h.started_fetches.clear();
        h.viewport(1, &[1], false);
        assert_eq!(h.started_fetches, vec![1]);
    }

    #[test]
    fn test_render_failure_waits_for_explicit_retry() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        h.viewport(1, &[1], false);
        h.settle_fetches();
        assert_eq!(h.renders.len(), 1);

        h.complete_render(0, Err(RenderError::Decode("bad xref".into())));
        assert!(h.events.iter().any(|e| matches!(e, ViewerEvent::RenderFailed { page: 1, .. })));
        assert!(h.session.page_error(1).is_some());

        h.started_renders.clear();
        h.viewport(1, &[1], false);
        assert!(h.started_renders.is_empty());

        let step = h.session.retry_render(1, h.now).unwrap();
        h.apply(step);
        assert_eq!(h.started_renders, vec![1]);
        h.settle();
        assert!(h.session.rendered(1).is_some());
        assert!(h.session.page_error(1).is_none());
    }

    #[test]
    fn test_pooled_slots_reclaim_far_page() {
        let config = ViewerConfig::default().with_render_slots(2);
        let mut h = Harness::new(config, 100);

        h.viewport(1, &[1], false);
        h.settle();
        h.viewport(2, &[2], false);
        h.settle();
        assert_eq!(h.session.slots().bound_pages(), vec![1, 2]);

        h.events.clear();
        h.viewport(30, &[30], false);
        h.settle();

        assert!(h.session.rendered(30).is_some());
        assert!(h.events.contains(&ViewerEvent::NeedsReload { page: 1 }));
        assert!(h.session.slots().bound_pages().contains(&2));
    }

    #[test]
    fn test_zoom_gesture_defers_reclamation() {
        let config = ViewerConfig::default().with_render_slots(1);
        let mut h = Harness::new(config, 100);
        h.viewport(1, &[1], false);
        h.settle();

        let step = h.session.set_zoom_in_progress(true, h.now);
        h.apply(step);
        h.viewport(20, &[20], false);
        h.settle();
        assert!(h.cached().contains(&20));
        assert!(h.session.rendered(20).is_none());
        assert!(h.session.slots().is_waiting(20));

        h.started_renders.clear();
        let step = h.session.set_zoom_in_progress(false, h.now);
        h.apply(step);
        assert_eq!(h.started_renders, vec![20]);
        h.settle();
        assert!(h.session.rendered(20).is_some());
        assert!(h.session.rendered(1).is_none());
    }

    #[test]
    fn test_memory_pressure_keeps_window() {
        let mut h = Harness::new(ViewerConfig::default(), 100);
        h.viewport(10, &[10], false);
        h.settle();
        for page in [20, 30, 40] {
            h.request(page, PriorityBand::Idle);
        }
        h.settle();
        assert!(h.cached().contains(&40));

        let step = h.session.on_memory_pressure();
        h.apply(step);

        assert!(h.cached().iter().all(|&p| p.abs_diff(10) <= 2));
        assert!(h.events.contains(&ViewerEvent::Evicted { page: 40 }));
    }

    #[test]
    fn test_set_cache_bound_shrinks() {
        let mut h = Harness::new(ViewerConfig::default(), 100);
        h.viewport(10, &[10], false);
        h.settle();
        assert!(h.session.cache().len() > 2);

        let step = h.session.set_cache_bound(CacheBound::Entries(2), h.now);
        h.apply(step);
        assert_eq!(h.session.cache().len(), 2);
        assert!(h.cached().contains(&10));
        assert_eq!(h.session.config().max_cache_entries, Some(2));
    }

    #[test]
    fn test_bound_below_visible_count_parks_evicted_pages() {
        let mut h = Harness::new(ViewerConfig::default(), 100);
        h.viewport(10, &[10, 11], false);
        h.settle();

        let step = h.session.set_cache_bound(CacheBound::Entries(1), h.now);
        h.apply(step);
        assert_eq!(h.session.cache().len(), 1);
        assert!(h.fetches.is_empty());
        for page in [10, 11] {
            assert_ne!(h.session.page_status(page), PageStatus::Missing, "page {page}");
        }
    }

    #[test]
    fn test_overflow_eviction_keeps_visible_pages_requested() {
        let config = ViewerConfig::default().with_max_cache_entries(1);
        let mut h = Harness::new(config, 20);
        h.viewport(1, &[1, 2], false);
        h.settle();

        assert_eq!(h.cached(), vec![2]);
        assert_eq!(h.session.page_status(1), PageStatus::Queued);
        assert!(h.session.fetches().board().is_parked(1));
        assert_eq!(h.started_fetches.iter().filter(|&&p| p == 1).count(), 1);

        // Parked until the viewport changes, then fetched once
        h.started_fetches.clear();
        h.viewport(1, &[1, 2], false);
        h.settle();

        assert_eq!(h.cached(), vec![1]);
        assert_eq!(h.started_fetches.iter().filter(|&&p| p == 1).count(), 1);
        assert!(!h.started_fetches.contains(&2));
        assert_eq!(h.session.page_status(2), PageStatus::Queued);
        assert!(h.session.fetches().board().is_parked(2));
    }

    #[test]
    fn test_explicit_request_survives_viewport_move() {
        let config = ViewerConfig::default().with_max_concurrent_fetches(1);
        let mut h = Harness::new(config, 100);
        h.viewport(1, &[1], false);
        h.request(50, PriorityBand::Visible);
        assert_eq!(h.session.page_status(50), PageStatus::Queued);

        h.viewport(5, &[5], false);
        let task = h.session.fetches().board().task(50).unwrap();
        assert_eq!(task.priority, PriorityBand::Visible);
        assert_eq!(h.session.page_status(2), PageStatus::Missing);

        h.settle();
        assert!(h.cached().contains(&50));
    }

    #[test]
    fn test_jump_sized_sample_from_idle_keeps_prefetch() {
        let mut h = Harness::new(ViewerConfig::default(), 100);
        h.viewport(1, &[1], false);
        h.settle();

        h.started_fetches.clear();
        h.viewport(40, &[40], true);
        assert_eq!(h.session.scroll_state().classification, ScrollClass::Slow);
        assert!(h.started_fetches.contains(&41));
    }

    #[test]
    fn test_invalid_pages_rejected() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        assert!(matches!(
            h.session.on_viewport_changed(0, [0], None, h.now),
            Err(ViewerError::InvalidPage { page: 0, page_count: 10 })
        ));
        assert!(h.session.on_viewport_changed(5, [5, 11], None, h.now).is_err());
        assert!(h.session.request_page(11, PriorityBand::Visible, h.now).is_err());
    }

    #[test]
    fn test_relayout_drops_pages_past_end() {
        let mut h = Harness::new(ViewerConfig::default(), 20);
        h.viewport(10, &[10, 11], false);
        h.settle();
        assert!(h.cached().contains(&11));

        let step = h
            .session
            .relayout(DocumentInfo::with_page_count(9), h.now)
            .unwrap();
        h.apply(step);
        h.settle();

        assert_eq!(h.session.window().current_page, 9);
        assert!(h.cached().iter().all(|&p| p <= 9));
        assert!(h.events.contains(&ViewerEvent::Evicted { page: 11 }));
    }

    #[test]
    fn test_shutdown_aborts_in_flight_work() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        h.viewport(1, &[1], false);
        assert!(!h.fetches.is_empty());

        let step = h.session.shutdown();
        assert!(step
            .effects
            .iter()
            .all(|e| matches!(e, Effect::AbortFetch { .. })));
        assert_eq!(step.effects.len(), h.fetches.len());
        h.apply(step);

        assert!(h.fetches.is_empty());
        assert!(h.session.is_stopped());
        assert_eq!(h.session.next_deadline(), None);
        assert!(matches!(
            h.session.request_page(2, PriorityBand::Visible, h.now),
            Err(ViewerError::Stopped)
        ));
    }

    #[test]
    fn test_stats_snapshot() {
        let mut h = Harness::new(ViewerConfig::default(), 10);
        h.viewport(1, &[1], false);
        h.settle();
        h.session.get_page(1);
        h.session.get_page(9);

        let stats = h.session.stats();
        assert_eq!(stats.cache.hits, 1);
        assert_eq!(stats.cache.misses, 1);
        assert_eq!(stats.cache.bound_kind, "entries");
        assert_eq!(stats.render.rendered, 1);
        assert_eq!(stats.slots.pool_size, None);
        assert!(stats.failed_pages.is_empty());
    }

    #[test]
    fn test_random_operations_hold_invariants() {
        let config = ViewerConfig::default()
            .with_max_cache_entries(8)
            .with_render_slots(3)
            .with_retry(2, 50, 200);
        let mut h = Harness::new(config, 60);
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for _ in 0..2000 {
            match rng.gen_range(0..6) {
                0 => {
                    h.now += Duration::from_millis(rng.gen_range(5..200));
                    let current = rng.gen_range(1..=60);
                    let visible: Vec<PageNumber> = if current < 60 && rng.gen_bool(0.5) {
                        vec![current, current + 1]
                    } else {
                        vec![current]
                    };
                    h.viewport(current, &visible, rng.gen_bool(0.7));
                }
                1 => {
                    let page = rng.gen_range(1..=60);
                    h.request(page, PriorityBand::Idle);
                }
                2 if !h.fetches.is_empty() => {
                    let index = rng.gen_range(0..h.fetches.len());
                    let result = if rng.gen_bool(0.8) {
                        Ok(())
                    } else {
                        Err(FetchError::Timeout)
                    };
                    h.complete_fetch(index, result);
                }
                3 if !h.renders.is_empty() => {
                    let index = rng.gen_range(0..h.renders.len());
                    h.complete_render(index, Ok(()));
                }
                4 => h.advance(rng.gen_range(10..300)),
                _ => {}
            }

            let cached = h.cached();
            assert!(cached.len() <= 8);

            let mut in_flight = BTreeSet::new();
            for (_, page) in &h.fetches {
                assert!(in_flight.insert(*page), "two fetches in flight for page {page}");
            }

            for page in h.session.slots().bound_pages() {
                assert!(cached.contains(&page), "slot bound to uncached page {page}");
            }

            if h.session.scroll_state().classification == ScrollClass::Fast {
                let window = h.session.window();
                assert!(h.session.fetches().board().tasks().all(|t| window.is_visible(t.page)));
            }

            for &page in &h.session.window().visible_pages {
                let status = h.session.page_status(page);
                assert_ne!(status, PageStatus::Missing, "visible page {page} has no work");
            }
        }
    }
}
