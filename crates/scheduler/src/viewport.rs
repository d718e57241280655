//! Viewport-aware band assignment
//!
//! Maps every page to a priority band, or to no band at all, from the current
//! viewport and the scroll state:
//!
//! 1. Visible pages are always `Visible`.
//! 2. Fast scrolling assigns nothing else.
//! 3. Slow scrolling prefetches ahead in the scroll direction (`Directional`),
//!    the immediate neighbours (`Neighbor`) and a short run behind (`Idle`).
//! 4. When idle, neighbours stay `Neighbor` and the whole keep window, plus
//!    the run ahead in the last direction, becomes `Idle`.

use std::collections::BTreeSet;
use std::fmt;

use folio_cache::{EvictionFocus, PageNumber};

use crate::priority::PriorityBand;
use crate::scroll::{ScrollClass, ScrollState};

/// Page rotation in degrees, normalized to `0..360`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rotation(u16);

impl Rotation {
    /// Normalize any degree value, negative ones included.
    pub fn from_degrees(degrees: i32) -> Self {
        Self(degrees.rem_euclid(360) as u16)
    }

    pub fn degrees(self) -> u16 {
        self.0
    }
}

impl fmt::Display for Rotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}°", self.0)
    }
}

/// What the user is looking at
#[derive(Debug, Clone, PartialEq)]
pub struct ViewportWindow {
    /// Page the reading position is on
    pub current_page: PageNumber,
    /// Pages intersecting the viewport
    pub visible_pages: BTreeSet<PageNumber>,
    /// Zoom factor, 1.0 = 100%
    pub zoom_scale: f32,
    pub rotation: Rotation,
}

impl ViewportWindow {
    /// A window showing only `current_page` at 100%.
    pub fn new(current_page: PageNumber) -> Self {
        Self {
            current_page,
            visible_pages: BTreeSet::from([current_page]),
            zoom_scale: 1.0,
            rotation: Rotation::default(),
        }
    }

    pub fn is_visible(&self, page: PageNumber) -> bool {
        self.visible_pages.contains(&page)
    }

    /// Absolute page distance from the current page.
    pub fn distance(&self, page: PageNumber) -> u32 {
        page.abs_diff(self.current_page)
    }

    /// The eviction focus the caches should use for this window.
    pub fn focus(&self) -> EvictionFocus {
        EvictionFocus::new(self.current_page, self.visible_pages.iter().copied())
    }
}

/// Prefetch window sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrefetchPolicy {
    /// Pages ahead of the current page in the scroll direction
    pub ahead: u32,
    /// Pages behind the current page
    pub behind: u32,
    /// Radius protected from reclamation and prefetched when idle
    pub keep_window: u32,
}

impl Default for PrefetchPolicy {
    fn default() -> Self {
        Self {
            ahead: 3,
            behind: 1,
            keep_window: 2,
        }
    }
}

/// Assigns priority bands to pages
///
/// # Example
///
/// ```
/// use folio_scheduler::{BandCalculator, PrefetchPolicy, PriorityBand, ScrollState, ViewportWindow};
///
/// let calculator = BandCalculator::new(PrefetchPolicy::default(), 100);
/// let window = ViewportWindow::new(10);
/// let idle = ScrollState::default();
///
/// assert_eq!(calculator.band_for(10, &window, &idle), Some(PriorityBand::Visible));
/// assert_eq!(calculator.band_for(11, &window, &idle), Some(PriorityBand::Neighbor));
/// assert_eq!(calculator.band_for(12, &window, &idle), Some(PriorityBand::Idle));
/// assert_eq!(calculator.band_for(40, &window, &idle), None);
/// ```
#[derive(Debug, Clone, Copy)]
pub struct BandCalculator {
    policy: PrefetchPolicy,
    page_count: u32,
}

impl BandCalculator {
    pub fn new(policy: PrefetchPolicy, page_count: u32) -> Self {
        Self { policy, page_count }
    }

    pub fn policy(&self) -> PrefetchPolicy {
        self.policy
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn set_page_count(&mut self, page_count: u32) {
        self.page_count = page_count;
    }

    /// Band for `page`, or `None` when the page should not be worked on.
    pub fn band_for(
        &self,
        page: PageNumber,
        window: &ViewportWindow,
        scroll: &ScrollState,
    ) -> Option<PriorityBand> {
        if page == 0 || page > self.page_count {
            return None;
        }
        if window.is_visible(page) {
            return Some(PriorityBand::Visible);
        }

        let offset = i64::from(page) - i64::from(window.current_page);
        let distance = offset.unsigned_abs();
        let step = scroll.direction.step();
        // Signed offset along the direction of travel; positive is ahead.
        let along = offset * step;

        match scroll.classification {
            ScrollClass::Fast => None,
            ScrollClass::Slow => {
                if step != 0 && along > 0 && along <= i64::from(self.policy.ahead) {
                    Some(PriorityBand::Directional)
                } else if distance <= 1 {
                    Some(PriorityBand::Neighbor)
                } else if is_behind(along, step, distance, self.policy.behind) {
                    Some(PriorityBand::Idle)
                } else {
                    None
                }
            }
            ScrollClass::Idle => {
                if distance <= 1 {
                    Some(PriorityBand::Neighbor)
                } else if distance <= u64::from(self.policy.keep_window) {
                    Some(PriorityBand::Idle)
                } else if step != 0 && along > 0 && along <= i64::from(self.policy.ahead) {
                    Some(PriorityBand::Idle)
                } else {
                    None
                }
            }
        }
    }

    /// Every page with a band, best first.
    ///
    /// Ordered by band, then distance from the current page, then page number.
    pub fn wanted(&self, window: &ViewportWindow, scroll: &ScrollState) -> Vec<(PageNumber, PriorityBand)> {
        let reach = self
            .policy
            .ahead
            .max(self.policy.behind)
            .max(self.policy.keep_window)
            .max(1);
        let low = window.current_page.saturating_sub(reach).max(1);
        let high = window.current_page.saturating_add(reach).min(self.page_count);

        let candidates: BTreeSet<PageNumber> = (low..=high)
            .chain(window.visible_pages.iter().copied())
            .collect();

        let mut wanted: Vec<(PageNumber, PriorityBand)> = candidates
            .into_iter()
            .filter_map(|page| self.band_for(page, window, scroll).map(|band| (page, band)))
            .collect();
        wanted.sort_by_key(|(page, band)| (std::cmp::Reverse(*band), window.distance(*page), *page));
        wanted
    }
}

fn is_behind(along: i64, step: i64, distance: u64, behind: u32) -> bool {
    if step == 0 {
        distance <= u64::from(behind)
    } else {
        along < 0 && distance <= u64::from(behind)
    }
}
