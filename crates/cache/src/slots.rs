//! Render slot pool for virtualized layouts
//!
//! A bounded set of reusable render resources. Each slot is bound to at most
//! one page at a time; when the pool is full, slots held by pages outside the
//! viewport are reclaimed farthest-first. Visible pages are never reclaimed:
//! a request that cannot be satisfied waits until a slot frees naturally.

use std::collections::{HashMap, VecDeque};

use tracing::debug;

use crate::page::{EvictionFocus, PageNumber};

/// Index of a slot within the pool.
pub type SlotIndex = usize;

/// A pooled render slot.
#[derive(Debug)]
pub struct RenderSlot<R> {
    index: SlotIndex,
    occupying_page: Option<PageNumber>,
    resource: Option<R>,
}

impl<R> RenderSlot<R> {
    fn empty(index: SlotIndex) -> Self {
        Self {
            index,
            occupying_page: None,
            resource: None,
        }
    }

    /// Position of this slot in the pool
    pub fn index(&self) -> SlotIndex {
        self.index
    }

    /// Page bound to this slot, `None` when free
    pub fn occupying_page(&self) -> Option<PageNumber> {
        self.occupying_page
    }

    /// Rendered resource held by this slot, if the render has landed
    pub fn resource(&self) -> Option<&R> {
        self.resource.as_ref()
    }

    /// Whether the slot is free
    pub fn is_free(&self) -> bool {
        self.occupying_page.is_none()
    }
}

/// A page that lost its slot to a reclamation.
#[derive(Debug)]
pub struct Reclaimed<R> {
    /// Page that was unbound
    pub page: PageNumber,

    /// Resource released from the slot
    pub resource: Option<R>,
}

/// Result of a successful acquisition.
#[derive(Debug)]
pub struct SlotGrant<R> {
    /// Slot now bound to the requesting page
    pub slot: SlotIndex,

    /// Binding that had to be dropped to make room, if any
    pub reclaimed: Option<Reclaimed<R>>,
}

/// Statistics about slot usage
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotStats {
    /// Number of slots (current size for growable pools)
    pub capacity: usize,

    /// Slots currently bound to a page
    pub occupied: usize,

    /// Successful new bindings
    pub acquisitions: u64,

    /// Bindings dropped to make room for another page
    pub reclamations: u64,

    /// Requests that had to wait
    pub deferrals: u64,

    /// Explicit releases
    pub releases: u64,
}

/// Fixed-size (or on-demand growing) pool of render slots.
///
/// The pool exclusively owns the resources stored in its slots. Releasing a
/// slot hands the resource back to the caller so it can be dropped or
/// recycled outside the pool.
///
/// # Example
///
/// ```
/// use folio_cache::{EvictionFocus, RenderSlotPool};
///
/// let mut pool: RenderSlotPool<String> = RenderSlotPool::fixed(1);
///
/// let focus = EvictionFocus::new(1, [1]);
/// pool.acquire(1, &focus, 0).expect("a free slot");
/// pool.attach(1, "page one".to_string()).unwrap();
///
/// // Scroll far away: page 1 is no longer visible and gets reclaimed.
/// let focus = EvictionFocus::new(20, [20]);
/// let grant = pool.acquire(20, &focus, 0).expect("reclaimed slot");
/// assert_eq!(grant.reclaimed.map(|r| r.page), Some(1));
/// ```
#[derive(Debug)]
pub struct RenderSlotPool<R> {
    slots: Vec<RenderSlot<R>>,
    by_page: HashMap<PageNumber, SlotIndex>,
    growable: bool,
    reclamation_paused: bool,
    waiting: VecDeque<PageNumber>,
    stats: SlotStats,
}

impl<R> RenderSlotPool<R> {
    /// Create a pool with exactly `capacity` slots, allocated up front.
    pub fn fixed(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(RenderSlot::empty).collect(),
            by_page: HashMap::with_capacity(capacity),
            growable: false,
            reclamation_paused: false,
            waiting: VecDeque::new(),
            stats: SlotStats {
                capacity,
                ..Default::default()
            },
        }
    }

    /// Create a pool that grows on demand, for non-virtualized layouts.
    pub fn unbounded() -> Self {
        Self {
            slots: Vec::new(),
            by_page: HashMap::new(),
            growable: true,
            reclamation_paused: false,
            waiting: VecDeque::new(),
            stats: SlotStats::default(),
        }
    }

    /// Bind `page` to a slot.
    ///
    /// Returns the page's existing slot if it already holds one, otherwise a
    /// free slot, otherwise a reclaimed slot. Visible requesters may reclaim
    /// any non-visible page; other requesters may only reclaim pages outside
    /// the keep window that are farther from the current page than they are.
    ///
    /// Returns `None` when nothing can be freed (every candidate is visible or
    /// protected, or reclamation is paused); the page is then queued in the
    /// waiting list until [`take_waiting`](Self::take_waiting) is consulted.
    pub fn acquire(
        &mut self,
        page: PageNumber,
        focus: &EvictionFocus,
        keep_window: u32,
    ) -> Option<SlotGrant<R>> {
        if let Some(&slot) = self.by_page.get(&page) {
            return Some(SlotGrant {
                slot,
                reclaimed: None,
            });
        }

        if let Some(slot) = self.slots.iter().position(RenderSlot::is_free) {
            self.bind(slot, page);
            return Some(SlotGrant {
                slot,
                reclaimed: None,
            });
        }

        if self.growable {
            let slot = self.slots.len();
            self.slots.push(RenderSlot::empty(slot));
            self.stats.capacity = self.slots.len();
            self.bind(slot, page);
            return Some(SlotGrant {
                slot,
                reclaimed: None,
            });
        }

        if self.reclamation_paused {
            self.defer(page, "reclamation paused");
            return None;
        }

        let Some((slot, victim)) = self.reclaim_candidate(page, focus, keep_window) else {
            self.defer(page, "no reclaimable slot");
            return None;
        };

        let resource = self.unbind(slot);
        self.stats.reclamations += 1;
        debug!(target: "folio::slots", slot, victim, page, "reclaimed slot");
        self.bind(slot, page);

        Some(SlotGrant {
            slot,
            reclaimed: Some(Reclaimed {
                page: victim,
                resource,
            }),
        })
    }

    /// Free a slot, returning its resource.
    pub fn release(&mut self, slot: SlotIndex) -> Option<R> {
        if self.slots.get(slot).map_or(true, RenderSlot::is_free) {
            return None;
        }
        self.stats.releases += 1;
        self.unbind(slot)
    }

    /// Free whatever slot `page` holds and drop it from the waiting list.
    pub fn release_page(&mut self, page: PageNumber) -> Option<R> {
        self.waiting.retain(|&waiting| waiting != page);
        let slot = *self.by_page.get(&page)?;
        self.release(slot)
    }

    /// Drop the rendered resource of `page` but keep its slot binding.
    pub fn clear_resource(&mut self, page: PageNumber) -> Option<R> {
        let slot = *self.by_page.get(&page)?;
        self.slots[slot].resource.take()
    }

    /// Store a rendered resource for `page`.
    ///
    /// Returns the previous resource on success. If the page no longer holds
    /// a slot, the resource is handed back as `Err`.
    pub fn attach(&mut self, page: PageNumber, resource: R) -> Result<Option<R>, R> {
        match self.by_page.get(&page) {
            Some(&slot) => Ok(self.slots[slot].resource.replace(resource)),
            None => Err(resource),
        }
    }

    /// Rendered resource for `page`, if bound and rendered.
    pub fn resource(&self, page: PageNumber) -> Option<&R> {
        let slot = *self.by_page.get(&page)?;
        self.slots[slot].resource.as_ref()
    }

    /// Slot bound to `page`.
    pub fn slot_of(&self, page: PageNumber) -> Option<SlotIndex> {
        self.by_page.get(&page).copied()
    }

    /// Page bound to `slot`.
    pub fn occupant(&self, slot: SlotIndex) -> Option<PageNumber> {
        self.slots.get(slot).and_then(RenderSlot::occupying_page)
    }

    /// Iterate over all slots.
    pub fn slots(&self) -> impl Iterator<Item = &RenderSlot<R>> {
        self.slots.iter()
    }

    /// Pages currently holding a slot, ascending.
    pub fn bound_pages(&self) -> Vec<PageNumber> {
        let mut pages: Vec<PageNumber> = self.by_page.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Stop reclaiming bound slots (e.g. while a zoom gesture is in progress).
    pub fn pause_reclamation(&mut self) {
        self.reclamation_paused = true;
    }

    /// Resume reclaiming bound slots.
    pub fn resume_reclamation(&mut self) {
        self.reclamation_paused = false;
    }

    /// Whether reclamation is currently paused.
    pub fn is_reclamation_paused(&self) -> bool {
        self.reclamation_paused
    }

    /// Drain the waiting list in FIFO order.
    ///
    /// Pages that still need a slot should be passed to
    /// [`acquire`](Self::acquire) again; failed acquisitions re-queue them.
    pub fn take_waiting(&mut self) -> Vec<PageNumber> {
        self.waiting.drain(..).collect()
    }

    /// Whether `page` is waiting for a slot.
    pub fn is_waiting(&self, page: PageNumber) -> bool {
        self.waiting.contains(&page)
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of free slots.
    pub fn free_count(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_free()).count()
    }

    /// Get current slot statistics
    pub fn stats(&self) -> SlotStats {
        SlotStats {
            capacity: self.slots.len(),
            occupied: self.by_page.len(),
            ..self.stats
        }
    }

    fn bind(&mut self, slot: SlotIndex, page: PageNumber) {
        self.slots[slot].occupying_page = Some(page);
        self.slots[slot].resource = None;
        self.by_page.insert(page, slot);
        self.waiting.retain(|&waiting| waiting != page);
        self.stats.acquisitions += 1;
    }

    fn unbind(&mut self, slot: SlotIndex) -> Option<R> {
        let entry = &mut self.slots[slot];
        if let Some(page) = entry.occupying_page.take() {
            self.by_page.remove(&page);
        }
        entry.resource.take()
    }

    fn defer(&mut self, page: PageNumber, reason: &'static str) {
        if !self.waiting.contains(&page) {
            self.waiting.push_back(page);
        }
        self.stats.deferrals += 1;
        debug!(target: "folio::slots", page, reason, "slot request deferred");
    }

    fn reclaim_candidate(
        &self,
        requester: PageNumber,
        focus: &EvictionFocus,
        keep_window: u32,
    ) -> Option<(SlotIndex, PageNumber)> {
        let requester_visible = focus.is_visible(requester);
        let requester_distance = focus.distance(requester);

        self.slots
            .iter()
            .filter_map(|slot| slot.occupying_page.map(|page| (slot.index, page)))
            .filter(|&(_, page)| !focus.is_visible(page))
            .filter(|&(_, page)| {
                requester_visible
                    || (focus.distance(page) > keep_window
                        && focus.distance(page) > requester_distance)
            })
            .max_by(|&(a_slot, a_page), &(b_slot, b_page)| {
                focus
                    .distance(a_page)
                    .cmp(&focus.distance(b_page))
                    .then(b_slot.cmp(&a_slot))
            })
    }
}
