//! Page payload cache with viewport-aware eviction
//!
//! Holds fetched page payloads under a hard bound expressed either as an
//! entry count or as cumulative payload bytes. When an insertion breaches the
//! bound, pages are evicted farthest-first from the current page (skipping
//! visible pages), falling back to least-recently-accessed order only when
//! every remaining entry is visible.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, warn};

/// 1-based page number within a document session.
pub type PageNumber = u32;

/// Fetched byte representation of a page, prior to rendering.
///
/// Cloning is cheap: the bytes are shared and never mutated once stored.
#[derive(Clone, PartialEq, Eq)]
pub struct PagePayload {
    bytes: Arc<[u8]>,
}

impl PagePayload {
    /// Wrap fetched bytes into a payload.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// Size of the payload in bytes.
    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    /// Borrow the raw bytes.
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl From<Vec<u8>> for PagePayload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl fmt::Debug for PagePayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PagePayload").field("size", &self.size()).finish()
    }
}

/// Eviction bound for the page cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheBound {
    /// Maximum number of cached pages
    Entries(usize),

    /// Maximum cumulative payload size in bytes
    Bytes(usize),
}

impl CacheBound {
    /// Whether a single payload of `size` bytes could ever be admitted.
    fn admits_single(&self, size: usize) -> bool {
        match *self {
            CacheBound::Entries(limit) => limit >= 1,
            CacheBound::Bytes(limit) => size <= limit,
        }
    }

    fn exceeded_by(&self, entries: usize, bytes: usize) -> bool {
        match *self {
            CacheBound::Entries(limit) => entries > limit,
            CacheBound::Bytes(limit) => bytes > limit,
        }
    }
}

/// A cached page payload with its bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Page this entry belongs to
    pub page: PageNumber,

    /// Fetched payload
    pub payload: PagePayload,

    /// Logical access tick, bumped on every read
    pub last_access: u64,

    /// Logical insertion tick
    pub insertion_order: u64,
}

/// Viewport focus consulted by the eviction policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionFocus {
    /// Page the viewport is centred on
    pub current_page: PageNumber,

    /// Pages intersecting the viewport
    pub visible_pages: BTreeSet<PageNumber>,
}

impl EvictionFocus {
    /// Create a focus around `current_page` with the given visible set.
    pub fn new(current_page: PageNumber, visible_pages: impl IntoIterator<Item = PageNumber>) -> Self {
        Self {
            current_page,
            visible_pages: visible_pages.into_iter().collect(),
        }
    }

    /// Page distance from the current page.
    pub fn distance(&self, page: PageNumber) -> u32 {
        page.abs_diff(self.current_page)
    }

    /// Whether `page` is currently visible.
    pub fn is_visible(&self, page: PageNumber) -> bool {
        self.visible_pages.contains(&page)
    }
}

impl Default for EvictionFocus {
    fn default() -> Self {
        Self {
            current_page: 1,
            visible_pages: BTreeSet::new(),
        }
    }
}

/// Statistics about cache usage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Number of pages currently cached
    pub entry_count: usize,

    /// Total payload bytes currently cached
    pub bytes_used: usize,

    /// Configured bound
    pub bound: CacheBound,

    /// Number of cache hits
    pub hits: u64,

    /// Number of cache misses
    pub misses: u64,

    /// Number of pages evicted to respect the bound
    pub evictions: u64,

    /// Number of evictions that had to fall back to recency order
    pub overflow_evictions: u64,
}

impl CacheStats {
    /// Calculate the cache hit rate (0.0 to 1.0)
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Returned when a payload can never fit, even in an empty cache.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("page {page} ({size} bytes) cannot be admitted under cache bound {bound:?}")]
pub struct CapacityExceeded {
    /// Page that was rejected
    pub page: PageNumber,

    /// Payload size in bytes
    pub size: usize,

    /// Bound in force when the insertion was attempted
    pub bound: CacheBound,
}

/// Bounded page payload cache.
///
/// The cache is owned by a single control loop and mutated through `&mut self`;
/// every insertion and its eviction run as one step, so the bound holds after
/// each call returns.
///
/// # Example
///
/// ```
/// use folio_cache::{CacheBound, PageCache, PagePayload};
///
/// let mut cache = PageCache::new(CacheBound::Entries(2));
/// cache.set_focus(1, [1]);
///
/// cache.put(1, PagePayload::from(vec![0u8; 16])).unwrap();
/// cache.put(2, PagePayload::from(vec![0u8; 16])).unwrap();
/// let evicted = cache.put(9, PagePayload::from(vec![0u8; 16])).unwrap();
///
/// // Page 9 is the farthest from page 1, so it is the one dropped.
/// assert_eq!(evicted, vec![9]);
/// assert!(cache.contains(1) && cache.contains(2));
/// ```
#[derive(Debug)]
pub struct PageCache {
    entries: HashMap<PageNumber, CacheEntry>,
    bound: CacheBound,
    bytes_used: usize,
    clock: u64,
    focus: EvictionFocus,
    stats: CacheStats,
}

impl PageCache {
    /// Create an empty cache with the given bound.
    pub fn new(bound: CacheBound) -> Self {
        Self {
            entries: HashMap::new(),
            bound,
            bytes_used: 0,
            clock: 0,
            focus: EvictionFocus::default(),
            stats: CacheStats {
                entry_count: 0,
                bytes_used: 0,
                bound,
                hits: 0,
                misses: 0,
                evictions: 0,
                overflow_evictions: 0,
            },
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Update the viewport focus used to choose eviction victims.
    pub fn set_focus(
        &mut self,
        current_page: PageNumber,
        visible_pages: impl IntoIterator<Item = PageNumber>,
    ) {
        self.focus = EvictionFocus::new(current_page, visible_pages);
    }

    /// Current eviction focus.
    pub fn focus(&self) -> &EvictionFocus {
        &self.focus
    }

    /// Insert or replace a page payload.
    ///
    /// The entry is inserted and the cache is trimmed back under its bound in
    /// the same step. The incoming page competes with the existing entries, so
    /// a page farther away than everything already cached may be dropped
    /// immediately. Returns every evicted page (possibly including `page`).
    ///
    /// # Errors
    ///
    /// Returns [`CapacityExceeded`] when the payload could not fit even in an
    /// empty cache. Existing entries are left untouched in that case.
    pub fn put(
        &mut self,
        page: PageNumber,
        payload: PagePayload,
    ) -> Result<Vec<PageNumber>, CapacityExceeded> {
        let size = payload.size();
        if !self.bound.admits_single(size) {
            let error = CapacityExceeded {
                page,
                size,
                bound: self.bound,
            };
            warn!(target: "folio::cache", %error, "rejecting insert");
            return Err(error);
        }

        if let Some(old) = self.entries.remove(&page) {
            self.bytes_used = self.bytes_used.saturating_sub(old.payload.size());
        }

        let now = self.tick();
        self.bytes_used += size;
        self.entries.insert(
            page,
            CacheEntry {
                page,
                payload,
                last_access: now,
                insertion_order: now,
            },
        );

        let evicted = self.trim();
        self.sync_stats();
        Ok(evicted)
    }

    /// Retrieve a page payload, marking it as recently used.
    pub fn get(&mut self, page: PageNumber) -> Option<PagePayload> {
        let now = self.tick();
        match self.entries.get_mut(&page) {
            Some(entry) => {
                entry.last_access = now;
                self.stats.hits += 1;
                Some(entry.payload.clone())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Borrow a page payload without touching recency or statistics.
    pub fn peek(&self, page: PageNumber) -> Option<&PagePayload> {
        self.entries.get(&page).map(|entry| &entry.payload)
    }

    /// Borrow the full entry for a page.
    pub fn entry(&self, page: PageNumber) -> Option<&CacheEntry> {
        self.entries.get(&page)
    }

    /// Check whether a page is cached. Has no side effects.
    pub fn contains(&self, page: PageNumber) -> bool {
        self.entries.contains_key(&page)
    }

    /// Remove a page unconditionally.
    ///
    /// Removing a page that is not cached is a no-op and returns `None`.
    /// Callers owning dependents of the entry (render slots) must release
    /// them in the same step.
    pub fn remove(&mut self, page: PageNumber) -> Option<CacheEntry> {
        let entry = self.entries.remove(&page)?;
        self.bytes_used = self.bytes_used.saturating_sub(entry.payload.size());
        self.sync_stats();
        debug!(target: "folio::cache", page, "removed");
        Some(entry)
    }

    /// Drop every entry, returning the pages that were cached.
    pub fn clear(&mut self) -> Vec<PageNumber> {
        let mut pages: Vec<PageNumber> = self.entries.keys().copied().collect();
        pages.sort_unstable();
        self.entries.clear();
        self.bytes_used = 0;
        self.sync_stats();
        pages
    }

    /// Pages whose distance from `current_page` exceeds `keep_window`,
    /// farthest first (ties: least recently accessed first).
    pub fn evictable_candidates(&self, current_page: PageNumber, keep_window: u32) -> Vec<PageNumber> {
        let mut candidates: Vec<&CacheEntry> = self
            .entries
            .values()
            .filter(|entry| entry.page.abs_diff(current_page) > keep_window)
            .collect();
        candidates.sort_by(|a, b| {
            b.page
                .abs_diff(current_page)
                .cmp(&a.page.abs_diff(current_page))
                .then(a.last_access.cmp(&b.last_access))
        });
        candidates.into_iter().map(|entry| entry.page).collect()
    }

    /// Change the bound, evicting immediately if the cache is now over it.
    pub fn set_bound(&mut self, bound: CacheBound) -> Vec<PageNumber> {
        self.bound = bound;
        let evicted = self.trim();
        self.sync_stats();
        evicted
    }

    /// Configured bound.
    pub fn bound(&self) -> CacheBound {
        self.bound
    }

    /// Number of cached pages.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Cumulative payload bytes currently held.
    pub fn bytes_used(&self) -> usize {
        self.bytes_used
    }

    /// Cached page numbers in ascending order.
    pub fn pages(&self) -> Vec<PageNumber> {
        let mut pages: Vec<PageNumber> = self.entries.keys().copied().collect();
        pages.sort_unstable();
        pages
    }

    /// Get current cache statistics
    pub fn stats(&self) -> CacheStats {
        self.stats
    }

    /// Evict until the bound holds.
    fn trim(&mut self) -> Vec<PageNumber> {
        let mut evicted = Vec::new();
        while self.bound.exceeded_by(self.entries.len(), self.bytes_used) {
            let victim = match self.farthest_invisible() {
                Some(page) => page,
                None => match self.least_recently_used() {
                    Some(page) => {
                        self.stats.overflow_evictions += 1;
                        warn!(
                            target: "folio::cache",
                            page,
                            "every cached page is visible; evicting least recently used"
                        );
                        page
                    }
                    None => break,
                },
            };

            if let Some(entry) = self.entries.remove(&victim) {
                self.bytes_used = self.bytes_used.saturating_sub(entry.payload.size());
                self.stats.evictions += 1;
                debug!(
                    target: "folio::cache",
                    page = victim,
                    distance = self.focus.distance(victim),
                    "evicted"
                );
                evicted.push(victim);
            }
        }
        evicted
    }

    fn farthest_invisible(&self) -> Option<PageNumber> {
        self.entries
            .values()
            .filter(|entry| !self.focus.is_visible(entry.page))
            .max_by(|a, b| {
                self.focus
                    .distance(a.page)
                    .cmp(&self.focus.distance(b.page))
                    .then(b.last_access.cmp(&a.last_access))
            })
            .map(|entry| entry.page)
    }

    fn least_recently_used(&self) -> Option<PageNumber> {
        self.entries
            .values()
            .min_by_key(|entry| entry.last_access)
            .map(|entry| entry.page)
    }

    fn sync_stats(&mut self) {
        self.stats.entry_count = self.entries.len();
        self.stats.bytes_used = self.bytes_used;
        self.stats.bound = self.bound;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn payload(size: usize) -> PagePayload {
        PagePayload::from(vec![7u8; size])
    }

    #[test]
    fn test_basic_put_get() {
        let mut cache = PageCache::new(CacheBound::Entries(4));

        cache.put(3, payload(32)).unwrap();

        let hit = cache.get(3).expect("page should be cached");
        assert_eq!(hit.size(), 32);
        assert!(cache.contains(3));
        assert_eq!(cache.bytes_used(), 32);
    }

    #[test]
    fn test_cache_miss_has_no_side_effect() {
        let mut cache = PageCache::new(CacheBound::Entries(4));

        assert!(cache.get(9).is_none());
        assert!(!cache.contains(9));
        assert!(cache.is_empty());

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_sequential_requests_settle_around_current_page() {
        let mut cache = PageCache::new(CacheBound::Entries(5));
        cache.set_focus(10, [10]);

        for page in 1..=20 {
            cache.put(page, payload(8)).unwrap();
            assert!(cache.len() <= 5);
        }

        assert_eq!(cache.pages(), vec![8, 9, 10, 11, 12]);
    }

    #[test]
    fn test_incoming_far_page_is_dropped_immediately() {
        let mut cache = PageCache::new(CacheBound::Entries(2));
        cache.set_focus(5, [5]);

        cache.put(5, payload(8)).unwrap();
        cache.put(6, payload(8)).unwrap();
        let evicted = cache.put(40, payload(8)).unwrap();

        assert_eq!(evicted, vec![40]);
        assert_eq!(cache.pages(), vec![5, 6]);
    }

    #[test]
    fn test_visible_pages_are_protected() {
        let mut cache = PageCache::new(CacheBound::Entries(3));
        cache.set_focus(10, [1, 10]);

        cache.put(1, payload(8)).unwrap();
        cache.put(10, payload(8)).unwrap();
        cache.put(11, payload(8)).unwrap();
        let evicted = cache.put(12, payload(8)).unwrap();

        // Page 1 is the farthest, but it is visible.
        assert_eq!(evicted, vec![12]);
        assert!(cache.contains(1));
    }

    #[test]
    fn test_farthest_tie_breaks_by_recency() {
        let mut cache = PageCache::new(CacheBound::Entries(2));
        cache.set_focus(10, [10]);

        cache.put(8, payload(8)).unwrap();
        cache.put(12, payload(8)).unwrap();
        // Touch page 8 so page 12 becomes the least recently used of the pair.
        cache.get(8);
        let evicted = cache.put(10, payload(8)).unwrap();

        assert_eq!(evicted, vec![12]);
    }

    #[test]
    fn test_lru_fallback_when_everything_is_visible() {
        let mut cache = PageCache::new(CacheBound::Entries(2));
        cache.set_focus(2, [1, 2, 3]);

        cache.put(1, payload(8)).unwrap();
        cache.put(2, payload(8)).unwrap();
        cache.get(1);
        let evicted = cache.put(3, payload(8)).unwrap();

        assert_eq!(evicted, vec![2]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.stats().overflow_evictions, 1);
    }

    #[test]
    fn test_byte_bound() {
        let mut cache = PageCache::new(CacheBound::Bytes(100));
        cache.set_focus(1, [1]);

        cache.put(1, payload(40)).unwrap();
        cache.put(2, payload(40)).unwrap();
        let evicted = cache.put(3, payload(40)).unwrap();

        assert_eq!(evicted, vec![3]);
        assert!(cache.bytes_used() <= 100);

        let evicted = cache.put(2, payload(60)).unwrap();
        assert!(evicted.is_empty());
        assert_eq!(cache.bytes_used(), 100);
    }

    #[test]
    fn test_oversized_payload_is_rejected() {
        let mut cache = PageCache::new(CacheBound::Bytes(64));
        cache.put(1, payload(32)).unwrap();

        let error = cache.put(2, payload(65)).unwrap_err();
        assert_eq!(error.page, 2);
        assert_eq!(error.size, 65);

        // Existing entries are untouched.
        assert!(cache.contains(1));
        assert!(!cache.contains(2));
    }

    #[test]
    fn test_zero_entry_bound_rejects() {
        let mut cache = PageCache::new(CacheBound::Entries(0));
        assert!(cache.put(1, payload(1)).is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_replace_updates_bytes() {
        let mut cache = PageCache::new(CacheBound::Entries(4));

        cache.put(1, payload(10)).unwrap();
        cache.put(1, payload(30)).unwrap();

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.bytes_used(), 30);
        assert_eq!(cache.peek(1).map(PagePayload::size), Some(30));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let mut cache = PageCache::new(CacheBound::Entries(4));
        cache.put(1, payload(10)).unwrap();

        assert!(cache.remove(1).is_some());
        let before = cache.stats();
        assert!(cache.remove(1).is_none());
        assert!(cache.remove(77).is_none());
        assert_eq!(cache.stats(), before);
    }

    #[test]
    fn test_evictable_candidates_farthest_first() {
        let mut cache = PageCache::new(CacheBound::Entries(10));
        for page in [1, 4, 9, 10, 11, 13, 30] {
            cache.put(page, payload(4)).unwrap();
        }

        let candidates = cache.evictable_candidates(10, 2);
        assert_eq!(candidates, vec![30, 1, 4, 13]);

        assert!(cache.evictable_candidates(10, 100).is_empty());
    }

    #[test]
    fn test_set_bound_trims() {
        let mut cache = PageCache::new(CacheBound::Entries(5));
        cache.set_focus(3, [3]);
        for page in 1..=5 {
            cache.put(page, payload(4)).unwrap();
        }

        let mut evicted = cache.set_bound(CacheBound::Entries(3));
        evicted.sort_unstable();

        assert_eq!(evicted, vec![1, 5]);
        assert_eq!(cache.pages(), vec![2, 3, 4]);
    }

    #[test]
    fn test_clear_returns_pages() {
        let mut cache = PageCache::new(CacheBound::Entries(5));
        cache.put(4, payload(4)).unwrap();
        cache.put(2, payload(4)).unwrap();

        assert_eq!(cache.clear(), vec![2, 4]);
        assert!(cache.is_empty());
        assert_eq!(cache.bytes_used(), 0);
    }

    #[test]
    fn test_bound_holds_for_random_sequences() {
        let mut rng = StdRng::seed_from_u64(0x5eed);

        for bound in [CacheBound::Entries(7), CacheBound::Bytes(4096)] {
            let mut cache = PageCache::new(bound);
            for _ in 0..2_000 {
                let current = rng.gen_range(1..=200);
                let visible: Vec<PageNumber> =
                    (current..current + rng.gen_range(0..4)).collect();
                cache.set_focus(current, visible);

                let page = rng.gen_range(1..=200);
                let _ = cache.put(page, payload(rng.gen_range(1..=1024)));

                match bound {
                    CacheBound::Entries(limit) => assert!(cache.len() <= limit),
                    CacheBound::Bytes(limit) => assert!(cache.bytes_used() <= limit),
                }
                if rng.gen_bool(0.1) {
                    cache.remove(rng.gen_range(1..=200));
                }
            }
        }
    }
}
