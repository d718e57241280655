//! Session statistics snapshot

use folio_cache::{CacheBound, CacheStats, PageNumber, SlotStats};
use folio_scheduler::{FetchStats, RenderStats, ScrollState};
use serde::Serialize;

/// Point-in-time counters for a whole session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    pub cache: CacheSummary,
    pub fetch: FetchSummary,
    pub render: RenderSummary,
    pub slots: SlotSummary,
    pub scroll: ScrollSummary,
    /// Pages with a persistent error, ascending
    pub failed_pages: Vec<PageNumber>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheSummary {
    pub entries: usize,
    pub bytes: usize,
    /// `"entries"` or `"bytes"`
    pub bound_kind: &'static str,
    pub bound: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub overflow_evictions: u64,
}

impl From<CacheStats> for CacheSummary {
    fn from(stats: CacheStats) -> Self {
        let (bound_kind, bound) = match stats.bound {
            CacheBound::Entries(n) => ("entries", n),
            CacheBound::Bytes(n) => ("bytes", n),
        };
        Self {
            entries: stats.entry_count,
            bytes: stats.bytes_used,
            bound_kind,
            bound,
            hits: stats.hits,
            misses: stats.misses,
            hit_rate: stats.hit_rate(),
            evictions: stats.evictions,
            overflow_evictions: stats.overflow_evictions,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchSummary {
    pub submitted: u64,
    pub admitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub canceled: u64,
    pub upgraded: u64,
    pub queued: usize,
    pub in_flight: usize,
    pub retries_scheduled: u64,
    pub retries_dropped: u64,
    pub exhausted: u64,
    pub pending_retries: usize,
}

impl From<FetchStats> for FetchSummary {
    fn from(stats: FetchStats) -> Self {
        Self {
            submitted: stats.board.submitted,
            admitted: stats.board.admitted,
            completed: stats.board.completed,
            failed: stats.board.failed,
            canceled: stats.board.canceled,
            upgraded: stats.board.upgraded,
            queued: stats.board.queued,
            in_flight: stats.board.in_flight,
            retries_scheduled: stats.retries_scheduled,
            retries_dropped: stats.retries_dropped,
            exhausted: stats.exhausted,
            pending_retries: stats.pending_retries,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderSummary {
    pub submitted: u64,
    pub admitted: u64,
    pub rendered: u64,
    pub canceled: u64,
    pub stale_results: u64,
    pub invalidations: u64,
    pub torn_down: u64,
    pub failed_pages: usize,
    pub queued: usize,
    pub in_flight: usize,
}

impl From<RenderStats> for RenderSummary {
    fn from(stats: RenderStats) -> Self {
        Self {
            submitted: stats.board.submitted,
            admitted: stats.board.admitted,
            rendered: stats.rendered,
            canceled: stats.board.canceled,
            stale_results: stats.stale_results,
            invalidations: stats.invalidations,
            torn_down: stats.torn_down,
            failed_pages: stats.failed_pages,
            queued: stats.board.queued,
            in_flight: stats.board.in_flight,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotSummary {
    /// `None` for a pool that grows on demand
    pub pool_size: Option<usize>,
    pub capacity: usize,
    pub occupied: usize,
    pub acquisitions: u64,
    pub reclamations: u64,
    pub deferrals: u64,
    pub releases: u64,
}

impl SlotSummary {
    pub(crate) fn new(stats: SlotStats, pool_size: Option<usize>) -> Self {
        Self {
            pool_size,
            capacity: stats.capacity,
            occupied: stats.occupied,
            acquisitions: stats.acquisitions,
            reclamations: stats.reclamations,
            deferrals: stats.deferrals,
            releases: stats.releases,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScrollSummary {
    pub classification: String,
    pub velocity: f32,
}

impl From<ScrollState> for ScrollSummary {
    fn from(state: ScrollState) -> Self {
        Self {
            classification: state.classification.to_string(),
            velocity: state.velocity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_summary_reports_bound_kind() {
        let stats = CacheStats {
            entry_count: 3,
            bytes_used: 300,
            bound: CacheBound::Bytes(1024),
            hits: 3,
            misses: 1,
            evictions: 2,
            overflow_evictions: 0,
        };
        let summary = CacheSummary::from(stats);
        assert_eq!(summary.bound_kind, "bytes");
        assert_eq!(summary.bound, 1024);
        assert_eq!(summary.hit_rate, 0.75);
    }

    #[test]
    fn test_scroll_summary_serializes() {
        let summary = ScrollSummary::from(ScrollState::default());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["classification"], "idle");
        assert_eq!(json["velocity"], 0.0);
    }
}
