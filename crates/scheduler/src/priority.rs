//! Priority bands and the admission queue
//!
//! Work is ordered by band (visible first), then by submission order within a
//! band. The queue is a max-heap with lazy invalidation: upgrading or
//! cancelling a task leaves its old heap entry in place, and stale entries are
//! skipped when popped.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::fmt;

use folio_cache::PageNumber;

/// Scheduling priority band
///
/// Higher variants are admitted first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PriorityBand {
    /// Background prefetch when scrolling has stopped
    Idle = 0,

    /// Immediate neighbour of the current page
    Neighbor = 1,

    /// Within the prefetch window in the scroll direction
    Directional = 2,

    /// Currently intersecting the viewport
    Visible = 3,
}

impl PriorityBand {
    /// All bands, highest first.
    pub const ALL: [PriorityBand; 4] = [
        PriorityBand::Visible,
        PriorityBand::Directional,
        PriorityBand::Neighbor,
        PriorityBand::Idle,
    ];

    /// Lowercase name of the band.
    pub fn as_str(self) -> &'static str {
        match self {
            PriorityBand::Idle => "idle",
            PriorityBand::Neighbor => "neighbor",
            PriorityBand::Directional => "directional",
            PriorityBand::Visible => "visible",
        }
    }
}

impl fmt::Display for PriorityBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unique task identifier
pub type TaskId = u64;

/// A heap entry pointing at a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueEntry {
    pub(crate) id: TaskId,
    pub(crate) page: PageNumber,
    pub(crate) priority: PriorityBand,
    pub(crate) seq: u64,
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Higher band first; within a band the earlier submission wins, which
        // is reversed here because BinaryHeap is a max heap.
        match self.priority.cmp(&other.priority) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            other => other,
        }
    }
}

/// Band-ordered queue with lazy invalidation.
#[derive(Debug, Default)]
pub(crate) struct PriorityQueue {
    heap: BinaryHeap<QueueEntry>,
}

impl PriorityQueue {
    pub(crate) fn push(&mut self, entry: QueueEntry) {
        self.heap.push(entry);
    }

    /// Pop the best entry accepted by `is_live`, discarding stale ones.
    pub(crate) fn pop_live<F>(&mut self, mut is_live: F) -> Option<QueueEntry>
    where
        F: FnMut(&QueueEntry) -> bool,
    {
        while let Some(entry) = self.heap.pop() {
            if is_live(&entry) {
                return Some(entry);
            }
        }
        None
    }

    /// Number of heap entries, stale ones included.
    #[cfg(test)]
    pub(crate) fn raw_len(&self) -> usize {
        self.heap.len()
    }

    pub(crate) fn clear(&mut self) {
        self.heap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(id: TaskId, priority: PriorityBand, seq: u64) -> QueueEntry {
        QueueEntry {
            id,
            page: id as PageNumber,
            priority,
            seq,
        }
    }

    #[test]
    fn test_band_ordering() {
        assert!(PriorityBand::Visible > PriorityBand::Directional);
        assert!(PriorityBand::Directional > PriorityBand::Neighbor);
        assert!(PriorityBand::Neighbor > PriorityBand::Idle);
        assert_eq!(PriorityBand::ALL[0], PriorityBand::Visible);
    }

    #[test]
    fn test_queue_orders_by_band_then_fifo() {
        let mut queue = PriorityQueue::default();
        queue.push(entry(1, PriorityBand::Idle, 0));
        queue.push(entry(2, PriorityBand::Visible, 1));
        queue.push(entry(3, PriorityBand::Neighbor, 2));
        queue.push(entry(4, PriorityBand::Visible, 3));

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop_live(|_| true))
            .map(|entry| entry.id)
            .collect();
        assert_eq!(order, vec![2, 4, 3, 1]);
    }

    #[test]
    fn test_pop_live_skips_stale_entries() {
        let mut queue = PriorityQueue::default();
        queue.push(entry(1, PriorityBand::Visible, 0));
        queue.push(entry(2, PriorityBand::Idle, 1));

        let popped = queue.pop_live(|entry| entry.id != 1).unwrap();
        assert_eq!(popped.id, 2);
        assert_eq!(queue.raw_len(), 0);
    }

    #[test]
    fn test_display() {
        assert_eq!(PriorityBand::Directional.to_string(), "directional");
    }
}
