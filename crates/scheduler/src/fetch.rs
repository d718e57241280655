//! Fetch scheduling with retry and backoff
//!
//! Wraps a [`TaskBoard`] for load tasks and adds a per-page attempt counter.
//! A failed fetch is retried after an exponential backoff until the attempt
//! limit is reached; retries only resubmit pages that still have a band when
//! they come due.
//!
//! The attempt count survives cancellation. It is cleared by a successful
//! fetch, by [`FetchScheduler::reset_attempts`], or when a pending retry is
//! dropped.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use folio_cache::PageNumber;

use crate::board::{Admission, BoardStats, Cancellation, Finish, RequestOutcome, Task, TaskBoard};
use crate::priority::{PriorityBand, TaskId};

/// Retry limits for failed fetches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per page before giving up, the first one included
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Delay after the `failures`-th consecutive failure.
    ///
    /// Doubles per failure, starting at `base_delay`, capped at `max_delay`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(5),
        }
    }
}

/// Result of reporting a fetch completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The live task succeeded; the payload should be stored
    Delivered { page: PageNumber },
    /// A retry was scheduled for `due`
    RetryScheduled {
        page: PageNumber,
        attempts: u32,
        due: Instant,
    },
    /// The attempt limit was reached
    Exhausted { page: PageNumber, attempts: u32 },
    /// The task was cancelled in flight; the result must be dropped
    Discarded { page: PageNumber },
    /// No admitted task has this id
    Unknown,
}

#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    priority: PriorityBand,
    due: Instant,
}

/// Fetch counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchStats {
    pub board: BoardStats,
    pub retries_scheduled: u64,
    pub retries_dropped: u64,
    pub exhausted: u64,
    pub pending_retries: usize,
}

/// Load task scheduler
#[derive(Debug)]
pub struct FetchScheduler {
    board: TaskBoard,
    policy: RetryPolicy,
    attempts: HashMap<PageNumber, u32>,
    retries: BTreeMap<PageNumber, PendingRetry>,
    retries_scheduled: u64,
    retries_dropped: u64,
    exhausted: u64,
}

impl FetchScheduler {
    /// Create a scheduler admitting at most `max_concurrency` loads at once.
    pub fn new(max_concurrency: usize, policy: RetryPolicy) -> Self {
        Self {
            board: TaskBoard::new(max_concurrency),
            policy,
            attempts: HashMap::new(),
            retries: BTreeMap::new(),
            retries_scheduled: 0,
            retries_dropped: 0,
            exhausted: 0,
        }
    }

    /// Request a fetch. A pending retry for the page is superseded.
    pub fn request(&mut self, page: PageNumber, priority: PriorityBand, now: Instant) -> RequestOutcome {
        self.retries.remove(&page);
        self.board.request(page, priority, now)
    }

    /// Move a queued load to another band. See [`TaskBoard::reprioritize`].
    pub fn reprioritize(&mut self, page: PageNumber, priority: PriorityBand) -> bool {
        self.board.reprioritize(page, priority)
    }

    /// Hold a queued load back until [`unpark_all`](Self::unpark_all).
    pub fn park(&mut self, page: PageNumber) -> bool {
        self.board.park(page)
    }

    /// Release every parked load.
    pub fn unpark_all(&mut self) -> Vec<PageNumber> {
        self.board.unpark_all()
    }

    /// Admit queued loads up to the concurrency limit.
    pub fn admit(&mut self) -> Vec<Admission> {
        let admitted = self.board.admit();
        for admission in &admitted {
            tracing::debug!(
                target: "folio::fetch",
                page = admission.page,
                task = admission.id,
                band = %admission.priority,
                "fetch admitted"
            );
        }
        admitted
    }

    /// Cancel the task and any pending retry for `page`.
    ///
    /// Dropping a pending retry forgets the attempt count; cancelling a task
    /// keeps it.
    pub fn cancel(&mut self, page: PageNumber) -> Option<Cancellation> {
        if self.retries.remove(&page).is_some() {
            self.attempts.remove(&page);
        }
        self.board.cancel(page)
    }

    /// Cancel every task matching `predicate`. Attempt counts are kept.
    pub fn cancel_where<F>(&mut self, predicate: F) -> Vec<Cancellation>
    where
        F: Fn(&Task) -> bool,
    {
        self.board.cancel_where(predicate)
    }

    /// Cancel every task and drop every pending retry.
    pub fn cancel_all(&mut self) -> Vec<Cancellation> {
        self.retries.clear();
        self.attempts.clear();
        self.board.cancel_all()
    }

    /// Report the completion of an admitted load.
    pub fn complete(&mut self, id: TaskId, succeeded: bool, now: Instant) -> FetchOutcome {
        match self.board.finish(id, succeeded) {
            Finish::Unknown(_) => FetchOutcome::Unknown,
            Finish::Discarded { page, .. } => {
                tracing::trace!(target: "folio::fetch", page, task = id, "stale fetch result dropped");
                FetchOutcome::Discarded { page }
            }
            Finish::Completed(task) => {
                self.attempts.remove(&task.page);
                FetchOutcome::Delivered { page: task.page }
            }
            Finish::Failed(task) => {
                let page = task.page;
                let attempts = self.attempts.entry(page).or_insert(0);
                *attempts += 1;
                let attempts = *attempts;

                if attempts >= self.policy.max_attempts {
                    self.attempts.remove(&page);
                    self.exhausted += 1;
                    tracing::warn!(target: "folio::fetch", page, attempts, "fetch attempts exhausted");
                    return FetchOutcome::Exhausted { page, attempts };
                }

                let due = now + self.policy.delay_for(attempts);
                self.retries.insert(
                    page,
                    PendingRetry {
                        priority: task.priority,
                        due,
                    },
                );
                self.retries_scheduled += 1;
                tracing::debug!(target: "folio::fetch", page, attempts, "fetch retry scheduled");
                FetchOutcome::RetryScheduled { page, attempts, due }
            }
        }
    }

    /// Release an admitted load without recording an attempt.
    ///
    /// Used when the fetcher gave up on its own; the page is left without a
    /// task so the next reconciliation can request it again. Returns the page
    /// if the task was still live.
    pub fn abandon(&mut self, id: TaskId) -> Option<PageNumber> {
        match self.board.finish(id, false) {
            Finish::Failed(task) => Some(task.page),
            _ => None,
        }
    }

    /// Resubmit retries that are due at `now`.
    ///
    /// `band_of` gives the page's current band. Pages without one are dropped
    /// and their attempt count forgotten. Returns the resubmitted pages.
    pub fn resubmit_due<F>(&mut self, now: Instant, band_of: F) -> Vec<(PageNumber, PriorityBand)>
    where
        F: Fn(PageNumber) -> Option<PriorityBand>,
    {
        let due: Vec<(PageNumber, PendingRetry)> = self
            .retries
            .iter()
            .filter(|(_, retry)| retry.due <= now)
            .map(|(page, retry)| (*page, *retry))
            .collect();

        let mut resubmitted = Vec::new();
        for (page, retry) in due {
            self.retries.remove(&page);
            match band_of(page) {
                Some(band) => {
                    tracing::debug!(
                        target: "folio::fetch",
                        page,
                        band = %band,
                        was = %retry.priority,
                        "retrying fetch"
                    );
                    self.board.request(page, band, now);
                    resubmitted.push((page, band));
                }
                None => {
                    self.attempts.remove(&page);
                    self.retries_dropped += 1;
                    tracing::debug!(target: "folio::fetch", page, "retry dropped, page out of window");
                }
            }
        }
        resubmitted
    }

    /// Earliest pending retry deadline.
    pub fn next_retry_due(&self) -> Option<Instant> {
        self.retries.values().map(|retry| retry.due).min()
    }

    /// `true` if a retry is waiting for its backoff to expire.
    pub fn retry_pending(&self, page: PageNumber) -> bool {
        self.retries.contains_key(&page)
    }

    /// Consecutive failures recorded for `page`.
    pub fn attempts(&self, page: PageNumber) -> u32 {
        self.attempts.get(&page).copied().unwrap_or(0)
    }

    /// Forget the attempt count for `page`.
    pub fn reset_attempts(&mut self, page: PageNumber) {
        self.attempts.remove(&page);
    }

    /// The underlying task board.
    pub fn board(&self) -> &TaskBoard {
        &self.board
    }

    /// Change the concurrency limit. Running loads are never aborted.
    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.board.set_max_concurrency(max_concurrency);
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn stats(&self) -> FetchStats {
        FetchStats {
            board: self.board.stats(),
            retries_scheduled: self.retries_scheduled,
            retries_dropped: self.retries_dropped,
            exhausted: self.exhausted,
            pending_retries: self.retries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(250),
        }
    }

    fn fail_once(scheduler: &mut FetchScheduler, page: PageNumber, now: Instant) -> FetchOutcome {
        scheduler.request(page, PriorityBand::Visible, now);
        let admitted = scheduler.admit();
        let admission = admitted.iter().find(|a| a.page == page).unwrap();
        scheduler.complete(admission.id, false, now)
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(250));
        assert_eq!(policy.delay_for(40), Duration::from_millis(250));
    }

    #[test]
    fn test_delivered_resets_attempts() {
        let mut scheduler = FetchScheduler::new(2, policy());
        let now = Instant::now();

        fail_once(&mut scheduler, 5, now);
        assert_eq!(scheduler.attempts(5), 1);

        scheduler.request(5, PriorityBand::Visible, now);
        let id = scheduler.admit()[0].id;
        assert_eq!(scheduler.complete(id, true, now), FetchOutcome::Delivered { page: 5 });
        assert_eq!(scheduler.attempts(5), 0);
    }

    #[test]
    fn test_retry_then_exhausted() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let start = Instant::now();

        let first = fail_once(&mut scheduler, 7, start);
        let due = start + Duration::from_millis(100);
        assert_eq!(
            first,
            FetchOutcome::RetryScheduled {
                page: 7,
                attempts: 1,
                due
            }
        );
        assert_eq!(scheduler.next_retry_due(), Some(due));

        // Nothing is resubmitted before the deadline
        assert!(scheduler
            .resubmit_due(start, |_| Some(PriorityBand::Visible))
            .is_empty());
        assert_eq!(
            scheduler.resubmit_due(due, |_| Some(PriorityBand::Visible)),
            vec![(7, PriorityBand::Visible)]
        );

        let id = scheduler.admit()[0].id;
        let second = scheduler.complete(id, false, due);
        assert!(matches!(second, FetchOutcome::RetryScheduled { attempts: 2, .. }));

        let later = due + Duration::from_secs(1);
        scheduler.resubmit_due(later, |_| Some(PriorityBand::Visible));
        let id = scheduler.admit()[0].id;
        assert_eq!(
            scheduler.complete(id, false, later),
            FetchOutcome::Exhausted { page: 7, attempts: 3 }
        );
        assert_eq!(scheduler.stats().exhausted, 1);
        assert!(scheduler.next_retry_due().is_none());
    }

    #[test]
    fn test_retry_dropped_when_page_has_no_band() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let now = Instant::now();

        fail_once(&mut scheduler, 3, now);
        let later = now + Duration::from_secs(1);
        assert!(scheduler.resubmit_due(later, |_| None).is_empty());
        assert_eq!(scheduler.attempts(3), 0);
        assert!(!scheduler.board().is_active(3));
        assert_eq!(scheduler.stats().retries_dropped, 1);
    }

    #[test]
    fn test_explicit_request_supersedes_retry() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let now = Instant::now();

        fail_once(&mut scheduler, 3, now);
        assert!(scheduler.retry_pending(3));

        scheduler.request(3, PriorityBand::Visible, now);
        assert!(!scheduler.retry_pending(3));
        assert_eq!(scheduler.attempts(3), 1);
    }

    #[test]
    fn test_abandon_records_no_attempt() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let now = Instant::now();

        scheduler.request(4, PriorityBand::Visible, now);
        let id = scheduler.admit()[0].id;
        assert_eq!(scheduler.abandon(id), Some(4));
        assert_eq!(scheduler.attempts(4), 0);
        assert!(!scheduler.retry_pending(4));
        assert!(!scheduler.board().is_active(4));
        assert_eq!(scheduler.abandon(id), None);
    }

    #[test]
    fn test_cancel_drops_retry() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let now = Instant::now();

        fail_once(&mut scheduler, 9, now);
        assert!(scheduler.cancel(9).is_none());
        assert!(!scheduler.retry_pending(9));
        assert_eq!(scheduler.attempts(9), 0);
    }

    #[test]
    fn test_cancelled_task_keeps_attempt_count() {
        let mut scheduler = FetchScheduler::new(1, policy());
        let now = Instant::now();

        fail_once(&mut scheduler, 4, now);
        fail_once(&mut scheduler, 4, now);
        assert_eq!(scheduler.attempts(4), 2);

        // Scrolled away and back: the retried load is cancelled in flight
        scheduler.request(4, PriorityBand::Visible, now);
        let id = scheduler.admit()[0].id;
        let cancelled = scheduler.cancel_where(|task| task.page == 4);
        assert_eq!(cancelled.len(), 1);
        assert!(matches!(scheduler.complete(id, false, now), FetchOutcome::Discarded { page: 4 }));
        assert_eq!(scheduler.attempts(4), 2);

        // The next failure is the last one allowed
        assert_eq!(
            fail_once(&mut scheduler, 4, now),
            FetchOutcome::Exhausted { page: 4, attempts: 3 }
        );
    }
}
