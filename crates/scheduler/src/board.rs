//! Single-flight task board
//!
//! Tracks at most one live task per page, admits queued tasks in band order up
//! to a concurrency limit, and reconciles completions against cancellation.
//!
//! A cancelled in-flight task keeps its concurrency slot until its completion
//! is reported through [`TaskBoard::finish`]. This keeps the number of
//! outstanding collaborator calls bounded even when the collaborator ignores
//! the cancellation token.

use std::collections::HashMap;
use std::time::Instant;

use folio_cache::PageNumber;

use crate::cancel::CancellationToken;
use crate::priority::{PriorityBand, PriorityQueue, QueueEntry, TaskId};

/// Lifecycle state of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
    /// Waiting for admission
    Queued,
    /// Admitted, completion pending
    InFlight,
    /// Completed successfully
    Done,
    /// Cancelled before completion
    Canceled,
    /// Completed with an error
    Failed,
}

impl TaskState {
    /// `true` for Done, Canceled and Failed.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Done | TaskState::Canceled | TaskState::Failed)
    }
}

/// A unit of work for one page
#[derive(Debug, Clone)]
pub struct Task {
    /// Unique id, never reused within a board
    pub id: TaskId,
    /// Target page
    pub page: PageNumber,
    /// Current band
    pub priority: PriorityBand,
    /// When the task was first requested
    pub created_at: Instant,
    /// Lifecycle state
    pub state: TaskState,
    seq: u64,
    token: CancellationToken,
    parked: bool,
}

impl Task {
    /// Token shared with whoever executes this task.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

/// Result of [`TaskBoard::request`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestOutcome {
    /// A new task was queued
    Enqueued(TaskId),
    /// An existing queued task was moved to a higher band
    Upgraded(TaskId),
    /// A task already exists at an equal or higher band, or is in flight
    AlreadyActive(TaskId),
}

impl RequestOutcome {
    /// Id of the task the request resolved to.
    pub fn task_id(&self) -> TaskId {
        match *self {
            RequestOutcome::Enqueued(id)
            | RequestOutcome::Upgraded(id)
            | RequestOutcome::AlreadyActive(id) => id,
        }
    }
}

/// A task moved from Queued to InFlight
#[derive(Debug, Clone)]
pub struct Admission {
    /// Id to report back through [`TaskBoard::finish`]
    pub id: TaskId,
    pub page: PageNumber,
    /// Band the task was admitted at
    pub priority: PriorityBand,
    /// Token to hand to the collaborator
    pub token: CancellationToken,
}

/// A task removed by cancellation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancellation {
    pub id: TaskId,
    pub page: PageNumber,
    /// The task had been admitted, so a completion is still owed
    pub was_in_flight: bool,
}

/// Result of [`TaskBoard::finish`]
#[derive(Debug, Clone)]
pub enum Finish {
    /// The live task for the page succeeded
    Completed(Task),
    /// The live task for the page failed
    Failed(Task),
    /// The task was cancelled while in flight; its result must be dropped
    Discarded { id: TaskId, page: PageNumber },
    /// No admitted task has this id
    Unknown(TaskId),
}

/// Board counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardStats {
    /// Tasks created by `request`
    pub submitted: u64,
    /// Tasks moved to InFlight
    pub admitted: u64,
    /// Tasks that finished successfully
    pub completed: u64,
    /// Tasks that finished with an error
    pub failed: u64,
    /// Tasks cancelled while queued or in flight
    pub canceled: u64,
    /// Band upgrades of queued tasks
    pub upgraded: u64,
    /// Tasks currently queued
    pub queued: usize,
    /// Admitted tasks whose completion is pending, cancelled ones included
    pub in_flight: usize,
}

impl BoardStats {
    /// Queued plus in flight.
    pub fn pending(&self) -> usize {
        self.queued + self.in_flight
    }
}

/// Band-ordered, single-flight task board
///
/// # Example
///
/// ```
/// use std::time::Instant;
/// use folio_scheduler::{PriorityBand, RequestOutcome, TaskBoard};
///
/// let mut board = TaskBoard::new(1);
/// let now = Instant::now();
///
/// board.request(9, PriorityBand::Idle, now);
/// board.request(4, PriorityBand::Visible, now);
///
/// let admitted = board.admit();
/// assert_eq!(admitted.len(), 1);
/// assert_eq!(admitted[0].page, 4);
///
/// // A second request for a live page never creates a duplicate task
/// assert!(matches!(
///     board.request(4, PriorityBand::Visible, now),
///     RequestOutcome::AlreadyActive(_)
/// ));
/// ```
#[derive(Debug)]
pub struct TaskBoard {
    tasks: HashMap<PageNumber, Task>,
    queue: PriorityQueue,
    occupied: HashMap<TaskId, PageNumber>,
    max_concurrency: usize,
    next_id: TaskId,
    next_seq: u64,
    stats: BoardStats,
}

impl TaskBoard {
    /// Create a board admitting at most `max_concurrency` tasks at once.
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            tasks: HashMap::new(),
            queue: PriorityQueue::default(),
            occupied: HashMap::new(),
            max_concurrency: max_concurrency.max(1),
            next_id: 1,
            next_seq: 0,
            stats: BoardStats::default(),
        }
    }

    /// Request work for `page` at `priority`.
    ///
    /// If a task already exists for the page it is reused; a queued task is
    /// upgraded when `priority` is higher than its current band. In-flight
    /// tasks are never re-queued.
    pub fn request(&mut self, page: PageNumber, priority: PriorityBand, now: Instant) -> RequestOutcome {
        if let Some(task) = self.tasks.get_mut(&page) {
            if task.state == TaskState::Queued && priority > task.priority {
                task.priority = priority;
                self.queue.push(QueueEntry {
                    id: task.id,
                    page,
                    priority,
                    seq: task.seq,
                });
                self.stats.upgraded += 1;
                return RequestOutcome::Upgraded(task.id);
            }
            return RequestOutcome::AlreadyActive(task.id);
        }

        let id = self.next_id;
        self.next_id += 1;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.tasks.insert(
            page,
            Task {
                id,
                page,
                priority,
                created_at: now,
                state: TaskState::Queued,
                seq,
                token: CancellationToken::new(),
                parked: false,
            },
        );
        self.queue.push(QueueEntry { id, page, priority, seq });
        self.stats.submitted += 1;
        RequestOutcome::Enqueued(id)
    }

    /// Move a queued task to `priority`, up or down.
    ///
    /// Returns `false` if the page has no queued task or the band is unchanged.
    /// The task keeps its original submission order within the new band.
    pub fn reprioritize(&mut self, page: PageNumber, priority: PriorityBand) -> bool {
        let Some(task) = self.tasks.get_mut(&page) else {
            return false;
        };
        if task.state != TaskState::Queued || task.priority == priority {
            return false;
        }
        task.priority = priority;
        self.queue.push(QueueEntry {
            id: task.id,
            page,
            priority,
            seq: task.seq,
        });
        true
    }

    /// Admit queued tasks while concurrency allows, best band first.
    pub fn admit(&mut self) -> Vec<Admission> {
        let mut admitted = Vec::new();

        while self.occupied.len() < self.max_concurrency {
            let tasks = &self.tasks;
            let Some(entry) = self.queue.pop_live(|entry| {
                tasks.get(&entry.page).is_some_and(|task| {
                    task.id == entry.id
                        && task.state == TaskState::Queued
                        && !task.parked
                        && task.priority == entry.priority
                })
            }) else {
                break;
            };

            let Some(task) = self.tasks.get_mut(&entry.page) else {
                continue;
            };
            task.state = TaskState::InFlight;
            self.occupied.insert(task.id, task.page);
            self.stats.admitted += 1;
            admitted.push(Admission {
                id: task.id,
                page: task.page,
                priority: task.priority,
                token: task.token.clone(),
            });
        }

        if self.queued_len() == 0 {
            self.queue.clear();
        }

        admitted
    }

    /// Hold the queued task for `page` back from admission.
    ///
    /// A parked task stays Queued and keeps its band, but [`admit`](Self::admit)
    /// skips it until [`unpark_all`](Self::unpark_all). Returns `false` if the
    /// page has no queued task.
    pub fn park(&mut self, page: PageNumber) -> bool {
        match self.tasks.get_mut(&page) {
            Some(task) if task.state == TaskState::Queued => {
                task.parked = true;
                true
            }
            _ => false,
        }
    }

    /// Make every parked task admissible again, in page order.
    pub fn unpark_all(&mut self) -> Vec<PageNumber> {
        let mut pages = Vec::new();
        for task in self.tasks.values_mut().filter(|task| task.parked) {
            task.parked = false;
            self.queue.push(QueueEntry {
                id: task.id,
                page: task.page,
                priority: task.priority,
                seq: task.seq,
            });
            pages.push(task.page);
        }
        pages.sort_unstable();
        pages
    }

    /// `true` if `page` has a parked task.
    pub fn is_parked(&self, page: PageNumber) -> bool {
        self.tasks.get(&page).is_some_and(|task| task.parked)
    }

    /// Cancel the task for `page`, queued or in flight.
    pub fn cancel(&mut self, page: PageNumber) -> Option<Cancellation> {
        let task = self.tasks.remove(&page)?;
        task.token.cancel();
        self.stats.canceled += 1;
        Some(Cancellation {
            id: task.id,
            page,
            was_in_flight: task.state == TaskState::InFlight,
        })
    }

    /// Cancel every task matching `predicate`, in page order.
    pub fn cancel_where<F>(&mut self, predicate: F) -> Vec<Cancellation>
    where
        F: Fn(&Task) -> bool,
    {
        let mut pages: Vec<PageNumber> = self
            .tasks
            .values()
            .filter(|task| predicate(task))
            .map(|task| task.page)
            .collect();
        pages.sort_unstable();

        pages.into_iter().filter_map(|page| self.cancel(page)).collect()
    }

    /// Cancel all tasks.
    pub fn cancel_all(&mut self) -> Vec<Cancellation> {
        let cancelled = self.cancel_where(|_| true);
        self.queue.clear();
        cancelled
    }

    /// Report the completion of an admitted task and release its slot.
    pub fn finish(&mut self, id: TaskId, succeeded: bool) -> Finish {
        let Some(page) = self.occupied.remove(&id) else {
            return Finish::Unknown(id);
        };

        let is_live = self.tasks.get(&page).is_some_and(|task| task.id == id);
        if !is_live {
            return Finish::Discarded { id, page };
        }
        let Some(mut task) = self.tasks.remove(&page) else {
            return Finish::Discarded { id, page };
        };

        if succeeded {
            task.state = TaskState::Done;
            self.stats.completed += 1;
            Finish::Completed(task)
        } else {
            task.state = TaskState::Failed;
            self.stats.failed += 1;
            Finish::Failed(task)
        }
    }

    /// The live task for `page`, if any.
    pub fn task(&self, page: PageNumber) -> Option<&Task> {
        self.tasks.get(&page)
    }

    /// Iterate over live tasks in arbitrary order.
    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// State of the live task for `page`.
    pub fn state(&self, page: PageNumber) -> Option<TaskState> {
        self.tasks.get(&page).map(|task| task.state)
    }

    /// `true` if `page` has a queued or in-flight task.
    pub fn is_active(&self, page: PageNumber) -> bool {
        self.tasks.contains_key(&page)
    }

    /// Number of queued tasks.
    pub fn queued_len(&self) -> usize {
        self.tasks
            .values()
            .filter(|task| task.state == TaskState::Queued)
            .count()
    }

    /// Number of admitted tasks still holding a slot.
    pub fn occupied(&self) -> usize {
        self.occupied.len()
    }

    /// `true` if another task could be admitted now.
    pub fn has_capacity(&self) -> bool {
        self.occupied.len() < self.max_concurrency
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Change the concurrency limit. Lowering it never aborts running tasks.
    pub fn set_max_concurrency(&mut self, max_concurrency: usize) {
        self.max_concurrency = max_concurrency.max(1);
    }

    /// `true` when nothing is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.tasks.is_empty() && self.occupied.is_empty()
    }

    /// Board counters.
    pub fn stats(&self) -> BoardStats {
        let mut stats = self.stats.clone();
        stats.queued = self.queued_len();
        stats.in_flight = self.occupied.len();
        stats
    }
}
