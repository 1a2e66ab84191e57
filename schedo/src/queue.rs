//! The priority queue set shared by the submitters, the scheduler and the worker pool.
//!
//! There is one FIFO queue per [`Priority`]. Jobs scheduled for a retry wait in a min-heap
//! keyed by the instant they become ready and are promoted into their FIFO queue once that
//! instant has passed, so within a class jobs are ordered by the time they became ready.
//!
//! Dequeued jobs are not forgotten: they move into a lease table owned by the dequeuing worker
//! until the worker acknowledges the outcome. Leases whose owner stops sending heartbeats are
//! handed to the reaper, see [`PriorityQueueSet::orphaned`].
use std::{
    cmp::Ordering,
    collections::{BinaryHeap, VecDeque},
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use fxhash::FxHashMap;
use tokio::{
    sync::Notify,
    time::{sleep_until, Instant},
};
use tokio_util::sync::CancellationToken;

use crate::{
    job::{JobId, Priority},
    worker::WorkerId,
};

/// Roughly thirty years, used in place of deadlines that would overflow an [`Instant`].
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

pub(crate) fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// How dequeues are shared between the priority classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fairness {
    /// Every `High` job is dequeued before any `Normal` job.
    Strict,
    /// While both classes have ready jobs, every `every`-th dequeue is taken from `Normal`.
    Floor { every: u32 },
}

impl Default for Fairness {
    fn default() -> Self {
        Self::Floor { every: 5 }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Delayed {
    ready_at: Instant,
    seq: u64,
    priority: Priority,
    id: JobId,
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so the BinaryHeap pops the earliest entry first.
        other
            .ready_at
            .cmp(&self.ready_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Debug)]
struct Lease {
    owner: WorkerId,
    priority: Priority,
    heartbeat: Instant,
    hard_time_limit: Duration,
    settling: bool,
}

#[derive(Default)]
struct QueueState {
    ready: [VecDeque<JobId>; 2],
    delayed: BinaryHeap<Delayed>,
    leases: FxHashMap<JobId, Lease>,
    seq: u64,
    high_streak: u32,
}

impl QueueState {
    fn promote(&mut self, now: Instant) {
        while self
            .delayed
            .peek()
            .is_some_and(|entry| entry.ready_at <= now)
        {
            if let Some(entry) = self.delayed.pop() {
                self.ready[entry.priority.index()].push_back(entry.id);
            }
        }
    }

    fn pop_ready(&mut self, fairness: Fairness) -> Option<(JobId, Priority)> {
        let high_ready = !self.ready[Priority::High.index()].is_empty();
        let normal_ready = !self.ready[Priority::Normal.index()].is_empty();
        let priority = match (high_ready, normal_ready) {
            (false, false) => return None,
            (true, false) => Priority::High,
            (false, true) => Priority::Normal,
            (true, true) => match fairness {
                Fairness::Floor { every } if self.high_streak.saturating_add(1) >= every => {
                    Priority::Normal
                }
                _ => Priority::High,
            },
        };

        if priority == Priority::High && normal_ready {
            self.high_streak = self.high_streak.saturating_add(1);
        } else {
            self.high_streak = 0;
        }

        self.ready[priority.index()]
            .pop_front()
            .map(|id| (id, priority))
    }

    fn owned_lease(&mut self, id: JobId, owner: WorkerId) -> Option<&mut Lease> {
        self.leases.get_mut(&id).filter(|lease| lease.owner == owner)
    }
}

/// A collection of FIFO queues, one per [`Priority`], safe for concurrent producers and
/// consumers.
pub struct PriorityQueueSet {
    state: Mutex<QueueState>,
    notify: Notify,
    fairness: Fairness,
    claim_timeout: Duration,
}

impl PriorityQueueSet {
    /// `claim_timeout` bounds how long a dequeued job may go without a heartbeat before its
    /// owner has recorded the job's own hard time limit.
    pub fn new(fairness: Fairness, claim_timeout: Duration) -> Self {
        Self {
            state: Default::default(),
            notify: Notify::new(),
            fairness,
            claim_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        // No code path panics while holding the lock, the state is always consistent.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make `id` ready for dequeue at the back of its priority class.
    pub fn enqueue(&self, priority: Priority, id: JobId) {
        {
            let mut state = self.lock();
            state.promote(Instant::now());
            state.ready[priority.index()].push_back(id);
        }
        self.notify.notify_one();
    }

    /// Make `id` ready for dequeue once `delay` has elapsed.
    pub fn enqueue_after(&self, priority: Priority, id: JobId, delay: Duration) {
        {
            let mut state = self.lock();
            state.seq += 1;
            let seq = state.seq;
            state.delayed.push(Delayed {
                ready_at: deadline(Instant::now(), delay),
                seq,
                priority,
                id,
            });
        }
        // Every idle worker recomputes the instant it next needs to wake up.
        self.notify.notify_waiters();
    }

    /// Wait for the next ready job and lease it to `owner`.
    ///
    /// Returns `None` once `shutdown` is cancelled.
    pub async fn dequeue_blocking(
        &self,
        owner: WorkerId,
        shutdown: &CancellationToken,
    ) -> Option<JobId> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if shutdown.is_cancelled() {
                return None;
            }

            let next_ready_at = {
                let mut state = self.lock();
                let now = Instant::now();
                state.promote(now);
                if let Some((id, priority)) = state.pop_ready(self.fairness) {
                    state.leases.insert(
                        id,
                        Lease {
                            owner,
                            priority,
                            heartbeat: now,
                            hard_time_limit: self.claim_timeout,
                            settling: false,
                        },
                    );
                    return Some(id);
                }
                state.delayed.peek().map(|entry| entry.ready_at)
            };

            let next_ready = async {
                match next_ready_at {
                    Some(instant) => sleep_until(instant).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return None,
                _ = &mut notified => {},
                _ = next_ready => {},
            }
        }
    }

    /// The number of ready jobs of the given priority.
    pub fn len(&self, priority: Priority) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state.ready[priority.index()].len()
    }

    /// Whether no job is ready, waiting for a retry or leased.
    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.ready.iter().all(VecDeque::is_empty)
            && state.delayed.is_empty()
            && state.leases.is_empty()
    }

    /// The number of jobs waiting for their retry delay to elapse.
    pub fn delayed_len(&self) -> usize {
        let mut state = self.lock();
        state.promote(Instant::now());
        state.delayed.len()
    }

    /// The number of dequeued jobs not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.lock().leases.len()
    }

    /// Refresh the heartbeat of a lease, returning whether `owner` still holds it.
    pub(crate) fn touch(&self, id: JobId, owner: WorkerId) -> bool {
        match self.lock().owned_lease(id, owner) {
            Some(lease) => {
                lease.heartbeat = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Refresh the heartbeat and record the job's hard time limit once it is known.
    pub(crate) fn extend_lease(&self, id: JobId, owner: WorkerId, hard_time_limit: Duration) {
        if let Some(lease) = self.lock().owned_lease(id, owner) {
            lease.heartbeat = Instant::now();
            lease.hard_time_limit = hard_time_limit;
        }
    }

    /// Reserve the right to write the outcome of a leased job.
    ///
    /// Exactly one of the owner and the reaper wins; the loser must not touch the job.
    pub(crate) fn begin_settle(&self, id: JobId, owner: WorkerId) -> bool {
        match self.lock().owned_lease(id, owner) {
            Some(lease) if !lease.settling => {
                lease.settling = true;
                true
            }
            _ => false,
        }
    }

    /// Give up a settlement whose write failed so the reaper can retry it later.
    pub(crate) fn abandon_settle(&self, id: JobId, owner: WorkerId) {
        if let Some(lease) = self.lock().owned_lease(id, owner) {
            lease.settling = false;
        }
    }

    /// Drop the lease, the job is finished with.
    pub(crate) fn ack(&self, id: JobId, owner: WorkerId) {
        let mut state = self.lock();
        if state.owned_lease(id, owner).is_some() {
            state.leases.remove(&id);
        }
    }

    /// Drop the lease and make the job ready again after `delay`.
    pub(crate) fn ack_and_retry(&self, id: JobId, owner: WorkerId, delay: Duration) {
        let priority = {
            let mut state = self.lock();
            if state.owned_lease(id, owner).is_none() {
                return;
            }
            state.leases.remove(&id).map(|lease| lease.priority)
        };
        if let Some(priority) = priority {
            self.enqueue_after(priority, id, delay);
        }
    }

    /// Drop the lease and put the job straight back at the end of its ready queue.
    pub(crate) fn release(&self, id: JobId, owner: WorkerId) {
        let priority = {
            let mut state = self.lock();
            if state.owned_lease(id, owner).is_none() {
                return;
            }
            state.leases.remove(&id).map(|lease| lease.priority)
        };
        if let Some(priority) = priority {
            self.enqueue(priority, id);
        }
    }

    /// Claim every lease whose owner has been silent for longer than the job's hard time limit.
    ///
    /// The returned leases are marked as settling, so each orphan is handed out only once.
    pub(crate) fn orphaned(&self, now: Instant) -> Vec<(JobId, WorkerId)> {
        self.lock()
            .leases
            .iter_mut()
            .filter(|(_, lease)| {
                !lease.settling && now.saturating_duration_since(lease.heartbeat) > lease.hard_time_limit
            })
            .map(|(id, lease)| {
                lease.settling = true;
                (*id, lease.owner)
            })
            .collect()
    }
}
