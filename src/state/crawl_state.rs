//! Crawl termination state machine
//!
//! Every worker reports its state transitions here. Queue emptiness alone cannot tell
//! whether a crawl is finished, because an item may be in flight between the two roles
//! while both queues look empty. `CrawlState` therefore pairs worker liveness with
//! per-role push/get counters: the crawl is over only when every worker is waiting
//! *and* everything each role pushed has been taken by the other.

use crate::state::{Role, WorkerId, WorkerState};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::futures::Notified;
use tokio::sync::Notify;

/// Default length of the post-resume grace window
pub const SUSPEND_WINDOW: Duration = Duration::from_secs(5);

/// Abort reason reported when a role has no live workers left
pub const THREAD_REDUCTION_REASON: &str = "Fatal thread reduction, stopping program";

/// Push/get accounting for both roles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CrawlCounters {
    /// Bundles pushed by fetchers into the crawl queue
    pub fetch_pushes: u64,
    /// URLs pushed by crawlers (and the seed) into the fetch queue
    pub crawl_pushes: u64,
    /// URLs taken by fetchers
    pub fetch_gets: u64,
    /// Bundles taken by crawlers
    pub crawl_gets: u64,
    pub live_crawlers: usize,
    pub live_fetchers: usize,
    /// Completed crawler cycles (`Sleeping` reports)
    pub crawler_cycles: u64,
    /// Completed fetcher cycles
    pub fetcher_cycles: u64,
}

impl CrawlCounters {
    /// True when every pushed item has been taken by the peer role
    pub fn is_balanced(&self) -> bool {
        self.fetch_pushes == self.crawl_gets && self.crawl_pushes == self.fetch_gets
    }

    fn live(&self, role: Role) -> usize {
        match role {
            Role::Crawler => self.live_crawlers,
            Role::Fetcher => self.live_fetchers,
        }
    }

    fn live_mut(&mut self, role: Role) -> &mut usize {
        match role {
            Role::Crawler => &mut self.live_crawlers,
            Role::Fetcher => &mut self.live_fetchers,
        }
    }

    fn count_push(&mut self, role: Role) {
        match role {
            Role::Crawler => self.crawl_pushes += 1,
            Role::Fetcher => self.fetch_pushes += 1,
        }
    }

    fn count_get(&mut self, role: Role) {
        match role {
            Role::Crawler => self.crawl_gets += 1,
            Role::Fetcher => self.fetch_gets += 1,
        }
    }

    fn count_cycle(&mut self, role: Role) {
        match role {
            Role::Crawler => self.crawler_cycles += 1,
            Role::Fetcher => self.fetcher_cycles += 1,
        }
    }
}

#[derive(Debug, Clone)]
struct WorkerRecord {
    state: WorkerState,
    last_transition: Instant,
    resuming: bool,
}

#[derive(Debug, Default)]
struct Inner {
    workers: HashMap<WorkerId, WorkerRecord>,
    counters: CrawlCounters,
    suspended_at: Option<Instant>,
    abort_reason: Option<String>,
}

/// Shared termination and health tracker for one crawl
#[derive(Debug)]
pub struct CrawlState {
    inner: Mutex<Inner>,
    changed: Notify,
    suspend_window: Duration,
}

impl Default for CrawlState {
    fn default() -> Self {
        Self::new()
    }
}

impl CrawlState {
    pub fn new() -> Self {
        Self::with_suspend_window(SUSPEND_WINDOW)
    }

    /// Creates a tracker with a custom suspension grace window
    pub fn with_suspend_window(suspend_window: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            changed: Notify::new(),
            suspend_window,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Adds a worker record in the `Idle` state and counts it as live
    pub fn register(&self, id: WorkerId, resuming: bool) {
        let mut inner = self.lock();
        let previous = inner.workers.insert(
            id,
            WorkerRecord {
                state: WorkerState::Idle,
                last_transition: Instant::now(),
                resuming,
            },
        );
        if previous.is_none() {
            *inner.counters.live_mut(id.role) += 1;
        }
    }

    /// Records a state transition and updates the counters it implies
    pub fn set(&self, id: WorkerId, state: WorkerState) {
        {
            let mut inner = self.lock();
            let Some(record) = inner.workers.get_mut(&id) else {
                tracing::trace!(worker = %id, %state, "state report from unregistered worker");
                return;
            };

            record.state = state;
            record.last_transition = Instant::now();
            let resuming = record.resuming;

            match state {
                WorkerState::Started if resuming => {
                    inner.suspended_at = None;
                }
                WorkerState::GotData => inner.counters.count_get(id.role),
                WorkerState::PushedResult => inner.counters.count_push(id.role),
                WorkerState::Sleeping => inner.counters.count_cycle(id.role),
                WorkerState::Stopped => {
                    inner.workers.remove(&id);
                }
                WorkerState::Died => {
                    inner.workers.remove(&id);
                    let live = inner.counters.live_mut(id.role);
                    *live = live.saturating_sub(1);
                    tracing::warn!(worker = %id, remaining = *live, "worker died");
                }
                _ => {}
            }
        }
        self.changed.notify_waiters();
    }

    /// Counts a push made outside a worker loop (seeding, external API)
    pub fn record_push(&self, role: Role) {
        self.lock().counters.count_push(role);
        self.changed.notify_waiters();
    }

    /// Counts a get made outside a worker loop
    pub fn record_get(&self, role: Role) {
        self.lock().counters.count_get(role);
        self.changed.notify_waiters();
    }

    /// Returns the last state a worker reported, if it is still registered
    pub fn state_of(&self, id: WorkerId) -> Option<WorkerState> {
        self.lock().workers.get(&id).map(|r| r.state)
    }

    /// Returns how long ago a worker last reported
    pub fn last_transition(&self, id: WorkerId) -> Option<Duration> {
        self.lock()
            .workers
            .get(&id)
            .map(|r| r.last_transition.elapsed())
    }

    /// Returns true when the crawl has run out of work
    ///
    /// Always false while suspended. True immediately if either role has no live
    /// workers, with the abort reason set. Otherwise every worker must be waiting
    /// (or gone) and the push/get counters must balance.
    pub fn end_state(&self) -> bool {
        let mut inner = self.lock();

        if let Some(since) = inner.suspended_at {
            if since.elapsed() < self.suspend_window {
                return false;
            }
            inner.suspended_at = None;
        }

        if inner.counters.live(Role::Crawler) == 0 || inner.counters.live(Role::Fetcher) == 0 {
            if inner.abort_reason.is_none() {
                inner.abort_reason = Some(THREAD_REDUCTION_REASON.to_string());
            }
            return true;
        }

        inner.workers.values().all(|r| r.state.is_quiescent()) && inner.counters.is_balanced()
    }

    /// Returns true once every worker has settled during shutdown
    ///
    /// Counter balance is not required; a forced shutdown abandons in-flight work.
    pub fn exit_state(&self) -> bool {
        let inner = self.lock();

        if inner.counters.live(Role::Crawler) == 0 || inner.counters.live(Role::Fetcher) == 0 {
            return true;
        }

        inner.workers.values().all(|r| r.state.is_settled())
    }

    /// Starts the grace window during which `end_state` is always false
    pub fn suspend(&self) {
        self.lock().suspended_at = Some(Instant::now());
    }

    pub fn unsuspend(&self) {
        self.lock().suspended_at = None;
        self.changed.notify_waiters();
    }

    pub fn is_suspended(&self) -> bool {
        self.lock()
            .suspended_at
            .map(|since| since.elapsed() < self.suspend_window)
            .unwrap_or(false)
    }

    pub fn abort_reason(&self) -> Option<String> {
        self.lock().abort_reason.clone()
    }

    pub fn counters(&self) -> CrawlCounters {
        self.lock().counters
    }

    /// Number of registered workers
    pub fn worker_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Forgets all workers and counters, ready for a new crawl
    pub fn reset(&self) {
        *self.lock() = Inner::default();
    }

    /// Resolves on the next state transition
    pub fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }
}
