//! Per-crawl shared context
//!
//! One `CrawlContext` is built per `Coordinator` and handed to every worker by `Arc`.
//! It owns both work queues, the termination tracker, the download pool and the
//! pluggable collaborators, plus the flags that drive shutdown.

use crate::config::Config;
use crate::crawler::gate::ConnectionGate;
use crate::crawler::hooks::EventHooks;
use crate::crawler::parser::PageParser;
use crate::crawler::pool::{DownloadPool, PoolSettings, TransferServices};
use crate::crawler::queue::{WorkItem, WorkQueue};
use crate::output::CrawlStats;
use crate::state::{CrawlState, Role, WorkerId, WorkerState};
use crate::url::{Rules, UrlRegistry};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Attempts made by `push` before the caller has to buffer the item
pub const PUSH_ATTEMPTS: u32 = 5;

/// Pause between push attempts
const PUSH_RETRY_DELAY: Duration = Duration::from_millis(50);

pub struct CrawlContext {
    pub config: Arc<Config>,
    /// URLs waiting for a fetcher
    pub fetch_queue: WorkQueue<WorkItem>,
    /// Page bundles waiting for a crawler
    pub crawl_queue: WorkQueue<WorkItem>,
    pub state: CrawlState,
    pub gate: ConnectionGate,
    pub pool: DownloadPool,
    pub stats: Arc<CrawlStats>,
    pub registry: UrlRegistry,
    pub rules: Arc<dyn Rules>,
    pub parser: Arc<dyn PageParser>,
    pub hooks: EventHooks,
    /// Restored URLs that did not fit in the fetch queue yet
    backlog: Mutex<VecDeque<WorkItem>>,
    stop: AtomicBool,
    exit_requested: AtomicBool,
    forced: AtomicBool,
    wake: Notify,
}

impl CrawlContext {
    pub fn new(
        config: Arc<Config>,
        services: TransferServices,
        parser: Arc<dyn PageParser>,
        hooks: EventHooks,
    ) -> Self {
        let queue_size = config.crawler.queue_size;
        Self {
            fetch_queue: WorkQueue::new(queue_size),
            crawl_queue: WorkQueue::new(queue_size),
            state: CrawlState::new(),
            gate: services.gate.clone(),
            stats: services.stats.clone(),
            rules: services.rules.clone(),
            pool: DownloadPool::new(PoolSettings::from_config(&config), services),
            registry: UrlRegistry::new(),
            parser,
            hooks,
            backlog: Mutex::new(VecDeque::new()),
            stop: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            forced: AtomicBool::new(false),
            wake: Notify::new(),
            config,
        }
    }

    /// The queue a role takes work from
    pub fn input_queue(&self, role: Role) -> &WorkQueue<WorkItem> {
        match role {
            Role::Crawler => &self.crawl_queue,
            Role::Fetcher => &self.fetch_queue,
        }
    }

    /// The queue a role hands its results to
    pub fn output_queue(&self, role: Role) -> &WorkQueue<WorkItem> {
        self.input_queue(role.peer())
    }

    /// Single push attempt on behalf of `role`
    ///
    /// With a worker id the push is reported through its state transitions,
    /// otherwise it is counted directly.
    pub fn try_push(
        &self,
        worker: Option<WorkerId>,
        role: Role,
        mut item: WorkItem,
    ) -> Result<(), WorkItem> {
        item.role = role;
        if let Some(id) = worker {
            self.state.set(id, WorkerState::PushingResult);
        }
        self.output_queue(role).try_push(item)?;
        match worker {
            Some(id) => self.state.set(id, WorkerState::PushedResult),
            None => self.state.record_push(role),
        }
        Ok(())
    }

    /// Pushes with up to `PUSH_ATTEMPTS` tries, handing the item back if all fail
    pub async fn push(
        &self,
        worker: Option<WorkerId>,
        role: Role,
        item: WorkItem,
    ) -> Result<(), WorkItem> {
        let mut item = item;
        for attempt in 1..=PUSH_ATTEMPTS {
            item = match self.try_push(worker, role, item) {
                Ok(()) => return Ok(()),
                Err(item) => item,
            };
            if attempt < PUSH_ATTEMPTS && !self.stop_requested() {
                tokio::time::sleep(PUSH_RETRY_DELAY).await;
            }
        }
        Err(item)
    }

    /// Takes the next item for `role`, waiting up to `timeout`
    pub async fn get_url_data(
        &self,
        worker: Option<WorkerId>,
        role: Role,
        timeout: Duration,
    ) -> Option<WorkItem> {
        let item = self.input_queue(role).pop(timeout).await?;
        match worker {
            Some(id) => self.state.set(id, WorkerState::GotData),
            None => self.state.record_get(role),
        }
        Some(item)
    }

    /// Asks the main loop to finish
    ///
    /// A forced end also stops every open connection handle from saving its body.
    pub fn end_loop(&self, forced: bool) {
        if forced {
            self.forced.store(true, Ordering::SeqCst);
            self.gate.block_writes();
        }
        self.exit_requested.store(true, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::SeqCst)
    }

    pub fn is_forced(&self) -> bool {
        self.forced.load(Ordering::SeqCst)
    }

    /// Tells every worker loop to leave at its next check
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Resolves after `end_loop`, or immediately if one was missed
    pub async fn woken(&self) {
        self.wake.notified().await
    }

    pub fn close_queues(&self) {
        self.fetch_queue.close();
        self.crawl_queue.close();
    }

    /// Clears flags and queues left over from a previous crawl
    pub fn prepare_run(&self) {
        self.stop.store(false, Ordering::SeqCst);
        self.exit_requested.store(false, Ordering::SeqCst);
        self.forced.store(false, Ordering::SeqCst);
        self.gate.allow_writes();
        for queue in [&self.fetch_queue, &self.crawl_queue] {
            queue.reopen();
            queue.clear();
        }
        self.lock_backlog().clear();
    }

    fn lock_backlog(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Seeds a crawler-role URL, parking it in the backlog when the queue is full
    pub fn seed(&self, item: WorkItem) {
        let mut backlog = self.lock_backlog();
        if !backlog.is_empty() {
            backlog.push_back(item);
            return;
        }
        if let Err(item) = self.try_push(None, Role::Crawler, item) {
            backlog.push_back(item);
        }
    }

    /// Moves as much of the backlog into the fetch queue as fits
    pub fn feed_backlog(&self) {
        let mut backlog = self.lock_backlog();
        while let Some(item) = backlog.pop_front() {
            if let Err(item) = self.try_push(None, Role::Crawler, item) {
                backlog.push_front(item);
                break;
            }
        }
    }

    pub fn backlog_len(&self) -> usize {
        self.lock_backlog().len()
    }

    /// Takes every backlog item, for session saving
    pub fn take_backlog(&self) -> Vec<WorkItem> {
        self.lock_backlog().drain(..).collect()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::CrawlUrl;

    fn url_item(path: &str) -> WorkItem {
        let url = CrawlUrl::seed(&format!("http://example.com/{}", path)).unwrap();
        WorkItem::url(Arc::new(url), Role::Crawler)
    }

    fn small_config(queue_size: usize) -> Config {
        let mut config = Config::default();
        config.crawler.queue_size = queue_size;
        config
    }

    #[test]
    fn test_queue_direction() {
        let ctx = testing::context(Config::default());
        assert!(std::ptr::eq(ctx.input_queue(Role::Fetcher), &ctx.fetch_queue));
        assert!(std::ptr::eq(ctx.output_queue(Role::Crawler), &ctx.fetch_queue));
        assert!(std::ptr::eq(ctx.input_queue(Role::Crawler), &ctx.crawl_queue));
        assert!(std::ptr::eq(ctx.output_queue(Role::Fetcher), &ctx.crawl_queue));
    }

    #[tokio::test]
    async fn test_external_push_and_get_keep_counters_balanced() {
        let ctx = testing::context(Config::default());

        assert!(ctx.push(None, Role::Crawler, url_item("a")).await.is_ok());
        assert_eq!(ctx.state.counters().crawl_pushes, 1);

        let item = ctx
            .get_url_data(None, Role::Fetcher, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(item.role, Role::Crawler);
        assert!(ctx.state.counters().is_balanced());

        assert!(ctx
            .get_url_data(None, Role::Fetcher, Duration::from_millis(20))
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_worker_push_reports_states() {
        let ctx = testing::context(Config::default());
        let id = WorkerId::new(Role::Crawler, 0);
        ctx.state.register(id, false);

        ctx.push(Some(id), Role::Crawler, url_item("a")).await.unwrap();
        assert_eq!(ctx.state.state_of(id), Some(WorkerState::PushedResult));
        assert_eq!(ctx.state.counters().crawl_pushes, 1);
    }

    #[tokio::test]
    async fn test_push_to_full_queue_hands_item_back() {
        let ctx = testing::context(small_config(1));
        ctx.push(None, Role::Crawler, url_item("a")).await.unwrap();

        let rejected = ctx.push(None, Role::Crawler, url_item("b")).await.unwrap_err();
        assert_eq!(rejected.subject().full_url(), "http://example.com/b");
        assert_eq!(ctx.state.counters().crawl_pushes, 1);
    }

    #[test]
    fn test_backlog_fills_queue_as_it_drains() {
        let ctx = testing::context(small_config(2));
        for path in ["a", "b", "c", "d"] {
            ctx.seed(url_item(path));
        }
        assert_eq!(ctx.fetch_queue.len(), 2);
        assert_eq!(ctx.backlog_len(), 2);

        ctx.fetch_queue.try_pop();
        ctx.feed_backlog();
        assert_eq!(ctx.fetch_queue.len(), 2);
        assert_eq!(ctx.backlog_len(), 1);
        assert_eq!(ctx.state.counters().crawl_pushes, 3);
    }

    #[test]
    fn test_forced_end_blocks_writes() {
        let ctx = testing::context(Config::default());
        ctx.end_loop(false);
        assert!(ctx.exit_requested());
        assert!(!ctx.gate.writes_blocked());

        ctx.end_loop(true);
        assert!(ctx.is_forced());
        assert!(ctx.gate.writes_blocked());

        ctx.prepare_run();
        assert!(!ctx.exit_requested());
        assert!(!ctx.is_forced());
        assert!(!ctx.gate.writes_blocked());
    }

    #[tokio::test]
    async fn test_end_loop_wakes_waiter() {
        let ctx = testing::context(Config::default());
        ctx.end_loop(false);
        // The permit is kept for a waiter that arrives later
        tokio::time::timeout(Duration::from_millis(100), ctx.woken())
            .await
            .unwrap();
    }
}
