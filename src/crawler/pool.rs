//! Download worker pool
//!
//! A fixed number of tokio tasks pull `DownloadTask`s from a bounded priority queue
//! and run them through the `Fetcher`, each transfer holding a `ConnectionHandle`.
//!
//! # Submission
//!
//! - `submit` is fire-and-forget (images, archives and other non-parsed resources)
//! - `fetch` waits for the outcome on a oneshot channel (pages and stylesheets)
//!
//! A URL is claimed when it is submitted and released when its outcome is known, so
//! a second submission while the first is queued or running is a duplicate.
//!
//! # Hung transfers
//!
//! Each slot records what it is working on and since when. `end_hanging_workers`
//! aborts any worker stuck past the transfer timeout, puts its task back on the
//! queue (reply channel included) and starts a fresh worker in the slot.

use crate::config::Config;
use crate::crawler::fetcher::{FetchError, FetchOptions, FetchResult, Fetcher};
use crate::crawler::gate::{ConnectionGate, ConnectionHandle};
use crate::crawler::multipart::{MultipartTracker, PartProgress, PartSpec};
use crate::crawler::queue::WorkQueue;
use crate::output::{CrawlStats, FileStatus};
use crate::storage::{CacheRecord, CacheStore, PageSink};
use crate::url::{Rules, UrlId, UrlRef};
use sha2::{Digest, Sha256};
use std::cmp::Ordering as CmpOrdering;
use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;

/// How long an idle worker waits on the queue before re-checking for shutdown
const WORKER_POLL: Duration = Duration::from_millis(250);

/// Extra queue slots beyond one per worker
const QUEUE_HEADROOM: usize = 5;

pub(crate) type Reply = oneshot::Sender<DownloadOutcome>;

/// Final outcome of a pool download
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Body downloaded (and saved, unless the sink discards)
    Completed {
        body: Vec<u8>,
        checksum: String,
        saved_to: Option<PathBuf>,
    },
    /// The cached copy is current
    NotModified,
    Failed {
        error: FetchError,
        fatal: bool,
        http_status: Option<u16>,
    },
    /// The URL was already queued or in flight
    Duplicate,
    /// Downloaded after writes were blocked; nothing was saved
    Discarded,
    /// The pool shut down before the transfer ran
    Cancelled,
}

impl DownloadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }
}

/// Pool tuning, derived from `[pool]`
#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub size: usize,
    pub num_parts: usize,
    pub transfer_timeout: Duration,
    pub part_retries: u32,
    /// How long a transfer waits for a connection slot
    pub connect_wait: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &Config) -> Self {
        let size = if config.crawler.single_threaded {
            1
        } else {
            config.pool.thread_pool_size.max(1)
        };
        Self {
            size,
            num_parts: config.pool.num_parts.max(1),
            transfer_timeout: Duration::from_secs(config.pool.transfer_timeout_secs),
            part_retries: config.pool.part_retries,
            connect_wait: Duration::from_secs(config.network.socket_timeout_secs.max(1)),
        }
    }
}

/// Collaborators every transfer needs
#[derive(Clone)]
pub struct TransferServices {
    pub fetcher: Arc<Fetcher>,
    pub gate: ConnectionGate,
    pub rules: Arc<dyn Rules>,
    pub cache: Arc<dyn CacheStore>,
    pub sink: PageSink,
    pub stats: Arc<CrawlStats>,
}

/// A queued transfer
#[derive(Debug)]
pub struct DownloadTask {
    url: UrlRef,
    priority: i32,
    part: Option<PartSpec>,
    reply: Option<Reply>,
}

impl DownloadTask {
    fn part_index(&self) -> usize {
        self.part.map(|p| p.part_index).unwrap_or(0)
    }
}

// Reverse comparison so lower priority values (and earlier parts) come first
impl Ord for DownloadTask {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.part_index().cmp(&self.part_index()))
    }
}

impl PartialOrd for DownloadTask {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for DownloadTask {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for DownloadTask {}

#[derive(Debug)]
struct InFlight {
    task: DownloadTask,
    started: Instant,
}

#[derive(Debug)]
struct WorkerSlot {
    index: usize,
    current: Mutex<Option<InFlight>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerSlot {
    fn current(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

enum Transfer {
    Done(DownloadOutcome),
    Split(u64, CacheRecord),
    Part(Result<Vec<u8>, FetchError>),
}

struct PoolShared {
    settings: PoolSettings,
    services: TransferServices,
    queue: WorkQueue<DownloadTask>,
    overflow: Mutex<VecDeque<DownloadTask>>,
    claims: Mutex<HashSet<UrlId>>,
    tracker: MultipartTracker,
    slots: Vec<Arc<WorkerSlot>>,
    /// Tasks submitted and not yet finished, parts included
    outstanding: AtomicUsize,
    stopping: AtomicBool,
    idle: Notify,
}

/// Fixed-size pool of download workers
pub struct DownloadPool {
    shared: Arc<PoolShared>,
}

impl DownloadPool {
    pub fn new(settings: PoolSettings, services: TransferServices) -> Self {
        let slots = (0..settings.size.max(1))
            .map(|index| {
                Arc::new(WorkerSlot {
                    index,
                    current: Mutex::new(None),
                    handle: Mutex::new(None),
                })
            })
            .collect();
        let part_retries = settings.part_retries;
        let queue = WorkQueue::new(settings.size + QUEUE_HEADROOM);

        Self {
            shared: Arc::new(PoolShared {
                settings,
                services,
                queue,
                overflow: Mutex::new(VecDeque::new()),
                claims: Mutex::new(HashSet::new()),
                tracker: MultipartTracker::new(part_retries),
                slots,
                outstanding: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                idle: Notify::new(),
            }),
        }
    }

    /// Spawns a worker in every empty slot
    pub fn start(&self) {
        self.shared.stopping.store(false, Ordering::SeqCst);
        self.shared.queue.reopen();
        for slot in &self.shared.slots {
            let running = slot
                .handle()
                .as_ref()
                .map(|h| !h.is_finished())
                .unwrap_or(false);
            if !running {
                spawn_worker(&self.shared, slot);
            }
        }
        tracing::debug!("Started {} download workers", self.shared.slots.len());
    }

    pub fn size(&self) -> usize {
        self.shared.slots.len()
    }

    /// Queues a download without waiting for it; false if it is a duplicate
    pub fn submit(&self, url: UrlRef) -> bool {
        self.shared.submit(url, None).is_ok()
    }

    /// Queues a download and waits for its outcome
    pub async fn fetch(&self, url: UrlRef) -> DownloadOutcome {
        let (tx, rx) = oneshot::channel();
        match self.shared.submit(url, Some(tx)) {
            Ok(()) => rx.await.unwrap_or(DownloadOutcome::Cancelled),
            Err(outcome) => outcome,
        }
    }

    /// Number of workers with a transfer in progress
    pub fn busy_count(&self) -> usize {
        self.shared
            .slots
            .iter()
            .filter(|s| s.current().is_some())
            .count()
    }

    /// Tasks submitted and not yet finished
    pub fn pending(&self) -> usize {
        self.shared.outstanding.load(Ordering::SeqCst)
    }

    pub fn is_idle(&self) -> bool {
        self.pending() == 0
    }

    /// Waits until the pool has nothing left to do, or `timeout` passes
    ///
    /// Hung transfers are ended on every poll. Returns true if the pool went idle.
    pub async fn wait(&self, poll: Duration, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let idle = self.shared.idle.notified();
            tokio::pin!(idle);
            idle.as_mut().enable();

            self.end_hanging_workers();
            if self.is_idle() {
                return true;
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                tracing::warn!(
                    "Download pool still has {} tasks after {:?}",
                    self.pending(),
                    timeout
                );
                return false;
            }
            let _ = tokio::time::timeout(poll.min(deadline - now), idle).await;
        }
    }

    /// Aborts workers stuck past the transfer timeout and requeues their tasks
    ///
    /// Returns the number of workers ended.
    pub fn end_hanging_workers(&self) -> usize {
        let shared = &self.shared;
        let limit = shared.settings.transfer_timeout;
        let mut ended = 0;

        for slot in &shared.slots {
            let hung = {
                let mut current = slot.current();
                match current.as_ref() {
                    Some(flight) if flight.started.elapsed() >= limit => current.take(),
                    _ => None,
                }
            };
            let Some(flight) = hung else {
                continue;
            };

            if let Some(handle) = slot.handle().take() {
                handle.abort();
            }
            tracing::warn!(
                "Download worker {} stuck on {} for {:?}, restarting it",
                slot.index,
                flight.task.url,
                flight.started.elapsed()
            );
            shared.push_task(flight.task);
            if !shared.stopping.load(Ordering::SeqCst) {
                spawn_worker(shared, slot);
            }
            ended += 1;
        }
        ended
    }

    /// Lets workers finish their current transfer, then stops them
    ///
    /// Tasks that never started get a `Cancelled` reply.
    pub async fn stop_all(&self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::SeqCst);
        shared.queue.close();

        for slot in &shared.slots {
            let handle = slot.handle().take();
            if let Some(mut handle) = handle {
                if tokio::time::timeout(shared.settings.transfer_timeout, &mut handle)
                    .await
                    .is_err()
                {
                    tracing::warn!("Download worker {} did not stop in time", slot.index);
                    handle.abort();
                    let _ = handle.await;
                }
            }
        }
        shared.cancel_pending();
    }

    /// Aborts every worker immediately
    ///
    /// When this returns no transfer holds a connection handle.
    pub async fn kill_all(&self) {
        let shared = &self.shared;
        shared.stopping.store(true, Ordering::SeqCst);
        shared.queue.close();

        let handles: Vec<JoinHandle<()>> = shared
            .slots
            .iter()
            .filter_map(|slot| slot.handle().take())
            .collect();
        for handle in &handles {
            handle.abort();
        }
        for handle in handles {
            let _ = handle.await;
        }
        shared.cancel_pending();
    }
}

impl Drop for DownloadPool {
    fn drop(&mut self) {
        for slot in &self.shared.slots {
            if let Some(handle) = slot.handle().take() {
                handle.abort();
            }
        }
    }
}

fn spawn_worker(shared: &Arc<PoolShared>, slot: &Arc<WorkerSlot>) {
    let handle = tokio::spawn(run_worker(shared.clone(), slot.clone()));
    *slot.handle() = Some(handle);
}

async fn run_worker(shared: Arc<PoolShared>, slot: Arc<WorkerSlot>) {
    while !shared.stopping.load(Ordering::SeqCst) {
        shared.flush_overflow();
        let Some(task) = shared.queue.pop(WORKER_POLL).await else {
            if shared.queue.is_closed() {
                break;
            }
            continue;
        };

        let url = task.url.clone();
        let part = task.part;
        *slot.current() = Some(InFlight {
            task,
            started: Instant::now(),
        });

        let transfer = shared.transfer(&url, part).await;

        // Gone means hang detection took the task and this worker is being replaced
        let Some(flight) = slot.current().take() else {
            return;
        };
        shared.finish(flight.task, transfer).await;
    }
}

impl PoolShared {
    fn lock_claims(&self) -> MutexGuard<'_, HashSet<UrlId>> {
        self.claims.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_overflow(&self) -> MutexGuard<'_, VecDeque<DownloadTask>> {
        self.overflow.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn submit(&self, url: UrlRef, reply: Option<Reply>) -> Result<(), DownloadOutcome> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(DownloadOutcome::Cancelled);
        }
        if !self.lock_claims().insert(url.id()) {
            tracing::debug!("{} is already being downloaded", url);
            self.services.stats.add_duplicate();
            return Err(DownloadOutcome::Duplicate);
        }
        self.enqueue(DownloadTask {
            priority: url.priority(),
            url,
            part: None,
            reply,
        });
        Ok(())
    }

    fn enqueue(&self, task: DownloadTask) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
        self.push_task(task);
    }

    fn push_task(&self, task: DownloadTask) {
        if let Err(task) = self.queue.try_push(task) {
            self.lock_overflow().push_back(task);
        }
    }

    fn flush_overflow(&self) {
        let mut overflow = self.lock_overflow();
        while let Some(task) = overflow.pop_front() {
            if let Err(task) = self.queue.try_push(task) {
                overflow.push_front(task);
                break;
            }
        }
    }

    /// Marks one task finished
    fn settle(&self) {
        let _ = self
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        self.idle.notify_waiters();
    }

    fn complete(&self, id: UrlId, reply: Option<Reply>, outcome: DownloadOutcome) {
        self.lock_claims().remove(&id);
        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }

    async fn transfer(&self, url: &UrlRef, part: Option<PartSpec>) -> Transfer {
        let wait = self.settings.connect_wait;
        let Some(handle) = self.services.gate.acquire_timeout(wait).await else {
            tracing::debug!("No connection slot for {} within {:?}", url, wait);
            // Parts go back through the tracker's retry budget
            return match part {
                Some(_) => Transfer::Part(Err(FetchError::NoConnection)),
                None => {
                    self.services.stats.update_file_stats(FileStatus::Failed);
                    Transfer::Done(DownloadOutcome::Failed {
                        error: FetchError::NoConnection,
                        fatal: false,
                        http_status: None,
                    })
                }
            };
        };

        if let Some(part) = part {
            return Transfer::Part(self.fetch_part(url, part).await);
        }

        if let Some((total, validators)) = self.multipart_length(url).await {
            return Transfer::Split(total, validators);
        }
        Transfer::Done(self.fetch_whole(url, &handle).await)
    }

    /// Returns the resource length and its cache validators when it should be
    /// fetched in parts
    async fn multipart_length(&self, url: &UrlRef) -> Option<(u64, CacheRecord)> {
        let parts = self.settings.num_parts;
        if parts <= 1 || url.is_parseable() {
            return None;
        }
        let info = self.services.fetcher.head_info(url).await?;
        match info.content_length {
            Some(len) if info.accepts_ranges && len >= parts as u64 => Some((
                len,
                CacheRecord {
                    etag: info.etag,
                    last_modified: info.last_modified,
                    checksum: None,
                },
            )),
            _ => None,
        }
    }

    async fn fetch_whole(&self, url: &UrlRef, handle: &ConnectionHandle) -> DownloadOutcome {
        let services = &self.services;
        let (last_modified, etag) = services.cache.last_modified_and_etag(url.full_url());
        let options = FetchOptions::conditional(last_modified, etag);

        match services.fetcher.fetch(url, &options).await {
            FetchResult::Downloaded(download) => {
                if handle.writes_blocked() {
                    tracing::debug!("Discarding {} after shutdown began", url);
                    return DownloadOutcome::Discarded;
                }
                let saved_to = match services.sink.save(url, &download.body).await {
                    Ok(path) => path,
                    Err(e) => {
                        tracing::warn!("Could not save {}: {}", url, e);
                        services.stats.update_file_stats(FileStatus::Failed);
                        return DownloadOutcome::Failed {
                            error: FetchError::Storage(e.to_string()),
                            fatal: false,
                            http_status: Some(download.status),
                        };
                    }
                };
                services.stats.update_file_stats(FileStatus::Saved);
                if let Err(e) = services.cache.update(url.full_url(), &download.cache_record()) {
                    tracing::warn!("Could not update cache for {}: {}", url, e);
                }
                DownloadOutcome::Completed {
                    checksum: download.checksum,
                    body: download.body,
                    saved_to,
                }
            }
            FetchResult::NotModified { .. } => {
                tracing::debug!("{} is up to date", url);
                services.stats.update_file_stats(FileStatus::UpToDate);
                DownloadOutcome::NotModified
            }
            FetchResult::Failed {
                error,
                fatal,
                http_status,
            } => {
                services.stats.update_file_stats(FileStatus::Failed);
                if fatal {
                    services.rules.add_to_filter(url);
                }
                DownloadOutcome::Failed {
                    error,
                    fatal,
                    http_status,
                }
            }
        }
    }

    async fn fetch_part(&self, url: &UrlRef, part: PartSpec) -> Result<Vec<u8>, FetchError> {
        let options = FetchOptions::range(part.start, part.end);
        match self.services.fetcher.fetch(url, &options).await {
            FetchResult::Downloaded(download) => Ok(download.body),
            FetchResult::NotModified { .. } => Err(FetchError::Status(304)),
            FetchResult::Failed { error, .. } => Err(error),
        }
    }

    async fn finish(&self, task: DownloadTask, transfer: Transfer) {
        let DownloadTask {
            url,
            priority,
            part,
            reply,
        } = task;

        match transfer {
            Transfer::Done(outcome) => self.complete(url.id(), reply, outcome),
            Transfer::Split(total, validators) => {
                let specs = self.tracker.register(
                    url.clone(),
                    total,
                    self.settings.num_parts,
                    validators,
                    reply,
                );
                tracing::debug!(
                    "Fetching {} ({} bytes) in {} parts",
                    url,
                    total,
                    specs.len()
                );
                for spec in specs {
                    self.enqueue(DownloadTask {
                        url: url.clone(),
                        priority,
                        part: Some(spec),
                        reply: None,
                    });
                }
            }
            Transfer::Part(result) => {
                if let Some(spec) = part {
                    self.record_part(url, priority, spec, result).await;
                }
            }
        }
        self.settle();
    }

    async fn record_part(
        &self,
        url: UrlRef,
        priority: i32,
        spec: PartSpec,
        result: Result<Vec<u8>, FetchError>,
    ) {
        match self.tracker.record(spec, result) {
            PartProgress::Waiting | PartProgress::Unknown => {}
            PartProgress::Retry(spec) => {
                self.services.stats.add_rescheduled_part();
                self.enqueue(DownloadTask {
                    url,
                    priority,
                    part: Some(spec),
                    reply: None,
                });
            }
            PartProgress::Assembled {
                url,
                body,
                validators,
                reply,
            } => {
                let outcome = self.store_assembled(&url, body, validators).await;
                self.complete(url.id(), reply, outcome);
            }
            PartProgress::Failed { url, error, reply } => {
                tracing::info!("Multipart download of {} failed: {}", url, error);
                self.services.stats.update_file_stats(FileStatus::Failed);
                self.complete(
                    url.id(),
                    reply,
                    DownloadOutcome::Failed {
                        error,
                        fatal: false,
                        http_status: None,
                    },
                );
            }
        }
    }

    async fn store_assembled(
        &self,
        url: &UrlRef,
        body: Vec<u8>,
        validators: CacheRecord,
    ) -> DownloadOutcome {
        let services = &self.services;
        if services.gate.writes_blocked() {
            return DownloadOutcome::Discarded;
        }

        let checksum = hex::encode(Sha256::digest(&body));
        let saved_to = match services.sink.save(url, &body).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!("Could not save {}: {}", url, e);
                services.stats.update_file_stats(FileStatus::Failed);
                return DownloadOutcome::Failed {
                    error: FetchError::Storage(e.to_string()),
                    fatal: false,
                    http_status: None,
                };
            }
        };
        services.stats.update_file_stats(FileStatus::Saved);

        let record = CacheRecord {
            checksum: Some(checksum.clone()),
            ..validators
        };
        if let Err(e) = services.cache.update(url.full_url(), &record) {
            tracing::warn!("Could not update cache for {}: {}", url, e);
        }
        DownloadOutcome::Completed {
            body,
            checksum,
            saved_to,
        }
    }

    /// Replies `Cancelled` to everything still waiting and resets the bookkeeping
    fn cancel_pending(&self) {
        let mut cancelled = 0;
        let mut cancel = |reply: Option<Reply>| {
            cancelled += 1;
            if let Some(reply) = reply {
                let _ = reply.send(DownloadOutcome::Cancelled);
            }
        };

        for task in self.queue.drain() {
            cancel(task.reply);
        }
        for task in self.lock_overflow().drain(..) {
            cancel(task.reply);
        }
        for slot in &self.slots {
            if let Some(flight) = slot.current().take() {
                cancel(flight.task.reply);
            }
        }
        for (_, reply) in self.tracker.abandon_all() {
            cancel(reply);
        }

        if cancelled > 0 {
            tracing::info!("Cancelled {} unfinished downloads", cancelled);
        }
        self.lock_claims().clear();
        self.outstanding.store(0, Ordering::SeqCst);
        self.idle.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::hooks::EventHooks;
    use crate::storage::MemoryCache;
    use crate::url::{CrawlUrl, RuleSet};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Harness {
        pool: DownloadPool,
        gate: ConnectionGate,
        stats: Arc<CrawlStats>,
        cache: Arc<MemoryCache>,
        rules: Arc<RuleSet>,
    }

    fn harness(config: &Config, sink: PageSink) -> Harness {
        let stats = Arc::new(CrawlStats::new());
        let gate = ConnectionGate::new(config.network.max_connections);
        let cache = Arc::new(MemoryCache::new());
        let rules = Arc::new(RuleSet::new(&config.rules));
        let fetcher = Arc::new(
            Fetcher::new(config, gate.clone(), stats.clone(), EventHooks::default()).unwrap(),
        );
        let services = TransferServices {
            fetcher,
            gate: gate.clone(),
            rules: rules.clone(),
            cache: cache.clone(),
            sink,
            stats: stats.clone(),
        };
        let pool = DownloadPool::new(PoolSettings::from_config(config), services);
        pool.start();
        Harness {
            pool,
            gate,
            stats,
            cache,
            rules,
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.network.retries = 0;
        config.network.retry_delay_ms = 1;
        config.pool.thread_pool_size = 3;
        config
    }

    fn url(server: &MockServer, p: &str) -> UrlRef {
        Arc::new(CrawlUrl::seed(&format!("{}{}", server.uri(), p)).unwrap())
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_fetch_saves_and_updates_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/page.html"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("etag", "\"v1\"")
                    .set_body_string("<html></html>"),
            )
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let h = harness(&test_config(), PageSink::disk(dir.path()));
        let target = url(&server, "/page.html");

        let outcome = h.pool.fetch(target.clone()).await;
        let DownloadOutcome::Completed { body, saved_to, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(body, b"<html></html>");
        let saved = saved_to.unwrap();
        assert_eq!(std::fs::read(&saved).unwrap(), b"<html></html>");

        let (_, etag) = h.cache.last_modified_and_etag(target.full_url());
        assert_eq!(etag.as_deref(), Some("\"v1\""));
        assert_eq!(h.stats.files_saved(), 1);
        assert!(h.pool.wait(Duration::from_millis(20), Duration::from_secs(2)).await);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_cached_validators_give_not_modified() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .and(header("if-none-match", "\"cached\""))
            .respond_with(ResponseTemplate::new(304))
            .mount(&server)
            .await;

        let h = harness(&test_config(), PageSink::Discard);
        let target = url(&server, "/cached.html");
        h.cache
            .update(
                target.full_url(),
                &CacheRecord {
                    etag: Some("\"cached\"".to_string()),
                    ..CacheRecord::default()
                },
            )
            .unwrap();

        assert!(matches!(
            h.pool.fetch(target).await,
            DownloadOutcome::NotModified
        ));
        assert_eq!(h.stats.snapshot().up_to_date, 1);
        assert_eq!(h.stats.files_saved(), 0);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_fatal_failure_feeds_negative_cache() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let h = harness(&test_config(), PageSink::Discard);
        let target = url(&server, "/missing.html");

        let outcome = h.pool.fetch(target.clone()).await;
        assert!(matches!(
            outcome,
            DownloadOutcome::Failed {
                fatal: true,
                http_status: Some(404),
                ..
            }
        ));
        assert!(h.rules.violates(&target));
        assert_eq!(h.stats.snapshot().failed, 1);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_submission_is_suppressed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("slow")
                    .set_delay(Duration::from_millis(300)),
            )
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&test_config(), PageSink::Discard);
        let target = url(&server, "/slow.png");

        assert!(h.pool.submit(target.clone()));
        assert!(!h.pool.submit(target.clone()));
        assert!(matches!(
            h.pool.fetch(target.clone()).await,
            DownloadOutcome::Duplicate
        ));
        assert_eq!(h.stats.snapshot().duplicates_skipped, 2);

        assert!(h.pool.wait(Duration::from_millis(20), Duration::from_secs(5)).await);
        assert_eq!(h.stats.files_saved(), 1);

        // Released once finished
        assert!(h.pool.submit(target));
        h.pool.stop_all().await;
    }

    async fn mount_ranged(server: &MockServer, p: &str, body: &[u8], parts: usize) {
        Mock::given(method("HEAD"))
            .and(path(p))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("accept-ranges", "bytes")
                    .insert_header("etag", "\"archive-v1\"")
                    .insert_header("last-modified", "Mon, 01 Jan 2024 00:00:00 GMT")
                    .set_body_bytes(body.to_vec()),
            )
            .mount(server)
            .await;
        for spec in crate::crawler::multipart::split_ranges(UrlId::from_u64(0), body.len() as u64, parts)
        {
            let slice = body[spec.start as usize..=spec.end as usize].to_vec();
            Mock::given(method("GET"))
                .and(path(p))
                .and(header("range", format!("bytes={}-{}", spec.start, spec.end).as_str()))
                .respond_with(ResponseTemplate::new(206).set_body_bytes(slice))
                .mount(server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path(p))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_multipart_matches_single_download() {
        let server = MockServer::start().await;
        let body = payload(1003);
        mount_ranged(&server, "/archive.bin", &body, 4).await;

        let single = harness(&test_config(), PageSink::Discard);
        let DownloadOutcome::Completed {
            body: whole,
            checksum: whole_sum,
            ..
        } = single.pool.fetch(url(&server, "/archive.bin")).await
        else {
            panic!("single download failed");
        };
        single.pool.stop_all().await;

        let mut config = test_config();
        config.pool.num_parts = 4;
        let split = harness(&config, PageSink::Discard);
        let DownloadOutcome::Completed {
            body: joined,
            checksum: joined_sum,
            ..
        } = split.pool.fetch(url(&server, "/archive.bin")).await
        else {
            panic!("multipart download failed");
        };

        assert_eq!(whole, body);
        assert_eq!(joined, whole);
        assert_eq!(joined_sum, whole_sum);
        assert_eq!(split.stats.files_saved(), 1);
        assert_eq!(split.stats.snapshot().parts_rescheduled, 0);

        // The joined file keeps the validators from the HEAD request
        let record = split
            .cache
            .lookup(url(&server, "/archive.bin").full_url())
            .unwrap()
            .unwrap();
        assert_eq!(record.etag.as_deref(), Some("\"archive-v1\""));
        assert_eq!(
            record.last_modified.as_deref(),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
        assert_eq!(record.checksum, Some(joined_sum));
        split.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_short_part_is_rescheduled() {
        let server = MockServer::start().await;
        let body = payload(100);
        // A truncated answer for the second part, served once
        Mock::given(method("GET"))
            .and(path("/video.mp4"))
            .and(header("range", "bytes=50-99"))
            .respond_with(ResponseTemplate::new(206).set_body_bytes(body[50..60].to_vec()))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_ranged(&server, "/video.mp4", &body, 2).await;

        let mut config = test_config();
        config.pool.num_parts = 2;
        let h = harness(&config, PageSink::Discard);

        let outcome = h.pool.fetch(url(&server, "/video.mp4")).await;
        assert!(matches!(outcome, DownloadOutcome::Completed { body: ref b, .. } if *b == body));
        assert_eq!(h.stats.snapshot().parts_rescheduled, 1);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_hung_transfer_is_requeued() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_secs(10)),
            )
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("prompt"))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.pool.transfer_timeout_secs = 1;
        let h = Arc::new(harness(&config, PageSink::Discard));
        let target = url(&server, "/stuck.html");

        let waiter = {
            let h = h.clone();
            tokio::spawn(async move { h.pool.fetch(target).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!h.pool.is_idle());
        assert!(h.pool.wait(Duration::from_millis(100), Duration::from_secs(8)).await);

        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Completed { body: ref b, .. } if b == b"prompt"));
        assert_eq!(h.gate.count(), 0);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_kill_all_releases_connections() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
            .mount(&server)
            .await;

        let h = Arc::new(harness(&test_config(), PageSink::Discard));
        let waiter = {
            let h = h.clone();
            let target = url(&server, "/forever.html");
            tokio::spawn(async move { h.pool.fetch(target).await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(h.gate.count(), 1);
        assert_eq!(h.pool.busy_count(), 1);

        h.pool.kill_all().await;
        assert_eq!(h.gate.count(), 0);
        assert!(h.pool.is_idle());
        assert!(matches!(waiter.await.unwrap(), DownloadOutcome::Cancelled));
    }

    #[tokio::test]
    async fn test_blocked_writes_discard_body() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let h = harness(&test_config(), PageSink::disk(dir.path()));
        h.gate.block_writes();

        let outcome = h.pool.fetch(url(&server, "/late.html")).await;
        assert!(matches!(outcome, DownloadOutcome::Discarded));
        assert_eq!(h.stats.files_saved(), 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_saturated_gate_gives_no_connection() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("data"))
            .mount(&server)
            .await;

        let mut config = test_config();
        config.network.max_connections = 1;
        config.network.socket_timeout_secs = 1;
        let h = harness(&config, PageSink::Discard);
        let target = url(&server, "/busy.html");

        let held = h.gate.try_acquire().unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), h.pool.fetch(target.clone()))
            .await
            .expect("transfer must give up waiting for a slot");
        assert!(matches!(
            outcome,
            DownloadOutcome::Failed {
                error: FetchError::NoConnection,
                fatal: false,
                ..
            }
        ));
        assert_eq!(h.stats.snapshot().failed, 1);
        assert!(!h.rules.violates(&target));
        assert!(server.received_requests().await.unwrap_or_default().is_empty());

        drop(held);
        assert!(h.pool.fetch(target).await.is_completed());
        assert_eq!(h.gate.count(), 0);
        h.pool.stop_all().await;
    }

    #[tokio::test]
    async fn test_stop_all_cancels_queued_tasks() {
        let h = harness(&test_config(), PageSink::Discard);
        h.pool.stop_all().await;

        let target = Arc::new(CrawlUrl::seed("http://127.0.0.1:9/never.html").unwrap());
        assert!(matches!(
            h.pool.fetch(target).await,
            DownloadOutcome::Cancelled
        ));
    }
}
