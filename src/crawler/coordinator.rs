//! Crawl coordinator - main crawl orchestration logic
//!
//! The coordinator owns the `CrawlContext` and drives one crawl at a time:
//! - Seeding the fetch queue (fresh, or from a saved session)
//! - Spawning supervised fetcher and crawler workers
//! - Watching `CrawlState` until the crawl runs dry or is asked to stop
//! - Draining the download pool and shutting workers down, gracefully or not
//! - Saving the session after a forced stop and reporting the outcome

use crate::config::Config;
use crate::crawler::context::CrawlContext;
use crate::crawler::controller::CrawlController;
use crate::crawler::fetcher::{build_http_client, Fetcher};
use crate::crawler::hooks::EventHooks;
use crate::crawler::parser::{HtmlParser, PageParser};
use crate::crawler::pool::TransferServices;
use crate::crawler::queue::{Payload, WorkItem};
use crate::crawler::worker::{CrawlWorker, Step};
use crate::output::{CrawlReport, CrawlStats, StatsSnapshot};
use crate::state::{Role, WorkerId, WorkerState};
use crate::storage::{
    open_store, CacheStore, FrontierEntry, MemoryCache, PageSink, RunStatus, SessionSnapshot,
    SessionStore, SqliteStore, StorageError,
};
use crate::url::{CrawlUrl, RuleSet, Rules, UrlId, UrlRef};
use crate::{HarvestError, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::{AbortHandle, JoinHandle};

/// How often the main loop re-checks the end state without a wake-up
const MAIN_LOOP_TICK: Duration = Duration::from_millis(500);

/// How long a stopping worker gets to return before it is aborted
const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const PROGRESS_INTERVAL: Duration = Duration::from_secs(10);

/// A spawned worker: the abort handle of its loop and the supervisor watching it
struct WorkerTask {
    id: WorkerId,
    abort: AbortHandle,
    supervisor: JoinHandle<()>,
}

/// Builder for a `Coordinator` with replaceable collaborators
pub struct CoordinatorBuilder {
    config: Config,
    config_hash: String,
    rules: Option<Arc<dyn Rules>>,
    parser: Option<Arc<dyn PageParser>>,
    cache: Option<Arc<dyn CacheStore>>,
    session: Option<Arc<dyn SessionStore>>,
    sink: Option<PageSink>,
    hooks: EventHooks,
    client: Option<reqwest::Client>,
}

impl CoordinatorBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            config_hash: String::new(),
            rules: None,
            parser: None,
            cache: None,
            session: None,
            sink: None,
            hooks: EventHooks::default(),
            client: None,
        }
    }

    /// Hash recorded with each run in the database
    pub fn config_hash(mut self, hash: impl Into<String>) -> Self {
        self.config_hash = hash.into();
        self
    }

    pub fn rules(mut self, rules: Arc<dyn Rules>) -> Self {
        self.rules = Some(rules);
        self
    }

    pub fn parser(mut self, parser: Arc<dyn PageParser>) -> Self {
        self.parser = Some(parser);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn session(mut self, session: Arc<dyn SessionStore>) -> Self {
        self.session = Some(session);
        self
    }

    pub fn sink(mut self, sink: PageSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn hooks(mut self, hooks: EventHooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn http_client(mut self, client: reqwest::Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Builds the coordinator
    ///
    /// Without an injected cache or session store, the SQLite database named by
    /// `output.database-path` backs both; an empty path keeps the cache in memory
    /// and disables session saving.
    pub fn build(self) -> Result<Coordinator> {
        let Self {
            config,
            config_hash,
            rules,
            parser,
            cache,
            session,
            sink,
            hooks,
            client,
        } = self;

        let store = if (cache.is_none() || session.is_none())
            && !config.output.database_path.is_empty()
        {
            let store = Arc::new(open_store(Path::new(&config.output.database_path))?);
            tracing::debug!("Opened database {}", config.output.database_path);
            Some(store)
        } else {
            None
        };

        let cache: Arc<dyn CacheStore> = match (cache, &store) {
            (Some(cache), _) => cache,
            (None, Some(store)) => store.clone() as Arc<dyn CacheStore>,
            (None, None) => Arc::new(MemoryCache::new()),
        };
        let session: Option<Arc<dyn SessionStore>> = match (session, &store) {
            (Some(session), _) => Some(session),
            (None, Some(store)) => Some(store.clone() as Arc<dyn SessionStore>),
            (None, None) => None,
        };
        let sink = sink.unwrap_or_else(|| {
            if config.output.save_files {
                PageSink::disk(&config.output.project_dir)
            } else {
                PageSink::Discard
            }
        });

        let config = Arc::new(config);
        let stats = Arc::new(CrawlStats::new());
        let gate = crate::crawler::gate::ConnectionGate::new(config.network.max_connections);
        let client = match client {
            Some(client) => client,
            None => build_http_client(&config.network)?,
        };
        let fetcher = Fetcher::with_client(client, &config, gate.clone(), stats.clone(), hooks.clone());

        let services = TransferServices {
            fetcher: Arc::new(fetcher),
            gate,
            rules: rules.unwrap_or_else(|| Arc::new(RuleSet::new(&config.rules))),
            cache,
            sink,
            stats,
        };
        let parser = parser.unwrap_or_else(|| Arc::new(HtmlParser));
        let ctx = Arc::new(CrawlContext::new(config.clone(), services, parser, hooks));

        Ok(Coordinator {
            config,
            config_hash,
            ctx,
            session,
            runs: store,
            seed: None,
        })
    }
}

/// Main crawler coordinator structure
pub struct Coordinator {
    config: Arc<Config>,
    config_hash: String,
    ctx: Arc<CrawlContext>,
    session: Option<Arc<dyn SessionStore>>,
    runs: Option<Arc<SqliteStore>>,
    seed: Option<UrlRef>,
}

impl Coordinator {
    /// Creates a coordinator with the default collaborators
    pub fn new(config: Config) -> Result<Self> {
        CoordinatorBuilder::new(config).build()
    }

    pub fn builder(config: Config) -> CoordinatorBuilder {
        CoordinatorBuilder::new(config)
    }

    /// Shared context, for stopping the crawl from another task
    pub fn context(&self) -> &Arc<CrawlContext> {
        &self.ctx
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Prepares a fresh crawl from `seed`
    ///
    /// The seed is normalized, registered as seen and counted as the first link.
    pub fn configure(&mut self, seed: &str) -> Result<()> {
        let url = CrawlUrl::seed(seed)?;
        let ctx = &self.ctx;

        ctx.state.reset();
        ctx.registry.clear();
        ctx.stats.reset();
        ctx.prepare_run();

        ctx.rules.anchor(&url);
        ctx.registry.insert(&url);
        ctx.stats.add_link();

        tracing::info!("Configured crawl from {}", url);
        self.seed = Some(Arc::new(url));
        Ok(())
    }

    /// Runs a crawl from the configured seed
    pub async fn crawl(&mut self) -> Result<CrawlReport> {
        let seed = self.seed.clone().ok_or(HarvestError::NotConfigured)?;

        self.ctx.prepare_run();
        self.ctx.seed(WorkItem::url(seed.clone(), Role::Crawler));
        tracing::info!("Starting crawl of {}", seed);

        self.run(&seed, false).await
    }

    /// Resumes the crawl saved by the last forced stop
    pub async fn restart(&mut self) -> Result<CrawlReport> {
        let session = self
            .session
            .clone()
            .ok_or(HarvestError::Storage(StorageError::NoSession))?;
        let snapshot = session.load_session()?;

        self.configure(&snapshot.seed)?;
        let seed = self.seed.clone().ok_or(HarvestError::NotConfigured)?;
        let ctx = &self.ctx;

        ctx.registry
            .restore(snapshot.seen.iter().map(|&raw| UrlId::from_u64(raw)));
        ctx.stats.restore(&snapshot.stats);

        let mut restored = 0;
        for entry in &snapshot.frontier {
            match CrawlUrl::restored(&entry.url, entry.generation, entry.priority) {
                Ok(url) => {
                    ctx.seed(WorkItem::url(Arc::new(url), Role::Crawler));
                    restored += 1;
                }
                Err(e) => tracing::warn!("Skipping saved URL {}: {}", entry.url, e),
            }
        }
        tracing::info!(
            "Resuming crawl of {} with {} pending URLs and {} known",
            seed,
            restored,
            snapshot.seen.len()
        );

        ctx.state.suspend();
        self.run(&seed, true).await
    }

    /// Pushes an item on behalf of `role`; false if the queue stayed full
    pub fn push(&self, item: WorkItem, role: Role) -> bool {
        self.ctx.try_push(None, role, item).is_ok()
    }

    /// Takes the next item meant for `role`
    pub async fn get_url_data(&self, role: Role, timeout: Duration) -> Option<WorkItem> {
        self.ctx.get_url_data(None, role, timeout).await
    }

    /// Asks the running crawl to end
    pub fn end_loop(&self, forced: bool) {
        self.ctx.end_loop(forced);
    }

    /// Waits for the download pool to go idle; true if it did
    pub async fn wait(&self, poll: Duration, timeout: Duration) -> bool {
        self.ctx.pool.wait(poll, timeout).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    async fn run(&mut self, seed: &UrlRef, resuming: bool) -> Result<CrawlReport> {
        let started = Instant::now();
        let run_id = self.begin_run(seed);

        self.ctx.pool.start();
        let controller = self
            .config
            .limits
            .any()
            .then(|| CrawlController::spawn(self.ctx.clone(), started));

        let workers = if self.config.crawler.single_threaded {
            self.run_single(resuming).await;
            Vec::new()
        } else {
            let workers = self.spawn_workers(resuming);
            self.main_loop().await;
            workers
        };

        if !self.ctx.is_forced() {
            let pool = &self.config.pool;
            let drained = self
                .wait(
                    Duration::from_millis(pool.poll_interval_ms),
                    Duration::from_secs(pool.drain_timeout_secs),
                )
                .await;
            if !drained {
                tracing::warn!("Download pool did not drain in time");
            }
        }

        let forced = self.ctx.is_forced();
        self.end_threads(workers, controller, forced).await;

        let report = CrawlReport {
            stats: self.ctx.stats.snapshot(),
            counters: self.ctx.state.counters(),
            abort_reason: self.ctx.state.abort_reason(),
            forced,
            elapsed: started.elapsed(),
        };

        if forced {
            self.save_session(seed);
        } else if report.completed() {
            self.clear_session();
        }
        self.finish_run(run_id, report.completed());

        tracing::info!("Crawl finished: {}", report.summary_line());
        Ok(report)
    }

    fn spawn_workers(&self, resuming: bool) -> Vec<WorkerTask> {
        let (fetchers, crawlers) = self.config.crawler.worker_split();
        tracing::info!(
            "Spawning {} fetchers and {} crawlers",
            fetchers,
            crawlers
        );

        let ids = (0..fetchers)
            .map(|i| WorkerId::new(Role::Fetcher, i))
            .chain((0..crawlers).map(|i| WorkerId::new(Role::Crawler, i)));
        ids.map(|id| self.spawn_worker(CrawlWorker::new(id, self.ctx.clone(), resuming)))
            .collect()
    }

    /// Runs a worker under a supervisor that reports `Died` on error or panic
    fn spawn_worker(&self, worker: CrawlWorker) -> WorkerTask {
        let id = worker.id();
        let inner = tokio::spawn(worker.run());
        let abort = inner.abort_handle();
        let ctx = self.ctx.clone();

        let supervisor = tokio::spawn(async move {
            match inner.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::error!("Worker {} failed: {}", id, e);
                    ctx.state.set(id, WorkerState::Died);
                }
                Err(e) if e.is_panic() => {
                    tracing::error!("Worker {} panicked", id);
                    ctx.state.set(id, WorkerState::Died);
                }
                // Aborted during a forced shutdown
                Err(_) => {}
            }
        });

        WorkerTask {
            id,
            abort,
            supervisor,
        }
    }

    /// Waits until the crawl runs dry or `end_loop` is called
    async fn main_loop(&self) {
        let ctx = &self.ctx;
        let mut last_progress = Instant::now();

        loop {
            let changed = ctx.state.changed();
            tokio::pin!(changed);
            changed.as_mut().enable();

            ctx.feed_backlog();
            if ctx.exit_requested() {
                tracing::info!("Crawl asked to stop");
                break;
            }
            if ctx.backlog_len() == 0 && ctx.state.end_state() {
                match ctx.state.abort_reason() {
                    Some(reason) => tracing::error!("{}", reason),
                    None => tracing::info!("Crawl has run out of work"),
                }
                break;
            }

            if last_progress.elapsed() >= PROGRESS_INTERVAL {
                last_progress = Instant::now();
                self.log_progress();
            }

            tokio::select! {
                _ = &mut changed => {}
                _ = ctx.woken() => {}
                _ = tokio::time::sleep(MAIN_LOOP_TICK) => {}
            }
        }
    }

    /// Drives one fetcher and one crawler on the calling task
    async fn run_single(&self, resuming: bool) {
        let ctx = &self.ctx;
        let mut fetcher = CrawlWorker::new(WorkerId::new(Role::Fetcher, 0), ctx.clone(), resuming);
        let mut crawler = CrawlWorker::new(WorkerId::new(Role::Crawler, 0), ctx.clone(), resuming);
        fetcher.start();
        crawler.start();
        tracing::info!("Running single-threaded");

        loop {
            ctx.feed_backlog();
            if ctx.exit_requested() {
                break;
            }

            let mut idle = true;
            for worker in [&mut fetcher, &mut crawler] {
                match worker.step().await {
                    Ok(Step::Worked) => idle = false,
                    Ok(Step::Idle) | Ok(Step::Stopped) => {}
                    Err(e) => {
                        tracing::error!("Worker {} failed: {}", worker.id(), e);
                        ctx.state.set(worker.id(), WorkerState::Died);
                        return;
                    }
                }
            }

            if idle
                && fetcher.buffered() == 0
                && crawler.buffered() == 0
                && ctx.backlog_len() == 0
                && ctx.state.end_state()
            {
                tracing::info!("Crawl has run out of work");
                break;
            }
        }

        fetcher.finish();
        crawler.finish();
    }

    /// Stops the controller, the workers and the download pool
    async fn end_threads(
        &self,
        workers: Vec<WorkerTask>,
        controller: Option<CrawlController>,
        forced: bool,
    ) {
        let ctx = &self.ctx;
        if let Some(controller) = controller {
            controller.stop().await;
        }
        ctx.request_stop();

        if forced {
            tracing::info!("Forcing {} workers to stop", workers.len());
            for worker in &workers {
                worker.abort.abort();
            }
            for worker in workers {
                let _ = worker.supervisor.await;
            }
            ctx.pool.kill_all().await;
            ctx.close_queues();
            return;
        }

        ctx.close_queues();
        let limit = Duration::from_secs(self.config.crawler.shutdown_timeout_secs);
        let settled = tokio::time::timeout(limit, async {
            while !ctx.state.exit_state() {
                let changed = ctx.state.changed();
                let _ = tokio::time::timeout(MAIN_LOOP_TICK, changed).await;
            }
        })
        .await
        .is_ok();
        if !settled {
            tracing::warn!("Workers did not settle within {:?}", limit);
        }

        for mut worker in workers {
            if tokio::time::timeout(JOIN_TIMEOUT, &mut worker.supervisor)
                .await
                .is_err()
            {
                tracing::warn!("Worker {} did not stop, aborting it", worker.id);
                worker.abort.abort();
                let _ = worker.supervisor.await;
            }
        }
        ctx.pool.stop_all().await;
    }

    fn log_progress(&self) {
        let stats = self.ctx.stats.snapshot();
        tracing::info!(
            "Progress: {} links seen, {} files saved, {} queued for fetch, {} downloads pending",
            stats.links_seen,
            stats.files_saved,
            self.ctx.fetch_queue.len(),
            self.ctx.pool.pending()
        );
    }

    /// Saves every URL that was accepted but not fetched yet
    fn save_session(&self, seed: &UrlRef) {
        let Some(session) = &self.session else {
            return;
        };
        let ctx = &self.ctx;

        let mut pending: Vec<UrlRef> = Vec::new();
        let items = ctx
            .take_backlog()
            .into_iter()
            .chain(ctx.fetch_queue.drain())
            .chain(ctx.crawl_queue.drain());
        for item in items {
            match item.payload {
                Payload::Url(url) => pending.push(url),
                Payload::Page(bundle) => pending.extend(
                    bundle
                        .children
                        .into_iter()
                        .filter(|child| !ctx.rules.violates(child)),
                ),
            }
        }

        let snapshot = SessionSnapshot {
            seed: seed.full_url().to_string(),
            frontier: pending
                .iter()
                .map(|url| FrontierEntry {
                    url: url.full_url().to_string(),
                    priority: url.priority(),
                    generation: url.generation(),
                })
                .collect(),
            seen: ctx.registry.ids().into_iter().map(UrlId::as_u64).collect(),
            stats: ctx.stats.to_named(),
        };

        match session.save_session(&snapshot) {
            Ok(()) => tracing::info!(
                "Saved session with {} pending URLs",
                snapshot.frontier.len()
            ),
            Err(e) => tracing::error!("Failed to save session: {}", e),
        }
    }

    fn clear_session(&self) {
        if let Some(session) = &self.session {
            if let Err(e) = session.clear_session() {
                tracing::warn!("Failed to clear saved session: {}", e);
            }
        }
    }

    fn begin_run(&self, seed: &UrlRef) -> Option<i64> {
        let runs = self.runs.as_ref()?;
        match runs.create_run(&self.config_hash, seed.full_url()) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!("Could not record crawl run: {}", e);
                None
            }
        }
    }

    fn finish_run(&self, run_id: Option<i64>, completed: bool) {
        let (Some(runs), Some(id)) = (&self.runs, run_id) else {
            return;
        };
        let status = if completed {
            RunStatus::Completed
        } else {
            RunStatus::Interrupted
        };
        if let Err(e) = runs.finish_run(id, status) {
            tracing::warn!("Could not finish crawl run {}: {}", id, e);
        }
    }
}
