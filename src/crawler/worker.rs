//! Crawl workers
//!
//! A `CrawlWorker` runs one of the two roles:
//!
//! - **Fetcher**: takes URLs from the fetch queue, downloads them through the pool,
//!   parses pages and pushes a `PageBundle` of unseen children to the crawl queue
//! - **Crawler**: takes bundles from the crawl queue, filters and prioritizes the
//!   children and pushes them back to the fetch queue
//!
//! Every transition is reported to `CrawlState`, which is how the coordinator knows
//! the crawl has run dry. A worker only reports `Waiting` when its local buffer is
//! empty, so an item that could not be pushed yet keeps the crawl alive.

use crate::config::PriorityConfig;
use crate::crawler::context::CrawlContext;
use crate::crawler::pool::DownloadOutcome;
use crate::crawler::queue::{PageBundle, Payload, WorkItem};
use crate::state::{Role, WorkerId, WorkerState};
use crate::url::{server_priority, CrawlUrl, UrlRef};
use crate::{HarvestError, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

/// Items a worker holds on to when its output queue stays full
pub const MAX_BUFFER: usize = 100;

const BUFFER_FULL_PAUSE: Duration = Duration::from_millis(100);

/// What one loop iteration did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing arrived before the queue timeout
    Idle,
    /// An item was processed
    Worked,
    /// The stop flag was seen
    Stopped,
}

pub struct CrawlWorker {
    id: WorkerId,
    ctx: Arc<CrawlContext>,
    buffer: VecDeque<WorkItem>,
}

impl CrawlWorker {
    /// Creates the worker and registers it with the crawl state
    pub fn new(id: WorkerId, ctx: Arc<CrawlContext>, resuming: bool) -> Self {
        ctx.state.register(id, resuming);
        Self {
            id,
            ctx,
            buffer: VecDeque::new(),
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    pub fn role(&self) -> Role {
        self.id.role
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Runs until the stop flag is raised
    ///
    /// An error leaves the loop without reporting `Stopped`; the supervisor reports
    /// `Died` for it.
    pub async fn run(mut self) -> Result<()> {
        self.start();
        tracing::debug!("Worker {} started", self.id);
        while self.step().await? != Step::Stopped {}
        self.finish();
        Ok(())
    }

    pub fn start(&self) {
        self.ctx.state.set(self.id, WorkerState::Started);
    }

    pub fn finish(&self) {
        if !self.buffer.is_empty() {
            tracing::debug!(
                "Worker {} leaving with {} unpushed items",
                self.id,
                self.buffer.len()
            );
        }
        self.ctx.state.set(self.id, WorkerState::Stopped);
    }

    /// One loop iteration
    pub async fn step(&mut self) -> Result<Step> {
        if self.ctx.stop_requested() {
            return Ok(Step::Stopped);
        }

        self.flush_buffer();
        if self.buffer.is_empty() {
            self.ctx.state.set(self.id, WorkerState::Waiting);
        }

        let timeout = self.ctx.config.crawler.queue_timeout();
        let Some(item) = self
            .ctx
            .get_url_data(Some(self.id), self.role(), timeout)
            .await
        else {
            return Ok(Step::Idle);
        };

        match (self.role(), item.payload) {
            (Role::Crawler, Payload::Page(bundle)) => self.crawl(bundle).await,
            (Role::Fetcher, Payload::Url(url)) => self.fetch(url).await,
            (role, payload) => {
                return Err(HarvestError::Worker {
                    worker: self.id.to_string(),
                    message: format!("{} role cannot handle {:?}", role, payload_kind(&payload)),
                })
            }
        }

        self.ctx.state.set(self.id, WorkerState::Sleeping);
        let pause = self.ctx.config.crawler.sleep_time();
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
        Ok(Step::Worked)
    }

    /// Crawler role: filters and prioritizes the children of a fetched page
    async fn crawl(&mut self, bundle: PageBundle) {
        let ctx = self.ctx.clone();
        if ctx.rules.violates(&bundle.source) {
            tracing::debug!("Dropping bundle for filtered page {}", bundle.source);
            return;
        }
        if !ctx.hooks.before_crawl(&bundle) {
            tracing::debug!("Crawl of {} skipped by hook", bundle.source);
            return;
        }

        ctx.state.set(self.id, WorkerState::Crawling);
        for child in &bundle.children {
            if ctx.rules.violates(child) {
                ctx.stats.add_filtered();
                continue;
            }

            let priority = apply_url_priority(&bundle.source, child, &ctx.config.priority);
            let child = Arc::new(child.as_ref().clone().with_priority(priority));
            ctx.stats.add_link();
            tracing::trace!(url = %child, priority, "queueing child");
            self.emit(WorkItem::url(child, Role::Crawler)).await;
        }
        ctx.hooks.after_crawl(&bundle);
    }

    /// Fetcher role: downloads a URL and, for pages, pushes its bundle
    async fn fetch(&mut self, url: UrlRef) {
        let ctx = self.ctx.clone();
        if !ctx.hooks.before_fetch(&url) {
            tracing::debug!("Fetch of {} skipped by hook", url);
            return;
        }

        ctx.state.set(self.id, WorkerState::Downloading);
        if !url.is_parseable() {
            ctx.pool.submit(url);
            return;
        }

        let outcome = ctx.pool.fetch(url.clone()).await;
        if let DownloadOutcome::Completed { body, .. } = &outcome {
            ctx.state.set(self.id, WorkerState::Parsing);
            match ctx.parser.parse(&url, body) {
                Ok(document) => {
                    ctx.stats.add_parsed();
                    ctx.hooks.after_parse(&url, &document);

                    let children: Vec<UrlRef> = if document.follow {
                        document
                            .links
                            .iter()
                            .map(|link| url.child(link.clone()))
                            .filter(|child| ctx.registry.insert(child))
                            .map(Arc::new)
                            .collect()
                    } else {
                        Vec::new()
                    };
                    tracing::debug!("Parsed {}: {} new links", url, children.len());

                    let bundle = PageBundle {
                        source: url.clone(),
                        children,
                        document,
                    };
                    self.emit(WorkItem::page(bundle, Role::Fetcher)).await;
                }
                Err(e) => tracing::warn!("Could not parse {}: {}", url, e),
            }
        }
        ctx.hooks.after_fetch(&url, &outcome);
    }

    /// Pushes a result, buffering it when the peer queue stays full
    async fn emit(&mut self, item: WorkItem) {
        let mut item = item;
        if self.buffer.is_empty() {
            item = match self.ctx.push(Some(self.id), self.role(), item).await {
                Ok(()) => return,
                Err(item) => item,
            };
        }

        while self.buffer.len() >= MAX_BUFFER {
            if self.ctx.stop_requested() {
                tracing::debug!("Worker {} dropping {} on stop", self.id, item.subject());
                return;
            }
            tokio::time::sleep(BUFFER_FULL_PAUSE).await;
            self.flush_buffer();
        }
        self.buffer.push_back(item);
    }

    /// Moves buffered items into the output queue while it has room
    fn flush_buffer(&mut self) {
        while let Some(item) = self.buffer.pop_front() {
            if let Err(item) = self.ctx.try_push(Some(self.id), self.role(), item) {
                self.buffer.push_front(item);
                break;
            }
        }
    }
}

fn payload_kind(payload: &Payload) -> &'static str {
    match payload {
        Payload::Url(_) => "a URL",
        Payload::Page(_) => "a page bundle",
    }
}

/// Computes the queue priority of a child link; lower values are fetched first
///
/// Starts from the parent's generation, favours web pages, then applies the
/// configured extension and server boosts.
pub fn apply_url_priority(parent: &CrawlUrl, child: &CrawlUrl, config: &PriorityConfig) -> i32 {
    let mut priority = parent.generation() as i32;
    if child.is_webpage() {
        priority -= 1;
    }
    if let Some(boost) = config.extensions.get(&child.extension()) {
        priority -= boost;
    }
    if let Some(boost) = server_priority(&child.domain(), &config.servers) {
        priority -= boost;
    }
    priority
}
