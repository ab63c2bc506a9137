//! Optional callbacks around the fetch and crawl steps
//!
//! Filters return false to skip the item; observers only watch. Every hook is
//! optional and an empty `EventHooks` changes nothing.

use crate::crawler::parser::ParsedDocument;
use crate::crawler::pool::DownloadOutcome;
use crate::crawler::queue::PageBundle;
use crate::url::CrawlUrl;
use std::fmt;
use std::sync::Arc;

type UrlFilter = Arc<dyn Fn(&CrawlUrl) -> bool + Send + Sync>;
type UrlObserver = Arc<dyn Fn(&CrawlUrl) + Send + Sync>;
type BundleFilter = Arc<dyn Fn(&PageBundle) -> bool + Send + Sync>;
type BundleObserver = Arc<dyn Fn(&PageBundle) + Send + Sync>;
type FetchObserver = Arc<dyn Fn(&CrawlUrl, &DownloadOutcome) + Send + Sync>;
type ParseObserver = Arc<dyn Fn(&CrawlUrl, &ParsedDocument) + Send + Sync>;

#[derive(Clone, Default)]
pub struct EventHooks {
    before_fetch: Option<UrlFilter>,
    after_fetch: Option<FetchObserver>,
    after_parse: Option<ParseObserver>,
    before_crawl: Option<BundleFilter>,
    after_crawl: Option<BundleObserver>,
    proxy_auth_required: Option<UrlObserver>,
}

impl EventHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_before_fetch(mut self, f: impl Fn(&CrawlUrl) -> bool + Send + Sync + 'static) -> Self {
        self.before_fetch = Some(Arc::new(f));
        self
    }

    pub fn on_after_fetch(
        mut self,
        f: impl Fn(&CrawlUrl, &DownloadOutcome) + Send + Sync + 'static,
    ) -> Self {
        self.after_fetch = Some(Arc::new(f));
        self
    }

    pub fn on_after_parse(
        mut self,
        f: impl Fn(&CrawlUrl, &ParsedDocument) + Send + Sync + 'static,
    ) -> Self {
        self.after_parse = Some(Arc::new(f));
        self
    }

    pub fn on_before_crawl(
        mut self,
        f: impl Fn(&PageBundle) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.before_crawl = Some(Arc::new(f));
        self
    }

    pub fn on_after_crawl(mut self, f: impl Fn(&PageBundle) + Send + Sync + 'static) -> Self {
        self.after_crawl = Some(Arc::new(f));
        self
    }

    /// Runs when a proxy answers 407, before the request is retried
    pub fn on_proxy_auth_required(mut self, f: impl Fn(&CrawlUrl) + Send + Sync + 'static) -> Self {
        self.proxy_auth_required = Some(Arc::new(f));
        self
    }

    pub fn before_fetch(&self, url: &CrawlUrl) -> bool {
        self.before_fetch.as_ref().map_or(true, |f| f(url))
    }

    pub fn after_fetch(&self, url: &CrawlUrl, outcome: &DownloadOutcome) {
        if let Some(f) = &self.after_fetch {
            f(url, outcome);
        }
    }

    pub fn after_parse(&self, url: &CrawlUrl, document: &ParsedDocument) {
        if let Some(f) = &self.after_parse {
            f(url, document);
        }
    }

    pub fn before_crawl(&self, bundle: &PageBundle) -> bool {
        self.before_crawl.as_ref().map_or(true, |f| f(bundle))
    }

    pub fn after_crawl(&self, bundle: &PageBundle) {
        if let Some(f) = &self.after_crawl {
            f(bundle);
        }
    }

    pub fn proxy_auth_required(&self, url: &CrawlUrl) {
        match &self.proxy_auth_required {
            Some(f) => f(url),
            None => tracing::warn!("Proxy authentication required for {}", url),
        }
    }
}

impl fmt::Debug for EventHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHooks")
            .field("before_fetch", &self.before_fetch.is_some())
            .field("after_fetch", &self.after_fetch.is_some())
            .field("after_parse", &self.after_parse.is_some())
            .field("before_crawl", &self.before_crawl.is_some())
            .field("after_crawl", &self.after_crawl.is_some())
            .field("proxy_auth_required", &self.proxy_auth_required.is_some())
            .finish()
    }
}
