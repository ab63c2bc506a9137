//! URL filtering rules
//!
//! Decides which discovered URLs are worth fetching. Crawler-role workers consult
//! [`Rules::violates`] for every child link; the fetch path adds fatally failed URLs
//! to the negative cache so they are not attempted again.

use crate::config::RulesConfig;
use crate::url::{matches_wildcard, CrawlUrl, UrlId};
use std::collections::HashSet;
use std::sync::{Mutex, PoisonError, RwLock};

/// Filtering predicate applied to every discovered URL
pub trait Rules: Send + Sync {
    /// Returns true if the URL must not be fetched
    fn violates(&self, url: &CrawlUrl) -> bool;

    /// Adds a URL to the negative cache
    fn add_to_filter(&self, url: &CrawlUrl);

    /// Called once per crawl with the seed, before any URL is checked
    fn anchor(&self, _seed: &CrawlUrl) {}
}

/// Default rules: depth limit, seed-domain restriction, blacklist, extension filter
#[derive(Debug)]
pub struct RuleSet {
    max_depth: u32,
    same_domain: bool,
    blacklist: Vec<String>,
    skip_extensions: Vec<String>,
    seed_domain: RwLock<Option<String>>,
    negative: Mutex<HashSet<UrlId>>,
}

impl RuleSet {
    pub fn new(config: &RulesConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            same_domain: config.same_domain,
            blacklist: config.blacklist.iter().map(|p| p.to_lowercase()).collect(),
            skip_extensions: config
                .skip_extensions
                .iter()
                .map(|e| e.to_lowercase())
                .collect(),
            seed_domain: RwLock::new(None),
            negative: Mutex::new(HashSet::new()),
        }
    }

    /// Returns the reason a URL is rejected, if any
    pub fn rejection(&self, url: &CrawlUrl) -> Option<&'static str> {
        if self
            .negative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(&url.id())
        {
            return Some("previously failed");
        }

        if url.generation() > self.max_depth {
            return Some("depth exceeded");
        }

        let domain = url.domain();
        if self.blacklist.iter().any(|p| matches_wildcard(p, &domain)) {
            return Some("blacklisted domain");
        }

        if self.same_domain {
            let seed = self.seed_domain.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(seed) = seed.as_deref() {
                if seed != domain {
                    return Some("external domain");
                }
            }
        }

        let ext = url.extension();
        if !ext.is_empty() && self.skip_extensions.contains(&ext) {
            return Some("filtered extension");
        }

        None
    }
}

impl Rules for RuleSet {
    fn violates(&self, url: &CrawlUrl) -> bool {
        match self.rejection(url) {
            Some(reason) => {
                tracing::trace!(url = %url, reason, "URL filtered");
                true
            }
            None => false,
        }
    }

    fn add_to_filter(&self, url: &CrawlUrl) {
        self.negative
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.id());
    }

    fn anchor(&self, seed: &CrawlUrl) {
        *self.seed_domain.write().unwrap_or_else(PoisonError::into_inner) = Some(seed.domain());
    }
}
