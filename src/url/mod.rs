//! URL handling module for Ripple-Harvest
//!
//! This module provides the crawl URL model, normalization, domain matching,
//! the seen-set registry and the filtering rules.

mod domain;
mod normalize;
mod rules;

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use url::Url;

use crate::UrlResult;

// Re-export main functions
pub use domain::{extract_domain, matches_wildcard, server_priority};
pub use normalize::{normalize_url, resolve_link};
pub use rules::{Rules, RuleSet};

/// Shared handle to a crawl URL; queues and workers only ever pass these around
pub type UrlRef = Arc<CrawlUrl>;

/// Stable identity of a normalized URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UrlId(u64);

impl UrlId {
    /// Derives the id from the first eight bytes of the URL's SHA-256 digest
    pub fn of(url: &Url) -> Self {
        let digest = Sha256::digest(url.as_str().as_bytes());
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(bytes))
    }

    /// Rebuilds an id saved with a session
    pub fn from_u64(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for UrlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Resource category, derived from the path extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlKind {
    /// HTML document; downloaded and parsed for links
    WebPage,
    /// CSS; downloaded and scanned for `url(...)` references
    Stylesheet,
    /// Image file
    Image,
    /// Any other resource
    Other,
}

impl UrlKind {
    const PAGE_EXTENSIONS: &'static [&'static str] = &[
        "", "html", "htm", "shtml", "xhtml", "php", "asp", "aspx", "jsp", "cgi", "pl",
    ];
    const IMAGE_EXTENSIONS: &'static [&'static str] =
        &["jpg", "jpeg", "png", "gif", "bmp", "svg", "webp", "ico", "tif", "tiff"];

    /// Classifies a URL by the extension of its last path segment
    pub fn classify(url: &Url) -> Self {
        let ext = extension_of(url);
        if Self::PAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::WebPage
        } else if ext == "css" {
            Self::Stylesheet
        } else if Self::IMAGE_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::Other
        }
    }
}

fn extension_of(url: &Url) -> String {
    let path = url.path();
    if path.ends_with('/') {
        return String::new();
    }
    let file = path.rsplit('/').next().unwrap_or("");
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => ext.to_lowercase(),
        _ => String::new(),
    }
}

/// A URL scheduled or discovered during a crawl
///
/// Immutable once built; priority and generation are fixed when the URL is created.
#[derive(Debug, Clone)]
pub struct CrawlUrl {
    id: UrlId,
    url: Url,
    kind: UrlKind,
    generation: u32,
    priority: i32,
    parent: Option<UrlId>,
}

impl CrawlUrl {
    /// Builds the generation-zero URL a crawl starts from
    pub fn seed(raw: &str) -> UrlResult<Self> {
        let url = normalize_url(raw)?;
        Ok(Self::from_parts(url, 0, None))
    }

    /// Builds a URL at a given generation (used when restoring a saved session)
    pub fn restored(raw: &str, generation: u32, priority: i32) -> UrlResult<Self> {
        let url = normalize_url(raw)?;
        Ok(Self::from_parts(url, generation, None).with_priority(priority))
    }

    /// Builds a child one generation below this URL
    pub fn child(&self, url: Url) -> Self {
        Self::from_parts(url, self.generation + 1, Some(self.id))
    }

    fn from_parts(url: Url, generation: u32, parent: Option<UrlId>) -> Self {
        Self {
            id: UrlId::of(&url),
            kind: UrlKind::classify(&url),
            url,
            generation,
            priority: 0,
            parent,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn id(&self) -> UrlId {
        self.id
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn full_url(&self) -> &str {
        self.url.as_str()
    }

    pub fn kind(&self) -> UrlKind {
        self.kind
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn parent(&self) -> Option<UrlId> {
        self.parent
    }

    pub fn is_webpage(&self) -> bool {
        self.kind == UrlKind::WebPage
    }

    pub fn is_stylesheet(&self) -> bool {
        self.kind == UrlKind::Stylesheet
    }

    /// Pages and stylesheets are parsed for further links
    pub fn is_parseable(&self) -> bool {
        self.is_webpage() || self.is_stylesheet()
    }

    pub fn domain(&self) -> String {
        extract_domain(&self.url).unwrap_or_default()
    }

    /// Lowercase extension of the last path segment, without the dot
    pub fn extension(&self) -> String {
        extension_of(&self.url)
    }
}

impl fmt::Display for CrawlUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}

/// Set of every URL the crawl has already accepted for fetching
#[derive(Debug, Default)]
pub struct UrlRegistry {
    seen: Mutex<HashSet<UrlId>>,
}

impl UrlRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the URL; returns false if it was already known
    pub fn insert(&self, url: &CrawlUrl) -> bool {
        self.lock().insert(url.id())
    }

    pub fn contains(&self, id: UrlId) -> bool {
        self.lock().contains(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Every recorded id, for session saving
    pub fn ids(&self) -> Vec<UrlId> {
        self.lock().iter().copied().collect()
    }

    /// Adds ids loaded from a saved session
    pub fn restore(&self, ids: impl IntoIterator<Item = UrlId>) {
        self.lock().extend(ids);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<UrlId>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
