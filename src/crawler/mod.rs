//! Crawler module: the concurrent crawl engine
//!
//! This module contains the core crawling logic, including:
//! - Bounded priority queues between the fetcher and crawler roles
//! - The connection gate and the HTTP fetcher with retry logic
//! - The download pool for non-page resources, with multipart transfers
//! - HTML and CSS link extraction
//! - The coordinator and the resource ceiling controller

mod backoff;
mod context;
mod controller;
mod coordinator;
mod fetcher;
mod gate;
mod hooks;
mod multipart;
mod parser;
mod pool;
mod queue;
mod worker;

pub use backoff::ExponentialBackoff;
pub use context::CrawlContext;
pub use controller::{breach, Breach, CrawlController};
pub use coordinator::{Coordinator, CoordinatorBuilder};
pub use fetcher::{
    build_http_client, classify_status, Download, FetchError, FetchOptions, FetchResult,
    Fetcher, ResourceInfo, StatusClass,
};
pub use gate::{ConnectionGate, ConnectionHandle};
pub use hooks::EventHooks;
pub use multipart::{split_ranges, PartSpec};
pub use parser::{extract_css_links, parse_html, HtmlParser, PageParser, ParseError, ParsedDocument};
pub use pool::{DownloadOutcome, DownloadPool, PoolSettings, TransferServices};
pub use queue::{PageBundle, Payload, WorkItem, WorkQueue};
pub use worker::{apply_url_priority, CrawlWorker, Step};

pub use crate::output::CrawlReport;
