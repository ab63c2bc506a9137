//! HTTP fetcher implementation
//!
//! This module performs every network transfer for the download pool:
//! - Building the shared HTTP client
//! - Conditional requests against cached ETag / Last-Modified validators
//! - Byte-range requests for multipart downloads
//! - Status classification and bounded retries with backoff
//! - Crawl-wide adaptation when servers reject the user agent or keep resetting
//!   connections

use crate::config::{Config, NetworkConfig};
use crate::crawler::backoff::ExponentialBackoff;
use crate::crawler::gate::ConnectionGate;
use crate::crawler::hooks::EventHooks;
use crate::output::CrawlStats;
use crate::storage::CacheRecord;
use crate::url::CrawlUrl;
use reqwest::header::{
    HeaderMap, ACCEPT_RANGES, CONTENT_LENGTH, ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH,
    LAST_MODIFIED, RANGE, USER_AGENT,
};
use reqwest::{redirect::Policy, Client, RequestBuilder};
use sha2::{Digest, Sha256};
use std::error::Error as StdError;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// How a response status is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusClass {
    /// 2xx
    Success,
    /// 304; the cached copy is current
    NotModified,
    /// 400, 405, 406; retried without the User-Agent header
    RetryWithoutUserAgent,
    /// 407; the proxy-auth hook runs before the retry
    ProxyAuth,
    /// Retried up to the limit
    Transient,
    /// Never retried
    Fatal,
}

/// Maps an HTTP status onto its retry behaviour
///
/// | Status | Class |
/// |--------|-------|
/// | 2xx | Success |
/// | 304 | NotModified |
/// | 400, 405, 406 | RetryWithoutUserAgent |
/// | 401-404, 409-417 | Fatal |
/// | 407 | ProxyAuth |
/// | 408, 500, 502 | Transient |
/// | 501, 503-505 | Fatal |
/// | anything else | Transient |
pub fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Success,
        304 => StatusClass::NotModified,
        400 | 405 | 406 => StatusClass::RetryWithoutUserAgent,
        407 => StatusClass::ProxyAuth,
        408 | 500 | 502 => StatusClass::Transient,
        401..=404 | 409..=417 => StatusClass::Fatal,
        501 | 503..=505 => StatusClass::Fatal,
        _ => StatusClass::Transient,
    }
}

/// Why a transfer failed
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("HTTP status {0}")]
    Status(u16),

    #[error("request timed out")]
    Timeout,

    #[error("connection reset by peer")]
    ConnectionReset,

    #[error("connection failed: {0}")]
    Connect(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("short transfer: expected {expected} bytes, got {actual}")]
    ShortTransfer { expected: u64, actual: u64 },

    #[error("no connection slot available")]
    NoConnection,

    #[error("could not save body: {0}")]
    Storage(String),
}

impl FetchError {
    fn from_reqwest(err: &reqwest::Error) -> Self {
        if is_connection_reset(err) {
            Self::ConnectionReset
        } else if err.is_timeout() {
            Self::Timeout
        } else if err.is_connect() {
            Self::Connect(err.to_string())
        } else {
            Self::Transfer(err.to_string())
        }
    }
}

fn is_connection_reset(err: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        if e.to_string().to_ascii_lowercase().contains("connection reset") {
            return true;
        }
        current = e.source();
    }
    false
}

/// Per-request options
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Cached validators; when present the first attempt is a conditional HEAD
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    /// Inclusive byte range
    pub range: Option<(u64, u64)>,
    /// Overrides the configured retry count
    pub retries: Option<u32>,
}

impl FetchOptions {
    /// Conditional request from cached `(last_modified, etag)` validators
    pub fn conditional(last_modified: Option<String>, etag: Option<String>) -> Self {
        Self {
            etag,
            last_modified,
            ..Self::default()
        }
    }

    pub fn range(start: u64, end: u64) -> Self {
        Self {
            range: Some((start, end)),
            ..Self::default()
        }
    }

    fn is_conditional(&self) -> bool {
        self.etag.is_some() || self.last_modified.is_some()
    }
}

/// A completed transfer
#[derive(Debug, Clone)]
pub struct Download {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
    /// Hex SHA-256 of the body
    pub checksum: String,
}

impl Download {
    pub fn etag(&self) -> Option<String> {
        header_string(&self.headers, ETAG)
    }

    pub fn last_modified(&self) -> Option<String> {
        header_string(&self.headers, LAST_MODIFIED)
    }

    pub fn content_length(&self) -> Option<u64> {
        header_string(&self.headers, CONTENT_LENGTH).and_then(|v| v.parse().ok())
    }

    pub fn accepts_ranges(&self) -> bool {
        header_string(&self.headers, ACCEPT_RANGES)
            .map(|v| v.eq_ignore_ascii_case("bytes"))
            .unwrap_or(false)
    }

    /// Validators to remember for the next crawl
    pub fn cache_record(&self) -> CacheRecord {
        CacheRecord {
            etag: self.etag(),
            last_modified: self.last_modified(),
            checksum: Some(self.checksum.clone()),
        }
    }
}

/// Result of a fetch operation
#[derive(Debug)]
pub enum FetchResult {
    /// Body downloaded
    Downloaded(Download),
    /// Server confirmed the cached copy is current
    NotModified { headers: HeaderMap },
    /// Gave up; `fatal` is false only for failures the caller may retry later
    Failed {
        error: FetchError,
        fatal: bool,
        http_status: Option<u16>,
    },
}

/// What a HEAD request learned about a resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceInfo {
    pub content_length: Option<u64>,
    pub accepts_ranges: bool,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

/// Crawl-wide adjustments learned from server behaviour
#[derive(Debug)]
pub struct AdaptiveLimits {
    send_user_agent: AtomicBool,
    bad_requests: AtomicU32,
    socket_errors: AtomicU32,
    bad_request_threshold: u32,
    socket_error_threshold: u32,
}

impl AdaptiveLimits {
    pub fn new(config: &NetworkConfig) -> Self {
        Self {
            send_user_agent: AtomicBool::new(true),
            bad_requests: AtomicU32::new(0),
            socket_errors: AtomicU32::new(0),
            bad_request_threshold: config.bad_request_threshold.max(1),
            socket_error_threshold: config.socket_error_threshold.max(1),
        }
    }

    pub fn user_agent_enabled(&self) -> bool {
        self.send_user_agent.load(Ordering::SeqCst)
    }

    /// Counts a 400/405/406; returns true when this one disabled the User-Agent
    fn record_bad_request(&self) -> bool {
        let count = self.bad_requests.fetch_add(1, Ordering::SeqCst) + 1;
        count >= self.bad_request_threshold && self.send_user_agent.swap(false, Ordering::SeqCst)
    }

    /// Counts a reset; returns true each time the threshold is crossed
    fn record_socket_error(&self) -> bool {
        let threshold = self.socket_error_threshold;
        let count = self.socket_errors.fetch_add(1, Ordering::SeqCst) + 1;
        if count < threshold {
            return false;
        }
        self.socket_errors
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(threshold))
            .is_ok()
    }

    pub fn bad_requests(&self) -> u32 {
        self.bad_requests.load(Ordering::SeqCst)
    }

    pub fn socket_errors(&self) -> u32 {
        self.socket_errors.load(Ordering::SeqCst)
    }
}

/// Builds the HTTP client shared by every download worker
///
/// The User-Agent header is set per request so it can be dropped for servers
/// that reject it.
pub fn build_http_client(config: &NetworkConfig) -> Result<Client, reqwest::Error> {
    Client::builder()
        .timeout(Duration::from_secs(config.socket_timeout_secs))
        .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true)
        .build()
}

/// Performs transfers with retries, classification and crawl-wide adaptation
#[derive(Debug)]
pub struct Fetcher {
    client: Client,
    user_agent: String,
    retries: u32,
    backoff: ExponentialBackoff,
    limits: AdaptiveLimits,
    gate: ConnectionGate,
    stats: Arc<CrawlStats>,
    hooks: EventHooks,
}

impl Fetcher {
    pub fn new(
        config: &Config,
        gate: ConnectionGate,
        stats: Arc<CrawlStats>,
        hooks: EventHooks,
    ) -> Result<Self, reqwest::Error> {
        let client = build_http_client(&config.network)?;
        Ok(Self::with_client(client, config, gate, stats, hooks))
    }

    pub fn with_client(
        client: Client,
        config: &Config,
        gate: ConnectionGate,
        stats: Arc<CrawlStats>,
        hooks: EventHooks,
    ) -> Self {
        let network = &config.network;
        Self {
            client,
            user_agent: config.user_agent.header_value(),
            retries: network.retries,
            backoff: ExponentialBackoff::new(network.retry_delay_ms, network.retry_delay_max_ms),
            limits: AdaptiveLimits::new(network),
            gate,
            stats,
            hooks,
        }
    }

    pub fn limits(&self) -> &AdaptiveLimits {
        &self.limits
    }

    /// Fetches a URL
    ///
    /// # Request Flow
    ///
    /// 1. With cached validators, send a conditional HEAD
    ///    - 304 → `NotModified`
    ///    - 2xx → validators are stale; clear them and GET without using up an attempt
    /// 2. GET (with `Range` when requested)
    /// 3. Classify the status and retry transient failures with backoff
    ///
    /// Running out of attempts escalates the last error to fatal.
    pub async fn fetch(&self, url: &CrawlUrl, options: &FetchOptions) -> FetchResult {
        let retries = options.retries.unwrap_or(self.retries);
        let attempts = retries + 1;
        let mut conditional = options.is_conditional();
        let mut send_user_agent = true;
        let mut attempt = 0;
        let mut last_error = FetchError::Transfer("no attempt made".to_string());
        let mut last_status = None;

        while attempt < attempts {
            let use_agent = send_user_agent && self.limits.user_agent_enabled();
            let request = self.build_request(url, options, conditional, use_agent);

            match request.send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    last_status = Some(status);

                    match classify_status(status) {
                        StatusClass::Success if conditional => {
                            tracing::debug!("Cached copy of {} is stale", url);
                            conditional = false;
                            continue;
                        }
                        StatusClass::Success => {
                            let headers = response.headers().clone();
                            match response.bytes().await {
                                Ok(bytes) => {
                                    let body = bytes.to_vec();
                                    self.stats.update_bytes(body.len() as u64);
                                    let checksum = hex::encode(Sha256::digest(&body));
                                    return FetchResult::Downloaded(Download {
                                        status,
                                        headers,
                                        body,
                                        checksum,
                                    });
                                }
                                Err(e) => last_error = self.transport_error(url, &e),
                            }
                        }
                        StatusClass::NotModified => {
                            return FetchResult::NotModified {
                                headers: response.headers().clone(),
                            };
                        }
                        StatusClass::RetryWithoutUserAgent => {
                            if self.limits.record_bad_request() {
                                tracing::warn!(
                                    "Too many bad requests, no longer sending User-Agent"
                                );
                            }
                            send_user_agent = false;
                            last_error = FetchError::Status(status);
                        }
                        StatusClass::ProxyAuth => {
                            self.hooks.proxy_auth_required(url);
                            last_error = FetchError::Status(status);
                        }
                        StatusClass::Transient => last_error = FetchError::Status(status),
                        StatusClass::Fatal => {
                            return self.fatal(url, FetchError::Status(status), Some(status));
                        }
                    }
                }
                Err(e) => {
                    last_status = None;
                    last_error = self.transport_error(url, &e);
                }
            }

            attempt += 1;
            conditional = false;
            if attempt < attempts {
                self.stats.add_retry();
                let delay = self.backoff.delay(attempt - 1);
                tracing::debug!(
                    "Retrying {} in {:?} ({}/{}): {}",
                    url,
                    delay,
                    attempt,
                    retries,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }
        }

        self.fatal(url, last_error, last_status)
    }

    fn fatal(&self, url: &CrawlUrl, error: FetchError, http_status: Option<u16>) -> FetchResult {
        tracing::info!("Giving up on {}: {}", url, error);
        self.stats.add_fatal();
        FetchResult::Failed {
            error,
            fatal: true,
            http_status,
        }
    }

    fn transport_error(&self, url: &CrawlUrl, err: &reqwest::Error) -> FetchError {
        let error = FetchError::from_reqwest(err);
        if error == FetchError::ConnectionReset && self.limits.record_socket_error() {
            tracing::warn!("Repeated connection resets while fetching {}", url);
            self.gate.shrink();
        }
        error
    }

    fn build_request(
        &self,
        url: &CrawlUrl,
        options: &FetchOptions,
        conditional: bool,
        use_agent: bool,
    ) -> RequestBuilder {
        let mut request = if conditional {
            let mut head = self.client.head(url.url().clone());
            if let Some(etag) = &options.etag {
                head = head.header(IF_NONE_MATCH, etag.as_str());
            }
            if let Some(modified) = &options.last_modified {
                head = head.header(IF_MODIFIED_SINCE, modified.as_str());
            }
            head
        } else {
            self.client.get(url.url().clone())
        };

        if let Some((start, end)) = options.range {
            request = request.header(RANGE, format!("bytes={}-{}", start, end));
        }
        if use_agent {
            request = request.header(USER_AGENT, self.user_agent.as_str());
        }
        request
    }

    /// Sends a single HEAD to learn the size, range support and validators of a resource
    pub async fn head_info(&self, url: &CrawlUrl) -> Option<ResourceInfo> {
        let mut request = self.client.head(url.url().clone());
        if self.limits.user_agent_enabled() {
            request = request.header(USER_AGENT, self.user_agent.as_str());
        }

        let response = match request.send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                tracing::debug!("HEAD of {} returned {}", url, response.status());
                return None;
            }
            Err(e) => {
                tracing::debug!("HEAD of {} failed: {}", url, e);
                return None;
            }
        };

        let headers = response.headers();
        Some(ResourceInfo {
            content_length: header_string(headers, CONTENT_LENGTH).and_then(|v| v.parse().ok()),
            accepts_ranges: header_string(headers, ACCEPT_RANGES)
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false),
            etag: header_string(headers, ETAG),
            last_modified: header_string(headers, LAST_MODIFIED),
        })
    }
}

fn header_string(headers: &HeaderMap, name: reqwest::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
