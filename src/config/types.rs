use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

/// Main configuration structure for Ripple-Harvest
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(rename = "user-agent", default)]
    pub user_agent: UserAgentConfig,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub priority: PriorityConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

/// Worker and queue configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Total number of crawl workers, split between fetchers and crawlers
    pub workers: usize,

    /// Capacity of each work queue
    #[serde(rename = "queue-size")]
    pub queue_size: usize,

    /// How long a worker blocks on an empty queue before re-checking (milliseconds)
    #[serde(rename = "queue-timeout-ms")]
    pub queue_timeout_ms: u64,

    /// Pause after every completed worker cycle (milliseconds)
    #[serde(rename = "sleep-time-ms")]
    pub sleep_time_ms: u64,

    /// Drive one fetcher and one crawler on the calling task
    #[serde(rename = "single-threaded")]
    pub single_threaded: bool,

    /// Upper bound on a graceful shutdown (seconds)
    #[serde(rename = "shutdown-timeout-secs")]
    pub shutdown_timeout_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            workers: 10,
            queue_size: 1000,
            queue_timeout_ms: 500,
            sleep_time_ms: 0,
            single_threaded: false,
            shutdown_timeout_secs: 300,
        }
    }
}

impl CrawlerConfig {
    /// Returns the (fetchers, crawlers) split, three quarters going to fetchers
    pub fn worker_split(&self) -> (usize, usize) {
        let fetchers = (self.workers * 3 / 4).max(1);
        let crawlers = self.workers.saturating_sub(fetchers).max(1);
        (fetchers, crawlers)
    }

    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }

    pub fn sleep_time(&self) -> Duration {
        Duration::from_millis(self.sleep_time_ms)
    }
}

/// HTTP connection and retry configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Maximum number of concurrent outbound connections
    #[serde(rename = "max-connections")]
    pub max_connections: usize,

    /// Retries after the first attempt
    pub retries: u32,

    /// Whole-request timeout (seconds)
    #[serde(rename = "socket-timeout-secs")]
    pub socket_timeout_secs: u64,

    /// Connect timeout (seconds)
    #[serde(rename = "connect-timeout-secs")]
    pub connect_timeout_secs: u64,

    /// Base delay between attempts (milliseconds)
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,

    /// Cap on the exponential delay (milliseconds)
    #[serde(rename = "retry-delay-max-ms")]
    pub retry_delay_max_ms: u64,

    /// Bad requests (400/405/406) after which the User-Agent header is dropped crawl-wide
    #[serde(rename = "bad-request-threshold")]
    pub bad_request_threshold: u32,

    /// Connection resets after which the connection ceiling shrinks by one
    #[serde(rename = "socket-error-threshold")]
    pub socket_error_threshold: u32,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            retries: 1,
            socket_timeout_secs: 30,
            connect_timeout_secs: 10,
            retry_delay_ms: 500,
            retry_delay_max_ms: 10_000,
            bad_request_threshold: 5,
            socket_error_threshold: 4,
        }
    }
}

/// Download worker pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Number of download workers
    #[serde(rename = "thread-pool-size")]
    pub thread_pool_size: usize,

    /// Byte-range parts per multipart download (1 disables multipart)
    #[serde(rename = "num-parts")]
    pub num_parts: usize,

    /// A transfer running longer than this is considered hung (seconds)
    #[serde(rename = "transfer-timeout-secs")]
    pub transfer_timeout_secs: u64,

    /// How many times a short byte-range part is rescheduled
    #[serde(rename = "part-retries")]
    pub part_retries: u32,

    /// Poll interval used while draining the pool (milliseconds)
    #[serde(rename = "poll-interval-ms")]
    pub poll_interval_ms: u64,

    /// Upper bound on draining the pool at the end of a crawl (seconds)
    #[serde(rename = "drain-timeout-secs")]
    pub drain_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            thread_pool_size: 10,
            num_parts: 1,
            transfer_timeout_secs: 200,
            part_retries: 3,
            poll_interval_ms: 1000,
            drain_timeout_secs: 120,
        }
    }
}

/// Global resource ceilings enforced by the controller; zero means unlimited
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    #[serde(rename = "max-files")]
    pub max_files: u64,

    #[serde(rename = "max-bytes")]
    pub max_bytes: u64,

    #[serde(rename = "time-limit-secs")]
    pub time_limit_secs: u64,

    #[serde(rename = "controller-interval-ms")]
    pub controller_interval_ms: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_files: 0,
            max_bytes: 0,
            time_limit_secs: 0,
            controller_interval_ms: 1000,
        }
    }
}

impl LimitsConfig {
    /// Returns true if any ceiling is configured
    pub fn any(&self) -> bool {
        self.max_files > 0 || self.max_bytes > 0 || self.time_limit_secs > 0
    }
}

/// User agent identification configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UserAgentConfig {
    /// Name of the crawler
    #[serde(rename = "crawler-name")]
    pub crawler_name: String,

    /// Version of the crawler
    #[serde(rename = "crawler-version")]
    pub crawler_version: String,

    /// URL with information about the crawler
    #[serde(rename = "contact-url")]
    pub contact_url: String,

    /// Email address for crawler-related contact
    #[serde(rename = "contact-email")]
    pub contact_email: String,
}

impl Default for UserAgentConfig {
    fn default() -> Self {
        Self {
            crawler_name: "RippleHarvest".to_string(),
            crawler_version: env!("CARGO_PKG_VERSION").to_string(),
            contact_url: "https://example.com/bot".to_string(),
            contact_email: "bot@example.com".to_string(),
        }
    }
}

impl UserAgentConfig {
    /// Formats the header value: `Name/Version (+url; email)`
    pub fn header_value(&self) -> String {
        format!(
            "{}/{} (+{}; {})",
            self.crawler_name, self.crawler_version, self.contact_url, self.contact_email
        )
    }
}

/// URL filtering rules
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RulesConfig {
    /// Maximum link depth from the seed
    #[serde(rename = "max-depth")]
    pub max_depth: u32,

    /// Only follow links on the seed's host
    #[serde(rename = "same-domain")]
    pub same_domain: bool,

    /// Domain patterns that are never fetched (e.g. "*.ads.example")
    pub blacklist: Vec<String>,

    /// File extensions that are never fetched
    #[serde(rename = "skip-extensions")]
    pub skip_extensions: Vec<String>,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            same_domain: true,
            blacklist: Vec::new(),
            skip_extensions: Vec::new(),
        }
    }
}

/// Priority adjustments; higher values are fetched sooner
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PriorityConfig {
    /// Extension (without the dot) to priority boost
    pub extensions: HashMap<String, i32>,

    /// Server name fragment to priority boost
    pub servers: HashMap<String, i32>,
}

/// Output configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Directory downloaded files are saved under
    #[serde(rename = "project-dir")]
    pub project_dir: String,

    /// Path to the SQLite database file; empty keeps the cache in memory
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Write downloaded files to disk
    #[serde(rename = "save-files")]
    pub save_files: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            project_dir: "./harvest".to_string(),
            database_path: "./harvest.db".to_string(),
            save_files: true,
        }
    }
}
